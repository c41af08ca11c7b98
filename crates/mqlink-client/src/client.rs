//! Application-facing MQTT client.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use mqlink_core::QoS;

use crate::callback::{FnHandler, MqttHandler};
use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::Result;
use crate::will::Will;

/// MQTT client.
///
/// A thin layer over [`Connection`] with closure-based callbacks. Install a
/// full [`MqttHandler`] with [`set_handler`](Self::set_handler) to receive
/// every event instead.
pub struct Client {
    config: ClientConfig,
    connection: Connection,
    handler: Arc<FnHandler>,
}

impl Client {
    /// Create a new MQTT client with the given configuration.
    pub fn new(config: ClientConfig) -> Self {
        let connection = Connection::new(config.clone());
        let handler = Arc::new(FnHandler::new());
        connection.set_handler(handler.clone());
        Self {
            config,
            connection,
            handler,
        }
    }

    /// Connect using the configured `connect_timeout`.
    pub fn connect(&self) -> Result<()> {
        self.connection.connect(self.config.connect_timeout)
    }

    pub fn connect_timeout(&self, timeout: Duration) -> Result<()> {
        self.connection.connect(timeout)
    }

    /// Publish a message. Returns the packet identifier for QoS 1/2.
    pub fn publish(
        &self,
        topic: &str,
        payload: impl AsRef<[u8]>,
        qos: QoS,
        retain: bool,
    ) -> Result<Option<u16>> {
        self.connection.publish(topic, payload.as_ref(), qos, retain)
    }

    pub fn subscribe(&self, topic: &str, qos: QoS) -> Result<u16> {
        self.connection.subscribe(topic, qos)
    }

    pub fn set_will(&self, will: Will) {
        self.connection.set_will(will);
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Start the receive loop on a background thread.
    pub fn start_loop(&self) -> Result<JoinHandle<()>> {
        self.connection.start_loop()
    }

    pub fn disconnect(&self) -> Result<()> {
        self.connection.disconnect()
    }

    pub fn on_connect<F>(&self, f: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.handler.set_on_connect(f);
    }

    pub fn on_disconnect<F>(&self, f: F)
    where
        F: Fn(Option<&str>) + Send + Sync + 'static,
    {
        self.handler.set_on_disconnect(f);
    }

    pub fn on_message<F>(&self, f: F)
    where
        F: Fn(&str, &[u8]) + Send + Sync + 'static,
    {
        self.handler.set_on_message(f);
    }

    /// Replace the closure handler with a full [`MqttHandler`].
    pub fn set_handler(&self, handler: Arc<dyn MqttHandler>) {
        self.connection.set_handler(handler);
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}
