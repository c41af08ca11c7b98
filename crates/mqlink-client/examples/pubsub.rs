//! Publish/subscribe round trip against a local broker.
//!
//! Run with: cargo run -p mqlink-client --example pubsub [config.toml]
//!
//! Configuration is read from `mqlink.toml` (or the given path) and
//! `MQLINK__*` environment variables, e.g. `MQLINK__ADDRESS=broker:1883`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{error, info};
use mqlink_client::{ClientConfig, Connection, MqttHandler, QoS, Will, DEFAULT_CONFIG_FILE};

struct Printer {
    received: AtomicUsize,
}

impl MqttHandler for Printer {
    fn on_connect(&self, session_present: bool) {
        info!("Connected (session present: {})", session_present);
    }

    fn on_disconnect(&self, reason: Option<&str>) {
        info!("Disconnected: {}", reason.unwrap_or("requested"));
    }

    fn on_message(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) {
        let n = self.received.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            "#{} {} -> {} (qos {}, retain {})",
            n,
            topic,
            String::from_utf8_lossy(payload),
            qos as u8,
            retain
        );
    }

    fn on_published(&self, packet_id: u16) {
        info!("Publish {} acknowledged", packet_id);
    }

    fn on_delivery_failed(&self, packet_id: u16, qos: QoS) {
        error!("Publish {} (qos {}) was not delivered", packet_id, qos as u8);
    }

    fn on_inbound_dropped(&self, packet_id: u16) {
        error!("Inbound message {} dropped: broker never released it", packet_id);
    }

    fn on_subscribed(&self, packet_id: u16, return_codes: &[u8]) {
        info!("Subscribe {} granted {:?}", packet_id, return_codes);
    }
}

fn main() {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());

    let config = match ClientConfig::load(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level))
        .init();

    let config = if config.client_id.is_empty() {
        config.client_id(format!("mqlink-{}", std::process::id()))
    } else {
        config
    };
    let timeout = config.connect_timeout;

    let connection = Connection::new(config);
    connection.set_will(Will::new("mqlink/demo/status", "offline").retain(true));
    connection.set_handler(Arc::new(Printer {
        received: AtomicUsize::new(0),
    }));

    if let Err(e) = connection.connect(timeout) {
        error!("Could not connect: {}", e);
        std::process::exit(1);
    }

    let receiver = match connection.start_loop() {
        Ok(handle) => handle,
        Err(e) => {
            error!("Could not start receive loop: {}", e);
            std::process::exit(1);
        }
    };

    let run = || -> mqlink_client::Result<()> {
        connection.subscribe("mqlink/demo/#", QoS::ExactlyOnce)?;
        for (i, qos) in [QoS::AtMostOnce, QoS::AtLeastOnce, QoS::ExactlyOnce]
            .into_iter()
            .enumerate()
        {
            let payload = format!("message {}", i);
            connection.publish("mqlink/demo/data", payload.as_bytes(), qos, false)?;
        }
        Ok(())
    };
    if let Err(e) = run() {
        error!("{}", e);
    }

    thread::sleep(Duration::from_secs(3));

    if let Err(e) = connection.disconnect() {
        error!("Disconnect failed: {}", e);
    }
    let _ = receiver.join();
}
