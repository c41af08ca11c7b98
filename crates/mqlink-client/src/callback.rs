//! Application callbacks.
//!
//! Handlers run on the receive thread or the retry thread. Every call goes
//! through a panic boundary: a panicking handler is logged and the protocol
//! machinery carries on.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use log::error;
use mqlink_core::QoS;
use parking_lot::RwLock;

/// Handler trait for MQTT events.
///
/// All methods have default implementations that do nothing.
pub trait MqttHandler: Send + Sync {
    /// Called when the broker accepted the connection.
    #[allow(unused_variables)]
    fn on_connect(&self, session_present: bool) {}

    /// Called once when an established connection ends.
    ///
    /// `reason` is `None` for a client-initiated disconnect.
    #[allow(unused_variables)]
    fn on_disconnect(&self, reason: Option<&str>) {}

    /// Called for every delivered application message.
    ///
    /// QoS 2 messages are delivered once, after PUBREL.
    #[allow(unused_variables)]
    fn on_message(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) {}

    /// Called when a QoS 1/2 publish has been fully acknowledged.
    #[allow(unused_variables)]
    fn on_published(&self, packet_id: u16) {}

    /// Called when a publish was abandoned after exhausting its retries.
    #[allow(unused_variables)]
    fn on_delivery_failed(&self, packet_id: u16, qos: QoS) {}

    /// Called when an inbound QoS 2 message is dropped because the broker
    /// never sent PUBREL. The message was not delivered.
    #[allow(unused_variables)]
    fn on_inbound_dropped(&self, packet_id: u16) {}

    /// Called when a subscribe request has been acknowledged.
    #[allow(unused_variables)]
    fn on_subscribed(&self, packet_id: u16, return_codes: &[u8]) {}
}

/// Handler that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl MqttHandler for NoopHandler {}

type ConnectFn = Arc<dyn Fn(bool) + Send + Sync>;
type DisconnectFn = Arc<dyn Fn(Option<&str>) + Send + Sync>;
type MessageFn = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Handler assembled from closures.
///
/// Closures can be replaced at any time, including from inside a callback.
#[derive(Default)]
pub struct FnHandler {
    on_connect: RwLock<Option<ConnectFn>>,
    on_disconnect: RwLock<Option<DisconnectFn>>,
    on_message: RwLock<Option<MessageFn>>,
}

impl FnHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_on_connect<F>(&self, f: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        *self.on_connect.write() = Some(Arc::new(f));
    }

    pub fn set_on_disconnect<F>(&self, f: F)
    where
        F: Fn(Option<&str>) + Send + Sync + 'static,
    {
        *self.on_disconnect.write() = Some(Arc::new(f));
    }

    pub fn set_on_message<F>(&self, f: F)
    where
        F: Fn(&str, &[u8]) + Send + Sync + 'static,
    {
        *self.on_message.write() = Some(Arc::new(f));
    }
}

impl MqttHandler for FnHandler {
    fn on_connect(&self, session_present: bool) {
        let f = self.on_connect.read().clone();
        if let Some(f) = f {
            f(session_present);
        }
    }

    fn on_disconnect(&self, reason: Option<&str>) {
        let f = self.on_disconnect.read().clone();
        if let Some(f) = f {
            f(reason);
        }
    }

    fn on_message(&self, topic: &str, payload: &[u8], _qos: QoS, _retain: bool) {
        let f = self.on_message.read().clone();
        if let Some(f) = f {
            f(topic, payload);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Run `f`, logging and swallowing any panic.
pub(crate) fn guarded<F: FnOnce()>(name: &str, f: F) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
        error!("{} callback panicked: {}", name, panic_message(payload.as_ref()));
    }
}

/// The installed handler, shared by the receive and retry threads.
///
/// The handler is cloned out of the lock before each call, so a callback
/// may install a new handler without deadlocking.
pub(crate) struct Callbacks {
    handler: RwLock<Arc<dyn MqttHandler>>,
}

impl Callbacks {
    pub fn new(handler: Arc<dyn MqttHandler>) -> Self {
        Self {
            handler: RwLock::new(handler),
        }
    }

    pub fn set(&self, handler: Arc<dyn MqttHandler>) {
        *self.handler.write() = handler;
    }

    fn current(&self) -> Arc<dyn MqttHandler> {
        self.handler.read().clone()
    }

    pub fn connect(&self, session_present: bool) {
        let h = self.current();
        guarded("on_connect", || h.on_connect(session_present));
    }

    pub fn disconnect(&self, reason: Option<&str>) {
        let h = self.current();
        guarded("on_disconnect", || h.on_disconnect(reason));
    }

    pub fn message(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) {
        let h = self.current();
        guarded("on_message", || h.on_message(topic, payload, qos, retain));
    }

    pub fn published(&self, packet_id: u16) {
        let h = self.current();
        guarded("on_published", || h.on_published(packet_id));
    }

    pub fn delivery_failed(&self, packet_id: u16, qos: QoS) {
        let h = self.current();
        guarded("on_delivery_failed", || h.on_delivery_failed(packet_id, qos));
    }

    pub fn inbound_dropped(&self, packet_id: u16) {
        let h = self.current();
        guarded("on_inbound_dropped", || h.on_inbound_dropped(packet_id));
    }

    pub fn subscribed(&self, packet_id: u16, return_codes: &[u8]) {
        let h = self.current();
        guarded("on_subscribed", || h.on_subscribed(packet_id, return_codes));
    }
}

impl Default for Callbacks {
    fn default() -> Self {
        Self::new(Arc::new(NoopHandler))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Panicky;

    impl MqttHandler for Panicky {
        fn on_message(&self, _topic: &str, _payload: &[u8], _qos: QoS, _retain: bool) {
            panic!("boom");
        }

        fn on_connect(&self, _session_present: bool) {
            panic!("{}", String::from("owned boom"));
        }
    }

    #[test]
    fn test_panic_is_contained() {
        let callbacks = Callbacks::new(Arc::new(Panicky));
        callbacks.message("t", b"p", QoS::AtMostOnce, false);
        callbacks.connect(false);
        // Default methods still work after a panic
        callbacks.published(1);
    }

    #[test]
    fn test_panic_message() {
        let payload = panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload = panic::catch_unwind(|| panic!("{}", 42)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "42");
    }

    #[test]
    fn test_fn_handler() {
        let hits = Arc::new(AtomicUsize::new(0));
        let handler = FnHandler::new();

        let h = hits.clone();
        handler.set_on_message(move |topic, payload| {
            assert_eq!(topic, "a/b");
            assert_eq!(payload, b"hi");
            h.fetch_add(1, Ordering::SeqCst);
        });
        let h = hits.clone();
        handler.set_on_connect(move |present| {
            assert!(present);
            h.fetch_add(10, Ordering::SeqCst);
        });

        let callbacks = Callbacks::new(Arc::new(handler));
        callbacks.message("a/b", b"hi", QoS::AtLeastOnce, false);
        callbacks.connect(true);
        callbacks.disconnect(Some("unset closure is a no-op"));

        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_handler_replaced_from_callback() {
        struct Swapper {
            callbacks: Arc<Callbacks>,
        }

        impl MqttHandler for Swapper {
            fn on_connect(&self, _session_present: bool) {
                self.callbacks.set(Arc::new(NoopHandler));
            }
        }

        let callbacks = Arc::new(Callbacks::default());
        callbacks.set(Arc::new(Swapper {
            callbacks: callbacks.clone(),
        }));
        callbacks.connect(false);
        callbacks.connect(false);
    }
}
