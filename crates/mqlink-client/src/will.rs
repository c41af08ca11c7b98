//! Last Will and Testament.

use bytes::Bytes;
use mqlink_core::{LastWill, QoS};

/// Message the broker publishes on our behalf if the connection drops
/// without a DISCONNECT.
///
/// The will is sent with CONNECT, so it takes effect on the next
/// [`Connection::connect`](crate::Connection::connect).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl Will {
    /// Create a new will message with QoS 0 and no retain.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

impl From<Will> for LastWill {
    fn from(will: Will) -> Self {
        LastWill {
            topic: will.topic,
            message: will.payload,
            qos: will.qos,
            retain: will.retain,
        }
    }
}
