//! mqlink-client - blocking MQTT 3.1.1 client.
//!
//! One [`Connection`] owns a TCP socket, the packet encoder and the QoS 1/2
//! trackers. Inbound packets are read on a receive-loop thread; a periodic
//! task retransmits unacknowledged packets with exponential backoff and keeps
//! the connection alive. Application code observes events through an
//! [`MqttHandler`], or through closures on the [`Client`] facade.
//!
//! # Example
//!
//! ```no_run
//! use mqlink_client::{Client, ClientConfig, QoS};
//!
//! let client = Client::new(ClientConfig::new("localhost:1883").client_id("my-client"));
//! client.on_message(|topic, payload| {
//!     println!("{}: {}", topic, String::from_utf8_lossy(payload));
//! });
//!
//! client.connect()?;
//! client.start_loop()?;
//!
//! client.subscribe("sensors/#", QoS::AtLeastOnce)?;
//! client.publish("sensors/temp", "25.5", QoS::ExactlyOnce, false)?;
//! # Ok::<(), mqlink_client::ClientError>(())
//! ```

mod callback;
mod client;
mod config;
mod connection;
mod error;
mod events;
mod inflight;
mod qos1;
mod qos2;
mod session;
mod timer;
mod transport;
mod will;

pub use callback::{FnHandler, MqttHandler, NoopHandler};
pub use client::Client;
pub use config::{ClientConfig, DEFAULT_CONFIG_FILE};
pub use connection::Connection;
pub use error::{ClientError, Result};
pub use events::ConnectionState;
pub use inflight::{Retry, RetryPolicy, RetryState};
pub use qos1::Qos1Tracker;
pub use qos2::{InboundPublish, PubrecOutcome, Qos2State, Qos2Tracker, Role};
pub use session::{Outbound, Session};
pub use timer::PeriodicTask;
pub use transport::{Connector, FrameReader, TcpConnector, Transport};
pub use will::Will;

// Re-export useful types from core
pub use mqlink_core::{ConnectRefusal, Packet, PacketType, ProtocolError, QoS};
