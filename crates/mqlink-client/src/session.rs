//! Per-connection protocol state.
//!
//! The session owns the packet encoder and both QoS trackers. It turns
//! inbound packets into replies and application events, and outbound
//! requests into tracked packets. It performs no I/O itself: everything is
//! written through an [`Outbound`] sink.
//!
//! The receive loop and the retry task share one session. Each tracker has
//! its own lock, and no lock is held while sending or running callbacks.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};
use mqlink_core::{encode_puback, Packet, PacketEncoder, PacketType, QoS};
use parking_lot::Mutex;

use crate::callback::Callbacks;
use crate::error::Result;
use crate::inflight::{Retry, RetryPolicy};
use crate::qos1::Qos1Tracker;
use crate::qos2::{InboundPublish, PubrecOutcome, Qos2State, Qos2Tracker, Role};

/// Where the session writes packets.
pub trait Outbound: Send + Sync {
    fn send(&self, packet: &Packet) -> Result<()>;
}

pub struct Session {
    encoder: Mutex<PacketEncoder>,
    qos1: Mutex<Qos1Tracker>,
    qos2: Mutex<Qos2Tracker>,
    callbacks: Arc<Callbacks>,
    pending_pings: AtomicU32,
}

impl Session {
    pub(crate) fn new(policy: RetryPolicy, callbacks: Arc<Callbacks>) -> Self {
        Self {
            encoder: Mutex::new(PacketEncoder::new()),
            qos1: Mutex::new(Qos1Tracker::new(policy)),
            qos2: Mutex::new(Qos2Tracker::new(policy)),
            callbacks,
            pending_pings: AtomicU32::new(0),
        }
    }

    /// Encode, track and send a PUBLISH.
    ///
    /// Returns the packet identifier for QoS 1/2. The message is tracked
    /// before it is written so that a fast acknowledgement always finds it.
    pub fn publish(
        &self,
        out: &dyn Outbound,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<Option<u16>> {
        let packet = self.encoder.lock().publish(topic, payload, qos, retain, false)?;
        let packet_id = packet.packet_id();
        let now = Instant::now();

        match qos {
            QoS::AtMostOnce => {}
            QoS::AtLeastOnce => self.qos1.lock().track(packet.clone(), now),
            QoS::ExactlyOnce => self.qos2.lock().track(packet.clone(), now),
        }

        if let Err(e) = out.send(&packet) {
            if let Some(id) = packet_id {
                self.untrack(id, qos);
            }
            return Err(e);
        }
        Ok(packet_id)
    }

    fn untrack(&self, packet_id: u16, qos: QoS) {
        match qos {
            QoS::AtMostOnce => {}
            QoS::AtLeastOnce => {
                self.qos1.lock().acknowledge(packet_id);
            }
            QoS::ExactlyOnce => {
                self.qos2.lock().forget(packet_id);
            }
        }
    }

    /// Encode and send a single-topic SUBSCRIBE. Returns its identifier.
    pub fn subscribe(&self, out: &dyn Outbound, topic: &str, qos: QoS) -> Result<u16> {
        let packet = self.encoder.lock().subscribe(topic, qos)?;
        out.send(&packet)?;
        info!("Subscribing to {:?} (qos {})", topic, qos as u8);
        Ok(packet.packet_id().unwrap_or_default())
    }

    /// Dispatch one inbound packet.
    ///
    /// Only a failed write is returned as an error; protocol anomalies are
    /// logged and otherwise ignored.
    pub fn handle(&self, out: &dyn Outbound, packet: Packet) -> Result<()> {
        match packet.packet_type() {
            PacketType::Publish => self.handle_publish(out, packet),
            PacketType::Puback => {
                let Some(id) = packet.packet_id() else {
                    return Ok(());
                };
                if self.qos1.lock().acknowledge(id).is_some() {
                    debug!("Publish {} acknowledged", id);
                    self.callbacks.published(id);
                } else {
                    warn!("PUBACK for unknown packet {}", id);
                }
                Ok(())
            }
            PacketType::Pubrec => {
                let Some(id) = packet.packet_id() else {
                    return Ok(());
                };
                let outcome = self.qos2.lock().on_pubrec(id, Instant::now());
                match &outcome {
                    PubrecOutcome::Release(_) => {}
                    PubrecOutcome::DuplicateRelease(_) => debug!("Duplicate PUBREC {}", id),
                    PubrecOutcome::Unknown(_) => warn!("PUBREC for unknown packet {}", id),
                }
                out.send(outcome.pubrel())
            }
            PacketType::Pubcomp => {
                let Some(id) = packet.packet_id() else {
                    return Ok(());
                };
                if self.qos2.lock().on_pubcomp(id).is_some() {
                    debug!("Publish {} completed", id);
                    self.callbacks.published(id);
                } else {
                    warn!("PUBCOMP for unknown packet {}", id);
                }
                Ok(())
            }
            PacketType::Pubrel => {
                let Some(id) = packet.packet_id() else {
                    return Ok(());
                };
                let (pubcomp, delivered) = self.qos2.lock().on_pubrel(id);
                out.send(&pubcomp)?;
                match delivered {
                    Some(message) => self.deliver(&message),
                    None => debug!("PUBREL for completed packet {}", id),
                }
                Ok(())
            }
            PacketType::Suback => {
                let id = packet.packet_id().unwrap_or_default();
                info!("Subscription {} granted: {:?}", id, packet.return_codes());
                self.callbacks.subscribed(id, packet.return_codes());
                Ok(())
            }
            PacketType::Pingresp => {
                self.pending_pings.store(0, Ordering::SeqCst);
                Ok(())
            }
            PacketType::Connack => {
                warn!("Ignoring CONNACK on an established connection");
                Ok(())
            }
            other => {
                warn!("Ignoring unexpected {:?}", other);
                Ok(())
            }
        }
    }

    fn handle_publish(&self, out: &dyn Outbound, packet: Packet) -> Result<()> {
        match packet.qos() {
            QoS::AtMostOnce => {
                self.deliver(&packet);
                Ok(())
            }
            QoS::AtLeastOnce => {
                self.deliver(&packet);
                match packet.packet_id() {
                    Some(id) => out.send(&encode_puback(id, false)),
                    None => Ok(()),
                }
            }
            QoS::ExactlyOnce => {
                let id = packet.packet_id();
                let Some(result) = self.qos2.lock().on_publish(packet, Instant::now()) else {
                    return Ok(());
                };
                if let InboundPublish::Duplicate(_) = result {
                    debug!("Duplicate QoS 2 publish {:?}", id);
                }
                out.send(result.pubrec())
            }
        }
    }

    fn deliver(&self, message: &Packet) {
        self.callbacks.message(
            message.topic().unwrap_or_default(),
            message.payload(),
            message.qos(),
            message.retain(),
        );
    }

    /// Resend everything that is due and report abandoned handshakes.
    ///
    /// Give-ups are reported before anything is written, so a failed resend
    /// cannot swallow them. The first write error stops the resends.
    pub fn retry_due(&self, out: &dyn Outbound, now: Instant) -> Result<()> {
        let mut due = self.qos1.lock().due_for_retry(now);
        due.extend(self.qos2.lock().due_for_retry(now));

        let mut resends = Vec::with_capacity(due.len());
        for retry in due {
            match retry {
                Retry::Resend(packet) => resends.push(packet),
                Retry::GiveUp {
                    packet_id,
                    qos,
                    role: Role::Sender,
                } => {
                    warn!(
                        "Giving up on packet {} (qos {}) after retries",
                        packet_id, qos as u8
                    );
                    self.callbacks.delivery_failed(packet_id, qos);
                }
                Retry::GiveUp {
                    packet_id,
                    role: Role::Receiver,
                    ..
                } => {
                    warn!("Dropping inbound packet {}: never released", packet_id);
                    self.callbacks.inbound_dropped(packet_id);
                }
            }
        }

        for packet in resends {
            debug!("Retransmitting {}", packet);
            out.send(&packet)?;
        }
        Ok(())
    }

    /// Count a sent PINGREQ. Returns the number now outstanding.
    pub(crate) fn ping_sent(&self) -> u32 {
        self.pending_pings.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn pending_pings(&self) -> u32 {
        self.pending_pings.load(Ordering::SeqCst)
    }

    /// Forget all in-flight state, as for a clean session.
    pub fn clear(&self) {
        self.qos1.lock().clear();
        self.qos2.lock().clear();
        self.pending_pings.store(0, Ordering::SeqCst);
    }

    pub(crate) fn reset_pings(&self) {
        self.pending_pings.store(0, Ordering::SeqCst);
    }

    /// Number of QoS 1 publishes awaiting PUBACK.
    pub fn qos1_pending(&self) -> usize {
        self.qos1.lock().len()
    }

    pub fn qos2_state(&self, role: Role, packet_id: u16) -> Option<Qos2State> {
        self.qos2.lock().state_of(role, packet_id)
    }
}
