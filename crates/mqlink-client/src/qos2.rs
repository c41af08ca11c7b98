//! QoS 2 (exactly-once) handshake tracking.
//!
//! Sender and receiver handshakes live in separate tables keyed by packet
//! identifier, since each side of the connection allocates identifiers
//! independently.
//!
//! ```text
//! sender:   AwaitPubrec --PUBREC--> AwaitPubcomp --PUBCOMP--> (removed)
//! receiver: AwaitPubrel --PUBREL--> (removed)
//!
//! Either side is also removed once its retries run out.
//! ```

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use log::warn;
use mqlink_core::{encode_pubcomp, encode_pubrec, encode_pubrel, Packet, QoS};

use crate::inflight::{Retry, RetryPolicy, RetryState};

/// Which side of the handshake we are on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// We published the message.
    Sender,
    /// The broker published the message to us.
    Receiver,
}

/// Handshake state of a tracked identifier. Completed handshakes are removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos2State {
    /// PUBLISH sent, awaiting PUBREC.
    AwaitPubrec,
    /// PUBREL sent, awaiting PUBCOMP.
    AwaitPubcomp,
    /// PUBREC sent, awaiting PUBREL.
    AwaitPubrel,
}

/// Result of an inbound PUBREC. Every variant carries the PUBREL to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubrecOutcome {
    /// First PUBREC: the handshake advanced to [`Qos2State::AwaitPubcomp`].
    Release(Packet),
    /// Repeated PUBREC: PUBREL is resent with DUP, state unchanged.
    DuplicateRelease(Packet),
    /// No handshake for this identifier.
    Unknown(Packet),
}

impl PubrecOutcome {
    pub fn pubrel(&self) -> &Packet {
        match self {
            Self::Release(p) | Self::DuplicateRelease(p) | Self::Unknown(p) => p,
        }
    }
}

/// Result of an inbound QoS 2 PUBLISH. Every variant carries the PUBREC to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundPublish {
    /// New message, stored until PUBREL.
    First(Packet),
    /// Already stored; PUBREC resent with DUP.
    Duplicate(Packet),
}

impl InboundPublish {
    pub fn pubrec(&self) -> &Packet {
        match self {
            Self::First(p) | Self::Duplicate(p) => p,
        }
    }
}

#[derive(Debug, Clone)]
struct Handshake {
    packet_id: u16,
    /// Our PUBLISH (sender) or the message to deliver (receiver).
    publish: Packet,
    state: Qos2State,
    retry: RetryState,
}

/// In-flight QoS 2 handshakes for both roles.
#[derive(Debug, Default)]
pub struct Qos2Tracker {
    policy: RetryPolicy,
    outbound: VecDeque<Handshake>,
    inbound: HashMap<u16, Handshake>,
}

impl Qos2Tracker {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            outbound: VecDeque::new(),
            inbound: HashMap::new(),
        }
    }

    /// Register a sent QoS 2 PUBLISH in [`Qos2State::AwaitPubrec`].
    pub fn track(&mut self, packet: Packet, now: Instant) {
        let Some(packet_id) = packet.packet_id() else {
            return;
        };
        let entry = Handshake {
            packet_id,
            publish: packet,
            state: Qos2State::AwaitPubrec,
            retry: RetryState::new(&self.policy, now),
        };
        match self.outbound.iter_mut().find(|h| h.packet_id == packet_id) {
            Some(existing) => *existing = entry,
            None => self.outbound.push_back(entry),
        }
    }

    pub fn on_pubrec(&mut self, packet_id: u16, now: Instant) -> PubrecOutcome {
        let policy = self.policy;
        match self.outbound.iter_mut().find(|h| h.packet_id == packet_id) {
            Some(entry) if entry.state == Qos2State::AwaitPubrec => {
                entry.state = Qos2State::AwaitPubcomp;
                entry.retry.reset(&policy, now);
                PubrecOutcome::Release(encode_pubrel(packet_id, false))
            }
            Some(_) => PubrecOutcome::DuplicateRelease(encode_pubrel(packet_id, true)),
            None => PubrecOutcome::Unknown(encode_pubrel(packet_id, false)),
        }
    }

    /// Complete a sender handshake. Returns the original PUBLISH, or `None`
    /// if no handshake is awaiting PUBCOMP for this identifier.
    pub fn on_pubcomp(&mut self, packet_id: u16) -> Option<Packet> {
        let pos = self
            .outbound
            .iter()
            .position(|h| h.packet_id == packet_id && h.state == Qos2State::AwaitPubcomp)?;
        self.outbound.remove(pos).map(|h| h.publish)
    }

    /// Drop a sender handshake without completing it.
    pub fn forget(&mut self, packet_id: u16) -> bool {
        let before = self.outbound.len();
        self.outbound.retain(|h| h.packet_id != packet_id);
        self.outbound.len() != before
    }

    /// Handle an inbound QoS 2 PUBLISH. Returns `None` if it has no identifier.
    ///
    /// The message is withheld from the application until PUBREL. A PUBLISH
    /// for an identifier that is already stored is a retransmission whether or
    /// not it carries DUP; the stored message is kept.
    pub fn on_publish(&mut self, packet: Packet, now: Instant) -> Option<InboundPublish> {
        let packet_id = packet.packet_id()?;
        if self.inbound.contains_key(&packet_id) {
            return Some(InboundPublish::Duplicate(encode_pubrec(packet_id, true)));
        }
        self.inbound.insert(
            packet_id,
            Handshake {
                packet_id,
                publish: packet,
                state: Qos2State::AwaitPubrel,
                retry: RetryState::new(&self.policy, now),
            },
        );
        Some(InboundPublish::First(encode_pubrec(packet_id, false)))
    }

    /// Handle an inbound PUBREL.
    ///
    /// Always yields the PUBCOMP to send. The stored message is returned only
    /// the first time, so it is delivered exactly once.
    pub fn on_pubrel(&mut self, packet_id: u16) -> (Packet, Option<Packet>) {
        let delivered = self.inbound.remove(&packet_id).map(|h| h.publish);
        (encode_pubcomp(packet_id), delivered)
    }

    /// Collect due retransmissions for both roles.
    ///
    /// Sender handshakes resend PUBLISH or PUBREL, receiver handshakes
    /// resend PUBREC. Either kind is dropped with [`Retry::GiveUp`] once its
    /// retries are used up. A dropped inbound message was never delivered,
    /// so a later retransmission of it starts a fresh handshake.
    pub fn due_for_retry(&mut self, now: Instant) -> Vec<Retry> {
        let policy = self.policy;
        let mut out = Vec::new();

        self.outbound.retain_mut(|entry| {
            if !entry.retry.is_due(now) {
                return true;
            }
            if entry.retry.exhausted(&policy) {
                out.push(Retry::GiveUp {
                    packet_id: entry.packet_id,
                    qos: QoS::ExactlyOnce,
                    role: Role::Sender,
                });
                return false;
            }
            let packet = match entry.state {
                Qos2State::AwaitPubcomp => encode_pubrel(entry.packet_id, true),
                _ => {
                    entry.publish.set_dup();
                    entry.publish.clone()
                }
            };
            entry.retry.backoff(&policy, now);
            out.push(Retry::Resend(packet));
            true
        });

        self.inbound.retain(|_, entry| {
            if !entry.retry.is_due(now) {
                return true;
            }
            if entry.retry.exhausted(&policy) {
                warn!(
                    "No PUBREL for inbound packet {} after {} retries",
                    entry.packet_id, entry.retry.attempts
                );
                out.push(Retry::GiveUp {
                    packet_id: entry.packet_id,
                    qos: QoS::ExactlyOnce,
                    role: Role::Receiver,
                });
                return false;
            }
            entry.retry.backoff(&policy, now);
            out.push(Retry::Resend(encode_pubrec(entry.packet_id, true)));
            true
        });

        out
    }

    pub fn state_of(&self, role: Role, packet_id: u16) -> Option<Qos2State> {
        match role {
            Role::Sender => self
                .outbound
                .iter()
                .find(|h| h.packet_id == packet_id)
                .map(|h| h.state),
            Role::Receiver => self.inbound.get(&packet_id).map(|h| h.state),
        }
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    pub fn clear(&mut self) {
        self.outbound.clear();
        self.inbound.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use mqlink_core::{decode_packet, PacketEncoder};

    use super::*;

    fn sent(encoder: &mut PacketEncoder) -> Packet {
        encoder
            .publish("q2/out", b"payload", QoS::ExactlyOnce, false, false)
            .unwrap()
    }

    fn received(packet_id: u16, dup: bool) -> Packet {
        let command = if dup { 0x3C } else { 0x34 };
        let mut raw = vec![command, 0x09, 0x00, 0x03, b'a', b'/', b'b'];
        raw.extend_from_slice(&packet_id.to_be_bytes());
        raw.extend_from_slice(b"hi");
        decode_packet(&raw).unwrap()
    }

    #[test]
    fn test_sender_handshake() {
        let mut encoder = PacketEncoder::new();
        let mut tracker = Qos2Tracker::default();
        let now = Instant::now();
        let packet = sent(&mut encoder);
        let id = packet.packet_id().unwrap();

        tracker.track(packet.clone(), now);
        assert_eq!(tracker.state_of(Role::Sender, id), Some(Qos2State::AwaitPubrec));

        let outcome = tracker.on_pubrec(id, now);
        assert_eq!(outcome, PubrecOutcome::Release(encode_pubrel(id, false)));
        assert_eq!(outcome.pubrel().raw()[0], 0x62);
        assert_eq!(tracker.state_of(Role::Sender, id), Some(Qos2State::AwaitPubcomp));

        assert_eq!(tracker.on_pubcomp(id), Some(packet));
        assert_eq!(tracker.state_of(Role::Sender, id), None);
        assert_eq!(tracker.outbound_len(), 0);
    }

    #[test]
    fn test_duplicate_pubrec_resends_pubrel_with_dup() {
        let mut encoder = PacketEncoder::new();
        let mut tracker = Qos2Tracker::default();
        let now = Instant::now();
        let packet = sent(&mut encoder);
        let id = packet.packet_id().unwrap();
        tracker.track(packet, now);

        tracker.on_pubrec(id, now);
        let again = tracker.on_pubrec(id, now);
        assert!(matches!(again, PubrecOutcome::DuplicateRelease(_)));
        assert!(again.pubrel().dup());
        assert_eq!(again.pubrel().raw()[0], 0x6A);
        assert_eq!(tracker.state_of(Role::Sender, id), Some(Qos2State::AwaitPubcomp));
    }

    #[test]
    fn test_unknown_pubrec_still_answered() {
        let mut tracker = Qos2Tracker::default();
        let outcome = tracker.on_pubrec(9, Instant::now());
        assert_eq!(outcome, PubrecOutcome::Unknown(encode_pubrel(9, false)));
    }

    #[test]
    fn test_pubcomp_before_pubrec_is_ignored() {
        let mut encoder = PacketEncoder::new();
        let mut tracker = Qos2Tracker::default();
        let packet = sent(&mut encoder);
        let id = packet.packet_id().unwrap();
        tracker.track(packet, Instant::now());

        assert_eq!(tracker.on_pubcomp(id), None);
        assert_eq!(tracker.state_of(Role::Sender, id), Some(Qos2State::AwaitPubrec));
    }

    #[test]
    fn test_receiver_handshake_delivers_once() {
        let mut tracker = Qos2Tracker::default();
        let now = Instant::now();

        let first = tracker.on_publish(received(7, false), now).unwrap();
        assert_eq!(first, InboundPublish::First(encode_pubrec(7, false)));
        assert_eq!(tracker.state_of(Role::Receiver, 7), Some(Qos2State::AwaitPubrel));

        let dup = tracker.on_publish(received(7, true), now).unwrap();
        assert_eq!(dup, InboundPublish::Duplicate(encode_pubrec(7, true)));
        assert_eq!(tracker.inbound_len(), 1);

        let (pubcomp, delivered) = tracker.on_pubrel(7);
        assert_eq!(pubcomp, encode_pubcomp(7));
        let delivered = delivered.unwrap();
        assert_eq!(delivered.topic(), Some("a/b"));
        assert_eq!(delivered.payload(), &Bytes::from_static(b"hi"));
        assert_eq!(tracker.state_of(Role::Receiver, 7), None);

        let (pubcomp, delivered) = tracker.on_pubrel(7);
        assert_eq!(pubcomp, encode_pubcomp(7));
        assert!(delivered.is_none());
    }

    #[test]
    fn test_roles_do_not_collide() {
        let mut encoder = PacketEncoder::new();
        let mut tracker = Qos2Tracker::default();
        let now = Instant::now();
        let packet = sent(&mut encoder);
        let id = packet.packet_id().unwrap();

        tracker.track(packet, now);
        tracker.on_publish(received(id, false), now);

        assert_eq!(tracker.state_of(Role::Sender, id), Some(Qos2State::AwaitPubrec));
        assert_eq!(tracker.state_of(Role::Receiver, id), Some(Qos2State::AwaitPubrel));

        let (_, delivered) = tracker.on_pubrel(id);
        assert!(delivered.is_some());
        assert_eq!(tracker.state_of(Role::Sender, id), Some(Qos2State::AwaitPubrec));
    }

    #[test]
    fn test_retry_packet_depends_on_state() {
        let mut encoder = PacketEncoder::new();
        let mut tracker = Qos2Tracker::default();
        let start = Instant::now();

        let awaiting_rec = sent(&mut encoder);
        let rec_id = awaiting_rec.packet_id().unwrap();
        let awaiting_comp = sent(&mut encoder);
        let comp_id = awaiting_comp.packet_id().unwrap();
        tracker.track(awaiting_rec, start);
        tracker.track(awaiting_comp, start);
        tracker.on_pubrec(comp_id, start);
        tracker.on_publish(received(300, false), start);

        let retries = tracker.due_for_retry(start + Duration::from_secs(2));
        let resent: Vec<Packet> = retries
            .into_iter()
            .filter_map(|r| match r {
                Retry::Resend(p) => Some(p),
                Retry::GiveUp { .. } => None,
            })
            .collect();
        assert_eq!(resent.len(), 3);

        assert_eq!(resent[0].packet_id(), Some(rec_id));
        assert_eq!(resent[0].raw()[0], 0x3C);
        assert_eq!(resent[1], encode_pubrel(comp_id, true));
        assert_eq!(resent[2], encode_pubrec(300, true));
    }

    #[test]
    fn test_both_roles_give_up_after_retries() {
        let mut encoder = PacketEncoder::new();
        let mut tracker = Qos2Tracker::default();
        let mut now = Instant::now();
        let packet = sent(&mut encoder);
        let id = packet.packet_id().unwrap();
        tracker.track(packet, now);
        tracker.on_publish(received(5, false), now);

        let mut resent = 0;
        let mut gave_up = Vec::new();
        for _ in 0..10 {
            now += Duration::from_secs(120);
            for retry in tracker.due_for_retry(now) {
                match retry {
                    Retry::Resend(_) => resent += 1,
                    Retry::GiveUp {
                        packet_id,
                        qos,
                        role,
                    } => gave_up.push((packet_id, qos, role)),
                }
            }
        }

        assert_eq!(resent, 10);
        gave_up.sort_by_key(|(packet_id, _, _)| *packet_id);
        assert_eq!(
            gave_up,
            vec![
                (id, QoS::ExactlyOnce, Role::Sender),
                (5, QoS::ExactlyOnce, Role::Receiver),
            ]
        );
        assert_eq!(tracker.outbound_len(), 0);
        assert_eq!(tracker.inbound_len(), 0);
        assert!(tracker.due_for_retry(now + Duration::from_secs(3600)).is_empty());
    }

    #[test]
    fn test_dropped_inbound_message_can_arrive_again() {
        let mut tracker = Qos2Tracker::default();
        let mut now = Instant::now();
        tracker.on_publish(received(5, false), now);
        for _ in 0..6 {
            now += Duration::from_secs(120);
            tracker.due_for_retry(now);
        }
        assert_eq!(tracker.state_of(Role::Receiver, 5), None);

        // Late PUBREL is completed without delivery
        let (pubcomp, delivered) = tracker.on_pubrel(5);
        assert_eq!(pubcomp, encode_pubcomp(5));
        assert!(delivered.is_none());

        // A retransmission is a new handshake
        let again = tracker.on_publish(received(5, true), now).unwrap();
        assert!(matches!(again, InboundPublish::First(_)));
        assert!(tracker.on_pubrel(5).1.is_some());
    }
}
