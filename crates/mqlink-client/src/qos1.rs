//! QoS 1 (at-least-once) outbound tracking.
//!
//! Every QoS 1 PUBLISH stays here until the matching PUBACK arrives. Entries
//! are kept in send order so retransmissions go out in the order the
//! messages were first published.

use std::collections::VecDeque;
use std::time::Instant;

use mqlink_core::{Packet, QoS};

use crate::inflight::{Retry, RetryPolicy, RetryState};
use crate::qos2::Role;

#[derive(Debug, Clone)]
struct InflightPublish {
    packet_id: u16,
    packet: Packet,
    retry: RetryState,
}

/// PUBLISH packets awaiting PUBACK.
#[derive(Debug, Default)]
pub struct Qos1Tracker {
    policy: RetryPolicy,
    pending: VecDeque<InflightPublish>,
}

impl Qos1Tracker {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            pending: VecDeque::new(),
        }
    }

    /// Register a sent PUBLISH. A packet without an identifier is ignored.
    ///
    /// Reusing an identifier replaces the earlier entry.
    pub fn track(&mut self, packet: Packet, now: Instant) {
        let Some(packet_id) = packet.packet_id() else {
            return;
        };
        let entry = InflightPublish {
            packet_id,
            packet,
            retry: RetryState::new(&self.policy, now),
        };
        match self.pending.iter_mut().find(|p| p.packet_id == packet_id) {
            Some(existing) => *existing = entry,
            None => self.pending.push_back(entry),
        }
    }

    /// Remove the entry for a PUBACK. Returns `None` for an unknown
    /// identifier (late or duplicate PUBACK).
    pub fn acknowledge(&mut self, packet_id: u16) -> Option<Packet> {
        let pos = self.pending.iter().position(|p| p.packet_id == packet_id)?;
        self.pending.remove(pos).map(|p| p.packet)
    }

    /// Collect due retransmissions and advance their schedules.
    ///
    /// Resent packets carry DUP. Entries whose retries are used up are
    /// removed and reported as [`Retry::GiveUp`].
    pub fn due_for_retry(&mut self, now: Instant) -> Vec<Retry> {
        let policy = self.policy;
        let mut out = Vec::new();

        self.pending.retain_mut(|entry| {
            if !entry.retry.is_due(now) {
                return true;
            }
            if entry.retry.exhausted(&policy) {
                out.push(Retry::GiveUp {
                    packet_id: entry.packet_id,
                    qos: QoS::AtLeastOnce,
                    role: Role::Sender,
                });
                return false;
            }
            entry.packet.set_dup();
            entry.retry.backoff(&policy, now);
            out.push(Retry::Resend(entry.packet.clone()));
            true
        });

        out
    }

    pub fn contains(&self, packet_id: u16) -> bool {
        self.pending.iter().any(|p| p.packet_id == packet_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
