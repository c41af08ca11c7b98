//! Retransmission policy shared by the QoS 1 and QoS 2 trackers.

use std::time::{Duration, Instant};

use mqlink_core::{Packet, QoS};
use serde::Deserialize;

use crate::config::duration_secs;
use crate::qos2::Role;

/// Exponential backoff policy for unacknowledged packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Resends before the delivery is abandoned.
    pub max_retries: u32,
    /// Wait before the first resend.
    #[serde(with = "duration_secs")]
    pub initial_interval: Duration,
    /// Upper bound for the doubled interval.
    #[serde(with = "duration_secs")]
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if self.initial_interval.is_zero() {
            return Err("retry.initial_interval must be positive".to_string());
        }
        if self.max_interval < self.initial_interval {
            return Err("retry.max_interval must be >= retry.initial_interval".to_string());
        }
        Ok(())
    }
}

/// Retry bookkeeping for one in-flight packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    pub attempts: u32,
    pub interval: Duration,
    /// `None` means never due.
    pub deadline: Option<Instant>,
}

impl RetryState {
    pub fn new(policy: &RetryPolicy, now: Instant) -> Self {
        Self {
            attempts: 0,
            interval: policy.initial_interval,
            deadline: now.checked_add(policy.initial_interval),
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    pub fn exhausted(&self, policy: &RetryPolicy) -> bool {
        self.attempts >= policy.max_retries
    }

    /// Count one resend and schedule the next one at twice the interval.
    pub fn backoff(&mut self, policy: &RetryPolicy, now: Instant) {
        self.attempts += 1;
        self.interval = self
            .interval
            .checked_mul(2)
            .unwrap_or(policy.max_interval)
            .min(policy.max_interval);
        self.deadline = now.checked_add(self.interval);
    }

    /// Restart the schedule after the handshake made progress.
    pub fn reset(&mut self, policy: &RetryPolicy, now: Instant) {
        *self = Self::new(policy, now);
    }
}

/// Output of a tracker's retry scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Retry {
    /// Send this packet again; DUP is already set where it applies.
    Resend(Packet),
    /// Retries are exhausted and the entry was dropped.
    ///
    /// `role` tells an abandoned publish of ours ([`Role::Sender`]) from an
    /// inbound QoS 2 message the broker never released ([`Role::Receiver`]).
    GiveUp {
        packet_id: u16,
        qos: QoS,
        role: Role,
    },
}
