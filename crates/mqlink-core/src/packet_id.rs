//! Packet identifier generation.
//!
//! Packet identifiers are 16-bit non-zero values carried by QoS 1/2 PUBLISH
//! and SUBSCRIBE packets. Each connection owns its own generator.

/// Monotonic packet identifier counter.
///
/// Starts at 1, never yields 0, and wraps from 65535 back to 1.
#[derive(Debug, Clone)]
pub struct PacketIdGenerator {
    next_id: u16,
}

impl Default for PacketIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketIdGenerator {
    /// Create a generator whose first identifier is 1.
    pub fn new() -> Self {
        Self { next_id: 1 }
    }

    /// Take the next identifier.
    pub fn next_id(&mut self) -> u16 {
        let id = self.next_id;
        self.advance_next();
        id
    }

    /// The identifier the next call to [`next_id`](Self::next_id) returns.
    pub fn peek(&self) -> u16 {
        self.next_id
    }

    /// Restart the sequence at 1 (used on clean session connect).
    pub fn reset(&mut self) {
        self.next_id = 1;
    }

    /// Advance next_id, skipping 0.
    fn advance_next(&mut self) {
        self.next_id = self.next_id.wrapping_add(1);
        if self.next_id == 0 {
            self.next_id = 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_allocation() {
        let mut ids = PacketIdGenerator::new();
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
        assert_eq!(ids.next_id(), 3);
        assert_eq!(ids.peek(), 4);
    }

    #[test]
    fn test_skips_zero() {
        let mut ids = PacketIdGenerator::new();
        ids.next_id = 65535;
        assert_eq!(ids.next_id(), 65535);
        assert_eq!(ids.next_id(), 1); // Skipped 0
    }

    #[test]
    fn test_full_cycle_never_yields_zero() {
        let mut ids = PacketIdGenerator::new();
        for expected in 1..=u16::MAX {
            assert_eq!(ids.next_id(), expected);
        }
        assert_eq!(ids.next_id(), 1);
    }

    #[test]
    fn test_reset() {
        let mut ids = PacketIdGenerator::new();
        ids.next_id();
        ids.next_id();
        ids.reset();
        assert_eq!(ids.next_id(), 1);
    }
}
