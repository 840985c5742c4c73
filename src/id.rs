//! Uid Generator
//!
//! Generates globally unique, time-ordered 64-bit identifiers used for
//! broker session uids, packet correlation ids and takeover tokens,
//! without any cross-broker coordination. Time ordering is load-bearing:
//! a restarted broker's fresh session uid compares newer than every uid
//! its dead incarnation issued, and a retried takeover token compares
//! newer than the retired one.
//!
//! Uid Structure (64 bits):
//! - 1 bit: unused (sign bit)
//! - 41 bits: timestamp (milliseconds since epoch, ~69 years)
//! - 10 bits: node ID (0-1023)
//! - 12 bits: sequence (0-4095 per millisecond)

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Custom epoch: 2024-01-01 00:00:00 UTC
const WOLFMQ_EPOCH: u64 = 1704067200000;

/// Bit allocation
#[allow(dead_code)]
const TIMESTAMP_BITS: u64 = 41;
const NODE_ID_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;

/// Masks
const MAX_NODE_ID: u64 = (1 << NODE_ID_BITS) - 1;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;

/// Shifts
const NODE_ID_SHIFT: u64 = SEQUENCE_BITS;
const TIMESTAMP_SHIFT: u64 = NODE_ID_BITS + SEQUENCE_BITS;

/// Time-ordered unique identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Uid(pub u64);

impl Uid {
    /// Create from raw value
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw u64 value
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Extract timestamp from the uid (milliseconds since the UNIX epoch)
    pub fn timestamp(&self) -> u64 {
        (self.0 >> TIMESTAMP_SHIFT) + WOLFMQ_EPOCH
    }

    /// Extract the issuing node ID
    pub fn node_id(&self) -> u16 {
        ((self.0 >> NODE_ID_SHIFT) & MAX_NODE_ID) as u16
    }

    /// Extract the per-millisecond sequence number
    pub fn sequence(&self) -> u16 {
        (self.0 & MAX_SEQUENCE) as u16
    }
}

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Uid {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Uid> for u64 {
    fn from(id: Uid) -> Self {
        id.0
    }
}

/// Uid Generator
///
/// Thread-safe generator producing uids for a specific broker node.
pub struct UidGenerator {
    node_id: u64,
    /// Packed state: upper 52 bits = last_timestamp, lower 12 bits = sequence
    state: AtomicU64,
}

impl UidGenerator {
    /// Create a new generator for the given node ID
    ///
    /// # Panics
    /// Panics if node_id > 1023
    pub fn new(node_id: u16) -> Self {
        assert!(
            (node_id as u64) <= MAX_NODE_ID,
            "Node ID must be 0-1023, got {}",
            node_id
        );

        Self {
            node_id: node_id as u64,
            state: AtomicU64::new(0),
        }
    }

    /// Generate a new unique uid
    ///
    /// This method is lock-free and thread-safe.
    pub fn generate(&self) -> Uid {
        loop {
            let current_time = Self::current_time_millis();
            let old_state = self.state.load(Ordering::Relaxed);
            let old_timestamp = old_state >> SEQUENCE_BITS;
            let old_sequence = old_state & MAX_SEQUENCE;

            let (new_timestamp, new_sequence) = if current_time > old_timestamp {
                // New millisecond, reset sequence
                (current_time, 0)
            } else if current_time == old_timestamp {
                // Same millisecond, increment sequence
                let next_seq = old_sequence + 1;
                if next_seq > MAX_SEQUENCE {
                    // Sequence overflow, wait for next millisecond
                    std::thread::yield_now();
                    continue;
                }
                (current_time, next_seq)
            } else {
                // Clock went backwards (rare), use old timestamp + next sequence
                let next_seq = old_sequence + 1;
                if next_seq > MAX_SEQUENCE {
                    // Wait for time to catch up
                    std::thread::sleep(std::time::Duration::from_millis(1));
                    continue;
                }
                (old_timestamp, next_seq)
            };

            let new_state = (new_timestamp << SEQUENCE_BITS) | new_sequence;

            if self
                .state
                .compare_exchange(old_state, new_state, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                let id = (new_timestamp << TIMESTAMP_SHIFT)
                    | (self.node_id << NODE_ID_SHIFT)
                    | new_sequence;
                return Uid(id);
            }
            // CAS failed, retry
        }
    }

    /// Get current time in milliseconds since WOLFMQ_EPOCH
    fn current_time_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards before UNIX epoch")
            .as_millis() as u64
            - WOLFMQ_EPOCH
    }

    /// Derive a node ID from a broker instance name (e.g., "broker-5" -> 5)
    pub fn parse_node_id(instance: &str) -> u16 {
        // Try to extract a number from the end of the string
        let digits: String = instance
            .chars()
            .rev()
            .take_while(|c| c.is_ascii_digit())
            .collect::<String>()
            .chars()
            .rev()
            .collect();

        if digits.is_empty() {
            // Hash the string to get a consistent node ID
            let hash = instance
                .bytes()
                .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
            (hash % (MAX_NODE_ID + 1)) as u16
        } else {
            digits.parse::<u16>().unwrap_or(0) % (MAX_NODE_ID as u16 + 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_generate_unique_uids() {
        let gen = UidGenerator::new(1);
        let mut ids = HashSet::new();

        for _ in 0..10000 {
            let id = gen.generate();
            assert!(ids.insert(id.0), "Duplicate uid generated: {}", id);
        }
    }

    #[test]
    fn test_uids_are_ordered() {
        let gen = UidGenerator::new(1);
        let mut last_id = 0u64;

        for _ in 0..1000 {
            let id = gen.generate();
            assert!(id.0 > last_id, "Uids should be monotonically increasing");
            last_id = id.0;
        }
    }

    #[test]
    fn test_concurrent_generation() {
        let gen = Arc::new(UidGenerator::new(1));
        let mut handles = vec![];

        for _ in 0..4 {
            let gen = Arc::clone(&gen);
            handles.push(thread::spawn(move || {
                let mut ids = Vec::new();
                for _ in 0..1000 {
                    ids.push(gen.generate().0);
                }
                ids
            }));
        }

        let mut all_ids = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(all_ids.insert(id), "Duplicate uid in concurrent test");
            }
        }

        assert_eq!(all_ids.len(), 4000);
    }

    #[test]
    fn test_uid_decomposition() {
        let gen = UidGenerator::new(42);
        let id = gen.generate();

        assert_eq!(id.node_id(), 42);
        assert!(id.timestamp() > WOLFMQ_EPOCH);
    }

    #[test]
    fn test_parse_node_id() {
        assert_eq!(UidGenerator::parse_node_id("broker-5"), 5);
        assert_eq!(UidGenerator::parse_node_id("broker-42"), 42);
        assert_eq!(UidGenerator::parse_node_id("mq123"), 123);
        // Hashed values for non-numeric instance names
        let id1 = UidGenerator::parse_node_id("alpha");
        let id2 = UidGenerator::parse_node_id("beta");
        assert_ne!(id1, id2);
    }
}
