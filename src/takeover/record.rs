//! Takeover Records
//!
//! One record per takeover attempt: who is being taken over, who is doing
//! it, the token that names this attempt, and how it ended. The token is
//! never reused; a retry is a new record with a fresh token.

use crate::id::Uid;
use crate::state::broker::BrokerAddress;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cluster-visible outcome of an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TakeoverOutcome {
    Pending,
    Completed,
    Aborted,
}

impl std::fmt::Display for TakeoverOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TakeoverOutcome::Pending => write!(f, "PENDING"),
            TakeoverOutcome::Completed => write!(f, "COMPLETED"),
            TakeoverOutcome::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Local progress of an attempt this broker is tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TakeoverPhase {
    Requested,
    Granted,
    Completing,
    Completed,
    Aborted,
}

impl TakeoverPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TakeoverPhase::Completed | TakeoverPhase::Aborted)
    }
}

impl std::fmt::Display for TakeoverPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TakeoverPhase::Requested => write!(f, "REQUESTED"),
            TakeoverPhase::Granted => write!(f, "GRANTED"),
            TakeoverPhase::Completing => write!(f, "COMPLETING"),
            TakeoverPhase::Completed => write!(f, "COMPLETED"),
            TakeoverPhase::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// A takeover attempt as the cluster sees it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakeoverRecord {
    pub target: BrokerAddress,
    pub initiator: BrokerAddress,
    pub token: Uid,
    pub started_at: DateTime<Utc>,
    pub outcome: TakeoverOutcome,
}

impl TakeoverRecord {
    pub fn new(target: BrokerAddress, initiator: BrokerAddress, token: Uid) -> Self {
        Self {
            target,
            initiator,
            token,
            started_at: Utc::now(),
            outcome: TakeoverOutcome::Pending,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.outcome == TakeoverOutcome::Pending
    }

    /// The arbitration bid: every broker derives the same pair from packet
    /// content alone, so ties break identically everywhere.
    pub fn bid(&self) -> (String, u64) {
        (self.initiator.identity_key(), self.token.as_u64())
    }

    /// Lower bid wins a contested target
    pub fn beats(&self, other: &TakeoverRecord) -> bool {
        self.bid() < other.bid()
    }
}

impl std::fmt::Display for TakeoverRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "takeover of {} by {} (token {}, {})",
            self.target, self.initiator, self.token, self.outcome
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(instance: &str, session: u64) -> BrokerAddress {
        BrokerAddress::new(instance, "mq.example.com", 7676, Uid::from_raw(session))
    }

    #[test]
    fn test_new_record_is_pending() {
        let r = TakeoverRecord::new(addr("b3", 30), addr("b1", 10), Uid::from_raw(100));
        assert!(r.is_pending());
        assert_eq!(r.outcome.to_string(), "PENDING");
    }

    #[test]
    fn test_lower_initiator_wins() {
        let a = TakeoverRecord::new(addr("b3", 30), addr("b1", 10), Uid::from_raw(500));
        let b = TakeoverRecord::new(addr("b3", 30), addr("b2", 20), Uid::from_raw(100));
        assert!(a.beats(&b), "initiator identity dominates the token");
        assert!(!b.beats(&a));
    }

    #[test]
    fn test_token_breaks_same_initiator() {
        let a = TakeoverRecord::new(addr("b3", 30), addr("b1", 10), Uid::from_raw(100));
        let b = TakeoverRecord::new(addr("b3", 30), addr("b1", 10), Uid::from_raw(200));
        assert!(a.beats(&b));
    }

    #[test]
    fn test_phase_terminality() {
        assert!(!TakeoverPhase::Requested.is_terminal());
        assert!(!TakeoverPhase::Granted.is_terminal());
        assert!(!TakeoverPhase::Completing.is_terminal());
        assert!(TakeoverPhase::Completed.is_terminal());
        assert!(TakeoverPhase::Aborted.is_terminal());
    }
}
