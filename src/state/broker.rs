//! Broker Identity
//!
//! A broker is identified by its identity key `instance@host:port` plus a
//! session uid minted at process start. A restarted broker keeps its
//! identity key and shows up with a fresh, strictly newer session uid;
//! anything still quoting the dead session is stale and gets ignored.

use crate::id::Uid;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Full broker identity: identity key fields plus the live session.
///
/// The derived ordering (instance, host, port, session) is the cluster-wide
/// arbitration order; every broker must sort identities the same way.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BrokerAddress {
    pub instance: String,
    pub host: String,
    pub port: u16,
    pub session: Uid,
}

impl BrokerAddress {
    pub fn new(instance: impl Into<String>, host: impl Into<String>, port: u16, session: Uid) -> Self {
        Self {
            instance: instance.into(),
            host: host.into(),
            port,
            session,
        }
    }

    /// Stable identity key, unchanged across restarts
    pub fn identity_key(&self) -> String {
        format!("{}@{}:{}", self.instance, self.host, self.port)
    }

    /// Same broker installation, regardless of session
    pub fn same_identity(&self, other: &BrokerAddress) -> bool {
        self.instance == other.instance && self.host == other.host && self.port == other.port
    }

    /// The socket address peers dial
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.instance, self.host, self.port)
    }
}

/// Split a `host:port` string
pub fn parse_host_port(s: &str) -> Result<(String, u16)> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| Error::Config(format!("address '{}' is missing a port", s)))?;
    let port: u16 = port
        .parse()
        .map_err(|_| Error::Config(format!("address '{}' has an invalid port", s)))?;
    if host.is_empty() {
        return Err(Error::Config(format!("address '{}' has an empty host", s)));
    }
    Ok((host.to_string(), port))
}

/// Broker lifecycle, owned by the membership manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerLifecycleState {
    Joining,
    Operating,
    Suspect,
    FailoverInProgress,
    Failed,
    Removed,
}

impl BrokerLifecycleState {
    /// States that count toward master selection
    pub fn is_operating(&self) -> bool {
        matches!(self, BrokerLifecycleState::Operating)
    }

    /// States with no way back; the entry only exists for bookkeeping
    pub fn is_terminal(&self) -> bool {
        matches!(self, BrokerLifecycleState::Removed)
    }
}

impl std::fmt::Display for BrokerLifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerLifecycleState::Joining => write!(f, "JOINING"),
            BrokerLifecycleState::Operating => write!(f, "OPERATING"),
            BrokerLifecycleState::Suspect => write!(f, "SUSPECT"),
            BrokerLifecycleState::FailoverInProgress => write!(f, "FAILOVER_IN_PROGRESS"),
            BrokerLifecycleState::Failed => write!(f, "FAILED"),
            BrokerLifecycleState::Removed => write!(f, "REMOVED"),
        }
    }
}

/// Everything the membership manager tracks per broker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberInfo {
    pub address: BrokerAddress,
    pub state: BrokerLifecycleState,
    pub protocol_version: u16,
    /// Link-level reachability, distinct from lifecycle state
    pub reachable: bool,
    /// When this broker joined the view
    pub joined_at: DateTime<Utc>,
    /// Last packet arrival from this broker (not serialized)
    #[serde(skip)]
    pub last_heartbeat: Option<Instant>,
}

impl MemberInfo {
    pub fn new(address: BrokerAddress, protocol_version: u16) -> Self {
        Self {
            address,
            state: BrokerLifecycleState::Joining,
            protocol_version,
            reachable: true,
            joined_at: Utc::now(),
            last_heartbeat: Some(Instant::now()),
        }
    }

    /// Record packet arrival from this broker
    pub fn touch(&mut self) {
        self.last_heartbeat = Some(Instant::now());
    }

    /// Time since the last packet arrival
    pub fn time_since_heartbeat(&self) -> Option<std::time::Duration> {
        self.last_heartbeat.map(|t| t.elapsed())
    }

    /// Whether this broker has been silent longer than the threshold
    pub fn is_silent_for(&self, threshold: std::time::Duration) -> bool {
        match self.last_heartbeat {
            Some(t) => t.elapsed() >= threshold,
            None => true,
        }
    }
}
