//! WolfMQ - Broker Cluster Coordination Engine
//!
//! The inter-broker protocol and failover core of the WolfMQ message
//! broker: brokers discover each other over a binary control-packet
//! protocol, keep a shared membership view, and arbitrate which survivor
//! takes over a failed peer's message store.
//!
//! # Architecture
//!
//! Every broker is symmetric. Brokers announce themselves over TCP links,
//! gossip the member list transitively, and select the master
//! deterministically (the configured override, else the lowest operating
//! identity). When a peer goes silent past the failure threshold, the
//! survivors race to take over its store; a cluster-wide store lock plus
//! lexicographic arbitration on (initiator, token) guarantees exactly one
//! winner per target.
//!
//! # Features
//!
//! - Binary control-packet codec with canonical property encoding
//! - CRC32-framed TCP links with per-peer connection pooling
//! - Membership view with session-based stale-sender rejection
//! - Takeover state machine with watchdog expiry and duplicate detection
//! - Shared SQLite store-lock mediator for takeover exclusivity
//! - Queued cluster event feed for in-process listeners
//! - Read-only HTTP status API

pub mod api;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod events;
pub mod id;
pub mod network;
pub mod packet;
pub mod state;
pub mod store;
pub mod takeover;

pub use config::WolfMqConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfMqConfig;
    pub use crate::engine::ClusterEngine;
    pub use crate::error::{Error, Result};
    pub use crate::events::{ClusterEvent, ClusterReason, EventNotifier};
    pub use crate::id::{Uid, UidGenerator};
    pub use crate::packet::{ControlPacket, PacketType};
    pub use crate::state::{BrokerAddress, BrokerLifecycleState, MembershipManager};
    pub use crate::takeover::{TakeoverCoordinator, TakeoverOutcome, TakeoverRecord};
}
