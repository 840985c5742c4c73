//! Cluster State
//!
//! Broker identities, lifecycle states, and the membership view every
//! broker keeps of its cluster.

pub mod broker;
pub mod membership;

pub use broker::{parse_host_port, BrokerAddress, BrokerLifecycleState, MemberInfo};
pub use membership::MembershipManager;
