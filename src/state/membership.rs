//! Cluster Membership
//!
//! The membership manager owns the cluster view: which brokers exist, their
//! lifecycle state, reachability and protocol version, and which broker is
//! the master. Mutations queue their events while holding the view lock and
//! publish only after releasing it, so listeners never run inside the
//! manager's critical section.
//!
//! Entries are keyed by instance name. The session uid decides freshness:
//! an update quoting an older session than the view holds is stale and gets
//! rejected, and a newer session supersedes the dead incarnation outright.

use crate::events::{ClusterReason, EventNotifier};
use crate::state::broker::{BrokerAddress, BrokerLifecycleState, MemberInfo};
use crate::takeover::record::TakeoverRecord;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

type QueuedEvent = (ClusterReason, BrokerAddress, String);

/// Owner of the cluster view
pub struct MembershipManager {
    local: BrokerAddress,
    configured_master: Option<String>,
    members: RwLock<HashMap<String, MemberInfo>>,
    master: RwLock<Option<BrokerAddress>>,
    notifier: Arc<EventNotifier>,
}

impl MembershipManager {
    /// Create a view holding only the local broker, already operating.
    /// Construction is silent; only later mutations raise events.
    pub fn new(
        local: BrokerAddress,
        protocol_version: u16,
        configured_master: Option<String>,
        notifier: Arc<EventNotifier>,
    ) -> Self {
        let mut info = MemberInfo::new(local.clone(), protocol_version);
        info.state = BrokerLifecycleState::Operating;

        let mut members = HashMap::new();
        members.insert(local.instance.clone(), info);

        let master = Self::compute_master(configured_master.as_deref(), &members);

        Self {
            local,
            configured_master,
            members: RwLock::new(members),
            master: RwLock::new(master),
            notifier,
        }
    }

    /// The local broker's identity
    pub fn local(&self) -> &BrokerAddress {
        &self.local
    }

    /// Merge an announced broker into the view.
    ///
    /// A re-announce with the session the view already holds refreshes the
    /// entry (and may raise ADDRESS_CHANGED / VERSION_CHANGED). A newer
    /// session supersedes the old incarnation; an older one is rejected.
    pub async fn add_broker(&self, address: BrokerAddress, protocol_version: u16) -> Result<()> {
        let mut events: Vec<QueuedEvent> = Vec::new();
        {
            let mut members = self.members.write().await;

            let freshness = members
                .get(&address.instance)
                .map(|existing| existing.address.session.cmp(&address.session));

            match freshness {
                Some(std::cmp::Ordering::Greater) => {
                    let existing = &members[&address.instance];
                    return Err(Error::StaleSession {
                        broker: address.to_string(),
                        held: existing.address.session.as_u64(),
                        offered: address.session.as_u64(),
                    });
                }
                Some(std::cmp::Ordering::Equal) => {
                    if let Some(existing) = members.get_mut(&address.instance) {
                        existing.touch();
                        if existing.address.host != address.host
                            || existing.address.port != address.port
                        {
                            let detail = format!(
                                "moved from {}:{} to {}:{}",
                                existing.address.host,
                                existing.address.port,
                                address.host,
                                address.port
                            );
                            existing.address.host = address.host.clone();
                            existing.address.port = address.port;
                            events.push((
                                ClusterReason::AddressChanged,
                                existing.address.clone(),
                                detail,
                            ));
                        }
                        if existing.protocol_version != protocol_version {
                            let detail = format!(
                                "protocol {} -> {}",
                                existing.protocol_version, protocol_version
                            );
                            existing.protocol_version = protocol_version;
                            events.push((
                                ClusterReason::VersionChanged,
                                existing.address.clone(),
                                detail,
                            ));
                        }
                        if matches!(
                            existing.state,
                            BrokerLifecycleState::Suspect | BrokerLifecycleState::Failed
                        ) {
                            let detail =
                                format!("{} -> OPERATING: announce received", existing.state);
                            existing.state = BrokerLifecycleState::Operating;
                            events.push((
                                ClusterReason::StateChanged,
                                existing.address.clone(),
                                detail,
                            ));
                        }
                    }
                }
                Some(std::cmp::Ordering::Less) => {
                    // Newer session: the old incarnation is gone
                    if let Some(old) = members.remove(&address.instance) {
                        events.push((
                            ClusterReason::Removed,
                            old.address.clone(),
                            format!("superseded by session {}", address.session),
                        ));
                    }
                    events.push((
                        ClusterReason::Added,
                        address.clone(),
                        "rejoined with a new session".to_string(),
                    ));
                    members.insert(
                        address.instance.clone(),
                        MemberInfo::new(address, protocol_version),
                    );
                }
                None => {
                    events.push((
                        ClusterReason::Added,
                        address.clone(),
                        "joined the cluster".to_string(),
                    ));
                    members.insert(
                        address.instance.clone(),
                        MemberInfo::new(address, protocol_version),
                    );
                }
            }

            self.refresh_master(&members, &mut events).await;
        }
        self.emit(events);
        Ok(())
    }

    /// Drop a broker from the view
    pub async fn remove_broker(&self, instance: &str, detail: &str) -> Result<MemberInfo> {
        let mut events: Vec<QueuedEvent> = Vec::new();
        let removed = {
            let mut members = self.members.write().await;
            let removed = members
                .remove(instance)
                .ok_or_else(|| Error::BrokerNotFound(instance.to_string()))?;
            events.push((
                ClusterReason::Removed,
                removed.address.clone(),
                detail.to_string(),
            ));
            self.refresh_master(&members, &mut events).await;
            removed
        };
        self.emit(events);
        Ok(removed)
    }

    /// Move a broker to a new lifecycle state.
    ///
    /// FAILOVER_IN_PROGRESS cannot be entered here; `begin_failover` is the
    /// only door, and it wants the pending record as proof.
    pub async fn set_state(
        &self,
        instance: &str,
        new_state: BrokerLifecycleState,
        detail: &str,
    ) -> Result<BrokerLifecycleState> {
        if new_state == BrokerLifecycleState::FailoverInProgress {
            return Err(Error::Takeover(
                "FAILOVER_IN_PROGRESS requires a pending takeover record".into(),
            ));
        }

        let mut events: Vec<QueuedEvent> = Vec::new();
        let old = {
            let mut members = self.members.write().await;
            let member = members
                .get_mut(instance)
                .ok_or_else(|| Error::BrokerNotFound(instance.to_string()))?;

            let old = member.state;
            if old == BrokerLifecycleState::Removed {
                return Err(Error::Membership(format!(
                    "{} is removed and cannot change state",
                    member.address
                )));
            }
            if old != new_state {
                member.state = new_state;
                events.push((
                    ClusterReason::StateChanged,
                    member.address.clone(),
                    format!("{} -> {}: {}", old, new_state, detail),
                ));
            }
            self.refresh_master(&members, &mut events).await;
            old
        };
        self.emit(events);
        Ok(old)
    }

    /// Enter FAILOVER_IN_PROGRESS for the record's target. The record must
    /// still be pending and must name the session the view holds.
    pub async fn begin_failover(&self, record: &TakeoverRecord) -> Result<()> {
        if !record.is_pending() {
            return Err(Error::Takeover(format!(
                "cannot enter failover with outcome {}",
                record.outcome
            )));
        }

        let mut events: Vec<QueuedEvent> = Vec::new();
        {
            let mut members = self.members.write().await;
            let member = members
                .get_mut(&record.target.instance)
                .ok_or_else(|| Error::BrokerNotFound(record.target.instance.clone()))?;

            if member.address.session != record.target.session {
                return Err(Error::StaleSession {
                    broker: record.target.to_string(),
                    held: member.address.session.as_u64(),
                    offered: record.target.session.as_u64(),
                });
            }

            let old = member.state;
            if old == BrokerLifecycleState::Removed {
                return Err(Error::Membership(format!(
                    "{} is removed and cannot enter failover",
                    member.address
                )));
            }
            if old == BrokerLifecycleState::FailoverInProgress {
                // Re-delivered grant; the view already shows it
                tracing::debug!("{} is already in failover", member.address);
                return Ok(());
            }

            member.state = BrokerLifecycleState::FailoverInProgress;
            events.push((
                ClusterReason::StateChanged,
                member.address.clone(),
                format!("{} -> FAILOVER_IN_PROGRESS by {}", old, record.initiator),
            ));
            self.refresh_master(&members, &mut events).await;
        }
        self.emit(events);
        Ok(())
    }

    /// Record packet arrival from a broker. Restores reachability and heals
    /// a SUSPECT entry; anything past SUSPECT needs a full re-announce.
    pub async fn record_heartbeat(&self, instance: &str) {
        let mut events: Vec<QueuedEvent> = Vec::new();
        {
            let mut members = self.members.write().await;
            let Some(member) = members.get_mut(instance) else {
                return;
            };
            member.touch();
            if !member.reachable {
                member.reachable = true;
                events.push((
                    ClusterReason::StatusChanged,
                    member.address.clone(),
                    "link restored".to_string(),
                ));
            }
            if member.state == BrokerLifecycleState::Suspect {
                member.state = BrokerLifecycleState::Operating;
                events.push((
                    ClusterReason::StateChanged,
                    member.address.clone(),
                    "SUSPECT -> OPERATING: heartbeat resumed".to_string(),
                ));
            }
            self.refresh_master(&members, &mut events).await;
        }
        self.emit(events);
    }

    /// Flag a broker's link as down
    pub async fn mark_unreachable(&self, instance: &str) {
        let mut events: Vec<QueuedEvent> = Vec::new();
        {
            let mut members = self.members.write().await;
            let Some(member) = members.get_mut(instance) else {
                return;
            };
            if member.reachable {
                member.reachable = false;
                events.push((
                    ClusterReason::StatusChanged,
                    member.address.clone(),
                    "link lost".to_string(),
                ));
            }
        }
        self.emit(events);
    }

    /// Point-in-time copy of the view, in arbitration order
    pub async fn snapshot(&self) -> Vec<MemberInfo> {
        let members = self.members.read().await;
        let mut view: Vec<MemberInfo> = members.values().cloned().collect();
        view.sort_by(|a, b| a.address.cmp(&b.address));
        view
    }

    /// Look up one broker
    pub async fn get(&self, instance: &str) -> Option<MemberInfo> {
        self.members.read().await.get(instance).cloned()
    }

    /// Brokers currently OPERATING
    pub async fn operating_brokers(&self) -> Vec<BrokerAddress> {
        let members = self.members.read().await;
        let mut out: Vec<BrokerAddress> = members
            .values()
            .filter(|m| m.state.is_operating())
            .map(|m| m.address.clone())
            .collect();
        out.sort();
        out
    }

    /// The current master, if any
    pub async fn master(&self) -> Option<BrokerAddress> {
        self.master.read().await.clone()
    }

    fn compute_master(
        configured: Option<&str>,
        members: &HashMap<String, MemberInfo>,
    ) -> Option<BrokerAddress> {
        if let Some(wanted) = configured {
            // The configured master is the master exactly when present
            return members
                .values()
                .find(|m| m.address.instance == wanted || m.address.identity_key() == wanted)
                .map(|m| m.address.clone());
        }
        members
            .values()
            .filter(|m| m.state.is_operating())
            .map(|m| &m.address)
            .min()
            .cloned()
    }

    async fn refresh_master(
        &self,
        members: &HashMap<String, MemberInfo>,
        events: &mut Vec<QueuedEvent>,
    ) {
        let new = Self::compute_master(self.configured_master.as_deref(), members);
        let mut master = self.master.write().await;
        if *master != new {
            match (&new, &*master) {
                (Some(won), _) => events.push((
                    ClusterReason::MasterBrokerChanged,
                    won.clone(),
                    format!("master is now {}", won),
                )),
                (None, Some(lost)) => events.push((
                    ClusterReason::MasterBrokerChanged,
                    lost.clone(),
                    "master lost".to_string(),
                )),
                (None, None) => {}
            }
            *master = new;
        }
    }

    fn emit(&self, events: Vec<QueuedEvent>) {
        for (reason, broker, detail) in events {
            tracing::debug!("{} {}: {}", reason, broker, detail);
            self.notifier.publish(reason, broker, detail);
        }
    }
}
