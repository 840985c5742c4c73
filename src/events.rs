//! Cluster Events
//!
//! Membership and failover changes surface locally through the event
//! notifier. Delivery is synchronous and order-preserving: events drain from
//! a single queue guarded by a processing flag, so a listener that publishes
//! another event from inside its callback queues it instead of recursing,
//! and the new event still comes out in order. One listener failing is
//! logged and never stops delivery to the rest.

use crate::state::broker::BrokerAddress;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Why the cluster view changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterReason {
    Added,
    Removed,
    StatusChanged,
    StateChanged,
    VersionChanged,
    AddressChanged,
    MasterBrokerChanged,
}

impl std::fmt::Display for ClusterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ClusterReason::Added => "ADDED",
            ClusterReason::Removed => "REMOVED",
            ClusterReason::StatusChanged => "STATUS_CHANGED",
            ClusterReason::StateChanged => "STATE_CHANGED",
            ClusterReason::VersionChanged => "VERSION_CHANGED",
            ClusterReason::AddressChanged => "ADDRESS_CHANGED",
            ClusterReason::MasterBrokerChanged => "MASTER_BROKER_CHANGED",
        };
        write!(f, "ClusterReason[{}]", name)
    }
}

/// A single cluster change notification
#[derive(Debug, Clone)]
pub struct ClusterEvent {
    pub reason: ClusterReason,
    pub broker: BrokerAddress,
    pub detail: String,
}

impl std::fmt::Display for ClusterEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}: {}", self.reason, self.broker, self.detail)
    }
}

/// Callback invoked for each event a subscription matches
pub type ClusterListener = Arc<dyn Fn(&ClusterEvent) -> crate::Result<()> + Send + Sync>;

struct Subscription {
    id: u64,
    filter: Option<ClusterReason>,
    listener: ClusterListener,
}

/// Fan-out point for cluster change events
pub struct EventNotifier {
    subscriptions: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
    pending: Mutex<VecDeque<ClusterEvent>>,
    draining: Mutex<bool>,
}

impl EventNotifier {
    pub fn new() -> Self {
        Self {
            subscriptions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(VecDeque::new()),
            draining: Mutex::new(false),
        }
    }

    /// Register a listener, optionally restricted to one reason.
    /// Returns a subscription id for `unsubscribe`.
    pub fn subscribe(&self, filter: Option<ClusterReason>, listener: ClusterListener) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscriptions
            .lock()
            .expect("subscription lock poisoned")
            .push(Subscription {
                id,
                filter,
                listener,
            });
        id
    }

    /// Drop a subscription. Returns false if the id was not registered.
    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut subs = self
            .subscriptions
            .lock()
            .expect("subscription lock poisoned");
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Queue an event and deliver everything pending
    pub fn publish(&self, reason: ClusterReason, broker: BrokerAddress, detail: impl Into<String>) {
        let event = ClusterEvent {
            reason,
            broker,
            detail: detail.into(),
        };
        self.pending
            .lock()
            .expect("pending queue lock poisoned")
            .push_back(event);
        self.drain();
    }

    fn drain(&self) {
        loop {
            {
                let mut draining = self.draining.lock().expect("draining flag lock poisoned");
                if *draining {
                    // The active drainer will pick up what we queued
                    return;
                }
                *draining = true;
            }

            while let Some(event) = self
                .pending
                .lock()
                .expect("pending queue lock poisoned")
                .pop_front()
            {
                self.deliver(&event);
            }

            *self.draining.lock().expect("draining flag lock poisoned") = false;

            // A publisher that saw the flag up may have queued behind our back
            if self
                .pending
                .lock()
                .expect("pending queue lock poisoned")
                .is_empty()
            {
                return;
            }
        }
    }

    fn deliver(&self, event: &ClusterEvent) {
        let targets: Vec<(u64, Option<ClusterReason>, ClusterListener)> = self
            .subscriptions
            .lock()
            .expect("subscription lock poisoned")
            .iter()
            .map(|s| (s.id, s.filter, Arc::clone(&s.listener)))
            .collect();

        for (id, filter, listener) in targets {
            if let Some(want) = filter {
                if want != event.reason {
                    continue;
                }
            }
            if let Err(e) = listener(event) {
                tracing::warn!("Cluster listener {} failed for {}: {}", id, event, e);
            }
        }
    }
}

impl Default for EventNotifier {
    fn default() -> Self {
        Self::new()
    }
}
