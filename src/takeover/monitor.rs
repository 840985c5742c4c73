//! Liveness Monitor
//!
//! Periodic pass over the membership view: brokers that go quiet are moved
//! to SUSPECT, then FAILED, and a failed broker's store is claimed through
//! the coordinator. The same pass runs the coordinator's watchdog sweep and
//! reaps lock rows whose owners died mid-takeover.

use crate::state::broker::{BrokerAddress, BrokerLifecycleState, MemberInfo};
use crate::state::membership::MembershipManager;
use crate::store::StoreLockMediator;
use crate::takeover::coordinator::TakeoverCoordinator;
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::time::interval;

/// Verdict on a peer's liveness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessVerdict {
    Alive,
    Suspect,
    Dead,
}

/// How the monitor decides a peer is gone. The default judges packet
/// silence; deployments with an external fencing signal plug in their own.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn verdict(&self, member: &MemberInfo) -> LivenessVerdict;
}

/// Silence-based probe: SUSPECT after `suspect_after` without a packet,
/// dead after `failed_after`.
pub struct HeartbeatProbe {
    suspect_after: Duration,
    failed_after: Duration,
}

impl HeartbeatProbe {
    pub fn new(suspect_after: Duration, failed_after: Duration) -> Self {
        Self {
            suspect_after,
            failed_after,
        }
    }
}

#[async_trait]
impl LivenessProbe for HeartbeatProbe {
    async fn verdict(&self, member: &MemberInfo) -> LivenessVerdict {
        if member.is_silent_for(self.failed_after) {
            LivenessVerdict::Dead
        } else if member.is_silent_for(self.suspect_after) {
            LivenessVerdict::Suspect
        } else {
            LivenessVerdict::Alive
        }
    }
}

pub struct TakeoverMonitor {
    membership: Arc<MembershipManager>,
    coordinator: Arc<TakeoverCoordinator>,
    lock: Arc<dyn StoreLockMediator>,
    probe: Arc<dyn LivenessProbe>,
    tick_interval: Duration,
    watchdog: Duration,
    auto_takeover: bool,
    /// Last automatic attempt per target, so a denied or aborted takeover
    /// is not retried on every tick
    last_attempt: Mutex<HashMap<String, Instant>>,
    shutdown: RwLock<bool>,
}

impl TakeoverMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        membership: Arc<MembershipManager>,
        coordinator: Arc<TakeoverCoordinator>,
        lock: Arc<dyn StoreLockMediator>,
        probe: Arc<dyn LivenessProbe>,
        tick_interval: Duration,
        watchdog: Duration,
        auto_takeover: bool,
    ) -> Self {
        Self {
            membership,
            coordinator,
            lock,
            probe,
            tick_interval,
            watchdog,
            auto_takeover,
            last_attempt: Mutex::new(HashMap::new()),
            shutdown: RwLock::new(false),
        }
    }

    /// Run the probe loop until `stop` is called
    pub async fn run(&self) -> Result<()> {
        let mut ticker = interval(self.tick_interval);
        loop {
            if *self.shutdown.read().await {
                break;
            }
            ticker.tick().await;
            self.tick().await;
        }
        tracing::debug!("Liveness monitor stopped");
        Ok(())
    }

    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
    }

    /// One monitor pass: probe peers, sweep the attempt arena, reap locks
    pub async fn tick(&self) {
        self.probe_members().await;

        let (expired, purged) = self.coordinator.sweep().await;
        if expired > 0 || purged > 0 {
            tracing::debug!(
                "Watchdog sweep expired {} and purged {} takeover attempts",
                expired,
                purged
            );
        }

        // Rows twice the watchdog old belong to initiators that are gone
        match self.lock.reap_stale(self.watchdog * 2).await {
            Ok(0) => {}
            Ok(reaped) => tracing::info!("Reaped {} stale store lock rows", reaped),
            Err(e) => tracing::warn!("Stale lock reaping failed: {}", e),
        }
    }

    async fn probe_members(&self) {
        let local = self.membership.local().instance.clone();
        for member in self.membership.snapshot().await {
            if member.address.instance == local {
                continue;
            }
            match member.state {
                BrokerLifecycleState::Operating | BrokerLifecycleState::Suspect => {}
                // A broker stuck in FAILED means no takeover has claimed it
                // yet; keep trying until one lands or the broker re-announces
                BrokerLifecycleState::Failed => {
                    if self.auto_takeover {
                        self.start_takeover(member.address.clone()).await;
                    }
                    continue;
                }
                _ => continue,
            }

            match self.probe.verdict(&member).await {
                LivenessVerdict::Alive => {}
                LivenessVerdict::Suspect => {
                    if member.state == BrokerLifecycleState::Operating {
                        let silent = member
                            .time_since_heartbeat()
                            .unwrap_or_default()
                            .as_millis();
                        if let Err(e) = self
                            .membership
                            .set_state(
                                &member.address.instance,
                                BrokerLifecycleState::Suspect,
                                &format!("no packets for {}ms", silent),
                            )
                            .await
                        {
                            tracing::debug!("Could not mark {} suspect: {}", member.address, e);
                        }
                    }
                }
                LivenessVerdict::Dead => {
                    if let Err(e) = self
                        .membership
                        .set_state(
                            &member.address.instance,
                            BrokerLifecycleState::Failed,
                            "liveness probe declared it dead",
                        )
                        .await
                    {
                        tracing::debug!("Could not mark {} failed: {}", member.address, e);
                        continue;
                    }
                    if self.auto_takeover {
                        self.start_takeover(member.address.clone()).await;
                    }
                }
            }
        }
    }

    /// Kick off a takeover of `target` unless one ran too recently
    async fn start_takeover(&self, target: BrokerAddress) {
        {
            let mut attempts = self.last_attempt.lock().await;
            if let Some(last) = attempts.get(&target.instance) {
                if last.elapsed() < self.watchdog {
                    return;
                }
            }
            attempts.insert(target.instance.clone(), Instant::now());
        }

        tracing::info!("Starting automatic takeover of {}", target);
        let coordinator = Arc::clone(&self.coordinator);
        tokio::spawn(async move {
            match coordinator.initiate(target.clone()).await {
                Ok(outcome) => {
                    tracing::info!("Automatic takeover of {} finished {}", target, outcome)
                }
                Err(e) => tracing::debug!("Automatic takeover of {} not started: {}", target, e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventNotifier;
    use crate::id::{Uid, UidGenerator};
    use crate::packet::{ControlPacket, PROTOCOL_VERSION};
    use crate::store::{MemoryStoreLock, NoopRecovery};
    use crate::takeover::record::TakeoverOutcome;
    use std::collections::VecDeque;
    use tokio::sync::mpsc;

    fn addr(instance: &str, session: u64) -> BrokerAddress {
        BrokerAddress::new(
            instance,
            format!("{}.example.com", instance),
            7676,
            Uid::from_raw(session),
        )
    }

    /// Probe that plays back a fixed verdict sequence
    struct ScriptedProbe {
        verdicts: Mutex<VecDeque<LivenessVerdict>>,
    }

    impl ScriptedProbe {
        fn new(verdicts: &[LivenessVerdict]) -> Self {
            Self {
                verdicts: Mutex::new(verdicts.iter().copied().collect()),
            }
        }
    }

    #[async_trait]
    impl LivenessProbe for ScriptedProbe {
        async fn verdict(&self, _member: &MemberInfo) -> LivenessVerdict {
            self.verdicts
                .lock()
                .await
                .pop_front()
                .unwrap_or(LivenessVerdict::Alive)
        }
    }

    struct Rig {
        monitor: TakeoverMonitor,
        membership: Arc<MembershipManager>,
        coordinator: Arc<TakeoverCoordinator>,
        lock: Arc<MemoryStoreLock>,
        #[allow(dead_code)]
        outbound: mpsc::Receiver<ControlPacket>,
    }

    async fn rig(probe: Arc<dyn LivenessProbe>, auto_takeover: bool) -> Rig {
        let notifier = Arc::new(EventNotifier::new());
        let membership = Arc::new(MembershipManager::new(
            addr("broker-1", 10),
            PROTOCOL_VERSION,
            None,
            notifier,
        ));
        let lock = Arc::new(MemoryStoreLock::new());
        let (tx, rx) = mpsc::channel(64);
        let coordinator = Arc::new(TakeoverCoordinator::new(
            Arc::clone(&membership),
            Arc::clone(&lock) as Arc<dyn StoreLockMediator>,
            Arc::new(NoopRecovery),
            Arc::new(UidGenerator::new(1)),
            tx,
            Duration::from_secs(30),
            Duration::from_secs(300),
        ));
        let monitor = TakeoverMonitor::new(
            Arc::clone(&membership),
            Arc::clone(&coordinator),
            Arc::clone(&lock) as Arc<dyn StoreLockMediator>,
            probe,
            Duration::from_millis(50),
            Duration::from_secs(30),
            auto_takeover,
        );

        let target = addr("broker-3", 30);
        membership
            .add_broker(target.clone(), PROTOCOL_VERSION)
            .await
            .unwrap();
        membership
            .set_state("broker-3", BrokerLifecycleState::Operating, "announced")
            .await
            .unwrap();

        Rig {
            monitor,
            membership,
            coordinator,
            lock,
            outbound: rx,
        }
    }

    async fn state_of(rig: &Rig, instance: &str) -> BrokerLifecycleState {
        rig.membership.get(instance).await.unwrap().state
    }

    #[tokio::test]
    async fn test_heartbeat_probe_thresholds() {
        let probe = HeartbeatProbe::new(Duration::from_millis(100), Duration::from_millis(300));
        let mut member = MemberInfo::new(addr("broker-3", 30), PROTOCOL_VERSION);

        member.last_heartbeat = Some(Instant::now());
        assert_eq!(probe.verdict(&member).await, LivenessVerdict::Alive);

        member.last_heartbeat = Some(Instant::now() - Duration::from_millis(150));
        assert_eq!(probe.verdict(&member).await, LivenessVerdict::Suspect);

        member.last_heartbeat = Some(Instant::now() - Duration::from_millis(400));
        assert_eq!(probe.verdict(&member).await, LivenessVerdict::Dead);

        member.last_heartbeat = None;
        assert_eq!(probe.verdict(&member).await, LivenessVerdict::Dead);
    }

    #[tokio::test]
    async fn test_tick_escalates_suspect_then_failed_and_takes_over() {
        let probe = Arc::new(ScriptedProbe::new(&[
            LivenessVerdict::Suspect,
            LivenessVerdict::Dead,
        ]));
        let rig = rig(probe, true).await;

        rig.monitor.tick().await;
        assert_eq!(state_of(&rig, "broker-3").await, BrokerLifecycleState::Suspect);

        rig.monitor.tick().await;
        // The takeover runs on a spawned task; wait for it to land
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let snapshot = rig.coordinator.snapshot().await;
            if snapshot
                .iter()
                .any(|a| a.outcome == TakeoverOutcome::Completed)
            {
                break;
            }
            assert!(Instant::now() < deadline, "takeover never completed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state_of(&rig, "broker-3").await, BrokerLifecycleState::Removed);
    }

    #[tokio::test]
    async fn test_dead_verdict_without_auto_takeover_only_marks_failed() {
        let probe = Arc::new(ScriptedProbe::new(&[LivenessVerdict::Dead]));
        let rig = rig(probe, false).await;

        rig.monitor.tick().await;
        assert_eq!(state_of(&rig, "broker-3").await, BrokerLifecycleState::Failed);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rig.coordinator.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_local_broker_never_probed() {
        // Every verdict is Dead, yet the local entry must stay untouched
        let probe = Arc::new(ScriptedProbe::new(&[
            LivenessVerdict::Dead,
            LivenessVerdict::Dead,
        ]));
        let rig = rig(probe, false).await;

        rig.monitor.tick().await;
        assert_eq!(
            state_of(&rig, "broker-1").await,
            BrokerLifecycleState::Operating
        );
    }

    #[tokio::test]
    async fn test_failed_takeover_not_retried_within_backoff() {
        let probe = Arc::new(ScriptedProbe::new(&[LivenessVerdict::Dead]));
        let rig = rig(probe, true).await;

        // Another broker holds the lock, so the automatic attempt aborts
        // and broker-3 stays FAILED
        rig.lock
            .try_acquire(&addr("broker-3", 30), &addr("broker-9", 90), Uid::from_raw(5))
            .await
            .unwrap();
        rig.monitor.tick().await;

        let deadline = Instant::now() + Duration::from_secs(2);
        let first = loop {
            let snapshot = rig.coordinator.snapshot().await;
            if snapshot
                .iter()
                .any(|a| a.outcome == TakeoverOutcome::Aborted)
            {
                break snapshot;
            }
            assert!(Instant::now() < deadline, "first attempt never aborted");
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        assert_eq!(state_of(&rig, "broker-3").await, BrokerLifecycleState::Failed);

        // The target is still FAILED on the next tick, but the attempt is
        // inside the backoff window: no new token appears
        rig.monitor.tick().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = rig.coordinator.snapshot().await;
        assert_eq!(first.len(), second.len());
        assert_eq!(first[0].token, second[0].token);
    }
}
