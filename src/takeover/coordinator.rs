//! Takeover Coordinator
//!
//! Drives takeover attempts through REQUESTED, GRANTED, COMPLETING and a
//! terminal COMPLETED or ABORTED, and tracks the attempts other brokers
//! announce. One record per target lives in an arena keyed by instance
//! name; contested targets are settled by comparing (initiator identity,
//! token) pairs, lowest pair wins, so every broker resolves the same
//! conflict the same way without another message exchange.
//!
//! The store lock mediator is the ground truth for exclusivity. Arbitration
//! only decides who backs off first; a broker that loses the lock race
//! aborts no matter what its bid said.

use crate::id::{Uid, UidGenerator};
use crate::packet::{ControlPacket, PacketType};
use crate::state::broker::{BrokerAddress, BrokerLifecycleState};
use crate::state::membership::MembershipManager;
use crate::store::{LockResponse, StoreLockMediator, StoreRecovery};
use crate::takeover::record::{TakeoverOutcome, TakeoverPhase, TakeoverRecord};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, RwLock};

const PROP_TARGET_NAME: &str = "targetName";
const PROP_TARGET_HOST: &str = "targetHost";
const PROP_TARGET_PORT: &str = "targetPort";
const PROP_TARGET_SESSION: &str = "targetSession";
const PROP_INITIATOR_NAME: &str = "initiatorName";
const PROP_INITIATOR_HOST: &str = "initiatorHost";
const PROP_INITIATOR_PORT: &str = "initiatorPort";
const PROP_INITIATOR_SESSION: &str = "initiatorSession";
const PROP_TOKEN: &str = "token";

/// One tracked attempt. `local` means this broker is the initiator and owns
/// the full lifecycle; otherwise the attempt is a peer's and we only mirror
/// what the packets tell us.
struct Attempt {
    record: TakeoverRecord,
    phase: TakeoverPhase,
    local: bool,
    /// The store lock is currently claimed by this attempt
    lock_held: bool,
    /// `begin_failover` ran for this attempt and may need undoing
    failover_marked: bool,
    /// Watchdog deadline; past it the attempt is forced to ABORTED
    deadline: Instant,
    finished_at: Option<Instant>,
}

impl Attempt {
    fn new(record: TakeoverRecord, local: bool, watchdog: Duration) -> Self {
        Self {
            phase: TakeoverPhase::Requested,
            local,
            lock_held: false,
            failover_marked: false,
            deadline: Instant::now() + watchdog,
            finished_at: None,
            record,
        }
    }

    fn finish(&mut self, outcome: TakeoverOutcome) {
        self.phase = match outcome {
            TakeoverOutcome::Completed => TakeoverPhase::Completed,
            _ => TakeoverPhase::Aborted,
        };
        self.record.outcome = outcome;
        self.lock_held = false;
        self.finished_at = Some(Instant::now());
    }
}

#[derive(Default)]
struct Slot {
    current: Option<Attempt>,
}

/// Read-only view of a tracked attempt
#[derive(Debug, Clone, Serialize)]
pub struct AttemptSnapshot {
    pub target: String,
    pub initiator: String,
    pub token: u64,
    pub phase: TakeoverPhase,
    pub outcome: TakeoverOutcome,
    pub started_at: DateTime<Utc>,
    pub local: bool,
}

/// State an aborted attempt may have claimed; unwound outside the slot lock
type Unwind = (TakeoverRecord, bool, bool);

pub struct TakeoverCoordinator {
    local: BrokerAddress,
    membership: Arc<MembershipManager>,
    lock: Arc<dyn StoreLockMediator>,
    recovery: Arc<dyn StoreRecovery>,
    ids: Arc<UidGenerator>,
    outbound: mpsc::Sender<ControlPacket>,
    attempts: RwLock<HashMap<String, Arc<Mutex<Slot>>>>,
    watchdog: Duration,
    retention: Duration,
}

impl TakeoverCoordinator {
    pub fn new(
        membership: Arc<MembershipManager>,
        lock: Arc<dyn StoreLockMediator>,
        recovery: Arc<dyn StoreRecovery>,
        ids: Arc<UidGenerator>,
        outbound: mpsc::Sender<ControlPacket>,
        watchdog: Duration,
        retention: Duration,
    ) -> Self {
        Self {
            local: membership.local().clone(),
            membership,
            lock,
            recovery,
            ids,
            outbound,
            attempts: RwLock::new(HashMap::new()),
            watchdog,
            retention,
        }
    }

    /// Run a takeover of `target` to a terminal outcome.
    ///
    /// Every retry is a fresh attempt with a fresh token; an abort can land
    /// between any two steps here, so the slot is re-checked after each
    /// await and the flow stands down the moment its token is no longer the
    /// live attempt.
    pub async fn initiate(&self, target: BrokerAddress) -> Result<TakeoverOutcome> {
        if target.instance == self.local.instance {
            return Err(Error::Takeover("a broker cannot take over itself".into()));
        }
        match self.membership.get(&target.instance).await {
            None => return Err(Error::BrokerNotFound(target.instance.clone())),
            Some(member) => {
                if member.address.session != target.session {
                    return Err(Error::StaleSession {
                        broker: target.to_string(),
                        held: member.address.session.as_u64(),
                        offered: target.session.as_u64(),
                    });
                }
                if member.state == BrokerLifecycleState::FailoverInProgress {
                    return Err(Error::Takeover(format!("{} is already in failover", target)));
                }
                // Only a broker the view has given up on may be taken over
                if member.state != BrokerLifecycleState::Failed {
                    return Err(Error::Takeover(format!(
                        "{} is {} and cannot be taken over",
                        target, member.state
                    )));
                }
            }
        }

        let token = self.ids.generate();
        let record = TakeoverRecord::new(target.clone(), self.local.clone(), token);

        let slot = self.slot(&target.instance).await;
        {
            let mut guard = slot.lock().await;
            if let Some(current) = &guard.current {
                if !current.phase.is_terminal() {
                    return Err(Error::TakeoverConflict {
                        target: target.to_string(),
                        winner: current.record.initiator.to_string(),
                    });
                }
            }
            guard.current = Some(Attempt::new(record.clone(), true, self.watchdog));
        }

        tracing::info!("Requesting takeover of {} (token {})", target, token);
        self.broadcast(PacketType::TakeoverRequest, &record).await;

        // A competing request may have won arbitration while the broadcast
        // was in flight; a dead attempt must not touch the lock at all.
        if !self.in_phase(&slot, token, TakeoverPhase::Requested).await {
            return Ok(TakeoverOutcome::Aborted);
        }

        let response = match self.lock.try_acquire(&target, &self.local, token).await {
            Ok(response) => response,
            Err(e) => {
                self.abort_attempt(&slot, token, &format!("lock mediator failed: {}", e))
                    .await;
                return Ok(TakeoverOutcome::Aborted);
            }
        };

        if let LockResponse::Denied { holder } = response {
            let holder = holder.unwrap_or_else(|| "an unknown owner".to_string());
            self.abort_attempt(&slot, token, &format!("store lock held by {}", holder))
                .await;
            return Ok(TakeoverOutcome::Aborted);
        }

        // Claim the grant. If an abort raced the mediator call the lock goes
        // straight back.
        {
            let mut guard = slot.lock().await;
            match guard.current.as_mut() {
                Some(current)
                    if current.record.token == token
                        && current.phase == TakeoverPhase::Requested =>
                {
                    current.phase = TakeoverPhase::Granted;
                    current.lock_held = true;
                }
                _ => {
                    drop(guard);
                    self.release_lock(&target).await;
                    return Ok(TakeoverOutcome::Aborted);
                }
            }
        }

        if let Err(e) = self.membership.begin_failover(&record).await {
            self.abort_attempt(&slot, token, &format!("cannot enter failover: {}", e))
                .await;
            return Ok(TakeoverOutcome::Aborted);
        }
        {
            let mut guard = slot.lock().await;
            match guard.current.as_mut() {
                Some(current)
                    if current.record.token == token
                        && current.phase == TakeoverPhase::Granted =>
                {
                    current.failover_marked = true;
                }
                _ => {
                    // Aborted while entering failover; the aborter released
                    // the lock but could not know about the state change yet
                    drop(guard);
                    self.rollback_failover(&record, "aborted during failover entry")
                        .await;
                    return Ok(TakeoverOutcome::Aborted);
                }
            }
        }

        tracing::info!("Store lock on {} granted to {}", target, self.local);
        self.broadcast(PacketType::TakeoverGrant, &record).await;

        if !self
            .advance(&slot, token, TakeoverPhase::Granted, TakeoverPhase::Completing)
            .await
        {
            return Ok(TakeoverOutcome::Aborted);
        }

        if let Err(e) = self.recovery.recover(&target, &self.local).await {
            tracing::warn!("Recovery of {} failed: {}", target, e);
            self.abort_attempt(&slot, token, &format!("recovery failed: {}", e))
                .await;
            return Ok(TakeoverOutcome::Aborted);
        }

        // Final claim; a watchdog expiry during a long recovery still wins
        {
            let mut guard = slot.lock().await;
            match guard.current.as_mut() {
                Some(current)
                    if current.record.token == token
                        && current.phase == TakeoverPhase::Completing =>
                {
                    current.finish(TakeoverOutcome::Completed);
                }
                _ => return Ok(TakeoverOutcome::Aborted),
            }
        }

        let mut done = record.clone();
        done.outcome = TakeoverOutcome::Completed;
        self.broadcast(PacketType::TakeoverComplete, &done).await;

        if let Err(e) = self
            .membership
            .set_state(
                &target.instance,
                BrokerLifecycleState::Removed,
                &format!("store taken over by {}", self.local.instance),
            )
            .await
        {
            tracing::warn!("Could not retire {} after takeover: {}", target, e);
        }
        self.release_lock(&target).await;

        tracing::info!("Takeover of {} completed (token {})", target, token);
        Ok(TakeoverOutcome::Completed)
    }

    /// TAKEOVER_REQUEST from a peer: track the attempt, or arbitrate when
    /// the target is already contested.
    pub async fn handle_request(
        &self,
        sender: &BrokerAddress,
        packet: &ControlPacket,
    ) -> Result<()> {
        let incoming = record_from_packet(packet)?;
        if incoming.initiator.instance == self.local.instance {
            // Our own broadcast reflected back
            return Ok(());
        }
        if incoming.target.instance == self.local.instance {
            // This broker is alive to say so; tell the initiator to stand down
            tracing::warn!(
                "{} requested takeover of this broker; refusing (token {})",
                sender,
                incoming.token
            );
            self.broadcast(PacketType::TakeoverAbort, &incoming).await;
            return Ok(());
        }

        let slot = self.slot(&incoming.target.instance).await;
        let unwind = self
            .arbitrate(&slot, &incoming, TakeoverPhase::Requested)
            .await;
        self.unwind(unwind).await;
        Ok(())
    }

    /// TAKEOVER_GRANT from a peer: the initiator holds the store lock. Also
    /// arrives on resync, carrying attempts that started before we joined.
    pub async fn handle_grant(&self, sender: &BrokerAddress, packet: &ControlPacket) -> Result<()> {
        let incoming = record_from_packet(packet)?;
        if incoming.initiator.instance == self.local.instance {
            return Ok(());
        }
        if incoming.target.instance == self.local.instance {
            tracing::warn!("{} granted takeover of this broker; not tracking it", sender);
            return Ok(());
        }

        let slot = self.slot(&incoming.target.instance).await;
        let unwind = self.arbitrate(&slot, &incoming, TakeoverPhase::Granted).await;
        self.unwind(unwind).await;

        // Mirror the failover in the local view; a lagging or just-joined
        // view may not know the target yet
        if let Err(e) = self.membership.begin_failover(&incoming).await {
            tracing::debug!("Failover state for {} not recorded: {}", incoming.target, e);
        }
        Ok(())
    }

    /// TAKEOVER_COMPLETE from a peer: the target's store has moved and the
    /// target is retired from the view.
    pub async fn handle_complete(
        &self,
        _sender: &BrokerAddress,
        packet: &ControlPacket,
    ) -> Result<()> {
        let incoming = record_from_packet(packet)?;
        if incoming.initiator.instance == self.local.instance {
            return Ok(());
        }

        let slot = self.slot(&incoming.target.instance).await;
        let mut unwind: Option<Unwind> = None;
        {
            let mut guard = slot.lock().await;
            if let Some(current) = guard.current.as_ref() {
                // A re-delivered completion must not reset the terminal
                // record's retention clock
                if current.record.token == incoming.token && current.phase.is_terminal() {
                    tracing::debug!(
                        "Duplicate completion of {} ignored (token {})",
                        incoming.target,
                        incoming.token
                    );
                    return Ok(());
                }
            }
            if let Some(current) = guard.current.as_mut() {
                if current.local
                    && !current.phase.is_terminal()
                    && current.record.token != incoming.token
                {
                    tracing::info!(
                        "Abandoning takeover of {}; {} already completed it",
                        incoming.target,
                        incoming.initiator
                    );
                    unwind = Some((
                        current.record.clone(),
                        current.lock_held,
                        current.failover_marked,
                    ));
                    current.finish(TakeoverOutcome::Aborted);
                }
            }
            let mut done = Attempt::new(incoming.clone(), false, self.watchdog);
            done.finish(TakeoverOutcome::Completed);
            guard.current = Some(done);
        }
        self.unwind(unwind).await;

        tracing::info!(
            "Takeover of {} by {} completed",
            incoming.target,
            incoming.initiator
        );
        if let Some(member) = self.membership.get(&incoming.target.instance).await {
            if member.address.session == incoming.target.session
                && member.state != BrokerLifecycleState::Removed
            {
                if let Err(e) = self
                    .membership
                    .set_state(
                        &incoming.target.instance,
                        BrokerLifecycleState::Removed,
                        &format!("store taken over by {}", incoming.initiator.instance),
                    )
                    .await
                {
                    tracing::debug!("Could not retire {}: {}", incoming.target, e);
                }
            }
        }
        Ok(())
    }

    /// TAKEOVER_ABORT from a peer. An abort quoting a token that is unknown
    /// here, or one whose attempt already reached a terminal phase, is a
    /// no-op: retries and redeliveries make duplicates routine. The one
    /// abort that cancels a local attempt is the target refusing its own
    /// takeover; a live target outranks any initiator.
    pub async fn handle_abort(&self, sender: &BrokerAddress, packet: &ControlPacket) -> Result<()> {
        let incoming = record_from_packet(packet)?;
        let target_veto = sender.same_identity(&incoming.target);
        if incoming.initiator.instance == self.local.instance && !target_veto {
            return Ok(());
        }

        let slot = self.slot(&incoming.target.instance).await;
        let mut unwind: Option<Unwind> = None;
        let observed = {
            let mut guard = slot.lock().await;
            match guard.current.as_mut() {
                Some(current)
                    if current.record.token == incoming.token
                        && !current.phase.is_terminal() =>
                {
                    if current.local {
                        if target_veto {
                            tracing::info!(
                                "{} refused takeover of itself; standing down (token {})",
                                sender,
                                incoming.token
                            );
                            unwind = Some((
                                current.record.clone(),
                                current.lock_held,
                                current.failover_marked,
                            ));
                            current.finish(TakeoverOutcome::Aborted);
                        } else {
                            // Only the initiator or the target cancels this
                            tracing::warn!(
                                "{} aborted an attempt it does not own (token {})",
                                sender,
                                incoming.token
                            );
                        }
                        false
                    } else {
                        current.finish(TakeoverOutcome::Aborted);
                        true
                    }
                }
                _ => {
                    tracing::debug!(
                        "Ignoring stale abort of {} from {} (token {})",
                        incoming.target,
                        sender,
                        incoming.token
                    );
                    false
                }
            }
        };
        self.unwind(unwind).await;

        if observed {
            tracing::info!(
                "Takeover of {} by {} aborted",
                incoming.target,
                incoming.initiator
            );
            self.rollback_failover(&incoming, &format!("aborted by {}", incoming.initiator.instance))
                .await;
        }
        Ok(())
    }

    /// Grant packets for every attempt still holding a lock claim, replayed
    /// to brokers that join mid-takeover so they stand down on those targets.
    pub async fn pending_grant_packets(&self) -> Vec<ControlPacket> {
        let mut packets = Vec::new();
        for (_, slot) in self.all_slots().await {
            let guard = slot.lock().await;
            if let Some(current) = &guard.current {
                if matches!(
                    current.phase,
                    TakeoverPhase::Granted | TakeoverPhase::Completing
                ) {
                    packets.push(self.takeover_packet(PacketType::TakeoverGrant, &current.record));
                }
            }
        }
        packets
    }

    /// All tracked attempts, terminal ones included until retention drops them
    pub async fn snapshot(&self) -> Vec<AttemptSnapshot> {
        let mut attempts = Vec::new();
        for (_, slot) in self.all_slots().await {
            let guard = slot.lock().await;
            if let Some(current) = &guard.current {
                attempts.push(AttemptSnapshot {
                    target: current.record.target.to_string(),
                    initiator: current.record.initiator.to_string(),
                    token: current.record.token.as_u64(),
                    phase: current.phase,
                    outcome: current.record.outcome,
                    started_at: current.record.started_at,
                    local: current.local,
                });
            }
        }
        attempts.sort_by(|a, b| a.target.cmp(&b.target));
        attempts
    }

    /// Watchdog pass: force attempts past their deadline to ABORTED and drop
    /// terminal records older than the retention window. Returns how many of
    /// each this pass handled.
    pub async fn sweep(&self) -> (usize, usize) {
        let now = Instant::now();
        let mut expired = 0;
        let mut purged = 0;

        for (_, slot) in self.all_slots().await {
            let mut abort_token: Option<Uid> = None;
            let mut rollback: Option<TakeoverRecord> = None;
            {
                let mut guard = slot.lock().await;
                let mut clear = false;
                if let Some(current) = guard.current.as_mut() {
                    if !current.phase.is_terminal() && now >= current.deadline {
                        if current.local {
                            abort_token = Some(current.record.token);
                        } else {
                            tracing::info!(
                                "Takeover of {} by {} expired without completing (token {})",
                                current.record.target,
                                current.record.initiator,
                                current.record.token
                            );
                            current.finish(TakeoverOutcome::Aborted);
                            rollback = Some(current.record.clone());
                            expired += 1;
                        }
                    } else if current.phase.is_terminal() {
                        if let Some(finished) = current.finished_at {
                            if now.duration_since(finished) >= self.retention {
                                clear = true;
                            }
                        }
                    }
                }
                if clear {
                    guard.current = None;
                    purged += 1;
                }
            }
            if let Some(token) = abort_token {
                self.abort_attempt(&slot, token, "watchdog deadline passed").await;
                expired += 1;
            }
            if let Some(record) = rollback {
                self.rollback_failover(&record, "initiator went silent").await;
            }
        }
        (expired, purged)
    }

    /// Settle an incoming REQUEST or GRANT against whatever the slot holds.
    /// Returns claims to unwind when the local attempt lost.
    async fn arbitrate(
        &self,
        slot: &Arc<Mutex<Slot>>,
        incoming: &TakeoverRecord,
        incoming_phase: TakeoverPhase,
    ) -> Option<Unwind> {
        let mut unwind: Option<Unwind> = None;
        let mut guard = slot.lock().await;

        let install = match guard.current.as_mut() {
            Some(current) if !current.phase.is_terminal() => {
                if current.record.token == incoming.token
                    && current.record.initiator.same_identity(&incoming.initiator)
                {
                    // Same attempt again: at most a phase promotion
                    if incoming_phase == TakeoverPhase::Granted
                        && current.phase == TakeoverPhase::Requested
                    {
                        current.phase = TakeoverPhase::Granted;
                    } else {
                        tracing::debug!(
                            "Duplicate takeover packet for {} ignored (token {})",
                            incoming.target,
                            incoming.token
                        );
                    }
                    false
                } else if incoming.beats(&current.record) {
                    if current.local {
                        tracing::info!(
                            "Yielding takeover of {} to {} (token {})",
                            incoming.target,
                            incoming.initiator,
                            incoming.token
                        );
                        unwind = Some((
                            current.record.clone(),
                            current.lock_held,
                            current.failover_marked,
                        ));
                        current.finish(TakeoverOutcome::Aborted);
                    } else {
                        tracing::debug!(
                            "Takeover of {} re-claimed by {} (token {})",
                            incoming.target,
                            incoming.initiator,
                            incoming.token
                        );
                    }
                    true
                } else {
                    tracing::debug!(
                        "Ignoring takeover claim on {} from {}; {} holds precedence",
                        incoming.target,
                        incoming.initiator,
                        current.record.initiator
                    );
                    false
                }
            }
            _ => {
                tracing::debug!(
                    "Tracking takeover of {} by {} (token {})",
                    incoming.target,
                    incoming.initiator,
                    incoming.token
                );
                true
            }
        };

        if install {
            let mut attempt = Attempt::new(incoming.clone(), false, self.watchdog);
            attempt.phase = incoming_phase;
            guard.current = Some(attempt);
        }
        unwind
    }

    /// Give back everything a lost attempt claimed and tell the cluster
    async fn unwind(&self, unwind: Option<Unwind>) {
        let Some((record, held, marked)) = unwind else {
            return;
        };
        if held {
            self.release_lock(&record.target).await;
        }
        if marked {
            self.rollback_failover(&record, "lost arbitration").await;
        }
        self.broadcast(PacketType::TakeoverAbort, &record).await;
    }

    /// Mark a local attempt aborted and unwind its claims. Calling this for
    /// an attempt that already reached a terminal phase does nothing.
    async fn abort_attempt(&self, slot: &Arc<Mutex<Slot>>, token: Uid, reason: &str) {
        let unwind = {
            let mut guard = slot.lock().await;
            match guard.current.as_mut() {
                Some(current)
                    if current.record.token == token && !current.phase.is_terminal() =>
                {
                    let claims = (
                        current.record.clone(),
                        current.lock_held,
                        current.failover_marked,
                    );
                    current.finish(TakeoverOutcome::Aborted);
                    Some(claims)
                }
                _ => None,
            }
        };

        if let Some((record, _, _)) = &unwind {
            tracing::info!("Takeover of {} aborted: {}", record.target, reason);
        }
        self.unwind(unwind).await;
    }

    /// Return the target to FAILED after an aborted failover, provided the
    /// view still holds the same incarnation in FAILOVER_IN_PROGRESS
    async fn rollback_failover(&self, record: &TakeoverRecord, reason: &str) {
        let Some(member) = self.membership.get(&record.target.instance).await else {
            return;
        };
        if member.address.session != record.target.session
            || member.state != BrokerLifecycleState::FailoverInProgress
        {
            return;
        }
        if let Err(e) = self
            .membership
            .set_state(
                &record.target.instance,
                BrokerLifecycleState::Failed,
                &format!("takeover aborted: {}", reason),
            )
            .await
        {
            tracing::debug!("Failover rollback for {} skipped: {}", record.target, e);
        }
    }

    async fn in_phase(&self, slot: &Arc<Mutex<Slot>>, token: Uid, phase: TakeoverPhase) -> bool {
        let guard = slot.lock().await;
        matches!(
            &guard.current,
            Some(current) if current.record.token == token && current.phase == phase
        )
    }

    async fn advance(
        &self,
        slot: &Arc<Mutex<Slot>>,
        token: Uid,
        from: TakeoverPhase,
        to: TakeoverPhase,
    ) -> bool {
        let mut guard = slot.lock().await;
        match guard.current.as_mut() {
            Some(current) if current.record.token == token && current.phase == from => {
                current.phase = to;
                true
            }
            _ => false,
        }
    }

    async fn release_lock(&self, target: &BrokerAddress) {
        if let Err(e) = self.lock.release(target, &self.local).await {
            tracing::warn!("Store lock release for {} failed: {}", target, e);
        }
    }

    async fn broadcast(&self, packet_type: PacketType, record: &TakeoverRecord) {
        let packet = self.takeover_packet(packet_type, record);
        if let Err(e) = self.outbound.send(packet).await {
            tracing::debug!("Outbound queue closed, {} not sent: {}", packet_type, e);
        }
    }

    fn takeover_packet(&self, packet_type: PacketType, record: &TakeoverRecord) -> ControlPacket {
        let mut packet = ControlPacket::new(packet_type, self.ids.generate().as_u64());
        packet.put_str(PROP_TARGET_NAME, &record.target.instance);
        packet.put_str(PROP_TARGET_HOST, &record.target.host);
        packet.put_int(PROP_TARGET_PORT, i32::from(record.target.port));
        packet.put_long(PROP_TARGET_SESSION, record.target.session.as_u64() as i64);
        packet.put_str(PROP_INITIATOR_NAME, &record.initiator.instance);
        packet.put_str(PROP_INITIATOR_HOST, &record.initiator.host);
        packet.put_int(PROP_INITIATOR_PORT, i32::from(record.initiator.port));
        packet.put_long(
            PROP_INITIATOR_SESSION,
            record.initiator.session.as_u64() as i64,
        );
        packet.put_long(PROP_TOKEN, record.token.as_u64() as i64);
        packet
    }

    async fn slot(&self, instance: &str) -> Arc<Mutex<Slot>> {
        {
            let map = self.attempts.read().await;
            if let Some(slot) = map.get(instance) {
                return Arc::clone(slot);
            }
        }
        let mut map = self.attempts.write().await;
        Arc::clone(
            map.entry(instance.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Slot::default()))),
        )
    }

    async fn all_slots(&self) -> Vec<(String, Arc<Mutex<Slot>>)> {
        self.attempts
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect()
    }
}

/// Rebuild the attempt record every takeover packet carries. A packet with
/// any of the fields missing is malformed and dropped by the dispatcher.
fn record_from_packet(packet: &ControlPacket) -> Result<TakeoverRecord> {
    let target = BrokerAddress::new(
        require_str(packet, PROP_TARGET_NAME)?,
        require_str(packet, PROP_TARGET_HOST)?,
        prop_port(packet, PROP_TARGET_PORT)?,
        Uid::from_raw(require_long(packet, PROP_TARGET_SESSION)? as u64),
    );
    let initiator = BrokerAddress::new(
        require_str(packet, PROP_INITIATOR_NAME)?,
        require_str(packet, PROP_INITIATOR_HOST)?,
        prop_port(packet, PROP_INITIATOR_PORT)?,
        Uid::from_raw(require_long(packet, PROP_INITIATOR_SESSION)? as u64),
    );
    let token = Uid::from_raw(require_long(packet, PROP_TOKEN)? as u64);
    Ok(TakeoverRecord::new(target, initiator, token))
}

fn require_str<'a>(packet: &'a ControlPacket, key: &str) -> Result<&'a str> {
    packet.get_str(key).ok_or_else(|| {
        Error::PropertyCorrupted(format!("{} missing from {}", key, packet.packet_type))
    })
}

fn require_long(packet: &ControlPacket, key: &str) -> Result<i64> {
    packet.get_long(key).ok_or_else(|| {
        Error::PropertyCorrupted(format!("{} missing from {}", key, packet.packet_type))
    })
}

fn prop_port(packet: &ControlPacket, key: &str) -> Result<u16> {
    let value = packet.get_int(key).ok_or_else(|| {
        Error::PropertyCorrupted(format!("{} missing from {}", key, packet.packet_type))
    })?;
    u16::try_from(value)
        .map_err(|_| Error::PropertyCorrupted(format!("{} out of range: {}", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventNotifier;
    use crate::packet::PROTOCOL_VERSION;
    use crate::store::{MemoryStoreLock, NoopRecovery};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    fn addr(instance: &str, session: u64) -> BrokerAddress {
        BrokerAddress::new(
            instance,
            format!("{}.example.com", instance),
            7676,
            Uid::from_raw(session),
        )
    }

    struct Peer {
        coordinator: Arc<TakeoverCoordinator>,
        membership: Arc<MembershipManager>,
        outbound: mpsc::Receiver<ControlPacket>,
    }

    fn peer_with(
        instance: &str,
        session: u64,
        lock: Arc<dyn StoreLockMediator>,
        recovery: Arc<dyn StoreRecovery>,
        watchdog: Duration,
        retention: Duration,
    ) -> Peer {
        let notifier = Arc::new(EventNotifier::new());
        let membership = Arc::new(MembershipManager::new(
            addr(instance, session),
            PROTOCOL_VERSION,
            None,
            notifier,
        ));
        let (tx, rx) = mpsc::channel(64);
        let coordinator = Arc::new(TakeoverCoordinator::new(
            Arc::clone(&membership),
            lock,
            recovery,
            Arc::new(UidGenerator::new(1)),
            tx,
            watchdog,
            retention,
        ));
        Peer {
            coordinator,
            membership,
            outbound: rx,
        }
    }

    fn peer(instance: &str, session: u64, lock: Arc<dyn StoreLockMediator>) -> Peer {
        peer_with(
            instance,
            session,
            lock,
            Arc::new(NoopRecovery),
            Duration::from_secs(30),
            Duration::from_secs(300),
        )
    }

    async fn register_failed(peer: &Peer, target: &BrokerAddress) {
        peer.membership
            .add_broker(target.clone(), PROTOCOL_VERSION)
            .await
            .unwrap();
        peer.membership
            .set_state(&target.instance, BrokerLifecycleState::Failed, "probe timeout")
            .await
            .unwrap();
    }

    fn sent_types(rx: &mut mpsc::Receiver<ControlPacket>) -> Vec<PacketType> {
        let mut types = Vec::new();
        while let Ok(packet) = rx.try_recv() {
            types.push(packet.packet_type);
        }
        types
    }

    async fn state_of(peer: &Peer, instance: &str) -> BrokerLifecycleState {
        peer.membership.get(instance).await.unwrap().state
    }

    /// Parks try_acquire until the gate opens, then denies. Records whether
    /// anyone ever released through it.
    struct GatedDeniedLock {
        entered: Notify,
        gate: Notify,
        released: AtomicBool,
    }

    impl GatedDeniedLock {
        fn new() -> Self {
            Self {
                entered: Notify::new(),
                gate: Notify::new(),
                released: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl StoreLockMediator for GatedDeniedLock {
        async fn try_acquire(
            &self,
            _target: &BrokerAddress,
            _owner: &BrokerAddress,
            _token: Uid,
        ) -> Result<LockResponse> {
            self.entered.notify_one();
            self.gate.notified().await;
            Ok(LockResponse::Denied {
                holder: Some("broker-1@broker-1.example.com:7676".to_string()),
            })
        }

        async fn release(&self, _target: &BrokerAddress, _owner: &BrokerAddress) -> Result<()> {
            self.released.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Parks recover until the gate opens, then succeeds
    struct GatedRecovery {
        entered: Notify,
        gate: Notify,
    }

    impl GatedRecovery {
        fn new() -> Self {
            Self {
                entered: Notify::new(),
                gate: Notify::new(),
            }
        }
    }

    #[async_trait]
    impl StoreRecovery for GatedRecovery {
        async fn recover(&self, _target: &BrokerAddress, _new_owner: &BrokerAddress) -> Result<()> {
            self.entered.notify_one();
            self.gate.notified().await;
            Ok(())
        }
    }

    struct FailingRecovery;

    #[async_trait]
    impl StoreRecovery for FailingRecovery {
        async fn recover(&self, target: &BrokerAddress, _new_owner: &BrokerAddress) -> Result<()> {
            Err(Error::RecoveryFailed {
                target: target.to_string(),
                reason: "store copy failed".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_takeover_completes() {
        let lock = Arc::new(MemoryStoreLock::new());
        let mut b1 = peer("broker-1", 10, Arc::clone(&lock) as Arc<dyn StoreLockMediator>);
        let target = addr("broker-3", 30);
        register_failed(&b1, &target).await;

        let outcome = b1.coordinator.initiate(target.clone()).await.unwrap();
        assert_eq!(outcome, TakeoverOutcome::Completed);
        assert_eq!(state_of(&b1, "broker-3").await, BrokerLifecycleState::Removed);
        assert_eq!(
            sent_types(&mut b1.outbound),
            vec![
                PacketType::TakeoverRequest,
                PacketType::TakeoverGrant,
                PacketType::TakeoverComplete,
            ]
        );

        // Lock was released at the end
        let response = lock
            .try_acquire(&target, &addr("broker-9", 90), Uid::from_raw(5))
            .await
            .unwrap();
        assert_eq!(response, LockResponse::Granted);
    }

    #[tokio::test]
    async fn test_lock_denied_aborts_without_grant() {
        let lock = Arc::new(MemoryStoreLock::new());
        let target = addr("broker-3", 30);
        lock.try_acquire(&target, &addr("broker-9", 90), Uid::from_raw(5))
            .await
            .unwrap();

        let mut b1 = peer("broker-1", 10, Arc::clone(&lock) as Arc<dyn StoreLockMediator>);
        register_failed(&b1, &target).await;

        let outcome = b1.coordinator.initiate(target.clone()).await.unwrap();
        assert_eq!(outcome, TakeoverOutcome::Aborted);
        assert_eq!(
            sent_types(&mut b1.outbound),
            vec![PacketType::TakeoverRequest, PacketType::TakeoverAbort]
        );
        // Never entered failover
        assert_eq!(state_of(&b1, "broker-3").await, BrokerLifecycleState::Failed);
    }

    #[tokio::test]
    async fn test_concurrent_attempts_single_winner() {
        let lock = Arc::new(MemoryStoreLock::new());
        let b1 = peer("broker-1", 10, Arc::clone(&lock) as Arc<dyn StoreLockMediator>);
        let b2 = peer("broker-2", 20, Arc::clone(&lock) as Arc<dyn StoreLockMediator>);
        let target = addr("broker-3", 30);
        register_failed(&b1, &target).await;
        register_failed(&b2, &target).await;

        let (r1, r2) = tokio::join!(
            b1.coordinator.initiate(target.clone()),
            b2.coordinator.initiate(target.clone())
        );
        let outcomes = [r1.unwrap(), r2.unwrap()];
        let completed = outcomes
            .iter()
            .filter(|o| **o == TakeoverOutcome::Completed)
            .count();
        assert_eq!(completed, 1, "the store lock admits exactly one winner");
        assert!(outcomes.contains(&TakeoverOutcome::Aborted));
    }

    #[tokio::test]
    async fn test_crossing_requests_lower_bid_wins_loser_never_locks() {
        let gated = Arc::new(GatedDeniedLock::new());
        let mut b2 = peer_with(
            "broker-2",
            20,
            Arc::clone(&gated) as Arc<dyn StoreLockMediator>,
            Arc::new(NoopRecovery),
            Duration::from_secs(30),
            Duration::from_secs(300),
        );
        let target = addr("broker-3", 30);
        register_failed(&b2, &target).await;

        let coordinator = Arc::clone(&b2.coordinator);
        let own = {
            let target = target.clone();
            tokio::spawn(async move { coordinator.initiate(target).await })
        };
        gated.entered.notified().await;

        // broker-1's competing request arrives while ours is parked at the
        // mediator; its identity sorts lower, so ours yields
        let b1_addr = addr("broker-1", 10);
        let b1_record = TakeoverRecord::new(target.clone(), b1_addr.clone(), Uid::from_raw(7));
        let request = b2
            .coordinator
            .takeover_packet(PacketType::TakeoverRequest, &b1_record);
        b2.coordinator.handle_request(&b1_addr, &request).await.unwrap();

        gated.gate.notify_one();
        let outcome = own.await.unwrap().unwrap();
        assert_eq!(outcome, TakeoverOutcome::Aborted);
        assert!(!gated.released.load(Ordering::SeqCst), "loser never held the lock");
        assert_eq!(
            sent_types(&mut b2.outbound),
            vec![PacketType::TakeoverRequest, PacketType::TakeoverAbort]
        );

        // broker-1 finishes; broker-2 retires the target from its view
        let complete = b2
            .coordinator
            .takeover_packet(PacketType::TakeoverComplete, &b1_record);
        b2.coordinator.handle_complete(&b1_addr, &complete).await.unwrap();
        assert_eq!(state_of(&b2, "broker-3").await, BrokerLifecycleState::Removed);
    }

    #[tokio::test]
    async fn test_competing_request_releases_held_lock() {
        let lock = Arc::new(MemoryStoreLock::new());
        let recovery = Arc::new(GatedRecovery::new());
        let mut b2 = peer_with(
            "broker-2",
            20,
            Arc::clone(&lock) as Arc<dyn StoreLockMediator>,
            Arc::clone(&recovery) as Arc<dyn StoreRecovery>,
            Duration::from_secs(30),
            Duration::from_secs(300),
        );
        let target = addr("broker-3", 30);
        register_failed(&b2, &target).await;

        let coordinator = Arc::clone(&b2.coordinator);
        let own = {
            let target = target.clone();
            tokio::spawn(async move { coordinator.initiate(target).await })
        };
        recovery.entered.notified().await;

        // Ours holds the lock mid-recovery when the lower bid shows up
        let b1_addr = addr("broker-1", 10);
        let b1_record = TakeoverRecord::new(target.clone(), b1_addr.clone(), Uid::from_raw(7));
        let request = b2
            .coordinator
            .takeover_packet(PacketType::TakeoverRequest, &b1_record);
        b2.coordinator.handle_request(&b1_addr, &request).await.unwrap();

        recovery.gate.notify_one();
        let outcome = own.await.unwrap().unwrap();
        assert_eq!(outcome, TakeoverOutcome::Aborted);
        assert_eq!(
            sent_types(&mut b2.outbound),
            vec![
                PacketType::TakeoverRequest,
                PacketType::TakeoverGrant,
                PacketType::TakeoverAbort,
            ]
        );
        // Lock went back and the view rolled off FAILOVER_IN_PROGRESS
        assert_eq!(
            lock.try_acquire(&target, &b1_addr, Uid::from_raw(8)).await.unwrap(),
            LockResponse::Granted
        );
        assert_eq!(state_of(&b2, "broker-3").await, BrokerLifecycleState::Failed);
    }

    #[tokio::test]
    async fn test_recovery_failure_aborts_and_releases() {
        let lock = Arc::new(MemoryStoreLock::new());
        let mut b1 = peer_with(
            "broker-1",
            10,
            Arc::clone(&lock) as Arc<dyn StoreLockMediator>,
            Arc::new(FailingRecovery),
            Duration::from_secs(30),
            Duration::from_secs(300),
        );
        let target = addr("broker-3", 30);
        register_failed(&b1, &target).await;

        let outcome = b1.coordinator.initiate(target.clone()).await.unwrap();
        assert_eq!(outcome, TakeoverOutcome::Aborted);
        assert_eq!(
            sent_types(&mut b1.outbound),
            vec![
                PacketType::TakeoverRequest,
                PacketType::TakeoverGrant,
                PacketType::TakeoverAbort,
            ]
        );
        assert_eq!(state_of(&b1, "broker-3").await, BrokerLifecycleState::Failed);
        assert_eq!(
            lock.try_acquire(&target, &addr("broker-9", 90), Uid::from_raw(5))
                .await
                .unwrap(),
            LockResponse::Granted
        );
    }

    #[tokio::test]
    async fn test_duplicate_abort_is_no_op() {
        let lock = Arc::new(MemoryStoreLock::new());
        let b1 = peer("broker-1", 10, Arc::clone(&lock) as Arc<dyn StoreLockMediator>);
        let target = addr("broker-3", 30);
        register_failed(&b1, &target).await;

        let b2_addr = addr("broker-2", 20);
        let record = TakeoverRecord::new(target.clone(), b2_addr.clone(), Uid::from_raw(44));
        let request = b1
            .coordinator
            .takeover_packet(PacketType::TakeoverRequest, &record);
        b1.coordinator.handle_request(&b2_addr, &request).await.unwrap();

        let abort = b1
            .coordinator
            .takeover_packet(PacketType::TakeoverAbort, &record);
        b1.coordinator.handle_abort(&b2_addr, &abort).await.unwrap();
        let snapshot = b1.coordinator.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].outcome, TakeoverOutcome::Aborted);

        // Same abort again, and one for a token never seen: both no-ops
        b1.coordinator.handle_abort(&b2_addr, &abort).await.unwrap();
        let unknown = TakeoverRecord::new(target.clone(), b2_addr.clone(), Uid::from_raw(999));
        let stray = b1
            .coordinator
            .takeover_packet(PacketType::TakeoverAbort, &unknown);
        b1.coordinator.handle_abort(&b2_addr, &stray).await.unwrap();

        let snapshot = b1.coordinator.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].outcome, TakeoverOutcome::Aborted);
    }

    #[tokio::test]
    async fn test_initiate_refuses_live_target() {
        let lock = Arc::new(MemoryStoreLock::new());
        let mut b1 = peer("broker-1", 10, Arc::clone(&lock) as Arc<dyn StoreLockMediator>);
        let target = addr("broker-3", 30);
        b1.membership
            .add_broker(target.clone(), PROTOCOL_VERSION)
            .await
            .unwrap();
        b1.membership
            .set_state("broker-3", BrokerLifecycleState::Operating, "announced")
            .await
            .unwrap();

        let err = b1.coordinator.initiate(target.clone()).await.unwrap_err();
        assert!(matches!(err, Error::Takeover(_)));

        // A merely suspect broker is not fair game either
        b1.membership
            .set_state("broker-3", BrokerLifecycleState::Suspect, "silent")
            .await
            .unwrap();
        let err = b1.coordinator.initiate(target.clone()).await.unwrap_err();
        assert!(matches!(err, Error::Takeover(_)));

        // Nothing went on the wire and the lock was never touched
        assert!(sent_types(&mut b1.outbound).is_empty());
        assert_eq!(
            lock.try_acquire(&target, &addr("broker-9", 90), Uid::from_raw(5))
                .await
                .unwrap(),
            LockResponse::Granted
        );
    }

    #[tokio::test]
    async fn test_self_targeted_request_draws_abort() {
        let lock = Arc::new(MemoryStoreLock::new());
        let mut b1 = peer("broker-1", 10, Arc::clone(&lock) as Arc<dyn StoreLockMediator>);

        let b2_addr = addr("broker-2", 20);
        let record = TakeoverRecord::new(addr("broker-1", 10), b2_addr.clone(), Uid::from_raw(44));
        let request = b1
            .coordinator
            .takeover_packet(PacketType::TakeoverRequest, &record);
        b1.coordinator.handle_request(&b2_addr, &request).await.unwrap();

        // A live target refuses and never tracks the attempt
        assert_eq!(sent_types(&mut b1.outbound), vec![PacketType::TakeoverAbort]);
        assert!(b1.coordinator.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_target_refusal_unwinds_initiator() {
        let lock = Arc::new(MemoryStoreLock::new());
        let recovery = Arc::new(GatedRecovery::new());
        let mut b1 = peer_with(
            "broker-1",
            10,
            Arc::clone(&lock) as Arc<dyn StoreLockMediator>,
            Arc::clone(&recovery) as Arc<dyn StoreRecovery>,
            Duration::from_secs(30),
            Duration::from_secs(300),
        );
        let target = addr("broker-3", 30);
        register_failed(&b1, &target).await;

        let coordinator = Arc::clone(&b1.coordinator);
        let own = {
            let target = target.clone();
            tokio::spawn(async move { coordinator.initiate(target).await })
        };
        recovery.entered.notified().await;

        // The target turns out to be alive and refuses its own takeover,
        // quoting the attempt it saw on the wire
        let request = b1.outbound.recv().await.unwrap();
        assert_eq!(request.packet_type, PacketType::TakeoverRequest);
        let record = record_from_packet(&request).unwrap();
        let refusal = b1
            .coordinator
            .takeover_packet(PacketType::TakeoverAbort, &record);
        b1.coordinator.handle_abort(&target, &refusal).await.unwrap();

        recovery.gate.notify_one();
        let outcome = own.await.unwrap().unwrap();
        assert_eq!(outcome, TakeoverOutcome::Aborted);
        // Lock went back and the view rolled off FAILOVER_IN_PROGRESS
        assert_eq!(
            lock.try_acquire(&target, &addr("broker-9", 90), Uid::from_raw(5))
                .await
                .unwrap(),
            LockResponse::Granted
        );
        assert_eq!(state_of(&b1, "broker-3").await, BrokerLifecycleState::Failed);
    }

    #[tokio::test]
    async fn test_duplicate_complete_keeps_retention_clock() {
        let lock = Arc::new(MemoryStoreLock::new());
        let b1 = peer_with(
            "broker-1",
            10,
            Arc::clone(&lock) as Arc<dyn StoreLockMediator>,
            Arc::new(NoopRecovery),
            Duration::from_secs(30),
            Duration::from_millis(60),
        );
        let target = addr("broker-3", 30);
        register_failed(&b1, &target).await;

        let b2_addr = addr("broker-2", 20);
        let record = TakeoverRecord::new(target.clone(), b2_addr.clone(), Uid::from_raw(44));
        let complete = b1
            .coordinator
            .takeover_packet(PacketType::TakeoverComplete, &record);
        b1.coordinator.handle_complete(&b2_addr, &complete).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        // Redelivered completion must not restart the retention window
        b1.coordinator.handle_complete(&b2_addr, &complete).await.unwrap();
        let snapshot = b1.coordinator.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].outcome, TakeoverOutcome::Completed);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let (_, purged) = b1.coordinator.sweep().await;
        assert_eq!(purged, 1);
        assert!(b1.coordinator.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_observed_grant_blocks_own_initiation() {
        let lock = Arc::new(MemoryStoreLock::new());
        let b1 = peer("broker-1", 10, Arc::clone(&lock) as Arc<dyn StoreLockMediator>);
        let target = addr("broker-3", 30);
        register_failed(&b1, &target).await;

        let b2_addr = addr("broker-2", 20);
        let record = TakeoverRecord::new(target.clone(), b2_addr.clone(), Uid::from_raw(44));
        let grant = b1
            .coordinator
            .takeover_packet(PacketType::TakeoverGrant, &record);
        b1.coordinator.handle_grant(&b2_addr, &grant).await.unwrap();

        // The observed grant is mirrored into the membership view
        assert_eq!(
            state_of(&b1, "broker-3").await,
            BrokerLifecycleState::FailoverInProgress
        );

        let err = b1.coordinator.initiate(target.clone()).await.unwrap_err();
        assert!(matches!(err, Error::Takeover(_) | Error::TakeoverConflict { .. }));
    }

    #[tokio::test]
    async fn test_pending_grants_replayed_for_resync() {
        let lock = Arc::new(MemoryStoreLock::new());
        let b1 = peer("broker-1", 10, Arc::clone(&lock) as Arc<dyn StoreLockMediator>);
        let target = addr("broker-3", 30);
        register_failed(&b1, &target).await;

        let b2_addr = addr("broker-2", 20);
        let record = TakeoverRecord::new(target.clone(), b2_addr.clone(), Uid::from_raw(44));
        let grant = b1
            .coordinator
            .takeover_packet(PacketType::TakeoverGrant, &record);
        b1.coordinator.handle_grant(&b2_addr, &grant).await.unwrap();

        let packets = b1.coordinator.pending_grant_packets().await;
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].packet_type, PacketType::TakeoverGrant);
        assert_eq!(packets[0].get_str("targetName"), Some("broker-3"));
        assert_eq!(packets[0].get_long("token"), Some(44));

        // Once the takeover completes there is nothing left to replay
        let complete = b1
            .coordinator
            .takeover_packet(PacketType::TakeoverComplete, &record);
        b1.coordinator.handle_complete(&b2_addr, &complete).await.unwrap();
        assert!(b1.coordinator.pending_grant_packets().await.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_expires_remote_and_purges_terminal() {
        let lock = Arc::new(MemoryStoreLock::new());
        let b1 = peer_with(
            "broker-1",
            10,
            Arc::clone(&lock) as Arc<dyn StoreLockMediator>,
            Arc::new(NoopRecovery),
            Duration::from_millis(20),
            Duration::from_millis(50),
        );
        let target = addr("broker-3", 30);
        register_failed(&b1, &target).await;

        let b2_addr = addr("broker-2", 20);
        let record = TakeoverRecord::new(target.clone(), b2_addr.clone(), Uid::from_raw(44));
        let request = b1
            .coordinator
            .takeover_packet(PacketType::TakeoverRequest, &record);
        b1.coordinator.handle_request(&b2_addr, &request).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        let (expired, purged) = b1.coordinator.sweep().await;
        assert_eq!((expired, purged), (1, 0));
        assert_eq!(b1.coordinator.snapshot().await[0].outcome, TakeoverOutcome::Aborted);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let (expired, purged) = b1.coordinator.sweep().await;
        assert_eq!((expired, purged), (0, 1));
        assert!(b1.coordinator.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_aborts_local_past_deadline() {
        let lock = Arc::new(MemoryStoreLock::new());
        let recovery = Arc::new(GatedRecovery::new());
        let mut b1 = peer_with(
            "broker-1",
            10,
            Arc::clone(&lock) as Arc<dyn StoreLockMediator>,
            Arc::clone(&recovery) as Arc<dyn StoreRecovery>,
            Duration::from_millis(20),
            Duration::from_secs(300),
        );
        let target = addr("broker-3", 30);
        register_failed(&b1, &target).await;

        let coordinator = Arc::clone(&b1.coordinator);
        let own = {
            let target = target.clone();
            tokio::spawn(async move { coordinator.initiate(target).await })
        };
        recovery.entered.notified().await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        let (expired, _) = b1.coordinator.sweep().await;
        assert_eq!(expired, 1);

        recovery.gate.notify_one();
        let outcome = own.await.unwrap().unwrap();
        assert_eq!(outcome, TakeoverOutcome::Aborted);
        assert_eq!(
            sent_types(&mut b1.outbound),
            vec![
                PacketType::TakeoverRequest,
                PacketType::TakeoverGrant,
                PacketType::TakeoverAbort,
            ]
        );
        assert_eq!(state_of(&b1, "broker-3").await, BrokerLifecycleState::Failed);
        assert_eq!(
            lock.try_acquire(&target, &addr("broker-9", 90), Uid::from_raw(5))
                .await
                .unwrap(),
            LockResponse::Granted
        );
    }

    #[tokio::test]
    async fn test_record_round_trips_through_packet() {
        let lock = Arc::new(MemoryStoreLock::new());
        let b1 = peer("broker-1", 10, Arc::clone(&lock) as Arc<dyn StoreLockMediator>);

        let record = TakeoverRecord::new(addr("broker-3", 30), addr("broker-1", 10), Uid::from_raw(77));
        let packet = b1
            .coordinator
            .takeover_packet(PacketType::TakeoverRequest, &record);
        let rebuilt = record_from_packet(&packet).unwrap();
        assert_eq!(rebuilt.target, record.target);
        assert_eq!(rebuilt.initiator, record.initiator);
        assert_eq!(rebuilt.token, record.token);
    }

    #[tokio::test]
    async fn test_malformed_takeover_packet_rejected() {
        let lock = Arc::new(MemoryStoreLock::new());
        let b1 = peer("broker-1", 10, Arc::clone(&lock) as Arc<dyn StoreLockMediator>);

        let mut packet = ControlPacket::new(PacketType::TakeoverRequest, 1);
        packet.put_str("targetHost", "broker-3.example.com");
        let err = b1
            .coordinator
            .handle_request(&addr("broker-2", 20), &packet)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PropertyCorrupted(_)));
    }
}
