//! Cluster Engine
//!
//! The engine is the context object that owns every component of the
//! coordination core: membership view, event notifier, packet dispatcher,
//! transport links, takeover coordinator and liveness monitor. It wires
//! them together at construction, runs the inbound and outbound pump
//! loops, and drives the announce handshake that brokers perform whenever
//! a link comes up.
//!
//! The first packet on any link must be ANNOUNCE. It carries the sender's
//! full identity plus its current member list, so membership spreads
//! transitively: a broker that dials one peer learns the whole cluster.
//! An announce that requests a reply also triggers a resync, which
//! forwards any takeover grants still pending so the newcomer stands down
//! on those targets.

use crate::config::WolfMqConfig;
use crate::dispatch::{PacketDispatcher, PacketHandler};
use crate::events::EventNotifier;
use crate::id::{Uid, UidGenerator};
use crate::network::{ClusterClient, ClusterServer, LinkEvent};
use crate::packet::{ControlPacket, PacketType, FLAG_REPLY_REQUESTED, PROTOCOL_VERSION};
use crate::state::broker::{parse_host_port, BrokerAddress, BrokerLifecycleState, MemberInfo};
use crate::state::membership::MembershipManager;
use crate::store::{StoreLockMediator, StoreRecovery};
use crate::takeover::coordinator::TakeoverCoordinator;
use crate::takeover::monitor::{HeartbeatProbe, TakeoverMonitor};
use crate::{Error, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::interval;

const PROP_SENDER_NAME: &str = "senderName";
const PROP_SENDER_HOST: &str = "senderHost";
const PROP_SENDER_PORT: &str = "senderPort";
const PROP_SENDER_SESSION: &str = "senderSession";
const PROP_PROTOCOL_VERSION: &str = "protocolVersion";

/// One member as carried in an announce body
#[derive(Debug, Serialize, Deserialize)]
struct MemberSummary {
    instance: String,
    host: String,
    port: u16,
    session: u64,
    protocol_version: u16,
}

impl From<&MemberInfo> for MemberSummary {
    fn from(member: &MemberInfo) -> Self {
        Self {
            instance: member.address.instance.clone(),
            host: member.address.host.clone(),
            port: member.address.port,
            session: member.address.session.as_u64(),
            protocol_version: member.protocol_version,
        }
    }
}

impl MemberSummary {
    fn address(&self) -> BrokerAddress {
        BrokerAddress::new(
            &self.instance,
            &self.host,
            self.port,
            Uid::from_raw(self.session),
        )
    }
}

/// Owner and lifecycle of the whole coordination core
pub struct ClusterEngine {
    config: WolfMqConfig,
    local: BrokerAddress,
    ids: Arc<UidGenerator>,
    notifier: Arc<EventNotifier>,
    membership: Arc<MembershipManager>,
    dispatcher: Arc<PacketDispatcher>,
    coordinator: Arc<TakeoverCoordinator>,
    monitor: Arc<TakeoverMonitor>,
    client: Arc<ClusterClient>,
    server: Arc<ClusterServer>,
    /// Inbound link socket address -> announced broker identity
    links: RwLock<HashMap<String, BrokerAddress>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<LinkEvent>>>,
    outbound_rx: Mutex<Option<mpsc::Receiver<ControlPacket>>>,
    shutdown: watch::Sender<bool>,
}

impl ClusterEngine {
    /// Build the engine from a validated config and the store seams.
    /// Nothing runs until `start`.
    pub fn new(
        config: WolfMqConfig,
        lock: Arc<dyn StoreLockMediator>,
        recovery: Arc<dyn StoreRecovery>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let (host, port) = parse_host_port(config.advertise_address())?;
        let ids = Arc::new(UidGenerator::new(UidGenerator::parse_node_id(
            &config.node.instance,
        )));
        // The session uid is minted once per process; everything a dead
        // incarnation sent compares older than this
        let local = BrokerAddress::new(&config.node.instance, host, port, ids.generate());

        let notifier = Arc::new(EventNotifier::new());
        let membership = Arc::new(MembershipManager::new(
            local.clone(),
            PROTOCOL_VERSION,
            config.cluster.master.clone(),
            Arc::clone(&notifier),
        ));

        let (outbound_tx, outbound_rx) = mpsc::channel(256);
        let coordinator = Arc::new(TakeoverCoordinator::new(
            Arc::clone(&membership),
            Arc::clone(&lock),
            recovery,
            Arc::clone(&ids),
            outbound_tx,
            config.takeover_watchdog(),
            config.record_retention(),
        ));

        let probe = Arc::new(HeartbeatProbe::new(
            config.suspect_after(),
            config.failed_after(),
        ));
        let monitor = Arc::new(TakeoverMonitor::new(
            Arc::clone(&membership),
            Arc::clone(&coordinator),
            lock,
            probe,
            config.heartbeat_interval(),
            config.takeover_watchdog(),
            config.cluster.ha_enabled && config.takeover.auto,
        ));

        let dispatcher = Arc::new(PacketDispatcher::new(config.cluster.ha_enabled));

        let (inbound_tx, inbound_rx) = mpsc::channel(1024);
        let server = Arc::new(ClusterServer::new(config.node.bind_address.clone(), inbound_tx));
        let client = Arc::new(ClusterClient::new(
            Duration::from_secs(5),
            Duration::from_secs(10),
        ));

        let (shutdown, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            local,
            ids,
            notifier,
            membership,
            dispatcher,
            coordinator,
            monitor,
            client,
            server,
            links: RwLock::new(HashMap::new()),
            inbound_rx: Mutex::new(Some(inbound_rx)),
            outbound_rx: Mutex::new(Some(outbound_rx)),
            shutdown,
        }))
    }

    pub fn local(&self) -> &BrokerAddress {
        &self.local
    }

    pub fn ha_enabled(&self) -> bool {
        self.config.cluster.ha_enabled
    }

    pub fn membership(&self) -> &Arc<MembershipManager> {
        &self.membership
    }

    pub fn coordinator(&self) -> &Arc<TakeoverCoordinator> {
        &self.coordinator
    }

    pub fn notifier(&self) -> &Arc<EventNotifier> {
        &self.notifier
    }

    /// The cluster port actually bound, once the server is up
    pub async fn bound_addr(&self) -> Option<SocketAddr> {
        self.server.local_addr().await
    }

    /// Register handlers, bring up the cluster port, and spawn the pump
    /// loops. Returns once everything is running.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let inbound = self
            .inbound_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Internal("engine already started".into()))?;
        let outbound = self
            .outbound_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Internal("engine already started".into()))?;

        self.register_handlers().await;

        let server = Arc::clone(&self.server);
        tokio::spawn(async move {
            if let Err(e) = server.start().await {
                tracing::error!("Cluster port failed: {}", e);
            }
        });

        let engine = Arc::clone(&self);
        tokio::spawn(async move { engine.inbound_loop(inbound).await });

        let engine = Arc::clone(&self);
        tokio::spawn(async move { engine.outbound_loop(outbound).await });

        if self.config.cluster.ha_enabled {
            let monitor = Arc::clone(&self.monitor);
            tokio::spawn(async move {
                if let Err(e) = monitor.run().await {
                    tracing::error!("Liveness monitor failed: {}", e);
                }
            });
        }

        let engine = Arc::clone(&self);
        tokio::spawn(async move { engine.announce_loop().await });

        tracing::info!(
            "Cluster engine for {} started (session {}, ha {})",
            self.local,
            self.local.session,
            if self.config.cluster.ha_enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    /// Announce departure and stop every loop
    pub async fn shutdown(&self) {
        tracing::info!("Cluster engine for {} shutting down", self.local);

        let mut goodbye = ControlPacket::new(PacketType::Goodbye, self.ids.generate().as_u64());
        self.put_identity(&mut goodbye);
        let targets = self.peer_addresses().await;
        for (address, e) in self.client.broadcast(&targets, &goodbye).await {
            tracing::debug!("Goodbye to {} not delivered: {}", address, e);
        }

        self.monitor.stop().await;
        let _ = self.shutdown.send(true);
        self.server.stop();
        self.client.close_all().await;
    }

    async fn register_handlers(self: &Arc<Self>) {
        self.dispatcher
            .register(
                PacketType::Announce,
                Arc::new(AnnounceHandler {
                    engine: Arc::clone(self),
                }),
            )
            .await;
        self.dispatcher
            .register(
                PacketType::Goodbye,
                Arc::new(GoodbyeHandler {
                    membership: Arc::clone(&self.membership),
                }),
            )
            .await;

        let takeover = Arc::new(TakeoverHandler {
            coordinator: Arc::clone(&self.coordinator),
        });
        for packet_type in [
            PacketType::TakeoverRequest,
            PacketType::TakeoverGrant,
            PacketType::TakeoverComplete,
            PacketType::TakeoverAbort,
        ] {
            self.dispatcher
                .register(packet_type, Arc::clone(&takeover) as Arc<dyn PacketHandler>)
                .await;
        }
    }

    /// Resolve each inbound packet to an announced identity and dispatch it
    async fn inbound_loop(&self, mut inbound: mpsc::Receiver<LinkEvent>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                event = inbound.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        LinkEvent::Packet(link, packet) => self.handle_inbound(link, packet).await,
                        LinkEvent::Closed(link) => {
                            let peer = self.links.write().await.remove(&link);
                            if let Some(peer) = peer {
                                tracing::debug!("Link from {} closed", peer);
                                self.membership.mark_unreachable(&peer.instance).await;
                            }
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Inbound loop stopped");
    }

    async fn handle_inbound(&self, link: String, packet: ControlPacket) {
        let sender = if packet.packet_type == PacketType::Announce {
            // The announce is the identity handshake; it (re)binds the link
            match announce_sender(&packet) {
                Ok(sender) => {
                    self.links.write().await.insert(link, sender.clone());
                    sender
                }
                Err(e) => {
                    tracing::warn!("Malformed announce on link {}: {}", link, e);
                    return;
                }
            }
        } else {
            let known = self.links.read().await.get(&link).cloned();
            match known {
                Some(sender) => sender,
                None => {
                    tracing::warn!(
                        "Dropping {} from {}: link has not announced itself",
                        packet.packet_type,
                        link
                    );
                    return;
                }
            }
        };

        self.membership.record_heartbeat(&sender.instance).await;
        self.dispatcher.dispatch(&sender, packet).await;
    }

    /// Deliver coordinator broadcasts to every known peer
    async fn outbound_loop(&self, mut outbound: mpsc::Receiver<ControlPacket>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                packet = outbound.recv() => {
                    let Some(packet) = packet else { break };
                    let targets = self.peer_addresses().await;
                    tracing::trace!(
                        "Broadcasting {} to {} peers",
                        packet.packet_type,
                        targets.len()
                    );
                    for (address, e) in self.client.broadcast(&targets, &packet).await {
                        tracing::debug!(
                            "{} to {} not delivered: {}",
                            packet.packet_type,
                            address,
                            e
                        );
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Outbound loop stopped");
    }

    /// Periodic announce doubles as the heartbeat. The first announce
    /// requests replies so a fresh broker learns the cluster in one round.
    async fn announce_loop(&self) {
        let period = self.config.heartbeat_interval();
        // Staggered start so brokers restarted together do not announce in
        // lockstep
        let jitter = rand::thread_rng().gen_range(0..=period.as_millis() as u64 / 4 + 1);
        tokio::time::sleep(Duration::from_millis(jitter)).await;

        let mut ticker = interval(period);
        let mut shutdown = self.shutdown.subscribe();
        let mut request_reply = true;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.announce(request_reply).await;
                    request_reply = false;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Announce loop stopped");
    }

    async fn announce(&self, request_reply: bool) {
        let targets = self.peer_addresses().await;
        if targets.is_empty() {
            return;
        }
        match self.announce_packet(request_reply).await {
            Ok(packet) => {
                for (address, e) in self.client.broadcast(&targets, &packet).await {
                    tracing::debug!("Announce to {} not delivered: {}", address, e);
                }
            }
            Err(e) => tracing::warn!("Could not build announce: {}", e),
        }
    }

    /// Reply to a fresh peer: our own announce plus every takeover grant
    /// still pending, so the newcomer stands down on those targets
    async fn resync(&self, peer: &BrokerAddress) {
        let address = peer.socket_addr();
        match self.announce_packet(false).await {
            Ok(packet) => {
                if let Err(e) = self.client.send(&address, &packet).await {
                    tracing::debug!("Announce reply to {} not delivered: {}", peer, e);
                    return;
                }
            }
            Err(e) => {
                tracing::warn!("Could not build announce reply: {}", e);
                return;
            }
        }

        for packet in self.coordinator.pending_grant_packets().await {
            if let Err(e) = self.client.send(&address, &packet).await {
                tracing::debug!("Grant forward to {} not delivered: {}", peer, e);
            }
        }
    }

    async fn announce_packet(&self, request_reply: bool) -> Result<ControlPacket> {
        let mut packet = ControlPacket::new(PacketType::Announce, self.ids.generate().as_u64());
        self.put_identity(&mut packet);
        packet.put_int(PROP_PROTOCOL_VERSION, i32::from(PROTOCOL_VERSION));
        if request_reply {
            packet.flags |= FLAG_REPLY_REQUESTED;
        }

        let members: Vec<MemberSummary> = self
            .membership
            .snapshot()
            .await
            .iter()
            .filter(|m| {
                m.address.instance != self.local.instance && !m.state.is_terminal()
            })
            .map(MemberSummary::from)
            .collect();
        if !members.is_empty() {
            packet.body = bincode::serialize(&members)?;
        }
        Ok(packet)
    }

    fn put_identity(&self, packet: &mut ControlPacket) {
        packet.put_str(PROP_SENDER_NAME, &self.local.instance);
        packet.put_str(PROP_SENDER_HOST, &self.local.host);
        packet.put_int(PROP_SENDER_PORT, i32::from(self.local.port));
        packet.put_long(PROP_SENDER_SESSION, self.local.session.as_u64() as i64);
    }

    /// Socket addresses to reach: configured peers plus everything the view
    /// knows, minus this broker
    async fn peer_addresses(&self) -> Vec<String> {
        let mut targets: BTreeSet<String> = self.config.cluster.peers.iter().cloned().collect();
        for member in self.membership.snapshot().await {
            if member.address.instance == self.local.instance || member.state.is_terminal() {
                continue;
            }
            targets.insert(member.address.socket_addr());
        }
        targets.remove(&self.local.socket_addr());
        targets.remove(self.config.advertise_address());
        targets.into_iter().collect()
    }
}

/// Rebuild the sender identity an announce or goodbye carries
fn announce_sender(packet: &ControlPacket) -> Result<BrokerAddress> {
    let instance = packet
        .get_str(PROP_SENDER_NAME)
        .ok_or_else(|| Error::PropertyCorrupted("senderName missing from ANNOUNCE".into()))?;
    let host = packet
        .get_str(PROP_SENDER_HOST)
        .ok_or_else(|| Error::PropertyCorrupted("senderHost missing from ANNOUNCE".into()))?;
    let port = packet
        .get_int(PROP_SENDER_PORT)
        .ok_or_else(|| Error::PropertyCorrupted("senderPort missing from ANNOUNCE".into()))?;
    let port = u16::try_from(port)
        .map_err(|_| Error::PropertyCorrupted(format!("senderPort out of range: {}", port)))?;
    let session = packet
        .get_long(PROP_SENDER_SESSION)
        .ok_or_else(|| Error::PropertyCorrupted("senderSession missing from ANNOUNCE".into()))?;
    Ok(BrokerAddress::new(
        instance,
        host,
        port,
        Uid::from_raw(session as u64),
    ))
}

/// ANNOUNCE: merge the sender and its member list into the view, reply
/// with our own state when asked
struct AnnounceHandler {
    engine: Arc<ClusterEngine>,
}

#[async_trait]
impl PacketHandler for AnnounceHandler {
    async fn handle(&self, sender: &BrokerAddress, packet: &ControlPacket) -> Result<()> {
        let version = packet
            .get_int(PROP_PROTOCOL_VERSION)
            .map(|v| v as u16)
            .unwrap_or(PROTOCOL_VERSION);

        self.engine
            .membership
            .add_broker(sender.clone(), version)
            .await?;
        // A direct announce completes the handshake; members learned only
        // by word of mouth stay JOINING until they speak for themselves
        if let Some(member) = self.engine.membership.get(&sender.instance).await {
            if member.state == BrokerLifecycleState::Joining {
                self.engine
                    .membership
                    .set_state(
                        &sender.instance,
                        BrokerLifecycleState::Operating,
                        "announce handshake complete",
                    )
                    .await?;
            }
        }

        if !packet.body.is_empty() {
            let members: Vec<MemberSummary> = bincode::deserialize(&packet.body)?;
            for summary in members {
                if summary.instance == self.engine.local.instance
                    || summary.instance == sender.instance
                {
                    continue;
                }
                if let Err(e) = self
                    .engine
                    .membership
                    .add_broker(summary.address(), summary.protocol_version)
                    .await
                {
                    tracing::debug!(
                        "Announced member {} not merged: {}",
                        summary.instance,
                        e
                    );
                }
            }
        }

        if packet.reply_requested() {
            self.engine.resync(sender).await;
        }
        Ok(())
    }
}

/// GOODBYE: the sender is leaving on purpose; drop it without waiting for
/// the liveness probe
struct GoodbyeHandler {
    membership: Arc<MembershipManager>,
}

#[async_trait]
impl PacketHandler for GoodbyeHandler {
    async fn handle(&self, sender: &BrokerAddress, _packet: &ControlPacket) -> Result<()> {
        match self
            .membership
            .remove_broker(&sender.instance, "goodbye received")
            .await
        {
            Ok(_) => {
                tracing::info!("{} left the cluster", sender);
                Ok(())
            }
            Err(Error::BrokerNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Takeover family: routed straight into the coordinator
struct TakeoverHandler {
    coordinator: Arc<TakeoverCoordinator>,
}

#[async_trait]
impl PacketHandler for TakeoverHandler {
    async fn handle(&self, sender: &BrokerAddress, packet: &ControlPacket) -> Result<()> {
        match packet.packet_type {
            PacketType::TakeoverRequest => self.coordinator.handle_request(sender, packet).await,
            PacketType::TakeoverGrant => self.coordinator.handle_grant(sender, packet).await,
            PacketType::TakeoverComplete => self.coordinator.handle_complete(sender, packet).await,
            PacketType::TakeoverAbort => self.coordinator.handle_abort(sender, packet).await,
            other => Err(Error::Internal(format!(
                "takeover handler registered for {}",
                other
            ))),
        }
    }
}
