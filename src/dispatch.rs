//! Packet Dispatch
//!
//! Inbound control packets route through a type-keyed handler registry.
//! Everything wrong at this boundary is logged and dropped: an unknown
//! type, a takeover packet while HA is off, or a handler error never
//! takes the link down and never unwinds past the dispatcher.

use crate::packet::{ControlPacket, PacketType};
use crate::state::broker::BrokerAddress;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// One handler per packet type
#[async_trait]
pub trait PacketHandler: Send + Sync {
    async fn handle(&self, sender: &BrokerAddress, packet: &ControlPacket) -> Result<()>;
}

/// Type-keyed routing table for inbound packets
pub struct PacketDispatcher {
    handlers: RwLock<HashMap<u16, Arc<dyn PacketHandler>>>,
    ha_enabled: bool,
}

impl PacketDispatcher {
    pub fn new(ha_enabled: bool) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            ha_enabled,
        }
    }

    pub fn ha_enabled(&self) -> bool {
        self.ha_enabled
    }

    /// Register the handler for a packet type, replacing any previous one
    pub async fn register(&self, packet_type: PacketType, handler: Arc<dyn PacketHandler>) {
        self.handlers
            .write()
            .await
            .insert(packet_type.code(), handler);
    }

    /// Route one packet. Never returns an error: problems are logged at the
    /// severity the taxonomy assigns and the packet is dropped.
    pub async fn dispatch(&self, sender: &BrokerAddress, packet: ControlPacket) {
        let packet_type = packet.packet_type;

        if packet_type.is_takeover() && !self.ha_enabled {
            let err = Error::UnexpectedPacket {
                packet: packet_type.to_string(),
                sender: sender.to_string(),
            };
            tracing::warn!("{}", err);
            return;
        }

        let handler = self.handlers.read().await.get(&packet_type.code()).cloned();
        let Some(handler) = handler else {
            let err = Error::UnexpectedPacket {
                packet: packet_type.to_string(),
                sender: sender.to_string(),
            };
            tracing::warn!("{}", err);
            return;
        };

        if let Err(e) = handler.handle(sender, &packet).await {
            if matches!(e, Error::StaleSession { .. }) {
                tracing::debug!("Stale {} from {}: {}", packet_type, sender, e);
            } else if e.is_protocol_anomaly() {
                tracing::warn!("{}", e);
            } else {
                tracing::warn!("Handler for {} from {} failed: {}", packet_type, sender, e);
            }
        }
    }
}
