//! Cluster Server
//!
//! Accepts inbound links from peers and pumps their packets into the
//! engine's inbound channel, tagged with the peer's socket address. The
//! engine resolves socket addresses to broker identities once the peer
//! announces itself.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};

use super::read_packet;
use crate::packet::ControlPacket;
use crate::{Error, Result};

/// What the server reports upward for every link
#[derive(Debug)]
pub enum LinkEvent {
    /// A packet arrived on the link from this socket address
    Packet(String, ControlPacket),
    /// The link from this socket address closed or failed
    Closed(String),
}

pub struct ClusterServer {
    bind_address: String,
    inbound_tx: mpsc::Sender<LinkEvent>,
    local_addr: Arc<RwLock<Option<SocketAddr>>>,
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl ClusterServer {
    pub fn new(bind_address: String, inbound_tx: mpsc::Sender<LinkEvent>) -> Self {
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);
        Self {
            bind_address,
            inbound_tx,
            local_addr: Arc::new(RwLock::new(None)),
            shutdown: shutdown_tx,
        }
    }

    /// The address actually bound, once `start` has it
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().await
    }

    /// Accept links until `stop` is called
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        let bound = listener.local_addr()?;
        *self.local_addr.write().await = Some(bound);
        tracing::info!("Cluster port listening on {}", bound);

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            tracing::debug!("Inbound link from {}", peer_addr);
                            let inbound_tx = self.inbound_tx.clone();
                            tokio::spawn(async move {
                                handle_link(socket, peer_addr, inbound_tx).await;
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Cluster port stopped");
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Read packets off one link until it dies, then report the closure
async fn handle_link(socket: TcpStream, peer_addr: String, inbound_tx: mpsc::Sender<LinkEvent>) {
    let (mut reader, _writer) = socket.into_split();

    loop {
        match read_packet(&mut reader).await {
            Ok(packet) => {
                tracing::trace!("Received {} from {}", packet.packet_type, peer_addr);
                if inbound_tx
                    .send(LinkEvent::Packet(peer_addr.clone(), packet))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e @ (Error::Io(_) | Error::PacketTooLarge(_) | Error::UnsupportedVersion(_))) => {
                // An I/O failure or a refused frame leaves the stream
                // position unknown; a version mismatch means the peer
                // speaks a protocol we cannot follow
                tracing::warn!("Dropping link from {}: {}", peer_addr, e);
                break;
            }
            Err(e) => {
                // The frame was consumed in full, so the reader is still
                // on a frame boundary; only this packet is lost
                tracing::warn!("Discarding unreadable packet from {}: {}", peer_addr, e);
            }
        }
    }

    let _ = inbound_tx.send(LinkEvent::Closed(peer_addr)).await;
}
