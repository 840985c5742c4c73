//! Cluster Client
//!
//! Outbound links to peers, one pooled write half per address. Sends are
//! at most once: a packet that hits a dead link is dropped along with the
//! link, never replayed on the replacement. The next send dials fresh.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;

use super::write_packet;
use crate::packet::ControlPacket;
use crate::{Error, Result};

struct PoolEntry {
    writer: OwnedWriteHalf,
    last_used: Instant,
}

pub struct ClusterClient {
    /// Outbound link per peer socket address
    pool: Arc<RwLock<HashMap<String, Arc<Mutex<PoolEntry>>>>>,
    connect_timeout: Duration,
    send_timeout: Duration,
}

impl ClusterClient {
    pub fn new(connect_timeout: Duration, send_timeout: Duration) -> Self {
        Self {
            pool: Arc::new(RwLock::new(HashMap::new())),
            connect_timeout,
            send_timeout,
        }
    }

    /// Send one packet to a peer. Establishes the link if none is pooled;
    /// a send failure drops the link and surfaces the error.
    pub async fn send(&self, address: &str, packet: &ControlPacket) -> Result<()> {
        let result = timeout(self.send_timeout, self.send_inner(address, packet)).await;
        match result {
            Ok(inner) => inner,
            Err(_) => {
                self.remove_link(address).await;
                Err(Error::ConnectionTimeout(address.to_string()))
            }
        }
    }

    async fn send_inner(&self, address: &str, packet: &ControlPacket) -> Result<()> {
        if let Some(entry) = self.get_link(address).await {
            let mut entry = entry.lock().await;
            match write_packet(&mut entry.writer, packet).await {
                Ok(()) => {
                    entry.last_used = Instant::now();
                    return Ok(());
                }
                Err(e) => {
                    // The packet is lost with the link; the caller decides
                    // whether the state it carried needs a resync
                    drop(entry);
                    self.remove_link(address).await;
                    return Err(e);
                }
            }
        }

        let stream = self.connect(address).await?;
        let (_reader, mut writer) = stream.into_split();
        write_packet(&mut writer, packet).await?;
        self.store_link(address.to_string(), writer).await;
        Ok(())
    }

    /// Send to every address, returning the peers that could not be reached
    pub async fn broadcast(
        &self,
        addresses: &[String],
        packet: &ControlPacket,
    ) -> Vec<(String, Error)> {
        let sends = addresses.iter().map(|address| async move {
            match self.send(address, packet).await {
                Ok(()) => None,
                Err(e) => Some((address.clone(), e)),
            }
        });
        futures::future::join_all(sends)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    async fn connect(&self, address: &str) -> Result<TcpStream> {
        let result = timeout(self.connect_timeout, TcpStream::connect(address)).await;
        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                tracing::debug!("Outbound link to {} established", address);
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    async fn get_link(&self, address: &str) -> Option<Arc<Mutex<PoolEntry>>> {
        self.pool.read().await.get(address).cloned()
    }

    async fn store_link(&self, address: String, writer: OwnedWriteHalf) {
        let mut pool = self.pool.write().await;
        pool.insert(
            address,
            Arc::new(Mutex::new(PoolEntry {
                writer,
                last_used: Instant::now(),
            })),
        );
    }

    async fn remove_link(&self, address: &str) {
        let mut pool = self.pool.write().await;
        if pool.remove(address).is_some() {
            tracing::debug!("Outbound link to {} dropped", address);
        }
    }

    /// Drop links idle past `max_idle`
    pub async fn cleanup_stale(&self, max_idle: Duration) {
        let mut pool = self.pool.write().await;
        let now = Instant::now();
        pool.retain(|address, entry| {
            if let Ok(e) = entry.try_lock() {
                if now.duration_since(e.last_used) > max_idle {
                    tracing::debug!("Dropping idle link to {}", address);
                    return false;
                }
            }
            true
        });
    }

    /// Close every outbound link
    pub async fn close_all(&self) {
        self.pool.write().await.clear();
    }

    pub async fn link_count(&self) -> usize {
        self.pool.read().await.len()
    }
}
