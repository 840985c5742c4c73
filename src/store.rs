//! Store Boundary
//!
//! The coordination engine does not own broker stores. It reaches them
//! through two seams: a lock mediator that arbitrates exclusive ownership
//! of a failed broker's store, and a recovery hook that transfers the
//! store to its new owner. Whatever backs the mediator must make
//! `try_acquire` atomic; that atomicity is what keeps two brokers from
//! both completing a takeover of the same target.

use crate::id::Uid;
use crate::state::broker::BrokerAddress;
use crate::{Error, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;

/// Outcome of a lock attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockResponse {
    Granted,
    /// Denied, naming the current holder when known
    Denied { holder: Option<String> },
}

/// Arbitration of exclusive store ownership
#[async_trait]
pub trait StoreLockMediator: Send + Sync {
    /// Try to take exclusive ownership of the target's store. Re-acquiring
    /// a lock this owner already holds refreshes it and grants again.
    async fn try_acquire(
        &self,
        target: &BrokerAddress,
        owner: &BrokerAddress,
        token: Uid,
    ) -> Result<LockResponse>;

    /// Release ownership. Only the holder can release.
    async fn release(&self, target: &BrokerAddress, owner: &BrokerAddress) -> Result<()>;

    /// Drop lock rows older than `max_age`, left behind by owners that died
    /// mid-takeover. Returns how many were reaped; mediators that do not age
    /// their locks reap nothing.
    async fn reap_stale(&self, _max_age: Duration) -> Result<u64> {
        Ok(0)
    }
}

/// Transfer of a failed broker's persistent store
#[async_trait]
pub trait StoreRecovery: Send + Sync {
    async fn recover(&self, target: &BrokerAddress, new_owner: &BrokerAddress) -> Result<()>;
}

/// Recovery hook for deployments where the storage layer moves the store
/// out of band; reports the handoff and succeeds.
pub struct NoopRecovery;

#[async_trait]
impl StoreRecovery for NoopRecovery {
    async fn recover(&self, target: &BrokerAddress, new_owner: &BrokerAddress) -> Result<()> {
        tracing::info!("Store of {} handed to {}", target, new_owner);
        Ok(())
    }
}

/// In-process lock table. Share one instance between brokers under test to
/// model the cluster-wide lock.
pub struct MemoryStoreLock {
    locks: Mutex<HashMap<String, (String, u64)>>,
}

impl MemoryStoreLock {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStoreLock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreLockMediator for MemoryStoreLock {
    async fn try_acquire(
        &self,
        target: &BrokerAddress,
        owner: &BrokerAddress,
        token: Uid,
    ) -> Result<LockResponse> {
        let mut locks = self.locks.lock().await;
        let me = owner.identity_key();
        match locks.get(&target.instance) {
            None => {
                locks.insert(target.instance.clone(), (me, token.as_u64()));
                Ok(LockResponse::Granted)
            }
            Some((holder, _)) if *holder == me => {
                locks.insert(target.instance.clone(), (me, token.as_u64()));
                Ok(LockResponse::Granted)
            }
            Some((holder, _)) => Ok(LockResponse::Denied {
                holder: Some(holder.clone()),
            }),
        }
    }

    async fn release(&self, target: &BrokerAddress, owner: &BrokerAddress) -> Result<()> {
        let mut locks = self.locks.lock().await;
        let me = owner.identity_key();
        match locks.get(&target.instance) {
            Some((holder, _)) if *holder == me => {
                locks.remove(&target.instance);
                Ok(())
            }
            Some((holder, _)) => Err(Error::Store(format!(
                "lock on {} held by {}, not {}",
                target.instance, holder, me
            ))),
            None => Err(Error::Store(format!(
                "lock on {} is not held",
                target.instance
            ))),
        }
    }
}

/// Lock table on a shared SQLite database. Every broker in the cluster
/// points at the same file; the PRIMARY KEY insert is the arbitration.
///
/// `Connection` is `Send` but not `Sync`, so access goes through a `Mutex`;
/// an `RwLock` guard held across an await would make the mediator futures
/// non-`Send`.
pub struct SqliteStoreLock {
    conn: Mutex<Connection>,
}

impl SqliteStoreLock {
    /// Create or open the lock database
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS takeover_locks (
                target TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                token INTEGER NOT NULL,
                acquired_at INTEGER NOT NULL
            );
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl StoreLockMediator for SqliteStoreLock {
    async fn try_acquire(
        &self,
        target: &BrokerAddress,
        owner: &BrokerAddress,
        token: Uid,
    ) -> Result<LockResponse> {
        let conn = self.conn.lock().await;
        let me = owner.identity_key();
        let now = chrono::Utc::now().timestamp_millis();

        let inserted = conn.execute(
            r#"
            INSERT INTO takeover_locks (target, owner, token, acquired_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(target) DO NOTHING
            "#,
            params![target.instance, me, token.as_u64() as i64, now],
        )?;
        if inserted > 0 {
            return Ok(LockResponse::Granted);
        }

        let holder: std::result::Result<String, _> = conn.query_row(
            "SELECT owner FROM takeover_locks WHERE target = ?1",
            params![target.instance],
            |row| row.get(0),
        );

        match holder {
            Ok(holder) if holder == me => {
                conn.execute(
                    "UPDATE takeover_locks SET token = ?2, acquired_at = ?3 WHERE target = ?1",
                    params![target.instance, token.as_u64() as i64, now],
                )?;
                Ok(LockResponse::Granted)
            }
            Ok(holder) => Ok(LockResponse::Denied {
                holder: Some(holder),
            }),
            // Holder released between our insert and select: contended
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                Ok(LockResponse::Denied { holder: None })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn release(&self, target: &BrokerAddress, owner: &BrokerAddress) -> Result<()> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM takeover_locks WHERE target = ?1 AND owner = ?2",
            params![target.instance, owner.identity_key()],
        )?;
        if deleted == 0 {
            return Err(Error::Store(format!(
                "lock on {} not held by {}",
                target.instance, owner
            )));
        }
        Ok(())
    }

    async fn reap_stale(&self, max_age: Duration) -> Result<u64> {
        let conn = self.conn.lock().await;
        let cutoff = chrono::Utc::now().timestamp_millis() - max_age.as_millis() as i64;
        let deleted = conn.execute(
            "DELETE FROM takeover_locks WHERE acquired_at < ?1",
            params![cutoff],
        )?;
        Ok(deleted as u64)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Store(format!("SQLite error: {}", e))
    }
}
