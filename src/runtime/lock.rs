//! Distributed mutual exclusion keyed by string
//!
//! The processor holds a run's lock only while deciding what to dispatch for that
//! run. Backends implement a non-blocking [`LockService::try_lock`]; timeouts,
//! owner identity and release-on-drop live in [`DistributedLock`] / [`LockGuard`].
//!
//! - [`LocalLockService`]: in-process set of held keys
//! - [`SqliteLockService`]: rows in a `flow_locks` table with a lease, so a crashed
//!   holder's lock expires instead of blocking the key forever

use crate::{error::LockError, runtime::clock::to_chrono};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::Instant;

/// Backend of the lock service
#[async_trait]
pub trait LockService: Send + Sync {
    /// Take `key` for `owner` if free. Never blocks waiting for the holder.
    async fn try_lock(&self, key: &str, owner: &str) -> Result<bool, LockError>;

    /// Release `key` if `owner` still holds it
    async fn unlock(&self, key: &str, owner: &str) -> Result<(), LockError>;
}

/// Lock client bound to one owner identity
#[derive(Clone)]
pub struct DistributedLock {
    service: Arc<dyn LockService>,
    owner: String,
    retry_every: Duration,
}

impl DistributedLock {
    pub fn new(service: Arc<dyn LockService>, owner: impl Into<String>) -> Self {
        Self {
            service,
            owner: owner.into(),
            retry_every: Duration::from_millis(10),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Acquire `key`, retrying until `timeout` elapses
    pub async fn acquire(&self, key: &str, timeout: Duration) -> Result<LockGuard, LockError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.service.try_lock(key, &self.owner).await? {
                return Ok(LockGuard {
                    key: key.to_string(),
                    owner: self.owner.clone(),
                    service: Some(Arc::clone(&self.service)),
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Timeout {
                    key: key.to_string(),
                });
            }
            tokio::time::sleep(self.retry_every.min(deadline - now)).await;
        }
    }
}

/// Held lock; release with [`LockGuard::release`], dropping releases in the background
pub struct LockGuard {
    key: String,
    owner: String,
    service: Option<Arc<dyn LockService>>,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn release(mut self) -> Result<(), LockError> {
        match self.service.take() {
            Some(service) => service.unlock(&self.key, &self.owner).await,
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(service) = self.service.take() else {
            return;
        };
        let key = std::mem::take(&mut self.key);
        let owner = std::mem::take(&mut self.owner);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = service.unlock(&key, &owner).await {
                        tracing::warn!("⚠️ Failed to release lock '{}' on drop: {}", key, e);
                    }
                });
            }
            Err(_) => {
                tracing::warn!("⚠️ Lock '{}' dropped outside a runtime; left to lease expiry", key);
            }
        }
    }
}

/// In-process lock service
#[derive(Debug, Default)]
pub struct LocalLockService {
    held: Mutex<HashSet<String>>,
}

impl LocalLockService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.held
            .lock()
            .map(|held| held.contains(key))
            .unwrap_or(false)
    }
}

#[async_trait]
impl LockService for LocalLockService {
    async fn try_lock(&self, key: &str, _owner: &str) -> Result<bool, LockError> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| anyhow::anyhow!("local lock mutex poisoned"))?;
        Ok(held.insert(key.to_string()))
    }

    async fn unlock(&self, key: &str, _owner: &str) -> Result<(), LockError> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| anyhow::anyhow!("local lock mutex poisoned"))?;
        held.remove(key);
        Ok(())
    }
}

/// Lease-based lock rows in SQLite, shared by every processor on the same database
#[derive(Debug, Clone)]
pub struct SqliteLockService {
    pool: SqlitePool,
    lease: Duration,
}

impl SqliteLockService {
    pub fn new(pool: SqlitePool, lease: Duration) -> Self {
        Self { pool, lease }
    }

    /// Create the lock table. Safe to call multiple times.
    pub async fn init_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS flow_locks (
                key TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                expires_at TIMESTAMP NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl LockService for SqliteLockService {
    async fn try_lock(&self, key: &str, owner: &str) -> Result<bool, LockError> {
        let now = Utc::now();
        let expires_at = now + to_chrono(self.lease);

        // Reclaim a lease whose holder died without releasing
        sqlx::query("DELETE FROM flow_locks WHERE key = ? AND expires_at < ?")
            .bind(key)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(anyhow::Error::from)?;

        let result = sqlx::query(
            "INSERT OR IGNORE INTO flow_locks (key, owner, expires_at) VALUES (?, ?, ?)",
        )
        .bind(key)
        .bind(owner)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;

        Ok(result.rows_affected() == 1)
    }

    async fn unlock(&self, key: &str, owner: &str) -> Result<(), LockError> {
        sqlx::query("DELETE FROM flow_locks WHERE key = ? AND owner = ?")
            .bind(key)
            .bind(owner)
            .execute(&self.pool)
            .await
            .map_err(anyhow::Error::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_times_out_until_release() {
        let service: Arc<dyn LockService> = Arc::new(LocalLockService::new());
        let first = DistributedLock::new(Arc::clone(&service), "proc-a");
        let second = DistributedLock::new(Arc::clone(&service), "proc-b");

        let guard = first.acquire("run-1", Duration::from_millis(20)).await.unwrap();
        let err = second
            .acquire("run-1", Duration::from_millis(20))
            .await
            .err()
            .expect("key is held");
        assert!(matches!(err, LockError::Timeout { ref key } if key == "run-1"));

        guard.release().await.unwrap();
        let again = second.acquire("run-1", Duration::from_millis(20)).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn drop_releases_in_background() {
        let local = Arc::new(LocalLockService::new());
        let lock = DistributedLock::new(local.clone(), "proc-a");

        {
            let _guard = lock.acquire("run-2", Duration::from_millis(20)).await.unwrap();
            assert!(local.is_locked("run-2"));
        }
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!local.is_locked("run-2"));
    }
}
