//! Exclusive lock table
//!
//! Named exclusive locks with owner tracking. Waiters queue on a per-name
//! tokio mutex, so grants are FIFO per lock. Releasing a lock whose owner is
//! still waiting for it cancels the wait: the grant, when it comes, is
//! dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::LockOwner;
use crate::error::{Error, Result};

struct Held {
    owner: LockOwner,
    _guard: OwnedMutexGuard<()>,
}

type WaitKey = (String, LockOwner);

/// Table of named exclusive locks
#[derive(Default)]
pub struct LockTable {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    held: Mutex<HashMap<String, Held>>,
    /// Pending acquisitions and whether they were cancelled. Taken after
    /// `held`, never held across an await.
    waiting: std::sync::Mutex<HashMap<WaitKey, bool>>,
}

/// Registration of one pending acquisition, removed when dropped
struct Waiter<'a> {
    table: &'a LockTable,
    key: WaitKey,
}

impl<'a> Waiter<'a> {
    fn register(table: &'a LockTable, name: &str, owner: &LockOwner) -> Self {
        let key = (name.to_string(), owner.clone());
        table.waiting().insert(key.clone(), false);
        Self { table, key }
    }

    /// Stop waiting; returns whether the acquisition was cancelled
    fn finish(self) -> bool {
        let cancelled = self.table.waiting().remove(&self.key);
        cancelled.unwrap_or(false)
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.table.waiting().remove(&self.key);
    }
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait up to `timeout` for `name`. Acquiring a lock the owner already
    /// holds succeeds immediately.
    pub async fn acquire(&self, name: &str, owner: &LockOwner, timeout: Duration) -> Result<()> {
        if self.holder(name).await.as_ref() == Some(owner) {
            return Ok(());
        }

        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        let waiter = Waiter::register(self, name, owner);
        let acquired = tokio::time::timeout(timeout, lock.lock_owned()).await;

        let mut held = self.held.lock().await;
        let cancelled = waiter.finish();
        let guard = acquired.map_err(|_| Error::LockTimeout {
            lock: name.to_string(),
        })?;
        if cancelled {
            // Dropping the guard hands the lock to the next waiter
            tracing::debug!("Lock {} granted to {} after release, dropping it", name, owner);
            return Err(Error::LockTimeout {
                lock: name.to_string(),
            });
        }

        held.insert(
            name.to_string(),
            Held {
                owner: owner.clone(),
                _guard: guard,
            },
        );
        tracing::trace!("Lock {} granted to {}", name, owner);
        Ok(())
    }

    /// Release `name` if `owner` holds it. Returns whether anything was
    /// released. An acquisition by `owner` still waiting for `name` is
    /// cancelled.
    pub async fn release(&self, name: &str, owner: &LockOwner) -> bool {
        let mut held = self.held.lock().await;
        match held.get(name) {
            Some(h) if &h.owner == owner => {
                held.remove(name);
                tracing::trace!("Lock {} released by {}", name, owner);
                true
            }
            _ => {
                let key = (name.to_string(), owner.clone());
                if let Some(cancelled) = self.waiting().get_mut(&key) {
                    tracing::debug!("Pending acquisition of {} by {} cancelled", name, owner);
                    *cancelled = true;
                }
                false
            }
        }
    }

    /// Release every lock whose owner matches `predicate`, and cancel that
    /// owner's pending acquisitions. Returns the released lock names.
    pub async fn release_where<F>(&self, predicate: F) -> Vec<String>
    where
        F: Fn(&LockOwner) -> bool,
    {
        let mut held = self.held.lock().await;
        let names: Vec<String> = held
            .iter()
            .filter(|(_, h)| predicate(&h.owner))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &names {
            held.remove(name);
        }
        for ((_, owner), cancelled) in self.waiting().iter_mut() {
            if predicate(owner) {
                *cancelled = true;
            }
        }
        names
    }

    /// Release everything
    pub async fn clear(&self) {
        self.held.lock().await.clear();
    }

    /// Current holder of `name`
    pub async fn holder(&self, name: &str) -> Option<LockOwner> {
        self.held.lock().await.get(name).map(|h| h.owner.clone())
    }

    /// Number of locks currently held
    pub async fn held_count(&self) -> usize {
        self.held.lock().await.len()
    }

    /// Number of acquisitions still waiting
    pub fn waiting_count(&self) -> usize {
        self.waiting().len()
    }

    fn waiting(&self) -> std::sync::MutexGuard<'_, HashMap<WaitKey, bool>> {
        // Never poisoned: no code panics while holding it
        self.waiting.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exclusive_and_idempotent_release() {
        let table = Arc::new(LockTable::new());
        let a = LockOwner::new("a", 1);
        let b = LockOwner::new("b", 1);

        table.acquire("l", &a, Duration::from_millis(50)).await.unwrap();
        assert!(matches!(
            table.acquire("l", &b, Duration::from_millis(50)).await,
            Err(Error::LockTimeout { .. })
        ));

        assert!(!table.release("l", &b).await);
        assert!(table.release("l", &a).await);
        assert!(!table.release("l", &a).await);

        table.acquire("l", &b, Duration::from_millis(50)).await.unwrap();
        assert_eq!(table.holder("l").await, Some(b));
    }

    #[tokio::test]
    async fn test_waiter_is_granted_after_release() {
        let table = Arc::new(LockTable::new());
        let a = LockOwner::new("a", 1);
        table.acquire("l", &a, Duration::from_millis(50)).await.unwrap();

        let waiter = {
            let table = table.clone();
            tokio::spawn(async move {
                let b = LockOwner::new("b", 1);
                table.acquire("l", &b, Duration::from_secs(5)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        table.release("l", &a).await;
        waiter.await.unwrap().unwrap();
        assert_eq!(table.holder("l").await.unwrap().member, "b");
    }

    #[tokio::test]
    async fn test_release_where_member() {
        let table = LockTable::new();
        table
            .acquire("x", &LockOwner::new("a", 1), Duration::from_millis(50))
            .await
            .unwrap();
        table
            .acquire("y", &LockOwner::new("b", 1), Duration::from_millis(50))
            .await
            .unwrap();

        let released = table.release_where(|o| o.member == "a").await;
        assert_eq!(released, vec!["x"]);
        assert_eq!(table.held_count().await, 1);

        table.clear().await;
        assert_eq!(table.held_count().await, 0);
    }

    #[tokio::test]
    async fn test_release_cancels_waiting_acquire() {
        let table = Arc::new(LockTable::new());
        let a = LockOwner::new("a", 1);
        let b = LockOwner::new("b", 1);
        table.acquire("l", &a, Duration::from_millis(50)).await.unwrap();

        let waiter = {
            let table = table.clone();
            let b = b.clone();
            tokio::spawn(async move { table.acquire("l", &b, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(table.waiting_count(), 1);

        // b gave up and released before its grant arrived
        assert!(!table.release("l", &b).await);
        assert!(table.release("l", &a).await);
        assert!(matches!(
            waiter.await.unwrap(),
            Err(Error::LockTimeout { .. })
        ));
        assert!(table.holder("l").await.is_none());
        assert_eq!(table.waiting_count(), 0);

        let c = LockOwner::new("c", 1);
        table.acquire("l", &c, Duration::from_millis(50)).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_where_cancels_waiters_of_member() {
        let table = Arc::new(LockTable::new());
        let a = LockOwner::new("a", 1);
        table.acquire("l", &a, Duration::from_millis(50)).await.unwrap();

        let waiter = {
            let table = table.clone();
            tokio::spawn(async move {
                table
                    .acquire("l", &LockOwner::new("gone", 3), Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(table.release_where(|o| o.member == "gone").await.is_empty());

        table.release("l", &a).await;
        assert!(waiter.await.unwrap().is_err());
        assert!(table.holder("l").await.is_none());
    }

    #[tokio::test]
    async fn test_abandoned_acquire_leaves_no_waiter() {
        let table = LockTable::new();
        let a = LockOwner::new("a", 1);
        table.acquire("l", &a, Duration::from_millis(50)).await.unwrap();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            table.acquire("l", &LockOwner::new("b", 1), Duration::from_secs(5)),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(table.waiting_count(), 0);
    }
}
