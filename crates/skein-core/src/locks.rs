//! Per-key write locks held from prepare until commit or rollback.

use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use skein_cluster::Key;
use tokio::sync::Notify;

use crate::message::TxId;

#[derive(Debug, Clone, Copy)]
struct LockHolder {
    tx: TxId,
    acquired_at: Instant,
}

/// Exclusive, reentrant (per transaction) key locks.
#[derive(Debug, Default)]
pub struct LockTable {
    locks: DashMap<Key, LockHolder>,
    released: Notify,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lock on `key` for `tx`. Succeeds if the key is free or
    /// already held by `tx`; otherwise returns the current holder.
    pub fn try_acquire(&self, key: &Key, tx: TxId) -> Result<(), TxId> {
        match self.locks.entry(key.clone()) {
            Entry::Occupied(e) if e.get().tx == tx => Ok(()),
            Entry::Occupied(e) => Err(e.get().tx),
            Entry::Vacant(e) => {
                e.insert(LockHolder {
                    tx,
                    acquired_at: Instant::now(),
                });
                Ok(())
            }
        }
    }

    /// Locks every key or none of them. On conflict, locks taken by this
    /// call are released and the contended key is returned with its holder.
    pub fn acquire_all<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a Key>,
        tx: TxId,
    ) -> Result<(), (Key, TxId)> {
        let mut taken: Vec<&Key> = Vec::new();
        for key in keys {
            let already_held = self.holder(key) == Some(tx);
            match self.try_acquire(key, tx) {
                Ok(()) => {
                    if !already_held {
                        taken.push(key);
                    }
                }
                Err(holder) => {
                    self.release_all(taken, tx);
                    return Err((key.clone(), holder));
                }
            }
        }
        Ok(())
    }

    /// Releases `key` if `tx` holds it.
    pub fn release(&self, key: &Key, tx: TxId) -> bool {
        let removed = self.locks.remove_if(key, |_, h| h.tx == tx).is_some();
        if removed {
            self.released.notify_waiters();
        }
        removed
    }

    pub fn release_all<'a>(&self, keys: impl IntoIterator<Item = &'a Key>, tx: TxId) {
        let mut any = false;
        for key in keys {
            any |= self.locks.remove_if(key, |_, h| h.tx == tx).is_some();
        }
        if any {
            self.released.notify_waiters();
        }
    }

    /// Currently locked keys accepted by `filter`.
    pub fn locked_keys(&self, filter: impl Fn(&Key) -> bool) -> Vec<Key> {
        self.locks
            .iter()
            .filter(|e| filter(e.key()))
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn holder(&self, key: &Key) -> Option<TxId> {
        self.locks.get(key).map(|h| h.tx)
    }

    pub fn is_locked(&self, key: &Key) -> bool {
        self.locks.contains_key(key)
    }

    /// Transactions holding at least one lock older than `max_age`.
    pub fn expired(&self, max_age: Duration) -> Vec<TxId> {
        let mut stale: Vec<TxId> = self
            .locks
            .iter()
            .filter(|e| e.acquired_at.elapsed() >= max_age)
            .map(|e| e.tx)
            .collect();
        stale.sort();
        stale.dedup();
        stale
    }

    /// Waits until none of `keys` is locked. Returns false on timeout.
    pub async fn wait_released(&self, keys: &[Key], timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            // register before checking so a release in between is not missed
            notified.as_mut().enable();

            if !keys.iter().any(|k| self.is_locked(k)) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return !keys.iter().any(|k| self.is_locked(k));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use skein_cluster::NodeId;

    fn tx(seq: u64) -> TxId {
        let origin = NodeId::parse("00000000-0000-0000-0000-000000000001").unwrap();
        TxId { origin, seq }
    }

    #[test]
    fn lock_is_exclusive_and_reentrant() {
        let table = LockTable::new();
        let k = Key::from("k");
        assert!(table.try_acquire(&k, tx(1)).is_ok());
        assert!(table.try_acquire(&k, tx(1)).is_ok());
        assert_eq!(table.try_acquire(&k, tx(2)), Err(tx(1)));

        assert!(!table.release(&k, tx(2)));
        assert!(table.release(&k, tx(1)));
        assert!(table.try_acquire(&k, tx(2)).is_ok());
    }

    #[test]
    fn acquire_all_is_all_or_nothing() {
        let table = LockTable::new();
        let (a, b, c) = (Key::from("a"), Key::from("b"), Key::from("c"));
        table.try_acquire(&c, tx(9)).unwrap();

        let err = table.acquire_all([&a, &b, &c], tx(1)).unwrap_err();
        assert_eq!(err, (c.clone(), tx(9)));
        assert!(!table.is_locked(&a));
        assert!(!table.is_locked(&b));

        table.acquire_all([&a, &b], tx(1)).unwrap();
        assert_eq!(table.holder(&a), Some(tx(1)));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn failed_acquire_keeps_previously_held_locks() {
        let table = LockTable::new();
        let (a, b) = (Key::from("a"), Key::from("b"));
        table.try_acquire(&a, tx(1)).unwrap();
        table.try_acquire(&b, tx(2)).unwrap();

        assert!(table.acquire_all([&a, &b], tx(1)).is_err());
        assert_eq!(table.holder(&a), Some(tx(1)));
    }

    #[test]
    fn expired_lists_old_holders() {
        let table = LockTable::new();
        table.try_acquire(&Key::from("a"), tx(1)).unwrap();
        table.try_acquire(&Key::from("b"), tx(1)).unwrap();
        assert_eq!(table.expired(Duration::ZERO), vec![tx(1)]);
        assert!(table.expired(Duration::from_secs(60)).is_empty());
    }

    #[tokio::test]
    async fn wait_released_wakes_on_release() {
        let table = Arc::new(LockTable::new());
        let k = Key::from("k");
        table.try_acquire(&k, tx(1)).unwrap();

        let waiter = {
            let table = table.clone();
            let k = k.clone();
            tokio::spawn(async move { table.wait_released(&[k], Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        table.release(&k, tx(1));
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn wait_released_times_out() {
        let table = LockTable::new();
        let k = Key::from("k");
        table.try_acquire(&k, tx(1)).unwrap();
        assert!(!table.wait_released(&[k], Duration::from_millis(30)).await);
    }
}
