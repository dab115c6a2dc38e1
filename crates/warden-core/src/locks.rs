//! Per-key async serialization.
//!
//! Used for audit chains, idempotency keys and approval request ids: callers on
//! the same key queue behind each other, different keys never contend. Entries
//! are dropped from the map once the last holder or waiter is gone.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type SlotMap = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

#[derive(Debug, Default)]
pub struct KeyedLocks {
    slots: SlotMap,
}

/// One counted reference to a key's slot. Whoever drops the last one besides
/// the map removes the entry, whether it held the lock or was still waiting.
struct SlotRef {
    key: String,
    slot: Option<Arc<AsyncMutex<()>>>,
    slots: SlotMap,
}

impl Drop for SlotRef {
    fn drop(&mut self) {
        let mut slots = self.slots.lock();
        if let Some(slot) = self.slot.take() {
            // Only the map and `slot` remain: nobody holds or waits.
            if Arc::strong_count(&slot) == 2 {
                slots.remove(&self.key);
            }
        }
    }
}

pub struct KeyedGuard {
    // Declared first so the lock is released before the slot is reclaimed.
    _guard: OwnedMutexGuard<()>,
    _slot: SlotRef,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> KeyedGuard {
        let slot = {
            let mut slots = self.slots.lock();
            slots
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        // Bound before the wait starts: if this future is dropped mid-wait the
        // pending acquire goes first, then `waiting` reclaims the entry.
        let waiting = SlotRef {
            key: key.to_string(),
            slot: Some(slot.clone()),
            slots: self.slots.clone(),
        };
        let guard = slot.lock_owned().await;
        KeyedGuard {
            _guard: guard,
            _slot: waiting,
        }
    }

    pub fn active_keys(&self) -> usize {
        self.slots.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_serialized() {
        let locks = Arc::new(KeyedLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            tasks.push(tokio::spawn(async move {
                let _g = locks.lock("chain-a").await;
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(locks.active_keys(), 0);
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.lock("a").await;
        let b = tokio::time::timeout(Duration::from_millis(200), locks.lock("b")).await;
        assert!(b.is_ok());
        assert_eq!(locks.active_keys(), 2);
    }

    #[tokio::test]
    async fn cancelled_waiter_after_release_leaves_no_entry() {
        let locks = KeyedLocks::new();
        let held = locks.lock("k").await;
        let mut waiter = Box::pin(locks.lock("k"));
        assert!(tokio::time::timeout(Duration::from_millis(10), &mut waiter).await.is_err());
        drop(held);
        assert_eq!(locks.active_keys(), 1);
        drop(waiter);
        assert_eq!(locks.active_keys(), 0);
    }

    #[tokio::test]
    async fn cancelled_waiter_before_release_leaves_no_entry() {
        let locks = KeyedLocks::new();
        let held = locks.lock("k").await;
        let mut waiter = Box::pin(locks.lock("k"));
        assert!(tokio::time::timeout(Duration::from_millis(10), &mut waiter).await.is_err());
        drop(waiter);
        assert_eq!(locks.active_keys(), 1);
        drop(held);
        assert_eq!(locks.active_keys(), 0);

        let again = tokio::time::timeout(Duration::from_millis(200), locks.lock("k")).await;
        assert!(again.is_ok());
    }
}
