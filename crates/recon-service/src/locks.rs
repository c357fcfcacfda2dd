//! Per-identity write serialization.
//!
//! Reconciliation performs read-modify-write cycles on individual identity
//! records. Two passes for the same key must not interleave, while passes for
//! different keys run freely. Entries are created on first use and dropped
//! again once nobody holds or waits for them, so the arena only ever contains
//! keys that are currently being written.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Slots = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

#[derive(Default, Clone)]
pub struct IdentityLocks {
  slots: Slots,
}

impl IdentityLocks {
  pub fn new() -> Self {
    Self::default()
  }

  /// Wait until no one else holds `key`, then hold it until the guard drops.
  pub async fn acquire(&self, key: &str) -> IdentityGuard {
    let slot = {
      let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
      slots
        .entry(key.to_string())
        .or_insert_with(|| Arc::new(AsyncMutex::new(())))
        .clone()
    };
    let guard = slot.clone().lock_owned().await;
    IdentityGuard {
      key: key.to_string(),
      slot,
      guard: Some(guard),
      slots: self.slots.clone(),
    }
  }

  /// Number of keys currently held or awaited
  pub fn active(&self) -> usize {
    self
      .slots
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .len()
  }
}

pub struct IdentityGuard {
  key: String,
  slot: Arc<AsyncMutex<()>>,
  guard: Option<OwnedMutexGuard<()>>,
  slots: Slots,
}

impl IdentityGuard {
  pub fn key(&self) -> &str {
    &self.key
  }
}

impl Drop for IdentityGuard {
  fn drop(&mut self) {
    self.guard.take();
    let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
    // One reference in the map and one here: nobody else is waiting.
    if Arc::strong_count(&self.slot) == 2 {
      slots.remove(&self.key);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  #[tokio::test]
  async fn same_key_is_serialized() {
    let locks = IdentityLocks::new();
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
      let locks = locks.clone();
      let inside = inside.clone();
      let max_inside = max_inside.clone();
      handles.push(tokio::spawn(async move {
        let _guard = locks.acquire("known:alice").await;
        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
        max_inside.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2)).await;
        inside.fetch_sub(1, Ordering::SeqCst);
      }));
    }
    for handle in handles {
      handle.await.unwrap();
    }

    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    assert_eq!(locks.active(), 0);
  }

  #[tokio::test]
  async fn different_keys_do_not_block() {
    let locks = IdentityLocks::new();
    let _alice = locks.acquire("known:alice").await;
    let bob = tokio::time::timeout(Duration::from_millis(100), locks.acquire("known:bob")).await;
    assert!(bob.is_ok());
    assert_eq!(locks.active(), 2);
  }

  #[tokio::test]
  async fn idle_entries_are_pruned() {
    let locks = IdentityLocks::new();
    {
      let guard = locks.acquire("unknown:Unknown_1").await;
      assert_eq!(guard.key(), "unknown:Unknown_1");
      assert_eq!(locks.active(), 1);
    }
    assert_eq!(locks.active(), 0);
  }
}
