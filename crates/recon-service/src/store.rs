use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::frames::Detection;
use common::identities::{KnownIdentity, UnknownIdentity};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// What a single unknown-face sighting did to its record.
#[derive(Debug, Clone, PartialEq)]
pub struct UnknownSighting {
  pub record: UnknownIdentity,
  pub created: bool,
  pub crop_replaced: bool,
}

/// Persistence contract for identity records. Each method touches at most one
/// record except the unknown-collection maintenance calls. The store may be
/// shared by several service instances, so every read-modify-write is atomic
/// here rather than in the caller.
#[async_trait]
pub trait IdentityStore: Send + Sync {
  async fn find_by_username(&self, username: &str) -> Result<Option<KnownIdentity>>;

  /// Atomically append a confidence entry to a known identity, trimming the
  /// history to `history_limit`. Returns `None` when no such identity exists.
  async fn upsert_known_confidence(
    &self,
    username: &str,
    confidence: f64,
    timestamp: DateTime<Utc>,
    history_limit: usize,
  ) -> Result<Option<KnownIdentity>>;

  async fn find_unknown_by_name(&self, name: &str) -> Result<Option<UnknownIdentity>>;
  async fn upsert_unknown(&self, record: &UnknownIdentity) -> Result<()>;

  /// Create the record for `detection.name` or apply a repeat sighting to it,
  /// as one atomic step.
  async fn record_unknown_sighting(
    &self,
    detection: &Detection,
    timestamp: DateTime<Utc>,
  ) -> Result<UnknownSighting>;

  /// Delete the `excess` records with the oldest `last_detected_at`. Returns
  /// the number actually deleted.
  async fn delete_oldest_unknown(&self, excess: usize) -> Result<usize>;

  /// Trim the collection down to `limit` records, oldest first, as one atomic
  /// step. Concurrent callers never delete more than the overflow.
  async fn evict_unknown_overflow(&self, limit: usize) -> Result<usize>;
  async fn count_unknown(&self) -> Result<usize>;

  /// Returns false when the username is already taken.
  async fn create_known(&self, identity: &KnownIdentity) -> Result<bool>;
  async fn list_known(&self) -> Result<Vec<KnownIdentity>>;
  async fn set_known_embedding(
    &self,
    username: &str,
    embedding: Vec<f32>,
  ) -> Result<Option<KnownIdentity>>;

  /// Most recently detected first
  async fn list_unknown(&self) -> Result<Vec<UnknownIdentity>>;

  async fn health_check(&self) -> Result<bool> {
    Ok(true)
  }
}

#[derive(Default)]
pub struct MemoryIdentityStore {
  inner: RwLock<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
  known: HashMap<String, KnownIdentity>,
  unknown: HashMap<String, UnknownIdentity>,
}

impl MemoryIdentityStore {
  pub fn new() -> Self {
    Self::default()
  }
}

fn oldest_first(a: &UnknownIdentity, b: &UnknownIdentity) -> std::cmp::Ordering {
  a.last_detected_at
    .cmp(&b.last_detected_at)
    .then_with(|| a.name.cmp(&b.name))
}

impl StoreInner {
  fn delete_oldest_unknown(&mut self, excess: usize) -> usize {
    if excess == 0 {
      return 0;
    }
    let mut records: Vec<&UnknownIdentity> = self.unknown.values().collect();
    records.sort_by(|a, b| oldest_first(a, b));
    let doomed: Vec<String> = records
      .into_iter()
      .take(excess)
      .map(|r| r.name.clone())
      .collect();
    for name in &doomed {
      self.unknown.remove(name);
    }
    doomed.len()
  }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
  async fn find_by_username(&self, username: &str) -> Result<Option<KnownIdentity>> {
    let inner = self.inner.read().await;
    Ok(inner.known.get(username).cloned())
  }

  async fn upsert_known_confidence(
    &self,
    username: &str,
    confidence: f64,
    timestamp: DateTime<Utc>,
    history_limit: usize,
  ) -> Result<Option<KnownIdentity>> {
    let mut inner = self.inner.write().await;
    let Some(identity) = inner.known.get_mut(username) else {
      return Ok(None);
    };
    identity.record_confidence(confidence, timestamp, history_limit);
    Ok(Some(identity.clone()))
  }

  async fn find_unknown_by_name(&self, name: &str) -> Result<Option<UnknownIdentity>> {
    let inner = self.inner.read().await;
    Ok(inner.unknown.get(name).cloned())
  }

  async fn upsert_unknown(&self, record: &UnknownIdentity) -> Result<()> {
    let mut inner = self.inner.write().await;
    inner.unknown.insert(record.name.clone(), record.clone());
    Ok(())
  }

  async fn record_unknown_sighting(
    &self,
    detection: &Detection,
    timestamp: DateTime<Utc>,
  ) -> Result<UnknownSighting> {
    let mut inner = self.inner.write().await;
    if let Some(record) = inner.unknown.get_mut(&detection.name) {
      let crop_replaced = record.record_sighting(
        detection.similarity,
        detection.bbox,
        detection.face_crop.clone(),
        timestamp,
      );
      return Ok(UnknownSighting {
        record: record.clone(),
        created: false,
        crop_replaced,
      });
    }

    let record = UnknownIdentity::first_seen(
      &detection.name,
      detection.similarity,
      detection.bbox,
      detection.face_crop.clone(),
      timestamp,
    );
    inner.unknown.insert(record.name.clone(), record.clone());
    Ok(UnknownSighting {
      crop_replaced: record.face_image.is_some(),
      record,
      created: true,
    })
  }

  async fn delete_oldest_unknown(&self, excess: usize) -> Result<usize> {
    let mut inner = self.inner.write().await;
    Ok(inner.delete_oldest_unknown(excess))
  }

  async fn evict_unknown_overflow(&self, limit: usize) -> Result<usize> {
    let mut inner = self.inner.write().await;
    let excess = inner.unknown.len().saturating_sub(limit);
    Ok(inner.delete_oldest_unknown(excess))
  }

  async fn count_unknown(&self) -> Result<usize> {
    Ok(self.inner.read().await.unknown.len())
  }

  async fn create_known(&self, identity: &KnownIdentity) -> Result<bool> {
    let mut inner = self.inner.write().await;
    if inner.known.contains_key(&identity.username) {
      return Ok(false);
    }
    inner
      .known
      .insert(identity.username.clone(), identity.clone());
    Ok(true)
  }

  async fn list_known(&self) -> Result<Vec<KnownIdentity>> {
    let inner = self.inner.read().await;
    let mut out: Vec<KnownIdentity> = inner.known.values().cloned().collect();
    out.sort_by(|a, b| a.username.cmp(&b.username));
    Ok(out)
  }

  async fn set_known_embedding(
    &self,
    username: &str,
    embedding: Vec<f32>,
  ) -> Result<Option<KnownIdentity>> {
    let mut inner = self.inner.write().await;
    let Some(identity) = inner.known.get_mut(username) else {
      return Ok(None);
    };
    identity.embedding = Some(embedding);
    Ok(Some(identity.clone()))
  }

  async fn list_unknown(&self) -> Result<Vec<UnknownIdentity>> {
    let inner = self.inner.read().await;
    let mut out: Vec<UnknownIdentity> = inner.unknown.values().cloned().collect();
    out.sort_by(|a, b| oldest_first(b, a));
    Ok(out)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;

  fn unknown(name: &str, seconds_ago: i64) -> UnknownIdentity {
    let ts = Utc::now() - Duration::seconds(seconds_ago);
    UnknownIdentity::first_seen(name, 0.4, None, None, ts)
  }

  #[tokio::test]
  async fn confidence_for_missing_identity_is_none() {
    let store = MemoryIdentityStore::new();
    let res = store
      .upsert_known_confidence("ghost", 0.9, Utc::now(), 100)
      .await
      .unwrap();
    assert!(res.is_none());
    assert!(store.list_known().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn create_known_rejects_duplicates() {
    let store = MemoryIdentityStore::new();
    assert!(store.create_known(&KnownIdentity::new("alice")).await.unwrap());
    assert!(!store.create_known(&KnownIdentity::new("alice")).await.unwrap());
    assert_eq!(store.list_known().await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn confidence_history_is_trimmed() {
    let store = MemoryIdentityStore::new();
    store.create_known(&KnownIdentity::new("bob")).await.unwrap();
    let base = Utc::now();
    for i in 0..5 {
      store
        .upsert_known_confidence("bob", 0.5, base + Duration::seconds(i), 3)
        .await
        .unwrap();
    }
    let bob = store.find_by_username("bob").await.unwrap().unwrap();
    assert_eq!(bob.confidence_history.len(), 3);
    assert_eq!(bob.confidence_history[0].timestamp, base + Duration::seconds(2));
  }

  #[tokio::test]
  async fn delete_oldest_unknown_removes_by_last_detected() {
    let store = MemoryIdentityStore::new();
    store.upsert_unknown(&unknown("Unknown_1", 30)).await.unwrap();
    store.upsert_unknown(&unknown("Unknown_2", 10)).await.unwrap();
    store.upsert_unknown(&unknown("Unknown_3", 20)).await.unwrap();

    let deleted = store.delete_oldest_unknown(2).await.unwrap();
    assert_eq!(deleted, 2);
    let left = store.list_unknown().await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].name, "Unknown_2");
  }

  #[tokio::test]
  async fn sighting_creates_then_updates_record() {
    let store = MemoryIdentityStore::new();
    let ts = Utc::now();
    let mut detection = Detection {
      name: "Unknown_7".into(),
      similarity: 0.42,
      bbox: None,
      face_crop: None,
    };

    let first = store.record_unknown_sighting(&detection, ts).await.unwrap();
    assert!(first.created);
    assert!(!first.crop_replaced);
    assert_eq!(first.record.detection_count, 1);

    detection.similarity = 0.55;
    detection.face_crop = Some("crop".into());
    let second = store
      .record_unknown_sighting(&detection, ts + Duration::seconds(1))
      .await
      .unwrap();
    assert!(!second.created);
    assert!(second.crop_replaced);
    assert_eq!(second.record.detection_count, 2);
    assert_eq!(second.record.unknown_id, first.record.unknown_id);
  }

  #[tokio::test]
  async fn evict_overflow_keeps_newest() {
    let store = MemoryIdentityStore::new();
    for (i, name) in ["Unknown_a", "Unknown_b", "Unknown_c", "Unknown_d"].iter().enumerate() {
      store.upsert_unknown(&unknown(name, 40 - i as i64 * 10)).await.unwrap();
    }

    assert_eq!(store.evict_unknown_overflow(4).await.unwrap(), 0);
    assert_eq!(store.evict_unknown_overflow(2).await.unwrap(), 2);
    let names: Vec<String> = store
      .list_unknown()
      .await
      .unwrap()
      .into_iter()
      .map(|u| u.name)
      .collect();
    assert_eq!(names, vec!["Unknown_d", "Unknown_c"]);
  }

  #[tokio::test]
  async fn list_unknown_is_newest_first() {
    let store = MemoryIdentityStore::new();
    store.upsert_unknown(&unknown("Unknown_old", 60)).await.unwrap();
    store.upsert_unknown(&unknown("Unknown_new", 1)).await.unwrap();
    let names: Vec<String> = store
      .list_unknown()
      .await
      .unwrap()
      .into_iter()
      .map(|u| u.name)
      .collect();
    assert_eq!(names, vec!["Unknown_new", "Unknown_old"]);
  }

  #[tokio::test]
  async fn embedding_is_stored_on_known_identity() {
    let store = MemoryIdentityStore::new();
    store.create_known(&KnownIdentity::new("carol")).await.unwrap();
    let updated = store
      .set_known_embedding("carol", vec![0.1, 0.2])
      .await
      .unwrap()
      .unwrap();
    assert_eq!(updated.embedding, Some(vec![0.1, 0.2]));
    assert!(store
      .set_known_embedding("nobody", vec![1.0])
      .await
      .unwrap()
      .is_none());
  }
}
