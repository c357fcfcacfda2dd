//! Applies classified detections to the identity store.
//!
//! Every detection touches at most one record. Unknown sightings and
//! unknown-identity eviction are single atomic store operations, so several
//! service instances may share one store. Known-identity updates are also
//! serialized in-process through [`IdentityLocks`]. A failure on one detection
//! is recorded in the [`ReconcileSummary`] and the rest of the frame is still
//! processed.

use crate::classifier::{classify, Classification};
use crate::locks::IdentityLocks;
use crate::store::{IdentityStore, UnknownSighting};
use chrono::{DateTime, Utc};
use common::frames::{Detection, DetectionFrame};
use common::identities::{DEFAULT_CONFIDENCE_HISTORY_LIMIT, DEFAULT_UNKNOWN_IDENTITY_LIMIT};
use serde::Serialize;
use std::sync::Arc;
use telemetry::metrics::{RECONCILED_DETECTIONS, UNKNOWN_EVICTIONS, UNREGISTERED_DETECTIONS};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
  #[error("persistence error: {0}")]
  Persistence(String),
}

impl ReconcileError {
  fn persistence(err: anyhow::Error) -> Self {
    ReconcileError::Persistence(format!("{err:#}"))
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
  KnownUpdated {
    username: String,
    history_len: usize,
  },
  /// A known-looking name with no provisioned identity. Nothing is written.
  Unregistered { username: String },
  UnknownCreated { name: String, evicted: usize },
  UnknownUpdated {
    name: String,
    detection_count: u64,
    crop_replaced: bool,
    evicted: usize,
  },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcileFailure {
  pub name: String,
  pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileSummary {
  pub succeeded: usize,
  pub failed: usize,
  pub skipped: usize,
  pub outcomes: Vec<ReconcileOutcome>,
  pub failures: Vec<ReconcileFailure>,
}

impl ReconcileSummary {
  fn record(&mut self, name: &str, result: Result<ReconcileOutcome, ReconcileError>) {
    match result {
      Ok(outcome) => {
        self.succeeded += 1;
        self.outcomes.push(outcome);
      }
      Err(err) => {
        self.failed += 1;
        self.failures.push(ReconcileFailure {
          name: name.to_string(),
          error: err.to_string(),
        });
      }
    }
  }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerLimits {
  /// N: confidence history entries kept per known identity
  pub history_limit: usize,
  /// M: unknown identity records kept in total
  pub unknown_limit: usize,
}

impl Default for ReconcilerLimits {
  fn default() -> Self {
    Self {
      history_limit: DEFAULT_CONFIDENCE_HISTORY_LIMIT,
      unknown_limit: DEFAULT_UNKNOWN_IDENTITY_LIMIT,
    }
  }
}

pub struct IdentityReconciler {
  store: Arc<dyn IdentityStore>,
  locks: IdentityLocks,
  limits: ReconcilerLimits,
}

impl IdentityReconciler {
  pub fn new(store: Arc<dyn IdentityStore>, limits: ReconcilerLimits) -> Self {
    Self {
      store,
      locks: IdentityLocks::new(),
      limits: ReconcilerLimits {
        history_limit: limits.history_limit.max(1),
        unknown_limit: limits.unknown_limit.max(1),
      },
    }
  }

  pub async fn reconcile_known(
    &self,
    name: &str,
    similarity: f64,
    timestamp: DateTime<Utc>,
  ) -> Result<ReconcileOutcome, ReconcileError> {
    let _guard = self.locks.acquire(&format!("known:{name}")).await;

    let updated = self
      .store
      .upsert_known_confidence(name, similarity, timestamp, self.limits.history_limit)
      .await
      .map_err(ReconcileError::persistence)?;

    match updated {
      Some(identity) => {
        debug!(
          username = %name,
          confidence = similarity,
          history = identity.confidence_history.len(),
          "known identity updated"
        );
        Ok(ReconcileOutcome::KnownUpdated {
          username: identity.username,
          history_len: identity.confidence_history.len(),
        })
      }
      None => {
        UNREGISTERED_DETECTIONS.inc();
        info!(username = %name, confidence = similarity, "detected but unregistered");
        Ok(ReconcileOutcome::Unregistered {
          username: name.to_string(),
        })
      }
    }
  }

  pub async fn reconcile_unknown(
    &self,
    detection: &Detection,
    timestamp: DateTime<Utc>,
  ) -> Result<ReconcileOutcome, ReconcileError> {
    let sighting = self
      .store
      .record_unknown_sighting(detection, timestamp)
      .await
      .map_err(ReconcileError::persistence)?;
    debug!(
      name = %sighting.record.name,
      count = sighting.record.detection_count,
      crop_replaced = sighting.crop_replaced,
      "unknown identity recorded"
    );

    let evicted = self.evict_unknown_overflow().await?;

    let UnknownSighting {
      record,
      created,
      crop_replaced,
    } = sighting;
    if created {
      Ok(ReconcileOutcome::UnknownCreated {
        name: record.name,
        evicted,
      })
    } else {
      Ok(ReconcileOutcome::UnknownUpdated {
        name: record.name,
        detection_count: record.detection_count,
        crop_replaced,
        evicted,
      })
    }
  }

  async fn evict_unknown_overflow(&self) -> Result<usize, ReconcileError> {
    let deleted = self
      .store
      .evict_unknown_overflow(self.limits.unknown_limit)
      .await
      .map_err(ReconcileError::persistence)?;
    if deleted > 0 {
      UNKNOWN_EVICTIONS.inc_by(deleted as u64);
      info!(
        evicted = deleted,
        limit = self.limits.unknown_limit,
        "evicted oldest unknown identities"
      );
    }
    Ok(deleted)
  }

  /// Classify and reconcile a whole frame.
  pub async fn reconcile_frame(&self, frame: &DetectionFrame) -> ReconcileSummary {
    let classification = classify(frame);
    self
      .reconcile_classified(&classification, frame.timestamp, &CancellationToken::new())
      .await
  }

  /// Reconcile already classified detections. Detections not yet started
  /// when `cancel` fires are left untouched.
  pub async fn reconcile_classified(
    &self,
    classification: &Classification,
    timestamp: DateTime<Utc>,
    cancel: &CancellationToken,
  ) -> ReconcileSummary {
    let mut summary = ReconcileSummary {
      skipped: classification.skipped,
      ..Default::default()
    };

    for detection in &classification.known {
      if cancel.is_cancelled() {
        return summary;
      }
      let result = self
        .reconcile_known(&detection.name, detection.similarity, timestamp)
        .await;
      observe("known", &detection.name, &result);
      summary.record(&detection.name, result);
    }

    for detection in &classification.unknown {
      if cancel.is_cancelled() {
        return summary;
      }
      let result = self.reconcile_unknown(detection, timestamp).await;
      observe("unknown", &detection.name, &result);
      summary.record(&detection.name, result);
    }

    summary
  }
}

fn observe(kind: &str, name: &str, result: &Result<ReconcileOutcome, ReconcileError>) {
  match result {
    Ok(_) => RECONCILED_DETECTIONS
      .with_label_values(&[kind, "success"])
      .inc(),
    Err(err) => {
      RECONCILED_DETECTIONS
        .with_label_values(&[kind, "failed"])
        .inc();
      warn!(kind, name = %name, error = %err, "failed to reconcile detection");
    }
  }
}
