//! Persistent identity records maintained by detection reconciliation.

use crate::frames::BoundingBox;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum confidence history entries kept per known identity (N).
pub const DEFAULT_CONFIDENCE_HISTORY_LIMIT: usize = 100;

/// Maximum number of unknown identity records kept system-wide (M).
pub const DEFAULT_UNKNOWN_IDENTITY_LIMIT: usize = 100;

/// Name given to an unknown identity when the detection carried an empty key.
pub const DEFAULT_UNKNOWN_NAME: &str = "Unknown Person";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceEntry {
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

/// A registered person. Created by provisioning, mutated by reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownIdentity {
    pub id: String,
    pub username: String,
    pub last_confidence: f64,
    pub last_detected_at: Option<DateTime<Utc>>,
    /// Oldest first, ordered by timestamp
    pub confidence_history: Vec<ConfidenceEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

impl KnownIdentity {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            username: username.into(),
            last_confidence: 0.0,
            last_detected_at: None,
            confidence_history: Vec::new(),
            embedding: None,
            created_at: Utc::now(),
        }
    }

    /// Append a detection to the history, keeping it sorted by timestamp and
    /// trimmed to `limit` entries (oldest evicted first). The `last_*` fields only
    /// move forward in time. Returns the resulting history length.
    pub fn record_confidence(
        &mut self,
        confidence: f64,
        timestamp: DateTime<Utc>,
        limit: usize,
    ) -> usize {
        let pos = self
            .confidence_history
            .partition_point(|e| e.timestamp <= timestamp);
        self.confidence_history.insert(
            pos,
            ConfidenceEntry {
                confidence,
                timestamp,
            },
        );

        let len = self.confidence_history.len();
        if len > limit {
            self.confidence_history.drain(..len - limit);
        }

        if self.last_detected_at.map_or(true, |last| timestamp >= last) {
            self.last_confidence = confidence;
            self.last_detected_at = Some(timestamp);
        }

        self.confidence_history.len()
    }
}

/// A provisional record for a face the inference service could not match.
/// `name` is the key the edge device assigned (e.g. `Unknown_3`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnknownIdentity {
    pub unknown_id: String,
    pub name: String,
    /// Base64 crop with the best similarity seen so far
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub face_image: Option<String>,
    pub last_confidence: f64,
    pub last_detected_at: DateTime<Utc>,
    pub detection_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBox>,
}

impl UnknownIdentity {
    pub fn first_seen(
        name: &str,
        similarity: f64,
        bbox: Option<BoundingBox>,
        face_image: Option<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let name = if name.trim().is_empty() {
            DEFAULT_UNKNOWN_NAME.to_string()
        } else {
            name.to_string()
        };
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            unknown_id: format!("unknown_{}", &suffix[..12]),
            name,
            face_image,
            last_confidence: similarity,
            last_detected_at: timestamp,
            detection_count: 1,
            bbox,
        }
    }

    /// Apply a repeat sighting. The stored crop is replaced only when a new crop
    /// is supplied and either none is stored yet or the new similarity is strictly
    /// higher than the stored one. Returns whether the crop was replaced.
    pub fn record_sighting(
        &mut self,
        similarity: f64,
        bbox: Option<BoundingBox>,
        face_image: Option<String>,
        timestamp: DateTime<Utc>,
    ) -> bool {
        let replace = match (&face_image, &self.face_image) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(_), Some(_)) => similarity > self.last_confidence,
        };
        if replace {
            self.face_image = face_image;
        }

        self.last_confidence = similarity;
        self.last_detected_at = self.last_detected_at.max(timestamp);
        self.detection_count = self.detection_count.saturating_add(1);
        if bbox.is_some() {
            self.bbox = bbox;
        }
        replace
    }
}
