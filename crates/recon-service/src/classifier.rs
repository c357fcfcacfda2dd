//! Splits a frame's detections into known and unknown faces.

use common::frames::{Detection, DetectionFrame, RawDetection};
use serde::Serialize;
use telemetry::metrics::SKIPPED_DETECTIONS;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Classification {
  pub known: Vec<Detection>,
  pub unknown: Vec<Detection>,
  /// Entries dropped for missing or unusable `name`/`similarity`
  pub skipped: usize,
}

impl Classification {
  pub fn is_empty(&self) -> bool {
    self.known.is_empty() && self.unknown.is_empty()
  }

  pub fn len(&self) -> usize {
    self.known.len() + self.unknown.len()
  }

  /// Known detections first, then unknown ones
  pub fn detections(&self) -> impl Iterator<Item = &Detection> {
    self.known.iter().chain(self.unknown.iter())
  }
}

/// Turn a raw entry into a [`Detection`], or `None` when it lacks a non-empty
/// name or a finite similarity. Similarity is clamped into [0, 1].
pub fn validate(raw: &RawDetection) -> Option<Detection> {
  let name = raw.name.as_deref()?;
  if name.trim().is_empty() {
    return None;
  }
  let similarity = raw.similarity.filter(|s| s.is_finite())?;
  Some(Detection {
    name: name.to_string(),
    similarity: similarity.clamp(0.0, 1.0),
    bbox: raw.bbox,
    face_crop: raw.crop.clone(),
  })
}

pub fn classify(frame: &DetectionFrame) -> Classification {
  let mut out = Classification::default();
  for raw in &frame.detections {
    let Some(detection) = validate(raw) else {
      out.skipped += 1;
      continue;
    };
    if detection.is_unknown() {
      out.unknown.push(detection);
    } else {
      out.known.push(detection);
    }
  }
  if out.skipped > 0 {
    SKIPPED_DETECTIONS.inc_by(out.skipped as u64);
    debug!(skipped = out.skipped, "dropped malformed detections");
  }
  out
}

/// Highest similarity in the frame rounded to two decimals, 0 when empty.
pub fn best_similarity(classification: &Classification) -> f64 {
  let best = classification
    .detections()
    .map(|d| d.similarity)
    .fold(0.0_f64, f64::max);
  (best * 100.0).round() / 100.0
}
