//! Bounded, purely derived views of a polling session for dashboards.

use crate::classifier::{best_similarity, Classification};
use chrono::{DateTime, Utc};
use common::frames::{BoundingBox, Detection, DetectionFrame};
use serde::Serialize;
use std::collections::VecDeque;
use uuid::Uuid;

pub const DEFAULT_FPS_WINDOW: usize = 12;
pub const DEFAULT_PEOPLE_WINDOW: usize = 12;
pub const DEFAULT_CONFIDENCE_WINDOW: usize = 20;
pub const DEFAULT_DETECTION_HISTORY_LIMIT: usize = 50;

/// Capped FIFO: pushing past capacity evicts the oldest item.
#[derive(Debug, Clone)]
pub struct SlidingWindow<T> {
  items: VecDeque<T>,
  capacity: usize,
}

impl<T> SlidingWindow<T> {
  pub fn new(capacity: usize) -> Self {
    let capacity = capacity.max(1);
    Self {
      items: VecDeque::with_capacity(capacity),
      capacity,
    }
  }

  pub fn push(&mut self, item: T) {
    if self.items.len() == self.capacity {
      self.items.pop_front();
    }
    self.items.push_back(item);
  }
}

impl<T: Clone> SlidingWindow<T> {
  pub fn to_vec(&self) -> Vec<T> {
    self.items.iter().cloned().collect()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SeriesPoint {
  pub timestamp: DateTime<Utc>,
  pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
  pub display_id: Uuid,
  pub name: String,
  pub similarity: f64,
  pub unknown: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub bbox: Option<BoundingBox>,
  pub detected_at: DateTime<Utc>,
}

/// Stats of the most recent frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameSnapshot {
  pub timestamp: DateTime<Utc>,
  pub fps: f64,
  pub people_count: u32,
  pub names: Vec<String>,
  pub best_similarity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatorConfig {
  pub fps_window: usize,
  pub people_window: usize,
  pub confidence_window: usize,
  pub history_limit: usize,
}

impl Default for AggregatorConfig {
  fn default() -> Self {
    Self {
      fps_window: DEFAULT_FPS_WINDOW,
      people_window: DEFAULT_PEOPLE_WINDOW,
      confidence_window: DEFAULT_CONFIDENCE_WINDOW,
      history_limit: DEFAULT_DETECTION_HISTORY_LIMIT,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresentationView {
  pub fps: Vec<SeriesPoint>,
  pub people: Vec<SeriesPoint>,
  pub confidence: Vec<SeriesPoint>,
  /// Newest first
  pub history: Vec<HistoryEntry>,
  pub snapshot: Option<FrameSnapshot>,
}

#[derive(Debug, Clone)]
pub struct PresentationAggregator {
  fps: SlidingWindow<SeriesPoint>,
  people: SlidingWindow<SeriesPoint>,
  confidence: SlidingWindow<SeriesPoint>,
  history: VecDeque<HistoryEntry>,
  history_limit: usize,
  latest: Option<FrameSnapshot>,
}

impl PresentationAggregator {
  pub fn new(config: AggregatorConfig) -> Self {
    Self {
      fps: SlidingWindow::new(config.fps_window),
      people: SlidingWindow::new(config.people_window),
      confidence: SlidingWindow::new(config.confidence_window),
      history: VecDeque::new(),
      history_limit: config.history_limit.max(1),
      latest: None,
    }
  }

  /// Add one point per series for `frame` and refresh the snapshot.
  /// `classification` must be the one already computed for `frame`.
  pub fn record_frame(&mut self, frame: &DetectionFrame, classification: &Classification) {
    let best = best_similarity(classification);
    let timestamp = frame.timestamp;

    self.fps.push(SeriesPoint {
      timestamp,
      value: (frame.fps * 10.0).round() / 10.0,
    });
    self.people.push(SeriesPoint {
      timestamp,
      value: f64::from(frame.people_count),
    });
    self.confidence.push(SeriesPoint {
      timestamp,
      value: best,
    });

    self.latest = Some(FrameSnapshot {
      timestamp,
      fps: frame.fps,
      people_count: frame.people_count,
      names: classification.detections().map(|d| d.name.clone()).collect(),
      best_similarity: best,
    });
  }

  /// Prepend `detections` to the history, each with a fresh display id. The
  /// first detection ends up first; entries past the limit are dropped.
  pub fn record_detection_history(&mut self, detections: &[Detection], timestamp: DateTime<Utc>) {
    for detection in detections.iter().rev() {
      self.history.push_front(HistoryEntry {
        display_id: Uuid::new_v4(),
        name: detection.name.clone(),
        similarity: detection.similarity,
        unknown: detection.is_unknown(),
        bbox: detection.bbox,
        detected_at: timestamp,
      });
    }
    self.history.truncate(self.history_limit);
  }

  pub fn view(&self) -> PresentationView {
    PresentationView {
      fps: self.fps.to_vec(),
      people: self.people.to_vec(),
      confidence: self.confidence.to_vec(),
      history: self.history.iter().cloned().collect(),
      snapshot: self.latest.clone(),
    }
  }
}

impl Default for PresentationAggregator {
  fn default() -> Self {
    Self::new(AggregatorConfig::default())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::classifier::classify;
  use chrono::Duration;
  use serde_json::json;

  fn record(agg: &mut PresentationAggregator, frame: &DetectionFrame) {
    agg.record_frame(frame, &classify(frame));
  }

  fn frame_at(ts: DateTime<Utc>, fps: f64, people: u32) -> DetectionFrame {
    DetectionFrame::from_metadata(
      &json!({
        "fps": fps,
        "people_count": people,
        "bboxes": [
          {"name": "alice", "similarity": 0.913},
          {"name": "Unknown_3", "similarity": 0.4}
        ]
      }),
      ts,
    )
    .unwrap()
  }

  fn detection(name: &str) -> Detection {
    Detection {
      name: name.to_string(),
      similarity: 0.5,
      bbox: None,
      face_crop: None,
    }
  }

  #[test]
  fn window_evicts_oldest() {
    let mut window = SlidingWindow::new(3);
    for i in 0..5 {
      window.push(i);
    }
    assert_eq!(window.to_vec(), vec![2, 3, 4]);
  }

  #[test]
  fn series_are_bounded_per_view() {
    let mut agg = PresentationAggregator::default();
    let base = Utc::now();
    for i in 0..30 {
      record(&mut agg, &frame_at(base + Duration::seconds(i), 24.0, 2));
    }
    let view = agg.view();
    assert_eq!(view.fps.len(), 12);
    assert_eq!(view.people.len(), 12);
    assert_eq!(view.confidence.len(), 20);
    assert_eq!(view.fps[0].timestamp, base + Duration::seconds(18));
  }

  #[test]
  fn snapshot_tracks_latest_frame() {
    let mut agg = PresentationAggregator::default();
    let ts = Utc::now();
    record(&mut agg, &frame_at(ts, 23.46, 2));
    let snapshot = agg.view().snapshot.unwrap();
    assert_eq!(snapshot.people_count, 2);
    assert_eq!(snapshot.best_similarity, 0.91);
    assert_eq!(snapshot.names, vec!["alice", "Unknown_3"]);
    assert_eq!(agg.view().fps[0].value, 23.5);
  }

  #[test]
  fn history_is_newest_first_and_capped() {
    let mut agg = PresentationAggregator::default();
    let base = Utc::now();
    for i in 0..60 {
      agg.record_detection_history(&[detection(&format!("p{i}"))], base + Duration::seconds(i));
    }
    let history = agg.view().history;
    assert_eq!(history.len(), 50);
    assert_eq!(history[0].name, "p59");
    assert_eq!(history[49].name, "p10");
  }

  #[test]
  fn history_entries_get_distinct_ids() {
    let mut agg = PresentationAggregator::default();
    let ts = Utc::now();
    agg.record_detection_history(&[detection("a"), detection("b")], ts);
    agg.record_detection_history(&[detection("a")], ts);
    let history = agg.view().history;
    assert_eq!(
      history.iter().map(|h| h.name.as_str()).collect::<Vec<_>>(),
      vec!["a", "a", "b"]
    );
    assert_ne!(history[0].display_id, history[1].display_id);
    assert!(!history[2].unknown);
  }

  #[test]
  fn snapshot_uses_supplied_classification() {
    let mut agg = PresentationAggregator::default();
    let frame = frame_at(Utc::now(), 20.0, 2);
    let classification = Classification {
      known: vec![detection("bob")],
      ..Default::default()
    };
    agg.record_frame(&frame, &classification);
    let snapshot = agg.view().snapshot.unwrap();
    assert_eq!(snapshot.names, vec!["bob"]);
    assert_eq!(snapshot.best_similarity, 0.5);
  }
}
