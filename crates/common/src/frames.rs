//! Detection frame contracts for the edge inference `/metadata` payload.
//!
//! A frame is the result of one polling cycle. Individual `bboxes` entries are
//! parsed leniently: an entry that cannot be understood is kept as an empty
//! [`RawDetection`] so that classification can skip it without losing the
//! rest of the frame.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Name prefix the inference service assigns to faces it could not match.
pub const UNKNOWN_PREFIX: &str = "Unknown";

/// Axis-aligned face box in pixel coordinates (`x`, `y`, `width`, `height`).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Build a box from the `[x1, y1, x2, y2]` corner form used by older edge builds.
    pub fn from_corners(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self {
            x: x1.min(x2),
            y: y1.min(y2),
            width: (x2 - x1).abs(),
            height: (y2 - y1).abs(),
        }
    }

    pub fn to_array(&self) -> [f64; 4] {
        [self.x, self.y, self.width, self.height]
    }

    fn from_xywh_value(value: &Value) -> Option<Self> {
        let items = value.as_array()?;
        if items.len() != 4 {
            return None;
        }
        let mut out = [0.0f64; 4];
        for (slot, item) in out.iter_mut().zip(items) {
            *slot = item.as_f64()?;
        }
        Some(Self::new(out[0], out[1], out[2], out[3]))
    }
}

/// One `bboxes` entry exactly as received. Every field is optional because the
/// edge device does not guarantee the shape; validation happens later.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBox>,

    /// Base64 face crop, when the edge device sends one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crop: Option<String>,
}

impl RawDetection {
    /// Parse a single `bboxes` entry. Supports the object form
    /// `{name, similarity, bbox: [x, y, w, h], crop?}` and the legacy tuple form
    /// `[x1, y1, x2, y2, name, similarity]`. Anything else yields an empty entry.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Object(map) => Self {
                name: map.get("name").and_then(Value::as_str).map(str::to_string),
                similarity: map.get("similarity").and_then(Value::as_f64),
                bbox: map.get("bbox").and_then(BoundingBox::from_xywh_value),
                crop: map
                    .get("crop")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
            },
            Value::Array(items) if items.len() == 6 => {
                let corners: Option<Vec<f64>> = items[..4].iter().map(Value::as_f64).collect();
                Self {
                    name: items[4].as_str().map(str::to_string),
                    similarity: items[5].as_f64(),
                    bbox: corners.map(|c| BoundingBox::from_corners(c[0], c[1], c[2], c[3])),
                    crop: None,
                }
            }
            _ => Self::default(),
        }
    }
}

/// A detection that passed validation: it has a name and a similarity in [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub name: String,
    pub similarity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBox>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub face_crop: Option<String>,
}

impl Detection {
    /// True when the inference service could not match the face to anyone.
    pub fn is_unknown(&self) -> bool {
        self.name.starts_with(UNKNOWN_PREFIX)
    }
}

/// One polling response from the inference endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionFrame {
    pub timestamp: DateTime<Utc>,
    pub fps: f64,
    pub people_count: u32,
    pub detections: Vec<RawDetection>,
}

impl DetectionFrame {
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            fps: 0.0,
            people_count: 0,
            detections: Vec::new(),
        }
    }

    /// Parse a `/metadata` body. Missing `fps`/`people_count` default to zero and a
    /// missing `bboxes` means no detections; a body that is not an object or a
    /// `bboxes` value that is not an array is rejected.
    pub fn from_metadata(body: &Value, timestamp: DateTime<Utc>) -> Result<Self, FrameParseError> {
        let map = body
            .as_object()
            .ok_or_else(|| FrameParseError::new("metadata body is not a JSON object"))?;

        let fps = map
            .get("fps")
            .and_then(Value::as_f64)
            .filter(|v| v.is_finite())
            .unwrap_or(0.0)
            .max(0.0);

        let people_count = map
            .get("people_count")
            .and_then(|v| v.as_u64().or_else(|| v.as_f64().map(|f| f.max(0.0).round() as u64)))
            .map(|v| v.min(u32::MAX as u64) as u32)
            .unwrap_or(0);

        let detections = match map.get("bboxes") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.iter().map(RawDetection::from_value).collect(),
            Some(other) => {
                return Err(FrameParseError::new(format!(
                    "bboxes must be an array, got {}",
                    json_type_name(other)
                )))
            }
        };

        Ok(Self {
            timestamp,
            fps,
            people_count,
            detections,
        })
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameParseError {
    message: String,
}

impl FrameParseError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for FrameParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed frame: {}", self.message)
    }
}

impl std::error::Error for FrameParseError {}
