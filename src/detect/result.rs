//! Detection payloads exchanged with the detection service.
//!
//! Inbound results look like:
//! `{ "detections": [...], "processed_frame": "data:image/jpeg;base64,...", "face_count": 1 }`
//!
//! The client performs no filtering or tracking: each event is an independent,
//! ordered sequence of detections for some recently transmitted frame.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Deserializer, Serialize};

/// Axis-aligned box in source-frame pixel space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// One face reported by the service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    /// Age label. The service may send a bare number (`25`) or a bucket (`"20-29"`).
    #[serde(deserialize_with = "label_from_wire")]
    pub age: String,
    #[serde(deserialize_with = "label_from_wire")]
    pub gender: String,
    /// Detection confidence (0.0-1.0)
    #[serde(default)]
    pub confidence: f64,
    /// Service-side timestamp, carried through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl Detection {
    /// Caption in the form `"Female, 31 (87%)"`.
    pub fn label(&self) -> String {
        let pct = (self.confidence.clamp(0.0, 1.0) * 100.0).round() as u32;
        format!("{}, {} ({}%)", self.gender, self.age, pct)
    }
}

/// One processed-frame result from the service.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    #[serde(default)]
    pub detections: Vec<Detection>,
    /// Annotated copy of the frame as a data URL.
    #[serde(
        default,
        rename = "processed_frame",
        skip_serializing_if = "Option::is_none"
    )]
    pub annotated_frame: Option<String>,
    #[serde(default)]
    pub face_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Outbound frame message: `{ "frame": "data:image/jpeg;base64,..." }`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameMessage {
    pub frame: String,
}

impl FrameMessage {
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| anyhow!("encode frame message: {}", e))
    }
}

/// Parse a detection result payload.
///
/// A JSON `null` (or an empty body) means the service produced no result for
/// the frame and yields `Ok(None)`.
pub fn parse_detection_event(payload: &[u8]) -> Result<Option<DetectionEvent>> {
    if payload.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(None);
    }
    serde_json::from_slice::<Option<DetectionEvent>>(payload)
        .map_err(|e| anyhow!("parse detection result: {}", e))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireLabel {
    Text(String),
    Number(serde_json::Number),
}

fn label_from_wire<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match WireLabel::deserialize(deserializer)? {
        WireLabel::Text(text) => text,
        WireLabel::Number(number) => number.to_string(),
    })
}
