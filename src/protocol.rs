//! Wire envelope for the frame telemetry stream.
//!
//! Every message is a JSON object of the form `{ "type": <tag>, "data": <payload> }`
//! where the tag is one of `frame`, `stats` or `error`:
//!
//! ```text
//! { "type": "frame", "data": { "timestamp": 1700000000000, "width": 1920, "height": 1080,
//!                              "fps": 24.5, "processingMode": 1, "processingTime": 12.3 } }
//! { "type": "stats", "data": { "averageFPS": 20.0, "maxFPS": 30.0, "minFPS": 10.0,
//!                              "averageProcessingTime": 10.0, "totalFrames": 3, "uptime": 4200 } }
//! { "type": "error", "data": "camera unavailable" }
//! ```
//!
//! Decoding only checks the shape of a message. Whether a frame makes sense
//! (non-zero dimensions, non-negative rates) is decided by the consumer via
//! [`FrameRecord::validate`].

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Image-processing mode reported by the producer.
///
/// Carried on the wire as its integer discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ProcessingMode {
    Grayscale = 0,
    CannyEdge = 1,
    Blur = 2,
    Original = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unknown processing mode {0} (expected 0..=3)")]
pub struct UnknownMode(pub u8);

impl ProcessingMode {
    pub fn all() -> [ProcessingMode; 4] {
        [
            ProcessingMode::Grayscale,
            ProcessingMode::CannyEdge,
            ProcessingMode::Blur,
            ProcessingMode::Original,
        ]
    }

    /// Human-readable name used in status lines.
    pub fn name(self) -> &'static str {
        match self {
            ProcessingMode::Grayscale => "Grayscale",
            ProcessingMode::CannyEdge => "Canny Edge",
            ProcessingMode::Blur => "Blur",
            ProcessingMode::Original => "Original",
        }
    }
}

impl TryFrom<u8> for ProcessingMode {
    type Error = UnknownMode;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ProcessingMode::Grayscale),
            1 => Ok(ProcessingMode::CannyEdge),
            2 => Ok(ProcessingMode::Blur),
            3 => Ok(ProcessingMode::Original),
            other => Err(UnknownMode(other)),
        }
    }
}

impl From<ProcessingMode> for u8 {
    fn from(mode: ProcessingMode) -> Self {
        mode as u8
    }
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One observed frame.
///
/// `timestamp` is the producer's capture time in milliseconds since the Unix
/// epoch; `processing_time` is in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameRecord {
    pub timestamp: f64,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub processing_mode: ProcessingMode,
    pub processing_time: f64,
}

/// Semantic problems with a structurally valid frame.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidFrame {
    #[error("frame dimensions must be positive (got {width}x{height})")]
    EmptyDimensions { width: u32, height: u32 },

    #[error("{field} must be finite and non-negative (got {value})")]
    OutOfRange { field: &'static str, value: f64 },
}

impl FrameRecord {
    /// Checks the constraints the codec leaves to the consumer.
    pub fn validate(&self) -> Result<(), InvalidFrame> {
        if self.width == 0 || self.height == 0 {
            return Err(InvalidFrame::EmptyDimensions {
                width: self.width,
                height: self.height,
            });
        }

        for (field, value) in [
            ("timestamp", self.timestamp),
            ("fps", self.fps),
            ("processingTime", self.processing_time),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(InvalidFrame::OutOfRange { field, value });
            }
        }

        Ok(())
    }
}

/// Aggregate statistics over a window of frames.
///
/// An empty window is represented by [`StatsSnapshot::empty`], where `min_fps`
/// is `f64::INFINITY` rather than zero so that `min <= avg <= max` is never
/// broken by a placeholder. JSON cannot carry infinity: the sentinel is written
/// as `null` and `null` (or a missing field) reads back as the sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    #[serde(rename = "averageFPS")]
    pub average_fps: f64,
    #[serde(rename = "maxFPS")]
    pub max_fps: f64,
    #[serde(
        rename = "minFPS",
        default = "unbounded_min_fps",
        deserialize_with = "deserialize_min_fps"
    )]
    pub min_fps: f64,
    #[serde(rename = "averageProcessingTime")]
    pub average_processing_time: f64,
    #[serde(rename = "totalFrames")]
    pub total_frames: u64,
    /// Milliseconds since the oldest retained frame was captured.
    pub uptime: f64,
}

fn unbounded_min_fps() -> f64 {
    f64::INFINITY
}

fn deserialize_min_fps<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::INFINITY))
}

impl StatsSnapshot {
    /// The neutral snapshot of an empty window.
    pub const fn empty() -> Self {
        Self {
            average_fps: 0.0,
            max_fps: 0.0,
            min_fps: f64::INFINITY,
            average_processing_time: 0.0,
            total_frames: 0,
            uptime: 0.0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total_frames == 0
    }

    /// `min_fps` with the empty-window sentinel mapped to `None`.
    pub fn min_fps(&self) -> Option<f64> {
        self.min_fps.is_finite().then_some(self.min_fps)
    }
}

impl Default for StatsSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

/// Message tag carried in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Frame,
    Stats,
    Error,
}

impl MessageKind {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "frame" => Some(MessageKind::Frame),
            "stats" => Some(MessageKind::Stats),
            "error" => Some(MessageKind::Error),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Frame => "frame",
            MessageKind::Stats => "stats",
            MessageKind::Error => "error",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Envelope {
    Frame(FrameRecord),
    Stats(StatsSnapshot),
    Error(String),
}

impl Envelope {
    pub fn kind(&self) -> MessageKind {
        match self {
            Envelope::Frame(_) => MessageKind::Frame,
            Envelope::Stats(_) => MessageKind::Stats,
            Envelope::Error(_) => MessageKind::Error,
        }
    }

    /// Serializes the envelope in wire form (producer side).
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("unknown message type {0:?}")]
    UnknownType(String),

    #[error("invalid {kind} payload: {source}")]
    Payload {
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    tag: String,
    #[serde(default)]
    data: Value,
}

/// Decodes one inbound text message.
///
/// Error payloads that are not strings are kept as their JSON text instead of
/// being rejected.
pub fn decode(raw: &str) -> Result<Envelope, DecodeError> {
    let RawEnvelope { tag, data } = serde_json::from_str(raw).map_err(DecodeError::Malformed)?;

    let kind = match MessageKind::from_tag(&tag) {
        Some(kind) => kind,
        None => return Err(DecodeError::UnknownType(tag)),
    };

    let envelope = match kind {
        MessageKind::Frame => serde_json::from_value(data).map(Envelope::Frame),
        MessageKind::Stats => serde_json::from_value(data).map(Envelope::Stats),
        MessageKind::Error => Ok(Envelope::Error(match data {
            Value::String(message) => message,
            other => other.to_string(),
        })),
    };

    envelope.map_err(|source| DecodeError::Payload { kind, source })
}

/// Encodes an outbound (client to server) payload.
pub fn encode<T: Serialize + ?Sized>(payload: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(payload)
}
