use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque reference to an enrolled subject (student number, staff id, ...).
///
/// The core never interprets it; resolution happens outside.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(String);

impl IdentityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdentityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdentityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for IdentityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Bounding box for a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector score for this face, if the model reports one.
    #[serde(default)]
    pub confidence: f32,
}

/// A descriptor whose length disagrees with the configured dimension.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("descriptor length mismatch: expected {expected}, got {actual}")]
pub struct DimensionMismatch {
    pub expected: usize,
    pub actual: usize,
}

/// Face descriptor vector (typically 128-dimensional).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Descriptor {
    pub values: Vec<f32>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Fail unless this descriptor has exactly `expected` dimensions.
    pub fn check_len(&self, expected: usize) -> Result<(), DimensionMismatch> {
        if self.values.len() == expected {
            Ok(())
        } else {
            Err(DimensionMismatch {
                expected,
                actual: self.values.len(),
            })
        }
    }

    /// Squared Euclidean distance. Descriptors of different lengths are
    /// not comparable.
    pub fn squared_distance(&self, other: &Descriptor) -> Result<f32, DimensionMismatch> {
        other.check_len(self.values.len())?;
        Ok(self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum())
    }

    /// Euclidean distance, the unit the match threshold is calibrated in.
    pub fn euclidean_distance(&self, other: &Descriptor) -> Result<f32, DimensionMismatch> {
        Ok(self.squared_distance(other)?.sqrt())
    }
}

impl From<Vec<f32>> for Descriptor {
    fn from(values: Vec<f32>) -> Self {
        Self { values }
    }
}

/// One face reported by a descriptor source for a single frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub descriptor: Descriptor,
    #[serde(rename = "box", default)]
    pub bbox: BoundingBox,
}

/// A descriptor accepted during a session, before aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capture {
    pub descriptor: Descriptor,
    pub frame_index: u64,
    pub captured_at: DateTime<Utc>,
}

/// The durable per-identity record: centroid of the enrollment captures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub identity_id: IdentityId,
    pub descriptor: Descriptor,
    pub created_at: DateTime<Utc>,
    pub source_capture_count: usize,
}

/// Outcome of matching one live descriptor against a roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchDecision {
    /// Matched identity; `None` whenever the decision is not accepted.
    pub identity_id: Option<IdentityId>,
    /// Euclidean distance to the nearest template. Infinite for an empty roster.
    pub distance: f32,
    /// `max(0, 1 - distance / threshold)`. Informational only.
    pub confidence: f32,
    pub accepted: bool,
}

impl MatchDecision {
    /// Decision for a probe with nothing to compare against.
    pub fn unknown() -> Self {
        Self {
            identity_id: None,
            distance: f32::INFINITY,
            confidence: 0.0,
            accepted: false,
        }
    }
}

/// A match decision together with the face it was computed for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceDecision {
    pub frame_index: u64,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    pub decision: MatchDecision,
}
