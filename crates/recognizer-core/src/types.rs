use crate::policy::Violation;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// One still frame as encoded bytes (JPEG or PNG).
///
/// Immutable once captured. Cloning shares the underlying buffer, so the
/// same image can be handed to every concurrent comparison task.
#[derive(Clone, PartialEq, Eq)]
pub struct Image {
    bytes: Arc<[u8]>,
}

impl Image {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl From<Vec<u8>> for Image {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image").field("len", &self.len()).finish()
    }
}

/// A known-identity image the source is compared against.
#[derive(Debug, Clone)]
pub struct ReferenceImage {
    /// Human-readable identifier (usually the file path), used for attribution only.
    pub id: String,
    pub image: Image,
    /// Minimum similarity [0, 100] a face match must reach.
    pub threshold: f32,
}

/// Ordered set of reference images, loaded once and shared read-only.
#[derive(Debug, Clone, Default)]
pub struct ReferenceSet {
    entries: Vec<ReferenceImage>,
}

impl ReferenceSet {
    pub fn new(entries: Vec<ReferenceImage>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[ReferenceImage] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Face-presence signal returned by the capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceDetection {
    pub face_count: usize,
}

/// One (name, confidence) pair from label detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    /// Confidence in [0, 100].
    pub confidence: f32,
}

impl Label {
    pub fn new(name: impl Into<String>, confidence: f32) -> Self {
        Self {
            name: name.into(),
            confidence,
        }
    }
}

/// A single face match returned by a comparison.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceMatch {
    pub similarity: f32,
}

/// Per-reference result of the comparison fan-out.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonOutcome {
    pub reference: String,
    pub matched: bool,
    /// The comparison call failed and was counted as a non-match.
    pub failed: bool,
}

/// Why an invocation ended without recognizing anyone.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotRecognizedReason {
    NoFaceDetected,
    PolicyViolation { violation: Violation },
    NoMatchFound,
}

impl fmt::Display for NotRecognizedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoFaceDetected => write!(f, "no faces detected in the image"),
            Self::PolicyViolation { violation } => {
                write!(f, "some of the labels did not pass confidence level: {violation}")
            }
            Self::NoMatchFound => write!(f, "did not recognize the caller"),
        }
    }
}

/// Capability step whose failure aborted an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    DetectionFailed,
    LabelDetectionFailed,
    DiagnosticsFailed,
}

/// Final output of one pipeline invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Recognized { reference: String },
    NotRecognized { reason: NotRecognizedReason },
    Rejected { reason: RejectReason },
}

impl Decision {
    pub fn is_recognized(&self) -> bool {
        matches!(self, Self::Recognized { .. })
    }
}
