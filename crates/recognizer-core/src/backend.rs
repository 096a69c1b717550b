//! Remote recognition capability.
//!
//! The pipeline never inspects pixels itself; it asks a backend for face
//! presence, labels, and face comparisons. A call error is distinct from an
//! empty result (zero faces, zero matches), which is a valid answer.

use crate::types::{FaceDetection, FaceMatch, Image, Label};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("recognition service error: {0}")]
    Service(String),
    #[error("malformed response from recognition service: {0}")]
    InvalidResponse(String),
    #[error("recognition call timed out after {0:?}")]
    Timeout(Duration),
}

/// Face detection, label detection, and face comparison.
#[async_trait]
pub trait RecognitionBackend: Send + Sync {
    async fn detect_faces(&self, image: &Image) -> Result<FaceDetection, BackendError>;

    async fn detect_labels(&self, image: &Image) -> Result<Vec<Label>, BackendError>;

    /// Compare the faces in `source` against `target`, returning every match
    /// whose similarity is at least `threshold` (0–100).
    async fn compare_faces(
        &self,
        source: &Image,
        target: &Image,
        threshold: f32,
    ) -> Result<Vec<FaceMatch>, BackendError>;
}

/// Run one backend call under a deadline.
pub async fn with_deadline<T, F>(deadline: Duration, call: F) -> Result<T, BackendError>
where
    F: Future<Output = Result<T, BackendError>>,
{
    tokio::time::timeout(deadline, call)
        .await
        .map_err(|_| BackendError::Timeout(deadline))?
}
