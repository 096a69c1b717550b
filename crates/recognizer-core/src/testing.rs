//! Stub capabilities shared by the unit tests.

use crate::backend::{BackendError, RecognitionBackend};
use crate::diagnostics::{DiagnosticError, DiagnosticRecord, DiagnosticSink};
use crate::notify::{Notifier, NotifyError};
use crate::types::{FaceDetection, FaceMatch, Image, Label, ReferenceImage};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub(crate) fn reference(id: &str, threshold: f32) -> ReferenceImage {
    ReferenceImage {
        id: id.to_string(),
        image: Image::from(id.as_bytes().to_vec()),
        threshold,
    }
}

/// Scripted answer for comparisons against one reference.
#[derive(Clone)]
pub(crate) struct Comparison {
    result: Result<usize, BackendError>,
    delay: Duration,
}

impl Comparison {
    pub(crate) fn matches(count: usize) -> Self {
        Self {
            result: Ok(count),
            delay: Duration::ZERO,
        }
    }

    pub(crate) fn fails(err: BackendError) -> Self {
        Self {
            result: Err(err),
            delay: Duration::ZERO,
        }
    }

    pub(crate) fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Backend answering from a script keyed by reference id.
///
/// Reference images built with [`reference`] carry their id as bytes, which
/// is how comparisons are routed. Unscripted references never match.
pub(crate) struct StubBackend {
    faces: Result<usize, BackendError>,
    labels: Result<Vec<Label>, BackendError>,
    comparisons: HashMap<String, Comparison>,
    compare_calls: AtomicUsize,
    completed_calls: AtomicUsize,
    thresholds: Mutex<Vec<(String, f32)>>,
}

impl Default for StubBackend {
    fn default() -> Self {
        Self {
            faces: Ok(1),
            labels: Ok(Vec::new()),
            comparisons: HashMap::new(),
            compare_calls: AtomicUsize::new(0),
            completed_calls: AtomicUsize::new(0),
            thresholds: Mutex::new(Vec::new()),
        }
    }
}

impl StubBackend {
    pub(crate) fn with_faces(mut self, faces: Result<usize, BackendError>) -> Self {
        self.faces = faces;
        self
    }

    pub(crate) fn with_labels(mut self, labels: Result<Vec<Label>, BackendError>) -> Self {
        self.labels = labels;
        self
    }

    pub(crate) fn with_comparison(mut self, reference: &str, comparison: Comparison) -> Self {
        self.comparisons.insert(reference.to_string(), comparison);
        self
    }

    pub(crate) fn compare_calls(&self) -> usize {
        self.compare_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn completed_calls(&self) -> usize {
        self.completed_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn thresholds(&self) -> Vec<(String, f32)> {
        self.thresholds.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecognitionBackend for StubBackend {
    async fn detect_faces(&self, _image: &Image) -> Result<FaceDetection, BackendError> {
        self.faces
            .clone()
            .map(|face_count| FaceDetection { face_count })
    }

    async fn detect_labels(&self, _image: &Image) -> Result<Vec<Label>, BackendError> {
        self.labels.clone()
    }

    async fn compare_faces(
        &self,
        _source: &Image,
        target: &Image,
        threshold: f32,
    ) -> Result<Vec<FaceMatch>, BackendError> {
        self.compare_calls.fetch_add(1, Ordering::SeqCst);
        let id = String::from_utf8_lossy(target.as_bytes()).into_owned();
        self.thresholds.lock().unwrap().push((id.clone(), threshold));

        let comparison = self
            .comparisons
            .get(&id)
            .cloned()
            .unwrap_or_else(|| Comparison::matches(0));
        if !comparison.delay.is_zero() {
            tokio::time::sleep(comparison.delay).await;
        }
        self.completed_calls.fetch_add(1, Ordering::SeqCst);

        comparison
            .result
            .map(|count| vec![FaceMatch { similarity: 99.0 }; count])
    }
}

/// Notifier that records every publish.
#[derive(Default)]
pub(crate) struct RecordingNotifier {
    published: Mutex<Vec<(String, String)>>,
    fail: bool,
    hang: bool,
}

impl RecordingNotifier {
    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Records the publish, then never completes.
    pub(crate) fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::default()
        }
    }

    pub(crate) fn published(&self) -> Vec<(String, String)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), NotifyError> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_string()));
        if self.hang {
            std::future::pending::<()>().await;
        }
        if self.fail {
            return Err(NotifyError::Unavailable("broker down".into()));
        }
        Ok(())
    }
}

/// Diagnostic sink that keeps records in memory.
#[derive(Default)]
pub(crate) struct RecordingSink {
    records: Mutex<Vec<DiagnosticRecord>>,
}

impl RecordingSink {
    pub(crate) fn records(&self) -> Vec<DiagnosticRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl DiagnosticSink for RecordingSink {
    async fn capture(&self, record: &DiagnosticRecord) -> Result<(), DiagnosticError> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}
