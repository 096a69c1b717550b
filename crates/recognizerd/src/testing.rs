//! Stub capabilities for the daemon's unit tests.

use async_trait::async_trait;
use recognizer_core::{
    BackendError, FaceDetection, FaceMatch, Image, Label, Mode, NotificationMessages, Pipeline,
    PipelineSettings, RecognitionBackend, ReferenceImage, ReferenceSet,
};
use recognizer_io::{FrameSource, GrabError, NoopNotifier};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub(crate) fn reference(id: &str) -> ReferenceImage {
    ReferenceImage {
        id: id.to_string(),
        image: Image::from(id.as_bytes().to_vec()),
        threshold: 95.0,
    }
}

pub(crate) fn pipeline(backend: StubBackend, mode: Mode, references: Vec<ReferenceImage>) -> Pipeline {
    Pipeline::new(
        Arc::new(backend),
        Arc::new(NoopNotifier),
        ReferenceSet::new(references),
        recognizer_core::LabelPolicy::default(),
        PipelineSettings {
            mode,
            messages: NotificationMessages {
                topic: "entrance/recognizer".into(),
                recognized: "yes".into(),
                not_recognized: "no".into(),
            },
            call_timeout: Duration::from_secs(5),
        },
    )
}

/// Backend that sees one face, labels it a person, and matches the
/// references whose ids it was built with.
pub(crate) struct StubBackend {
    matching: HashSet<String>,
    in_flight: AtomicUsize,
    peak: Arc<AtomicUsize>,
}

impl StubBackend {
    pub(crate) fn matching(ids: &[&str]) -> Self {
        Self {
            matching: ids.iter().map(|id| id.to_string()).collect(),
            in_flight: AtomicUsize::new(0),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Highest number of overlapping `detect_faces` calls seen.
    pub(crate) fn peak_concurrency(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.peak)
    }
}

#[async_trait]
impl RecognitionBackend for StubBackend {
    async fn detect_faces(&self, _image: &Image) -> Result<FaceDetection, BackendError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(FaceDetection { face_count: 1 })
    }

    async fn detect_labels(&self, _image: &Image) -> Result<Vec<Label>, BackendError> {
        Ok(vec![Label::new("Person", 99.0)])
    }

    async fn compare_faces(
        &self,
        _source: &Image,
        target: &Image,
        _threshold: f32,
    ) -> Result<Vec<FaceMatch>, BackendError> {
        let id = String::from_utf8_lossy(target.as_bytes()).into_owned();
        if self.matching.contains(&id) {
            Ok(vec![FaceMatch { similarity: 99.0 }])
        } else {
            Ok(Vec::new())
        }
    }
}

/// Frame source returning a fixed result.
pub(crate) struct StubFrames {
    pub(crate) fail: bool,
}

#[async_trait]
impl FrameSource for StubFrames {
    async fn grab(&self, url: &str) -> Result<Image, GrabError> {
        if self.fail {
            Err(GrabError::NoImage {
                url: url.to_string(),
            })
        } else {
            Ok(Image::from(b"frame".to_vec()))
        }
    }
}
