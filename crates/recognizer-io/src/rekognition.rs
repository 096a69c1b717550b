//! AWS Rekognition backend.
//!
//! Credentials and region come from the standard AWS provider chain; the
//! region can be pinned from configuration.

use async_trait::async_trait;
use aws_sdk_rekognition::config::Region;
use aws_sdk_rekognition::error::DisplayErrorContext;
use aws_sdk_rekognition::primitives::Blob;
use aws_sdk_rekognition::types::{self, QualityFilter};
use aws_sdk_rekognition::Client;
use recognizer_core::{BackendError, FaceDetection, FaceMatch, Image, Label, RecognitionBackend};

pub struct RekognitionBackend {
    client: Client,
}

impl RekognitionBackend {
    pub async fn from_env(region: Option<&str>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region.to_string()));
        }
        let shared = loader.load().await;
        tracing::info!(
            region = ?shared.region(),
            "AWS Rekognition client configured"
        );
        Self::with_client(Client::new(&shared))
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

fn sdk_image(image: &Image) -> types::Image {
    types::Image::builder()
        .bytes(Blob::new(image.as_bytes()))
        .build()
}

fn service_error(err: impl std::error::Error) -> BackendError {
    BackendError::Service(DisplayErrorContext(err).to_string())
}

fn labels_from_sdk(labels: &[types::Label]) -> Result<Vec<Label>, BackendError> {
    labels
        .iter()
        .map(|label| match (label.name(), label.confidence()) {
            (Some(name), Some(confidence)) => Ok(Label::new(name, confidence)),
            _ => Err(BackendError::InvalidResponse(format!(
                "label without name or confidence: {label:?}"
            ))),
        })
        .collect()
}

fn matches_from_sdk(matches: &[types::CompareFacesMatch]) -> Vec<FaceMatch> {
    matches
        .iter()
        .map(|m| FaceMatch {
            similarity: m.similarity().unwrap_or_default(),
        })
        .collect()
}

#[async_trait]
impl RecognitionBackend for RekognitionBackend {
    async fn detect_faces(&self, image: &Image) -> Result<FaceDetection, BackendError> {
        let output = self
            .client
            .detect_faces()
            .image(sdk_image(image))
            .send()
            .await
            .map_err(service_error)?;
        Ok(FaceDetection {
            face_count: output.face_details().len(),
        })
    }

    async fn detect_labels(&self, image: &Image) -> Result<Vec<Label>, BackendError> {
        let output = self
            .client
            .detect_labels()
            .image(sdk_image(image))
            .send()
            .await
            .map_err(service_error)?;
        labels_from_sdk(output.labels())
    }

    async fn compare_faces(
        &self,
        source: &Image,
        target: &Image,
        threshold: f32,
    ) -> Result<Vec<FaceMatch>, BackendError> {
        let output = self
            .client
            .compare_faces()
            .source_image(sdk_image(source))
            .target_image(sdk_image(target))
            .similarity_threshold(threshold)
            .quality_filter(QualityFilter::Auto)
            .send()
            .await
            .map_err(service_error)?;
        Ok(matches_from_sdk(output.face_matches()))
    }
}
