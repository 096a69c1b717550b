//! Loading reference images from disk.

use crate::config::{ConfigError, ReferenceSource};
use crate::format;
use recognizer_core::{Image, ReferenceImage, ReferenceSet};

/// Read every reference image. Any unreadable or non-JPEG/PNG file is fatal.
pub async fn load_references(sources: &[ReferenceSource]) -> Result<ReferenceSet, ConfigError> {
    let mut entries = Vec::with_capacity(sources.len());

    for source in sources {
        let bytes = tokio::fs::read(&source.path)
            .await
            .map_err(|e| ConfigError::ReferenceRead {
                path: source.path.clone(),
                source: e,
            })?;
        format::ensure_supported(&bytes).map_err(|e| ConfigError::ReferenceFormat {
            path: source.path.clone(),
            source: e,
        })?;

        tracing::debug!(
            path = %source.path.display(),
            bytes = bytes.len(),
            threshold = source.threshold,
            "loaded reference image"
        );
        entries.push(ReferenceImage {
            id: source.path.display().to_string(),
            image: Image::from(bytes),
            threshold: source.threshold,
        });
    }

    tracing::info!(count = entries.len(), "reference set loaded");
    Ok(ReferenceSet::new(entries))
}
