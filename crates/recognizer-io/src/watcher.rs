//! File-drop intake.
//!
//! A producer writes a snapshot to a fixed path; the watcher polls for it,
//! reads it, and deletes it so the next drop is a fresh event.

use crate::format::{self, FormatError};
use recognizer_core::Image;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("removing {}: {source}", path.display())]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{}: {source}", path.display())]
    Format {
        path: PathBuf,
        #[source]
        source: FormatError,
    },
}

pub struct FileWatcher {
    path: PathBuf,
    poll: Duration,
}

impl FileWatcher {
    pub fn new(path: impl Into<PathBuf>, poll: Duration) -> Self {
        Self {
            path: path.into(),
            poll,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sleep in `poll` steps until the target path exists.
    pub async fn wait(&self) {
        loop {
            if tokio::fs::metadata(&self.path).await.is_ok() {
                return;
            }
            tokio::time::sleep(self.poll).await;
        }
    }

    /// Read the target file and delete it.
    ///
    /// The file is removed even when it cannot be read or is not an image,
    /// so a bad drop is never retried.
    pub async fn take(&self) -> Result<Image, WatchError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(source) => {
                if let Err(err) = tokio::fs::remove_file(&self.path).await {
                    tracing::warn!(path = %self.path.display(), error = %err, "could not remove unreadable target");
                }
                return Err(WatchError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        tokio::fs::remove_file(&self.path)
            .await
            .map_err(|source| WatchError::Remove {
                path: self.path.clone(),
                source,
            })?;

        format::ensure_supported(&bytes).map_err(|source| WatchError::Format {
            path: self.path.clone(),
            source,
        })?;

        tracing::debug!(path = %self.path.display(), bytes = bytes.len(), "took target image");
        Ok(Image::from(bytes))
    }

    /// Wait for the next drop and take it.
    pub async fn next_image(&self) -> Result<Image, WatchError> {
        self.wait().await;
        self.take().await
    }
}
