//! Single-frame capture from a stream URL.

use crate::format::{self, FormatError};
use async_trait::async_trait;
use recognizer_core::Image;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

#[derive(Error, Debug)]
pub enum GrabError {
    #[error("Error opening video capture device: {url}")]
    Open {
        url: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Cannot read device {url}: {detail}")]
    Read { url: String, detail: String },
    #[error("Cannot read device {url}: timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },
    #[error("No image on device {url}")]
    NoImage { url: String },
    #[error("frame from {url}: {source}")]
    Format {
        url: String,
        #[source]
        source: FormatError,
    },
}

/// Something that can produce one still image from a stream URL.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn grab(&self, url: &str) -> Result<Image, GrabError>;
}

/// Grabs the first video frame with an `ffmpeg` subprocess, encoded as JPEG.
pub struct FfmpegGrabber {
    program: PathBuf,
    timeout: Duration,
}

impl FfmpegGrabber {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    fn command(&self, url: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(["-hide_banner", "-loglevel", "error", "-i"])
            .arg(url)
            .args(["-frames:v", "1", "-f", "image2pipe", "-vcodec", "mjpeg", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl FrameSource for FfmpegGrabber {
    async fn grab(&self, url: &str) -> Result<Image, GrabError> {
        let child = self.command(url).spawn().map_err(|source| GrabError::Open {
            url: url.to_string(),
            source,
        })?;

        // Dropping the future on timeout drops the child, which kills it.
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| GrabError::Timeout {
                url: url.to_string(),
                timeout: self.timeout,
            })?
            .map_err(|e| GrabError::Read {
                url: url.to_string(),
                detail: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GrabError::Read {
                url: url.to_string(),
                detail: format!("{}: {}", output.status, stderr.trim()),
            });
        }
        if output.stdout.is_empty() {
            return Err(GrabError::NoImage {
                url: url.to_string(),
            });
        }

        format::ensure_supported(&output.stdout).map_err(|source| GrabError::Format {
            url: url.to_string(),
            source,
        })?;

        tracing::debug!(url, bytes = output.stdout.len(), "grabbed frame");
        Ok(Image::from(output.stdout))
    }
}
