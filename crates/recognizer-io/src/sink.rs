//! Discovery records appended to a file, one pretty-printed JSON document each.

use async_trait::async_trait;
use recognizer_core::{DiagnosticError, DiagnosticRecord, DiagnosticSink};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

pub struct FileDiagnosticSink {
    path: PathBuf,
}

impl FileDiagnosticSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DiagnosticSink for FileDiagnosticSink {
    async fn capture(&self, record: &DiagnosticRecord) -> Result<(), DiagnosticError> {
        let mut text = record.to_pretty_json()?;
        text.push('\n');

        let mut options = tokio::fs::OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&self.path).await?;
        file.write_all(text.as_bytes()).await?;
        file.flush().await?;

        tracing::debug!(path = %self.path.display(), "diagnostic record written");
        Ok(())
    }
}
