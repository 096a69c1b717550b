//! Discovery-mode capture of raw detection output.

use crate::types::Label;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiagnosticError {
    #[error("diagnostic sink I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("diagnostic record encoding: {0}")]
    Encode(#[from] serde_json::Error),
}

/// What one discovery-mode invocation saw before any policy was applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticRecord {
    pub invocation: String,
    pub captured_at: DateTime<Utc>,
    pub face_count: usize,
    pub labels: Vec<Label>,
}

impl DiagnosticRecord {
    pub fn to_pretty_json(&self) -> Result<String, DiagnosticError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[async_trait]
pub trait DiagnosticSink: Send + Sync {
    async fn capture(&self, record: &DiagnosticRecord) -> Result<(), DiagnosticError>;
}

/// Sink that writes each record to the log at `info`.
pub struct LogSink;

#[async_trait]
impl DiagnosticSink for LogSink {
    async fn capture(&self, record: &DiagnosticRecord) -> Result<(), DiagnosticError> {
        tracing::info!(
            faces = record.face_count,
            "detected labels:\n{}",
            record.to_pretty_json()?
        );
        Ok(())
    }
}
