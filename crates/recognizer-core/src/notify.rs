use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NotifyError {
    #[error("notification transport unavailable: {0}")]
    Unavailable(String),
    #[error("publish to {topic} failed: {reason}")]
    PublishFailed { topic: String, reason: String },
}

/// Downstream channel that receives the recognition decision.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), NotifyError>;
}

/// Topic and the two payloads published for a decision.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationMessages {
    pub topic: String,
    pub recognized: String,
    pub not_recognized: String,
}

impl NotificationMessages {
    pub fn payload(&self, recognized: bool) -> &str {
        if recognized {
            &self.recognized
        } else {
            &self.not_recognized
        }
    }
}
