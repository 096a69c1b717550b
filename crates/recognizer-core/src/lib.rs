//! recognizer-core: recognition decision pipeline.
//!
//! Takes one still image, checks for a face, gates on label confidence,
//! compares against a reference set concurrently, and publishes a single
//! recognized / not-recognized decision. Detection, comparison, and
//! notification are injected capabilities.

pub mod backend;
pub mod diagnostics;
pub mod fanout;
pub mod notify;
pub mod pipeline;
pub mod policy;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{BackendError, RecognitionBackend};
pub use diagnostics::{DiagnosticError, DiagnosticRecord, DiagnosticSink};
pub use notify::{NotificationMessages, Notifier, NotifyError};
pub use pipeline::{Assessment, Mode, NotificationStatus, Pipeline, PipelineError, PipelineSettings};
pub use policy::{LabelPolicy, PolicyError, ThresholdMap};
pub use types::{Decision, FaceDetection, FaceMatch, Image, Label, ReferenceImage, ReferenceSet};
