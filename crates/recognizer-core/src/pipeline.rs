//! Recognition decision pipeline.
//!
//! One invocation walks `detect faces → detect labels → label policy →
//! comparison fan-out → decision → notification`. Capability failures in the
//! detection steps abort the invocation without notifying. Every other path
//! ends in exactly one decision and, outside discovery mode, exactly one
//! notification.

use crate::backend::{with_deadline, BackendError, RecognitionBackend};
use crate::diagnostics::{DiagnosticError, DiagnosticRecord, DiagnosticSink, LogSink};
use crate::fanout::compare_all;
use crate::notify::{NotificationMessages, Notifier, NotifyError};
use crate::policy::{LabelPolicy, PolicyVerdict};
use crate::types::{
    ComparisonOutcome, Decision, Image, Label, NotRecognizedReason, ReferenceSet, RejectReason,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::Instrument;

/// Default per-call deadline for capability requests.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Operating mode, fixed when the pipeline is built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Publish every decision; negative decisions are reported as errors by
    /// [`Pipeline::process`].
    #[default]
    Normal,
    /// Capture raw detection output, never publish, never fail on a negative decision.
    Discovery,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub mode: Mode,
    pub messages: NotificationMessages,
    pub call_timeout: Duration,
}

/// What happened to the notification for a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Sent,
    Failed,
    /// Discovery mode.
    Suppressed,
}

/// Outcome of one invocation that reached a decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assessment {
    pub invocation: String,
    pub decision: Decision,
    pub notification: NotificationStatus,
    pub face_count: usize,
    pub labels: Vec<Label>,
    pub comparisons: Vec<ComparisonOutcome>,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("error detecting faces: {0}")]
    Detection(#[source] BackendError),
    #[error("error detecting labels: {0}")]
    Labels(#[source] BackendError),
    #[error("error capturing diagnostics: {0}")]
    Diagnostics(#[from] DiagnosticError),
    /// A negative decision reported as a failure (normal mode only).
    #[error("{reason}")]
    NotRecognized {
        reason: NotRecognizedReason,
        assessment: Box<Assessment>,
    },
}

impl PipelineError {
    /// The decision this error stands for.
    pub fn decision(&self) -> Decision {
        match self {
            Self::Detection(_) => Decision::Rejected {
                reason: RejectReason::DetectionFailed,
            },
            Self::Labels(_) => Decision::Rejected {
                reason: RejectReason::LabelDetectionFailed,
            },
            Self::Diagnostics(_) => Decision::Rejected {
                reason: RejectReason::DiagnosticsFailed,
            },
            Self::NotRecognized { assessment, .. } => assessment.decision.clone(),
        }
    }
}

/// Orchestrates one recognition decision per image.
pub struct Pipeline {
    backend: Arc<dyn RecognitionBackend>,
    notifier: Arc<dyn Notifier>,
    sinks: Vec<Arc<dyn DiagnosticSink>>,
    references: Arc<ReferenceSet>,
    policy: Arc<LabelPolicy>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        backend: Arc<dyn RecognitionBackend>,
        notifier: Arc<dyn Notifier>,
        references: ReferenceSet,
        policy: LabelPolicy,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            backend,
            notifier,
            sinks: vec![Arc::new(LogSink)],
            references: Arc::new(references),
            policy: Arc::new(policy),
            settings,
        }
    }

    /// Add a sink that receives discovery-mode records, after the log.
    pub fn with_diagnostics(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn mode(&self) -> Mode {
        self.settings.mode
    }

    pub fn references(&self) -> &ReferenceSet {
        &self.references
    }

    pub fn policy(&self) -> &LabelPolicy {
        &self.policy
    }

    /// Swap the reference set and label policy. Takes `&mut self`, so it
    /// cannot overlap an invocation.
    pub fn reload(&mut self, references: ReferenceSet, policy: LabelPolicy) {
        tracing::info!(
            references = references.len(),
            min_rules = policy.min_confidence.len(),
            max_rules = policy.max_confidence.len(),
            "reloaded references and label policy"
        );
        self.references = Arc::new(references);
        self.policy = Arc::new(policy);
    }

    /// Run one invocation, reporting a normal-mode negative decision as
    /// [`PipelineError::NotRecognized`].
    ///
    /// This is the contract the front ends expose: outside discovery mode,
    /// "not recognized" and "failed" are the same thing to the caller.
    pub async fn process(&self, image: &Image) -> Result<Assessment, PipelineError> {
        let assessment = self.assess(image).await?;
        if self.settings.mode == Mode::Normal {
            if let Decision::NotRecognized { reason } = &assessment.decision {
                let reason = reason.clone();
                return Err(PipelineError::NotRecognized {
                    reason,
                    assessment: Box::new(assessment),
                });
            }
        }
        Ok(assessment)
    }

    /// Run one invocation. Only capability and diagnostics failures are
    /// errors; every decision, positive or negative, is returned as an
    /// [`Assessment`].
    pub async fn assess(&self, image: &Image) -> Result<Assessment, PipelineError> {
        let invocation = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("invocation", id = %invocation, bytes = image.len());
        self.run(invocation, image).instrument(span).await
    }

    async fn run(&self, invocation: String, image: &Image) -> Result<Assessment, PipelineError> {
        let discovery = self.settings.mode == Mode::Discovery;
        let deadline = self.settings.call_timeout;

        let detection = with_deadline(deadline, self.backend.detect_faces(image))
            .await
            .map_err(|err| {
                tracing::error!(error = %err, "error detecting face");
                PipelineError::Detection(err)
            })?;
        let face_count = detection.face_count;
        tracing::debug!(faces = face_count, "faces detected");

        // In discovery mode the first negative finding is kept while the
        // remaining steps still run for diagnostics.
        let mut rejection: Option<NotRecognizedReason> = None;

        if face_count == 0 {
            tracing::error!("no faces detected in the image");
            if !discovery {
                let decision = NotRecognizedReason::NoFaceDetected.into();
                return Ok(self
                    .conclude(invocation, decision, face_count, Vec::new(), Vec::new())
                    .await);
            }
            rejection = Some(NotRecognizedReason::NoFaceDetected);
        }

        let labels = with_deadline(deadline, self.backend.detect_labels(image))
            .await
            .map_err(|err| {
                tracing::error!(error = %err, "error detecting labels");
                PipelineError::Labels(err)
            })?;
        tracing::debug!(labels = labels.len(), "labels detected");

        if discovery {
            self.capture(&invocation, face_count, &labels).await?;
        }

        if let PolicyVerdict::Fail(violation) = self.policy.evaluate(&labels) {
            tracing::error!(%violation, "some of the labels did not pass confidence level");
            let reason = NotRecognizedReason::PolicyViolation { violation };
            if !discovery {
                return Ok(self
                    .conclude(invocation, reason.into(), face_count, labels, Vec::new())
                    .await);
            }
            rejection.get_or_insert(reason);
        }

        let verdict = compare_all(Arc::clone(&self.backend), image, &self.references, deadline).await;

        let decision = match (rejection, verdict.winner) {
            (Some(reason), _) => reason.into(),
            (None, Some(reference)) => Decision::Recognized { reference },
            (None, None) => NotRecognizedReason::NoMatchFound.into(),
        };

        Ok(self
            .conclude(invocation, decision, face_count, labels, verdict.outcomes)
            .await)
    }

    /// Publish the decision (outside discovery mode) and package the result.
    async fn conclude(
        &self,
        invocation: String,
        decision: Decision,
        face_count: usize,
        labels: Vec<Label>,
        comparisons: Vec<ComparisonOutcome>,
    ) -> Assessment {
        let notification = match self.settings.mode {
            Mode::Discovery => NotificationStatus::Suppressed,
            Mode::Normal => self.notify(decision.is_recognized()).await,
        };

        match &decision {
            Decision::Recognized { reference } => tracing::info!(%reference, "caller recognized"),
            Decision::NotRecognized { reason } => tracing::warn!(%reason, "caller not recognized"),
            Decision::Rejected { .. } => {}
        }

        Assessment {
            invocation,
            decision,
            notification,
            face_count,
            labels,
            comparisons,
        }
    }

    async fn notify(&self, recognized: bool) -> NotificationStatus {
        let messages = &self.settings.messages;
        let payload = messages.payload(recognized);
        let deadline = self.settings.call_timeout;
        let published = tokio::time::timeout(deadline, self.notifier.publish(&messages.topic, payload))
            .await
            .unwrap_or_else(|_| {
                Err(NotifyError::Unavailable(format!(
                    "publish timed out after {deadline:?}"
                )))
            });
        match published {
            Ok(()) => {
                tracing::info!(topic = %messages.topic, payload, "published decision");
                NotificationStatus::Sent
            }
            Err(err) => {
                tracing::error!(topic = %messages.topic, error = %err, "failed to publish decision");
                NotificationStatus::Failed
            }
        }
    }

    async fn capture(
        &self,
        invocation: &str,
        face_count: usize,
        labels: &[Label],
    ) -> Result<(), DiagnosticError> {
        let record = DiagnosticRecord {
            invocation: invocation.to_string(),
            captured_at: chrono::Utc::now(),
            face_count,
            labels: labels.to_vec(),
        };
        for sink in &self.sinks {
            sink.capture(&record).await?;
        }
        Ok(())
    }
}

impl From<NotRecognizedReason> for Decision {
    fn from(reason: NotRecognizedReason) -> Self {
        Decision::NotRecognized { reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Violation;
    use crate::testing::{reference, Comparison, RecordingNotifier, RecordingSink, StubBackend};

    const TOPIC: &str = "entrance/recognizer";
    const RECOGNIZED: &str = r#"{"message": "recognized"}"#;
    const NOT_RECOGNIZED: &str = r#"{"message": "not_recognized"}"#;

    fn settings(mode: Mode) -> PipelineSettings {
        PipelineSettings {
            mode,
            messages: NotificationMessages {
                topic: TOPIC.into(),
                recognized: RECOGNIZED.into(),
                not_recognized: NOT_RECOGNIZED.into(),
            },
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    struct Harness {
        pipeline: Pipeline,
        backend: Arc<StubBackend>,
        notifier: Arc<RecordingNotifier>,
        sink: Arc<RecordingSink>,
    }

    fn harness(backend: StubBackend, references: ReferenceSet, policy: LabelPolicy, mode: Mode) -> Harness {
        harness_with_notifier(backend, references, policy, mode, RecordingNotifier::default())
    }

    fn harness_with_notifier(
        backend: StubBackend,
        references: ReferenceSet,
        policy: LabelPolicy,
        mode: Mode,
        notifier: RecordingNotifier,
    ) -> Harness {
        let backend = Arc::new(backend);
        let notifier = Arc::new(notifier);
        let sink = Arc::new(RecordingSink::default());
        let pipeline = Pipeline::new(backend.clone(), notifier.clone(), references, policy, settings(mode))
            .with_diagnostics(sink.clone());
        Harness {
            pipeline,
            backend,
            notifier,
            sink,
        }
    }

    fn image() -> Image {
        Image::from(b"snapshot".to_vec())
    }

    fn sent(payload: &str) -> Vec<(String, String)> {
        vec![(TOPIC.to_string(), payload.to_string())]
    }

    #[tokio::test]
    async fn test_no_face_in_normal_mode_notifies_and_fails() {
        let h = harness(
            StubBackend::default().with_faces(Ok(0)),
            ReferenceSet::new(vec![reference("alice.jpg", 95.0)]),
            LabelPolicy::default(),
            Mode::Normal,
        );

        let err = h.pipeline.process(&image()).await.unwrap_err();

        assert!(matches!(
            err,
            PipelineError::NotRecognized {
                reason: NotRecognizedReason::NoFaceDetected,
                ..
            }
        ));
        assert_eq!(h.notifier.published(), sent(NOT_RECOGNIZED));
        assert_eq!(h.backend.compare_calls(), 0);
    }

    #[tokio::test]
    async fn test_no_face_short_circuits_before_labels() {
        // The label call would fail, but it is never reached.
        let h = harness(
            StubBackend::default()
                .with_faces(Ok(0))
                .with_labels(Err(BackendError::Service("unreachable".into()))),
            ReferenceSet::default(),
            LabelPolicy::default(),
            Mode::Normal,
        );

        let err = h.pipeline.process(&image()).await.unwrap_err();
        assert_eq!(
            err.decision(),
            Decision::NotRecognized {
                reason: NotRecognizedReason::NoFaceDetected
            }
        );
    }

    #[tokio::test]
    async fn test_policy_violation_in_normal_mode() {
        let h = harness(
            StubBackend::default().with_labels(Ok(vec![Label::new("Weapon", 99.0)])),
            ReferenceSet::new(vec![reference("alice.jpg", 95.0)]),
            LabelPolicy::parse("", "Weapon:50.0").unwrap(),
            Mode::Normal,
        );

        let err = h.pipeline.process(&image()).await.unwrap_err();

        match err {
            PipelineError::NotRecognized { reason, assessment } => {
                assert_eq!(
                    reason,
                    NotRecognizedReason::PolicyViolation {
                        violation: Violation::AboveMaximum {
                            label: "Weapon".into(),
                            threshold: 50.0,
                            actual: 99.0,
                        }
                    }
                );
                assert_eq!(assessment.notification, NotificationStatus::Sent);
                assert!(assessment.comparisons.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(h.notifier.published(), sent(NOT_RECOGNIZED));
        assert_eq!(h.backend.compare_calls(), 0);
    }

    #[tokio::test]
    async fn test_match_is_recognized() {
        let h = harness(
            StubBackend::default()
                .with_labels(Ok(vec![Label::new("Person", 99.0)]))
                .with_comparison("alice.jpg", Comparison::matches(1)),
            ReferenceSet::new(vec![reference("alice.jpg", 95.0)]),
            LabelPolicy::parse("Person:90", "Weapon:50").unwrap(),
            Mode::Normal,
        );

        let assessment = h.pipeline.process(&image()).await.unwrap();

        assert_eq!(
            assessment.decision,
            Decision::Recognized {
                reference: "alice.jpg".into()
            }
        );
        assert_eq!(assessment.notification, NotificationStatus::Sent);
        assert_eq!(h.notifier.published(), sent(RECOGNIZED));
        assert!(h.sink.records().is_empty());
    }

    #[tokio::test]
    async fn test_failed_comparison_does_not_block_other_match() {
        let h = harness(
            StubBackend::default()
                .with_comparison(
                    "alice.jpg",
                    Comparison::fails(BackendError::Service("access denied".into())),
                )
                .with_comparison("bob.jpg", Comparison::matches(1)),
            ReferenceSet::new(vec![reference("alice.jpg", 95.0), reference("bob.jpg", 95.0)]),
            LabelPolicy::default(),
            Mode::Normal,
        );

        let assessment = h.pipeline.process(&image()).await.unwrap();

        assert_eq!(
            assessment.decision,
            Decision::Recognized {
                reference: "bob.jpg".into()
            }
        );
        assert!(assessment.comparisons[0].failed);
        assert_eq!(h.notifier.published(), sent(RECOGNIZED));
    }

    #[tokio::test]
    async fn test_no_match_in_normal_mode_notifies_and_fails() {
        let h = harness(
            StubBackend::default(),
            ReferenceSet::new(vec![reference("alice.jpg", 95.0), reference("bob.jpg", 95.0)]),
            LabelPolicy::default(),
            Mode::Normal,
        );

        let err = h.pipeline.process(&image()).await.unwrap_err();

        assert_eq!(err.to_string(), "did not recognize the caller");
        assert_eq!(h.notifier.published(), sent(NOT_RECOGNIZED));
        assert_eq!(h.backend.compare_calls(), 2);
    }

    #[tokio::test]
    async fn test_empty_reference_set_is_not_recognized() {
        let h = harness(
            StubBackend::default(),
            ReferenceSet::default(),
            LabelPolicy::default(),
            Mode::Normal,
        );

        let assessment = h.pipeline.assess(&image()).await.unwrap();
        assert_eq!(assessment.decision, Decision::from(NotRecognizedReason::NoMatchFound));
        assert_eq!(h.notifier.published(), sent(NOT_RECOGNIZED));
    }

    #[tokio::test]
    async fn test_discovery_mode_no_face_is_inert() {
        let h = harness(
            StubBackend::default()
                .with_faces(Ok(0))
                .with_labels(Ok(vec![Label::new("Door", 88.5)])),
            ReferenceSet::new(vec![reference("alice.jpg", 95.0)]),
            LabelPolicy::default(),
            Mode::Discovery,
        );

        let assessment = h.pipeline.process(&image()).await.unwrap();

        assert_eq!(assessment.notification, NotificationStatus::Suppressed);
        assert_eq!(assessment.decision, Decision::from(NotRecognizedReason::NoFaceDetected));
        assert!(h.notifier.published().is_empty());

        let records = h.sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].face_count, 0);
        assert_eq!(records[0].labels, vec![Label::new("Door", 88.5)]);
        assert_eq!(records[0].invocation, assessment.invocation);
    }

    #[tokio::test]
    async fn test_discovery_mode_policy_failure_still_compares() {
        let h = harness(
            StubBackend::default()
                .with_labels(Ok(vec![Label::new("Weapon", 99.0)]))
                .with_comparison("alice.jpg", Comparison::matches(1)),
            ReferenceSet::new(vec![reference("alice.jpg", 95.0)]),
            LabelPolicy::parse("", "Weapon:50").unwrap(),
            Mode::Discovery,
        );

        let assessment = h.pipeline.process(&image()).await.unwrap();

        assert!(matches!(
            assessment.decision,
            Decision::NotRecognized {
                reason: NotRecognizedReason::PolicyViolation { .. }
            }
        ));
        assert_eq!(h.backend.compare_calls(), 1);
        assert_eq!(assessment.comparisons.len(), 1);
        assert!(h.notifier.published().is_empty());
    }

    #[tokio::test]
    async fn test_discovery_mode_recognized() {
        let h = harness(
            StubBackend::default().with_comparison("alice.jpg", Comparison::matches(1)),
            ReferenceSet::new(vec![reference("alice.jpg", 95.0)]),
            LabelPolicy::default(),
            Mode::Discovery,
        );

        let assessment = h.pipeline.process(&image()).await.unwrap();
        assert!(assessment.decision.is_recognized());
        assert!(h.notifier.published().is_empty());
    }

    #[tokio::test]
    async fn test_detection_failure_is_rejected_without_notification() {
        let h = harness(
            StubBackend::default().with_faces(Err(BackendError::Service("expired token".into()))),
            ReferenceSet::new(vec![reference("alice.jpg", 95.0)]),
            LabelPolicy::default(),
            Mode::Normal,
        );

        let err = h.pipeline.assess(&image()).await.unwrap_err();

        assert!(matches!(err, PipelineError::Detection(_)));
        assert_eq!(
            err.decision(),
            Decision::Rejected {
                reason: RejectReason::DetectionFailed
            }
        );
        assert!(h.notifier.published().is_empty());
    }

    #[tokio::test]
    async fn test_label_failure_is_rejected_without_notification() {
        for mode in [Mode::Normal, Mode::Discovery] {
            let h = harness(
                StubBackend::default().with_labels(Err(BackendError::InvalidResponse("truncated".into()))),
                ReferenceSet::new(vec![reference("alice.jpg", 95.0)]),
                LabelPolicy::default(),
                mode,
            );

            let err = h.pipeline.process(&image()).await.unwrap_err();

            assert!(matches!(err, PipelineError::Labels(_)));
            assert!(h.notifier.published().is_empty());
            assert_eq!(h.backend.compare_calls(), 0);
        }
    }

    #[tokio::test]
    async fn test_assess_reports_negative_decision_as_success() {
        let h = harness(
            StubBackend::default().with_faces(Ok(0)),
            ReferenceSet::default(),
            LabelPolicy::default(),
            Mode::Normal,
        );

        let assessment = h.pipeline.assess(&image()).await.unwrap();

        assert_eq!(assessment.decision, Decision::from(NotRecognizedReason::NoFaceDetected));
        assert_eq!(assessment.notification, NotificationStatus::Sent);
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_change_decision() {
        let h = harness_with_notifier(
            StubBackend::default().with_comparison("alice.jpg", Comparison::matches(1)),
            ReferenceSet::new(vec![reference("alice.jpg", 95.0)]),
            LabelPolicy::default(),
            Mode::Normal,
            RecordingNotifier::failing(),
        );

        let assessment = h.pipeline.process(&image()).await.unwrap();

        assert!(assessment.decision.is_recognized());
        assert_eq!(assessment.notification, NotificationStatus::Failed);
        assert_eq!(h.notifier.published().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_publish_times_out_as_failed() {
        let h = harness_with_notifier(
            StubBackend::default().with_comparison("alice.jpg", Comparison::matches(1)),
            ReferenceSet::new(vec![reference("alice.jpg", 95.0)]),
            LabelPolicy::default(),
            Mode::Normal,
            RecordingNotifier::hanging(),
        );

        let assessment = h.pipeline.process(&image()).await.unwrap();

        assert!(assessment.decision.is_recognized());
        assert_eq!(assessment.notification, NotificationStatus::Failed);
        assert_eq!(h.notifier.published().len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_invocations_are_identical() {
        let h = harness(
            StubBackend::default()
                .with_labels(Ok(vec![Label::new("Person", 97.0)]))
                .with_comparison("bob.jpg", Comparison::matches(1)),
            ReferenceSet::new(vec![reference("alice.jpg", 95.0), reference("bob.jpg", 95.0)]),
            LabelPolicy::parse("Person:90", "").unwrap(),
            Mode::Normal,
        );

        let first = h.pipeline.process(&image()).await.unwrap();
        let second = h.pipeline.process(&image()).await.unwrap();

        assert_eq!(first.decision, second.decision);
        assert_eq!(first.comparisons, second.comparisons);
        assert_ne!(first.invocation, second.invocation);
        let published = h.notifier.published();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0], published[1]);
    }

    #[tokio::test]
    async fn test_reload_swaps_references() {
        let mut h = harness(
            StubBackend::default().with_comparison("bob.jpg", Comparison::matches(1)),
            ReferenceSet::new(vec![reference("alice.jpg", 95.0)]),
            LabelPolicy::default(),
            Mode::Normal,
        );
        assert!(h.pipeline.process(&image()).await.is_err());

        h.pipeline.reload(
            ReferenceSet::new(vec![reference("bob.jpg", 80.0)]),
            LabelPolicy::default(),
        );

        let assessment = h.pipeline.process(&image()).await.unwrap();
        assert!(assessment.decision.is_recognized());
        assert_eq!(h.pipeline.references().len(), 1);
        assert_eq!(h.backend.thresholds().last(), Some(&("bob.jpg".to_string(), 80.0)));
    }
}
