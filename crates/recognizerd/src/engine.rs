use recognizer_core::{Assessment, Image, LabelPolicy, Mode, Pipeline, PipelineError, ReferenceSet};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("engine task exited")]
    ChannelClosed,
}

/// Snapshot of the engine, published after every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    pub mode: Mode,
    pub references: usize,
    pub min_rules: usize,
    pub max_rules: usize,
    pub processed: u64,
}

impl EngineStatus {
    fn of(pipeline: &Pipeline, processed: u64) -> Self {
        Self {
            mode: pipeline.mode(),
            references: pipeline.references().len(),
            min_rules: pipeline.policy().min_confidence.len(),
            max_rules: pipeline.policy().max_confidence.len(),
            processed,
        }
    }
}

/// Messages sent from the front ends to the engine task.
enum EngineRequest {
    Process {
        image: Image,
        reply: oneshot::Sender<Result<Assessment, PipelineError>>,
    },
    Reload {
        references: ReferenceSet,
        policy: LabelPolicy,
        reply: oneshot::Sender<()>,
    },
}

/// Clone-safe handle to the engine task.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    status: watch::Receiver<EngineStatus>,
}

impl EngineHandle {
    /// Run one pipeline invocation. A normal-mode negative decision comes
    /// back as [`PipelineError::NotRecognized`].
    pub async fn process(&self, image: Image) -> Result<Assessment, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Process {
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    /// Replace the reference set and label policy once the current invocation, if any, is done.
    pub async fn reload(&self, references: ReferenceSet, policy: LabelPolicy) -> Result<(), EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Reload {
                references,
                policy,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    pub fn status(&self) -> EngineStatus {
        self.status.borrow().clone()
    }
}

/// Spawn the engine task that owns `pipeline`.
///
/// Requests are handled one at a time, so invocations never overlap and a
/// reload always lands between two invocations.
pub fn spawn_engine(mut pipeline: Pipeline) -> EngineHandle {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);
    let (status_tx, status) = watch::channel(EngineStatus::of(&pipeline, 0));

    tokio::spawn(async move {
        tracing::info!(mode = ?pipeline.mode(), references = pipeline.references().len(), "engine started");
        let mut processed = 0u64;

        while let Some(req) = rx.recv().await {
            match req {
                EngineRequest::Process { image, reply } => {
                    let result = pipeline.process(&image).await;
                    processed += 1;
                    let _ = reply.send(result);
                }
                EngineRequest::Reload {
                    references,
                    policy,
                    reply,
                } => {
                    pipeline.reload(references, policy);
                    let _ = reply.send(());
                }
            }
            let _ = status_tx.send(EngineStatus::of(&pipeline, processed));
        }

        tracing::info!(processed, "engine exiting");
    });

    EngineHandle { tx, status }
}
