//! File-watcher front end.

use crate::engine::{EngineError, EngineHandle};
use recognizer_io::FileWatcher;

/// Feed every file dropped at the watched path to the engine.
///
/// Bad drops and failed invocations are logged and skipped. Returns only if
/// the engine goes away.
pub async fn run(watcher: FileWatcher, engine: EngineHandle) {
    tracing::info!(path = %watcher.path().display(), "watching for target image");

    loop {
        let image = match watcher.next_image().await {
            Ok(image) => image,
            Err(err) => {
                tracing::error!(error = %err, "skipping target image");
                continue;
            }
        };

        match engine.process(image).await {
            Ok(assessment) => {
                tracing::info!(
                    invocation = %assessment.invocation,
                    decision = ?assessment.decision,
                    "processed target image"
                );
            }
            Err(EngineError::ChannelClosed) => {
                tracing::error!("engine is gone, stopping file watcher");
                return;
            }
            Err(err) => tracing::error!(error = %err, "error processing target image"),
        }
    }
}
