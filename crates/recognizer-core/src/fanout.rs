//! Concurrent comparison of one source image against every reference.
//!
//! One task per reference, all spawned before any is awaited. The engine
//! always joins every task; a match does not cancel the rest. The first task
//! to complete with a match claims the attribution slot, which can be written
//! exactly once. A failing comparison counts as a non-match for its reference
//! only.

use crate::backend::{with_deadline, RecognitionBackend};
use crate::types::{ComparisonOutcome, Image, ReferenceSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::Instrument;

/// Aggregate result of a fan-out.
#[derive(Debug, Clone, PartialEq)]
pub struct FanOutVerdict {
    /// Reference credited with the match, if any task matched.
    pub winner: Option<String>,
    /// One outcome per reference, in reference-set order.
    pub outcomes: Vec<ComparisonOutcome>,
    /// Successful attributions. At most one.
    pub claims: usize,
}

impl FanOutVerdict {
    pub fn recognized(&self) -> bool {
        self.winner.is_some()
    }

    pub fn matched_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.matched).count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.failed).count()
    }
}

/// State shared by all comparison tasks of one fan-out.
#[derive(Default)]
struct MatchSlot {
    winner: OnceLock<String>,
    completed: AtomicUsize,
    claims: AtomicUsize,
}

impl MatchSlot {
    /// Record `reference` as the winner. Returns false if another task got there first.
    fn claim(&self, reference: &str) -> bool {
        let won = self.winner.set(reference.to_string()).is_ok();
        if won {
            self.claims.fetch_add(1, Ordering::SeqCst);
        }
        won
    }
}

/// Compare `source` against every entry of `references` concurrently.
///
/// Each comparison is bounded by `deadline`.
pub async fn compare_all(
    backend: Arc<dyn RecognitionBackend>,
    source: &Image,
    references: &ReferenceSet,
    deadline: Duration,
) -> FanOutVerdict {
    let slot = Arc::new(MatchSlot::default());
    let mut tasks = JoinSet::new();

    for (index, reference) in references.entries().iter().cloned().enumerate() {
        let backend = Arc::clone(&backend);
        let source = source.clone();
        let slot = Arc::clone(&slot);
        let span = tracing::info_span!("compare", reference = %reference.id);

        tasks.spawn(
            async move {
                let result = with_deadline(
                    deadline,
                    backend.compare_faces(&source, &reference.image, reference.threshold),
                )
                .await;
                slot.completed.fetch_add(1, Ordering::SeqCst);

                let outcome = match result {
                    Ok(matches) if !matches.is_empty() => {
                        if slot.claim(&reference.id) {
                            tracing::info!(matches = matches.len(), "recognized snapshot as {}", reference.id);
                        } else {
                            tracing::debug!(
                                matches = matches.len(),
                                "matched after attribution was already claimed"
                            );
                        }
                        ComparisonOutcome {
                            reference: reference.id,
                            matched: true,
                            failed: false,
                        }
                    }
                    Ok(_) => {
                        tracing::warn!("did not recognize the caller as {}", reference.id);
                        ComparisonOutcome {
                            reference: reference.id,
                            matched: false,
                            failed: false,
                        }
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "comparing faces failed");
                        ComparisonOutcome {
                            reference: reference.id,
                            matched: false,
                            failed: true,
                        }
                    }
                };
                (index, outcome)
            }
            .instrument(span),
        );
    }

    let mut outcomes: Vec<Option<ComparisonOutcome>> = vec![None; references.len()];
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, outcome)) => outcomes[index] = Some(outcome),
            Err(err) => tracing::error!(error = %err, "comparison task aborted"),
        }
    }

    tracing::debug!(
        issued = references.len(),
        completed = slot.completed.load(Ordering::SeqCst),
        claims = slot.claims.load(Ordering::SeqCst),
        "comparison fan-out joined"
    );

    // A task that panicked never reported back; count it as a failed non-match.
    let outcomes = outcomes
        .into_iter()
        .zip(references.entries())
        .map(|(outcome, reference)| {
            outcome.unwrap_or_else(|| ComparisonOutcome {
                reference: reference.id.clone(),
                matched: false,
                failed: true,
            })
        })
        .collect();

    FanOutVerdict {
        winner: slot.winner.get().cloned(),
        outcomes,
        claims: slot.claims.load(Ordering::SeqCst),
    }
}
