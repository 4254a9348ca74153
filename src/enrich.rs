//! Bounded-concurrency enrichment of persisted products. At most three
//! classifier calls run at once with a 500ms stagger between dispatches;
//! one product's failure never aborts the batch, the cancellation signal
//! always does.

use crate::classifier::{Classifier, ClassifierVerdict};
use crate::models::{EnrichmentCandidate, EnrichmentState, EnrichmentSummary, ProductRow};
use crate::store::SyncStore;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::{Duration, sleep};
use tracing::{info, warn};
use uuid::Uuid;

pub const MAX_CONCURRENT_TASKS: usize = 3;
pub const DISPATCH_STAGGER: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum EnrichError {
    /// The one signal that must propagate through every layer uncaught.
    #[error("job cancelled")]
    Cancelled,
    #[error("store error: {0}")]
    Store(String),
}

/// Shared cooperative-cancellation flag; cheap to clone across tasks.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Injected progress reporting. Returning `false` cancels the batch exactly
/// as the token would.
pub trait ProgressSink: Send + Sync {
    fn report(&self, percent: f32, message: &str) -> bool;
}

pub struct NullSink;

impl ProgressSink for NullSink {
    fn report(&self, _percent: f32, _message: &str) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct EnrichmentTask {
    pub product_id: Uuid,
    pub owner_id: String,
    pub name: String,
    pub images: Vec<String>,
    pub metadata: Option<Value>,
}

/// A product needs enrichment when it has no usable record yet. `done` and
/// unresolved `conflict` records are never re-enriched automatically.
pub fn needs_enrichment(record: &crate::models::EnrichmentRecord) -> bool {
    matches!(
        record.state,
        EnrichmentState::None | EnrichmentState::Pending | EnrichmentState::Failed
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskOutcome {
    Done,
    Conflict,
    Failed,
    Skipped,
}

pub struct EnrichmentRunner {
    store: Arc<dyn SyncStore>,
    classifier: Arc<dyn Classifier>,
    threshold: f32,
    max_concurrency: usize,
    stagger: Duration,
}

impl EnrichmentRunner {
    pub fn new(store: Arc<dyn SyncStore>, classifier: Arc<dyn Classifier>, threshold: f32) -> Self {
        Self {
            store,
            classifier,
            threshold,
            max_concurrency: MAX_CONCURRENT_TASKS,
            stagger: DISPATCH_STAGGER,
        }
    }

    #[cfg(test)]
    fn with_pacing(mut self, max_concurrency: usize, stagger: Duration) -> Self {
        self.max_concurrency = max_concurrency;
        self.stagger = stagger;
        self
    }

    /// Run a batch to completion or cancellation. Completed task results are
    /// committed to storage as they land and survive an abort.
    pub async fn run_batch(
        &self,
        tasks: Vec<EnrichmentTask>,
        token: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> EnrichmentSummary {
        let total = tasks.len();
        let mut summary = EnrichmentSummary::default();
        if total == 0 {
            return summary;
        }

        let mut queue = tasks.into_iter();
        let mut join_set: JoinSet<Result<TaskOutcome, EnrichError>> = JoinSet::new();
        let mut completed = 0usize;
        let mut dispatched = 0usize;

        loop {
            // top up the worker pool, pacing each dispatch
            while join_set.len() < self.max_concurrency && !token.is_cancelled() {
                let Some(task) = queue.next() else { break };
                if dispatched > 0 {
                    sleep(self.stagger).await;
                }
                dispatched += 1;
                let store = self.store.clone();
                let classifier = self.classifier.clone();
                let threshold = self.threshold;
                let task_token = token.clone();
                join_set.spawn(async move {
                    run_task(store, classifier, threshold, task, task_token).await
                });
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            completed += 1;

            match joined {
                Ok(Ok(TaskOutcome::Done)) => summary.done += 1,
                Ok(Ok(TaskOutcome::Conflict)) => summary.conflicts += 1,
                Ok(Ok(TaskOutcome::Failed)) => summary.failed += 1,
                Ok(Ok(TaskOutcome::Skipped)) => summary.skipped += 1,
                Ok(Err(EnrichError::Cancelled)) => {
                    token.cancel();
                    summary.aborted = true;
                    continue;
                }
                Ok(Err(err)) => {
                    warn!(target = "parcelsync.enrich", error = %err, "task errored");
                    summary.failed += 1;
                }
                Err(join_err) => {
                    warn!(target = "parcelsync.enrich", error = %join_err, "task panicked");
                    summary.failed += 1;
                }
            }

            let percent = (completed as f32 / total as f32) * 100.0;
            let message = format!("enriched {completed}/{total}");
            if !sink.report(percent, &message) {
                token.cancel();
                summary.aborted = true;
            }
        }

        if token.is_cancelled() {
            summary.aborted = true;
        }
        info!(
            target = "parcelsync.enrich",
            done = summary.done,
            conflicts = summary.conflicts,
            failed = summary.failed,
            skipped = summary.skipped,
            aborted = summary.aborted,
            "batch finished"
        );
        summary
    }
}

async fn run_task(
    store: Arc<dyn SyncStore>,
    classifier: Arc<dyn Classifier>,
    threshold: f32,
    task: EnrichmentTask,
    token: CancelToken,
) -> Result<TaskOutcome, EnrichError> {
    if token.is_cancelled() {
        return Err(EnrichError::Cancelled);
    }

    // the product may have been deleted since reconciliation queued it
    let Some(mut row) = store
        .find_product_by_id(task.product_id)
        .await
        .map_err(|err| EnrichError::Store(err.to_string()))?
    else {
        return Ok(TaskOutcome::Skipped);
    };

    let outcome = match classifier
        .enrich(&task.name, &task.images, task.metadata.as_ref())
        .await
    {
        Ok(verdict) if verdict.confidence < threshold => {
            record_conflict(&mut row, &verdict);
            TaskOutcome::Conflict
        }
        Ok(verdict) => {
            apply_verdict(&mut row, &verdict);
            TaskOutcome::Done
        }
        Err(err) => {
            warn!(
                target = "parcelsync.enrich",
                owner_id = %task.owner_id,
                product = %task.product_id,
                error = %err,
                "classification failed"
            );
            row.enrichment.state = EnrichmentState::Failed;
            row.enrichment.error = Some(err.to_string());
            row.enrichment.updated_at = Some(Utc::now());
            TaskOutcome::Failed
        }
    };

    store
        .update_product(row)
        .await
        .map_err(|err| EnrichError::Store(err.to_string()))?;
    Ok(outcome)
}

/// Low confidence: record exactly one ranked candidate for human review and
/// leave the user-visible fields alone.
fn record_conflict(row: &mut ProductRow, verdict: &ClassifierVerdict) {
    row.enrichment.state = EnrichmentState::Conflict;
    row.enrichment.candidates = vec![EnrichmentCandidate {
        provisional_id: Uuid::new_v4().to_string(),
        confidence: verdict.confidence,
        name: verdict.name.clone(),
        brand: verdict.brand.clone(),
        category: verdict.category.clone(),
    }];
    row.enrichment.model = verdict.model.clone();
    row.enrichment.source = Some(verdict.source.clone());
    row.enrichment.error = None;
    row.enrichment.updated_at = Some(Utc::now());
}

/// High confidence: overwrite only the fields the classifier returned.
fn apply_verdict(row: &mut ProductRow, verdict: &ClassifierVerdict) {
    if let Some(name) = &verdict.name {
        row.name = name.clone();
    }
    if let Some(brand) = &verdict.brand {
        row.brand = Some(brand.clone());
    }
    if let Some(category) = &verdict.category {
        row.category = Some(category.clone());
    }
    if let Some(subcategory) = &verdict.subcategory {
        row.subcategory = Some(subcategory.clone());
    }
    if let Some(url) = &verdict.url {
        row.url = Some(url.clone());
    }
    if let Some(description) = &verdict.description {
        row.description = Some(description.clone());
    }
    row.enrichment.state = EnrichmentState::Done;
    row.enrichment.candidates.clear();
    row.enrichment.model = verdict.model.clone();
    row.enrichment.source = Some(verdict.source.clone());
    row.enrichment.error = None;
    row.enrichment.updated_at = Some(Utc::now());
    row.updated_at = Utc::now();
}
