use std::mem;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::types::{BatchOutcome, FieldUpdate, PendingMutation, RecordRef};
use crate::CommandResult;

/// Hard per-batch limit of the document store.
pub(crate) const MAX_BATCH_CAPACITY: usize = 500;

/// A sealed group of mutations committed as one atomic unit.
///
/// Batches are only handed out after the builder has sealed them, and expose
/// no way to add entries afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatch {
    index: usize,
    entries: Vec<PendingMutation>,
}

impl MutationBatch {
    fn with_capacity(index: usize, capacity: usize) -> Self {
        Self {
            index,
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn entries(&self) -> &[PendingMutation] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Destination for sealed batches.
///
/// A commit must be all-or-nothing: either every entry is applied or the batch
/// reports an error and none are. Implementations are called concurrently.
pub trait MutationSink: Send + Sync + 'static {
    fn commit_batch(&self, batch: &MutationBatch) -> CommandResult<()>;
}

/// Folds an ordered mutation stream into capacity-bounded batches.
///
/// The current batch rolls over the moment it reaches capacity, and whatever
/// remains at the end of the stream (possibly nothing) becomes the last batch.
pub(crate) struct BatchBuilder {
    capacity: usize,
    current: MutationBatch,
    sealed: Vec<MutationBatch>,
}

impl BatchBuilder {
    pub(crate) fn new(capacity: usize) -> CommandResult<Self> {
        if !(1..=MAX_BATCH_CAPACITY).contains(&capacity) {
            return Err(CoreError::Configuration(format!(
                "batch capacity must be between 1 and {MAX_BATCH_CAPACITY}, got {capacity}"
            )));
        }
        Ok(Self {
            capacity,
            current: MutationBatch::with_capacity(0, capacity),
            sealed: Vec::new(),
        })
    }

    pub(crate) fn push(&mut self, reference: RecordRef, update: FieldUpdate) {
        self.current.entries.push(PendingMutation { reference, update });
        debug_assert!(self.current.len() <= self.capacity);

        if self.current.len() == self.capacity {
            let next = MutationBatch::with_capacity(self.current.index + 1, self.capacity);
            let full = mem::replace(&mut self.current, next);
            self.sealed.push(full);
        }
    }

    pub(crate) fn finish(mut self) -> Vec<MutationBatch> {
        self.sealed.push(self.current);
        self.sealed
    }
}

pub(crate) fn partition_mutations<I>(
    mutations: I,
    capacity: usize,
) -> CommandResult<Vec<MutationBatch>>
where
    I: IntoIterator<Item = PendingMutation>,
{
    let mut builder = BatchBuilder::new(capacity)?;
    for mutation in mutations {
        builder.push(mutation.reference, mutation.update);
    }
    Ok(builder.finish())
}

/// Commits every batch independently and waits for all of them.
///
/// At most `max_concurrent` commits run at a time. `on_outcome` sees each
/// outcome as it completes; the returned list is in batch order. One failed
/// batch never cancels or rolls back another.
pub(crate) async fn commit_all<S, F>(
    sink: Arc<S>,
    batches: Vec<MutationBatch>,
    max_concurrent: usize,
    mut on_outcome: F,
) -> Vec<BatchOutcome>
where
    S: MutationSink,
    F: FnMut(&BatchOutcome),
{
    let permits = Arc::new(Semaphore::new(max_concurrent.max(1)));

    let mut commits = batches
        .into_iter()
        .map(|batch| {
            let sink = Arc::clone(&sink);
            let permits = Arc::clone(&permits);
            async move {
                let batch_index = batch.index();
                let entry_count = batch.len();

                let result = match permits.acquire_owned().await {
                    Ok(permit) => crate::async_runtime::spawn_blocking(move || {
                        let _permit = permit;
                        sink.commit_batch(&batch)
                    })
                    .await
                    .map_err(|error| CoreError::Task(format!("Batch commit task failed: {error}")))
                    .and_then(|result| result),
                    Err(error) => Err(CoreError::Task(format!(
                        "Could not acquire commit slot: {error}"
                    ))),
                };

                match result {
                    Ok(()) => {
                        debug!(batch_index, entry_count, "batch committed");
                        BatchOutcome {
                            batch_index,
                            entry_count,
                            error: None,
                        }
                    }
                    Err(error) => {
                        warn!(batch_index, entry_count, %error, "batch commit failed");
                        BatchOutcome {
                            batch_index,
                            entry_count,
                            error: Some(error.to_string()),
                        }
                    }
                }
            }
        })
        .collect::<FuturesUnordered<_>>();

    let mut outcomes = Vec::with_capacity(commits.len());
    while let Some(outcome) = commits.next().await {
        on_outcome(&outcome);
        outcomes.push(outcome);
    }
    outcomes.sort_by_key(|outcome| outcome.batch_index);
    outcomes
}
