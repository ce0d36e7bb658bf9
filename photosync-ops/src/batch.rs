use std::collections::HashSet;
use std::sync::Arc;

use futures_util::{StreamExt, stream};
use photosync_core::DeleteTarget;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::remote::{BatchMutator, RemoteError};
use crate::store::Store;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("a batch operation is already running")]
    Busy,
    #[error("chunk size must be at least 1")]
    InvalidChunkSize,
}

/// Running tally of a batch operation. `processed == succeeded + failed` holds
/// for every published value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub running: bool,
    pub last_error: Option<String>,
}

impl BatchProgress {
    pub fn start(total: usize) -> Self {
        Self {
            total,
            running: total > 0,
            ..Self::default()
        }
    }

    /// Folds one finished chunk into the tally. `reported` is the server's
    /// success count, or the error when the whole request failed.
    pub fn after_chunk(&self, chunk_len: usize, reported: Result<u32, &RemoteError>) -> Self {
        let len = chunk_len.min(self.total.saturating_sub(self.processed));
        let (ok, last_error) = match reported {
            Ok(count) => ((count as usize).min(len), self.last_error.clone()),
            Err(err) => (0, Some(err.message())),
        };
        let processed = self.processed.saturating_add(len);
        Self {
            total: self.total,
            processed,
            succeeded: self.succeeded + ok,
            failed: self.failed + (len - ok),
            running: processed < self.total,
            last_error,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.processed == self.total
    }

    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        (self.processed * 100 / self.total) as u8
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub deleted: usize,
    pub total: usize,
    pub failed: usize,
}

impl From<&BatchProgress> for BatchOutcome {
    fn from(progress: &BatchProgress) -> Self {
        Self {
            deleted: progress.succeeded,
            total: progress.total,
            failed: progress.failed,
        }
    }
}

type InvalidateHook = Arc<dyn Fn(DeleteTarget) + Send + Sync>;

pub struct BatchExecutor<M: BatchMutator> {
    mutator: M,
    target: DeleteTarget,
    store: Store<BatchProgress>,
    invalidate: Vec<InvalidateHook>,
}

impl<M: BatchMutator> BatchExecutor<M> {
    pub fn new(mutator: M, target: DeleteTarget) -> Self {
        Self {
            mutator,
            target,
            store: Store::default(),
            invalidate: Vec::new(),
        }
    }

    /// Registers a view to drop when an operation finishes.
    pub fn with_invalidation(
        mut self,
        hook: impl Fn(DeleteTarget) + Send + Sync + 'static,
    ) -> Self {
        self.invalidate.push(Arc::new(hook));
        self
    }

    pub fn progress(&self) -> BatchProgress {
        self.store.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<BatchProgress> {
        self.store.subscribe()
    }

    /// Sends `ids` in consecutive chunks of at most `chunk_size`, one request at a
    /// time, publishing the tally after each chunk. A failed request counts its
    /// whole chunk as failed and the operation moves on.
    pub async fn execute(
        &self,
        ids: impl IntoIterator<Item = String>,
        chunk_size: usize,
    ) -> Result<BatchOutcome, BatchError> {
        if chunk_size == 0 {
            return Err(BatchError::InvalidChunkSize);
        }
        let mut seen = HashSet::new();
        let ids: Vec<String> = ids
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .collect();

        let initial = BatchProgress::start(ids.len());
        let claimed = self.store.modify_if(|progress| {
            if progress.running {
                return false;
            }
            *progress = initial.clone();
            true
        });
        if !claimed {
            return Err(BatchError::Busy);
        }
        if ids.is_empty() {
            return Ok(BatchOutcome::default());
        }
        let mut running = Running {
            executor: self,
            armed: true,
        };
        info!(
            kind = ?self.target,
            total = ids.len(),
            chunk_size,
            "batch operation started"
        );

        let done = stream::iter(ids.chunks(chunk_size))
            .fold(initial, |progress, chunk| async move {
                let result = self.mutator.mutate_batch(self.target, chunk).await;
                if let Err(err) = &result {
                    warn!(chunk = chunk.len(), error = %err, "batch chunk failed");
                }
                let next = progress.after_chunk(chunk.len(), result.as_ref().copied());
                self.store.replace(next.clone());
                next
            })
            .await;
        running.armed = false;

        info!(
            deleted = done.succeeded,
            failed = done.failed,
            "batch operation finished"
        );
        self.invalidate_views();
        Ok(BatchOutcome::from(&done))
    }

    fn invalidate_views(&self) {
        for hook in &self.invalidate {
            hook(self.target);
        }
    }
}

/// Ends an operation whose future was dropped between chunks. Chunks already
/// sent may have changed server state, so views are invalidated as well.
struct Running<'a, M: BatchMutator> {
    executor: &'a BatchExecutor<M>,
    armed: bool,
}

impl<M: BatchMutator> Drop for Running<'_, M> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.executor.store.modify_if(|progress| {
            if !progress.running {
                return false;
            }
            progress.running = false;
            true
        });
        let progress = self.executor.progress();
        warn!(
            processed = progress.processed,
            total = progress.total,
            "batch operation abandoned"
        );
        self.executor.invalidate_views();
    }
}
