use std::pin::pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::{StreamExt, stream};
use photosync_core::UploadReceipt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::remote::{ProgressFn, RemoteError, UploadFile, Uploader};
use crate::store::Store;

const DEFAULT_CONCURRENCY: usize = 2;
const DEFAULT_CLEAN_DELAY: Duration = Duration::from_millis(1500);

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("an upload is already running")]
    Busy,
    #[error("upload was reset before it finished")]
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadConfig {
    pub concurrency: usize,
    /// Wait before the fully-clean callback fires.
    pub clean_delay: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            clean_delay: DEFAULT_CLEAN_DELAY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskOutcome {
    Pending,
    Uploaded { uploaded: u32, skipped: u32 },
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadTask {
    pub name: String,
    pub percent: u8,
    pub outcome: TaskOutcome,
}

impl UploadTask {
    fn new(name: String) -> Self {
        Self {
            name,
            percent: 0,
            outcome: TaskOutcome::Pending,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.outcome != TaskOutcome::Pending
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UploadSummary {
    pub uploaded: u32,
    pub skipped: u32,
    pub failed: u32,
}

impl UploadSummary {
    fn record(mut self, result: &Result<UploadReceipt, RemoteError>) -> Self {
        match result {
            Ok(receipt) => {
                self.uploaded = self.uploaded.saturating_add(receipt.uploaded);
                self.skipped = self.skipped.saturating_add(receipt.skipped);
            }
            Err(_) => self.failed = self.failed.saturating_add(1),
        }
        self
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadState {
    pub tasks: Vec<UploadTask>,
    pub running: bool,
    pub summary: Option<UploadSummary>,
    pub last_error: Option<String>,
    #[serde(skip)]
    generation: u64,
}

type SummaryCallback = Arc<dyn Fn(UploadSummary) + Send + Sync>;

pub struct UploadPipeline<U: Uploader> {
    uploader: U,
    config: UploadConfig,
    store: Arc<Store<UploadState>>,
    run: Mutex<CancellationToken>,
    on_complete: Option<SummaryCallback>,
    on_clean: Option<SummaryCallback>,
}

impl<U: Uploader> UploadPipeline<U> {
    pub fn new(uploader: U) -> Self {
        Self::with_config(uploader, UploadConfig::default())
    }

    pub fn with_config(uploader: U, config: UploadConfig) -> Self {
        Self {
            uploader,
            config,
            store: Arc::new(Store::default()),
            run: Mutex::new(CancellationToken::new()),
            on_complete: None,
            on_clean: None,
        }
    }

    /// Called once per submission after every file has resolved.
    pub fn on_complete(mut self, callback: impl Fn(UploadSummary) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Arc::new(callback));
        self
    }

    /// Called `clean_delay` after a submission that finished without failures,
    /// unless the pipeline is reset or resubmitted first.
    pub fn on_clean(mut self, callback: impl Fn(UploadSummary) + Send + Sync + 'static) -> Self {
        self.on_clean = Some(Arc::new(callback));
        self
    }

    pub fn snapshot(&self) -> UploadState {
        self.store.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<UploadState> {
        self.store.subscribe()
    }

    /// Uploads every file, continuing past individual failures. Results are folded
    /// in submission order whatever the configured concurrency.
    pub async fn submit(&self, files: Vec<UploadFile>) -> Result<UploadSummary, UploadError> {
        if files.is_empty() {
            return Ok(UploadSummary::default());
        }

        let token = CancellationToken::new();
        let mut generation = 0;
        {
            let mut run = self.run.lock().unwrap_or_else(PoisonError::into_inner);
            let accepted = self.store.modify_if(|state| {
                if state.running {
                    return false;
                }
                state.generation += 1;
                generation = state.generation;
                state.tasks = files
                    .iter()
                    .map(|file| UploadTask::new(file.name.clone()))
                    .collect();
                state.running = true;
                state.summary = None;
                state.last_error = None;
                true
            });
            if !accepted {
                return Err(UploadError::Busy);
            }
            std::mem::replace(&mut *run, token.clone()).cancel();
        }
        let _abandon = Abandon {
            store: &self.store,
            generation,
        };
        info!(files = files.len(), "upload started");

        let concurrency = self.config.concurrency.max(1);
        let mut results = pin!(
            stream::iter(files.into_iter().enumerate())
                .map(|(index, file)| self.upload_one(generation, index, file))
                .buffered(concurrency)
        );

        let mut summary = UploadSummary::default();
        loop {
            let next = tokio::select! {
                _ = token.cancelled() => return Err(UploadError::Reset),
                next = results.next() => next,
            };
            let Some((index, name, result)) = next else {
                break;
            };
            summary = summary.record(&result);
            self.finish_task(generation, index, &name, result);
        }

        let finished = self.store.modify_if(|state| {
            if state.generation != generation {
                return false;
            }
            state.running = false;
            state.summary = Some(summary);
            true
        });
        if !finished {
            return Err(UploadError::Reset);
        }
        info!(
            uploaded = summary.uploaded,
            skipped = summary.skipped,
            failed = summary.failed,
            "upload finished"
        );

        if let Some(callback) = &self.on_complete {
            callback(summary);
        }
        if summary.is_clean()
            && let Some(callback) = &self.on_clean
        {
            let callback = Arc::clone(callback);
            let delay = self.config.clean_delay;
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(delay) => callback(summary),
                }
            });
        }
        Ok(summary)
    }

    /// Clears tasks, summary and error in one step and abandons any running
    /// submission.
    pub fn reset(&self) {
        let mut run = self.run.lock().unwrap_or_else(PoisonError::into_inner);
        run.cancel();
        *run = CancellationToken::new();
        self.store.modify(|state| {
            let generation = state.generation + 1;
            *state = UploadState {
                generation,
                ..UploadState::default()
            };
        });
        debug!("upload pipeline reset");
    }

    async fn upload_one(
        &self,
        generation: u64,
        index: usize,
        file: UploadFile,
    ) -> (usize, String, Result<UploadReceipt, RemoteError>) {
        let store = Arc::clone(&self.store);
        let progress: ProgressFn = Arc::new(move |sent, total| {
            let percent = percent_of(sent, total);
            store.modify_if(|state| {
                if state.generation != generation {
                    return false;
                }
                match state.tasks.get_mut(index) {
                    Some(task) if !task.is_finished() && task.percent < percent => {
                        task.percent = percent;
                        true
                    }
                    _ => false,
                }
            });
        });
        let result = self.uploader.upload(&file, progress).await;
        (index, file.name, result)
    }

    fn finish_task(
        &self,
        generation: u64,
        index: usize,
        name: &str,
        result: Result<UploadReceipt, RemoteError>,
    ) {
        let outcome = match &result {
            Ok(receipt) => TaskOutcome::Uploaded {
                uploaded: receipt.uploaded,
                skipped: receipt.skipped,
            },
            Err(err) => {
                warn!(file = %name, error = %err, "upload failed");
                TaskOutcome::Failed {
                    message: err.message(),
                }
            }
        };
        self.store.modify_if(|state| {
            if state.generation != generation {
                return false;
            }
            let Some(task) = state.tasks.get_mut(index) else {
                return false;
            };
            if task.is_finished() {
                return false;
            }
            if let TaskOutcome::Failed { message } = &outcome {
                state.last_error = Some(format!("{name}: {message}"));
            } else {
                task.percent = 100;
            }
            task.outcome = outcome;
            true
        });
    }
}

/// Releases the pipeline when a submission is dropped before it settles. Tasks
/// that never resolved are marked failed.
struct Abandon<'a> {
    store: &'a Store<UploadState>,
    generation: u64,
}

impl Drop for Abandon<'_> {
    fn drop(&mut self) {
        let generation = self.generation;
        let abandoned = self.store.modify_if(|state| {
            if state.generation != generation || !state.running {
                return false;
            }
            let mut summary = UploadSummary::default();
            for task in &mut state.tasks {
                if !task.is_finished() {
                    task.outcome = TaskOutcome::Failed {
                        message: "upload abandoned".to_string(),
                    };
                }
                match task.outcome {
                    TaskOutcome::Uploaded { uploaded, skipped } => {
                        summary.uploaded = summary.uploaded.saturating_add(uploaded);
                        summary.skipped = summary.skipped.saturating_add(skipped);
                    }
                    _ => summary.failed = summary.failed.saturating_add(1),
                }
            }
            state.running = false;
            state.summary = Some(summary);
            true
        });
        if abandoned {
            warn!("upload abandoned before it finished");
        }
    }
}

fn percent_of(sent: u64, total: Option<u64>) -> u8 {
    match total {
        Some(total) if total > 0 => (sent.min(total).saturating_mul(100) / total) as u8,
        _ => 0,
    }
}
