use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use photosync_core::JobSnapshot;
use thiserror::Error;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::remote::{JobSource, RemoteError};
use crate::store::Store;

const DEFAULT_ACTIVE_INTERVAL: Duration = Duration::from_secs(3);
const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum PollerError {
    #[error("status poll failed: {0}")]
    Status(#[source] RemoteError),
    #[error("could not start the job: {0}")]
    Start(#[source] RemoteError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    pub active: Duration,
    pub idle: Duration,
}

impl PollSchedule {
    pub fn new(active: Duration, idle: Duration) -> Self {
        Self { active, idle }
    }

    /// Short interval while the job is working, long otherwise. With nothing
    /// fetched yet the job is assumed idle.
    pub fn interval_for(&self, snapshot: Option<&JobSnapshot>) -> Duration {
        match snapshot {
            Some(snapshot) if snapshot.is_active() => self.active,
            _ => self.idle,
        }
    }
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self::new(DEFAULT_ACTIVE_INTERVAL, DEFAULT_IDLE_INTERVAL)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PollState {
    #[default]
    Stopped,
    Waiting,
    InFlight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvent {
    Start,
    Stop,
    /// The wait interval elapsed.
    Due,
    /// A manual sync asked for an early poll.
    Forced,
    /// The outstanding poll finished, successfully or not.
    Settled,
}

impl PollState {
    pub fn on(self, event: PollEvent) -> PollState {
        match (self, event) {
            (_, PollEvent::Stop) => PollState::Stopped,
            (PollState::Stopped, PollEvent::Start) => PollState::InFlight,
            (PollState::Waiting, PollEvent::Due | PollEvent::Forced) => PollState::InFlight,
            (PollState::InFlight, PollEvent::Settled) => PollState::Waiting,
            (state, _) => state,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollerView {
    pub snapshot: Option<JobSnapshot>,
    pub state: PollState,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub next_interval: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// The backend declined, typically because a sync is already running.
    NotStarted { message: Option<String> },
    /// Another `sync_now` call is still waiting for the backend.
    AlreadyRequested,
}

struct Control {
    epoch: u64,
    run: Option<RunHandle>,
}

/// Owned by one `start()`..`stop()` span. A wake-up sent to a stopped run dies
/// with it.
struct RunHandle {
    token: CancellationToken,
    wake: Arc<Notify>,
}

struct Shared<J> {
    source: J,
    schedule: PollSchedule,
    store: Store<PollerView>,
    control: Mutex<Control>,
    starting: AtomicBool,
}

impl<J: JobSource> Shared<J> {
    fn control(&self) -> std::sync::MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn epoch(&self) -> u64 {
        self.control().epoch
    }

    /// Commits a poll result unless `stop()` ran since it was issued. Returns the
    /// next wait interval, or `None` when the result was discarded.
    fn record(
        &self,
        epoch: u64,
        result: &Result<JobSnapshot, RemoteError>,
        settle: bool,
    ) -> Option<Duration> {
        let control = self.control();
        if control.epoch != epoch {
            debug!("discarding poll result from a stopped run");
            return None;
        }
        let mut interval = self.schedule.idle;
        self.store.modify(|view| {
            match result {
                Ok(snapshot) => {
                    view.snapshot = Some(snapshot.clone());
                    view.last_error = None;
                    view.consecutive_failures = 0;
                }
                Err(err) => {
                    view.last_error = Some(err.message());
                    view.consecutive_failures += 1;
                }
            }
            interval = self.schedule.interval_for(view.snapshot.as_ref());
            if settle {
                view.state = view.state.on(PollEvent::Settled);
            }
            if view.state != PollState::Stopped {
                view.next_interval = Some(interval);
            }
        });
        drop(control);

        match result {
            Ok(snapshot) => debug!(
                phase = ?snapshot.phase,
                processed = snapshot.processed,
                total = snapshot.total,
                next_secs = interval.as_secs_f32(),
                "job status polled"
            ),
            Err(err) => warn!(
                error = %err,
                failures = self.store.read(|view| view.consecutive_failures),
                "job status poll failed"
            ),
        }
        Some(interval)
    }

    /// Applies a loop transition if the run is still current.
    fn advance(&self, epoch: u64, event: PollEvent) -> bool {
        let control = self.control();
        if control.epoch != epoch {
            return false;
        }
        self.store.modify(|view| view.state = view.state.on(event));
        true
    }
}

async fn run<J: JobSource>(
    shared: Arc<Shared<J>>,
    epoch: u64,
    token: CancellationToken,
    wake: Arc<Notify>,
) {
    loop {
        let result = tokio::select! {
            _ = token.cancelled() => break,
            result = shared.source.job_status() => result,
        };
        let Some(interval) = shared.record(epoch, &result, true) else {
            break;
        };
        let event = tokio::select! {
            _ = token.cancelled() => break,
            _ = wake.notified() => PollEvent::Forced,
            _ = tokio::time::sleep(interval) => PollEvent::Due,
        };
        if !shared.advance(epoch, event) {
            break;
        }
    }
    debug!(epoch, "poll loop exited");
}

/// Fetches job status on an adaptive schedule and publishes each snapshot.
pub struct JobPoller<J: JobSource> {
    inner: Arc<Shared<J>>,
}

impl<J: JobSource> JobPoller<J> {
    pub fn new(source: J, schedule: PollSchedule) -> Self {
        Self {
            inner: Arc::new(Shared {
                source,
                schedule,
                store: Store::default(),
                control: Mutex::new(Control {
                    epoch: 0,
                    run: None,
                }),
                starting: AtomicBool::new(false),
            }),
        }
    }

    pub fn source(&self) -> &J {
        &self.inner.source
    }

    pub fn view(&self) -> PollerView {
        self.inner.store.snapshot()
    }

    pub fn snapshot(&self) -> Option<JobSnapshot> {
        self.inner.store.read(|view| view.snapshot.clone())
    }

    pub fn state(&self) -> PollState {
        self.inner.store.read(|view| view.state)
    }

    pub fn subscribe(&self) -> watch::Receiver<PollerView> {
        self.inner.store.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.inner.control().run.is_some()
    }

    /// Polls immediately, then keeps polling until `stop()`. Calling it on a
    /// running poller does nothing.
    pub fn start(&self) {
        let mut control = self.inner.control();
        if control.run.is_some() {
            return;
        }
        control.epoch += 1;
        let epoch = control.epoch;
        let token = CancellationToken::new();
        let wake = Arc::new(Notify::new());
        control.run = Some(RunHandle {
            token: token.clone(),
            wake: Arc::clone(&wake),
        });
        self.inner
            .store
            .modify(|view| view.state = view.state.on(PollEvent::Start));
        drop(control);

        info!(epoch, "job status polling started");
        tokio::spawn(run(Arc::clone(&self.inner), epoch, token, wake));
    }

    /// Cancels the pending wait and any outstanding poll. Results of polls issued
    /// before this call are never applied.
    pub fn stop(&self) {
        let mut control = self.inner.control();
        control.epoch += 1;
        let run = control.run.take();
        self.inner.store.modify_if(|view| {
            let changed = view.state != PollState::Stopped || view.next_interval.is_some();
            view.state = view.state.on(PollEvent::Stop);
            view.next_interval = None;
            changed
        });
        drop(control);

        if let Some(run) = run {
            run.token.cancel();
            info!("job status polling stopped");
        }
    }

    /// One poll outside the schedule.
    pub async fn refresh(&self) -> Result<JobSnapshot, PollerError> {
        let epoch = self.inner.epoch();
        let result = self.inner.source.job_status().await;
        self.inner.record(epoch, &result, false);
        result.map_err(PollerError::Status)
    }

    /// Asks the backend to start the job, then polls right away so the view
    /// reflects it.
    pub async fn sync_now(&self) -> Result<StartOutcome, PollerError> {
        if self.inner.starting.swap(true, Ordering::AcqRel) {
            debug!("sync already requested");
            return Ok(StartOutcome::AlreadyRequested);
        }
        let _starting = StartingGuard(&self.inner.starting);

        let response = self
            .inner
            .source
            .start_job()
            .await
            .map_err(PollerError::Start)?;
        if response.started {
            info!("job started");
        } else {
            info!(message = ?response.message, "job not started");
        }

        let wake = self
            .inner
            .control()
            .run
            .as_ref()
            .map(|run| Arc::clone(&run.wake));
        if let Some(wake) = wake {
            wake.notify_one();
        } else if let Err(err) = self.refresh().await {
            warn!(error = %err, "status refresh after sync request failed");
        }

        Ok(if response.started {
            StartOutcome::Started
        } else {
            StartOutcome::NotStarted {
                message: response.message,
            }
        })
    }
}

impl<J: JobSource> Drop for JobPoller<J> {
    fn drop(&mut self) {
        self.stop();
    }
}

struct StartingGuard<'a>(&'a AtomicBool);

impl Drop for StartingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
