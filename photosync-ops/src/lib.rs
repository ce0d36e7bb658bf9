mod batch;
mod config;
mod pager;
mod poller;
mod remote;
mod store;
mod upload;

pub use batch::{BatchError, BatchExecutor, BatchOutcome, BatchProgress};
pub use config::{ConfigError, OpsConfig};
pub use pager::{CursorPager, CursorState, LoadOutcome, PagerError, PagerState};
pub use poller::{
    JobPoller, PollEvent, PollSchedule, PollState, PollerError, PollerView, StartOutcome,
};
pub use remote::{
    BatchMutator, JobSource, Keyed, PageSource, PhotoListing, PhotoSearch, ProgressFn,
    RemoteError, UploadFile, Uploader,
};
pub use store::Store;
pub use upload::{
    TaskOutcome, UploadConfig, UploadError, UploadPipeline, UploadState, UploadSummary,
    UploadTask,
};
