mod client;
mod models;

pub use client::{ApiErrorClass, MAX_PAGE_SIZE, MAX_UPLOAD_BYTES, PhotoApiError, PhotoClient};
pub use models::{
    BatchDeleteResponse, DeleteTarget, FailureEntry, JobPhase, JobSnapshot, JobStatus, Page,
    Photo, SearchHit, StartJobResponse, UploadReceipt,
};
