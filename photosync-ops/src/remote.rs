use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use photosync_core::{
    DeleteTarget, JobSnapshot, Page, Photo, PhotoApiError, PhotoClient, SearchHit,
    StartJobResponse, UploadReceipt,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error(transparent)]
    Api(#[from] PhotoApiError),
    #[error("{0}")]
    Backend(String),
}

impl RemoteError {
    /// Human readable message for the last-error slot of a view.
    pub fn message(&self) -> String {
        match self {
            RemoteError::Api(err) => err.detail(),
            RemoteError::Backend(message) => message.clone(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Api(err) => err.is_retryable(),
            RemoteError::Backend(_) => true,
        }
    }
}

/// Stable server-side identity of a listed item.
pub trait Keyed {
    fn key(&self) -> &str;
}

impl Keyed for Photo {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Keyed for SearchHit {
    fn key(&self) -> &str {
        &self.id
    }
}

pub trait PageSource: Send + Sync {
    type Item: Keyed + Clone + Send + Sync + 'static;
    type Query: Clone + Send + Sync + 'static;

    fn fetch_page(
        &self,
        query: &Self::Query,
        cursor: Option<&str>,
        page_size: u32,
    ) -> impl Future<Output = Result<Page<Self::Item>, RemoteError>> + Send;
}

pub type ProgressFn = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub name: String,
    pub path: PathBuf,
}

impl UploadFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self { name, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub trait Uploader: Send + Sync {
    fn upload(
        &self,
        file: &UploadFile,
        on_progress: ProgressFn,
    ) -> impl Future<Output = Result<UploadReceipt, RemoteError>> + Send;
}

pub trait BatchMutator: Send + Sync {
    /// Applies the mutation to `ids` and returns how many succeeded.
    fn mutate_batch(
        &self,
        target: DeleteTarget,
        ids: &[String],
    ) -> impl Future<Output = Result<u32, RemoteError>> + Send;
}

pub trait JobSource: Send + Sync + 'static {
    fn job_status(&self) -> impl Future<Output = Result<JobSnapshot, RemoteError>> + Send;

    fn start_job(&self) -> impl Future<Output = Result<StartJobResponse, RemoteError>> + Send;
}

/// Library listing, newest first.
#[derive(Clone)]
pub struct PhotoListing(pub PhotoClient);

impl PageSource for PhotoListing {
    type Item = Photo;
    type Query = ();

    async fn fetch_page(
        &self,
        _query: &(),
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<Page<Photo>, RemoteError> {
        Ok(self.0.list_photos(page_size, cursor).await?)
    }
}

/// Ranked search results for a text query.
#[derive(Clone)]
pub struct PhotoSearch(pub PhotoClient);

impl PageSource for PhotoSearch {
    type Item = SearchHit;
    type Query = String;

    async fn fetch_page(
        &self,
        query: &String,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<Page<SearchHit>, RemoteError> {
        Ok(self.0.search_photos(query, page_size, cursor).await?)
    }
}

impl Uploader for PhotoClient {
    async fn upload(
        &self,
        file: &UploadFile,
        on_progress: ProgressFn,
    ) -> Result<UploadReceipt, RemoteError> {
        Ok(self
            .upload_photo(file.path(), move |sent, total| on_progress(sent, total))
            .await?)
    }
}

impl BatchMutator for PhotoClient {
    async fn mutate_batch(&self, target: DeleteTarget, ids: &[String]) -> Result<u32, RemoteError> {
        Ok(self.delete_photos(target, ids).await?.deleted)
    }
}

impl JobSource for PhotoClient {
    async fn job_status(&self) -> Result<JobSnapshot, RemoteError> {
        Ok(self.drive_sync_status().await?)
    }

    async fn start_job(&self) -> Result<StartJobResponse, RemoteError> {
        Ok(self.start_drive_sync().await?)
    }
}
