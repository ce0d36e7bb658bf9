use std::path::Path;

use futures_util::StreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tokio_util::io::ReaderStream;
use tracing::debug;
use url::Url;

use crate::models::{
    BatchDeleteResponse, DeleteTarget, JobSnapshot, Page, Photo, SearchHit, StartJobResponse,
    UploadReceipt,
};

const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// Largest page the listing endpoints accept.
pub const MAX_PAGE_SIZE: u32 = 200;

/// Per-file limit enforced by the upload endpoint.
pub const MAX_UPLOAD_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum PhotoApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("search query cannot be empty")]
    InvalidQuery,
    #[error("{name} exceeds the {limit} byte upload limit ({size} bytes)")]
    TooLarge { name: String, size: u64, limit: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

#[derive(Clone)]
pub struct PhotoClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl PhotoClient {
    pub fn new(token: impl Into<String>) -> Result<Self, PhotoApiError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, PhotoApiError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    pub async fn list_photos(
        &self,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page<Photo>, PhotoApiError> {
        let mut url = self.endpoint("/photos")?;
        append_page_params(&mut url, limit, cursor);
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn search_photos(
        &self,
        query: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page<SearchHit>, PhotoApiError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(PhotoApiError::InvalidQuery);
        }
        let mut url = self.endpoint("/search")?;
        url.query_pairs_mut().append_pair("q", query);
        append_page_params(&mut url, limit, cursor);
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Streams `source` to the upload endpoint, reporting `(bytes_sent, bytes_total)`
    /// as chunks are handed to the transport.
    pub async fn upload_photo<F>(
        &self,
        source: &Path,
        on_progress: F,
    ) -> Result<UploadReceipt, PhotoApiError>
    where
        F: Fn(u64, Option<u64>) + Send + Sync + 'static,
    {
        let name = source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let file = tokio::fs::File::open(source).await?;
        let total = file.metadata().await?.len();
        if total > MAX_UPLOAD_BYTES {
            return Err(PhotoApiError::TooLarge {
                name,
                size: total,
                limit: MAX_UPLOAD_BYTES,
            });
        }

        on_progress(0, Some(total));
        let mut sent = 0u64;
        let stream = ReaderStream::new(file).map(move |chunk| {
            if let Ok(bytes) = &chunk {
                sent = sent.saturating_add(bytes.len() as u64);
                on_progress(sent, Some(total));
            }
            chunk
        });
        let part = Part::stream_with_length(reqwest::Body::wrap_stream(stream), total)
            .file_name(name.clone())
            .mime_str(guess_mime(&name))?;
        let form = Form::new().part("files", part);

        debug!(file = %name, bytes = total, "uploading photo");
        let url = self.endpoint("/photos/upload")?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .multipart(form)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn delete_photos(
        &self,
        target: DeleteTarget,
        ids: &[String],
    ) -> Result<BatchDeleteResponse, PhotoApiError> {
        #[derive(Serialize)]
        struct Body<'a> {
            ids: &'a [String],
        }

        let url = self.endpoint(target.path())?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(&Body { ids })
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn drive_sync_status(&self) -> Result<JobSnapshot, PhotoApiError> {
        let url = self.endpoint("/sync/drive/status")?;
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn start_drive_sync(&self) -> Result<StartJobResponse, PhotoApiError> {
        let url = self.endpoint("/sync/drive/start")?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, PhotoApiError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, PhotoApiError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(PhotoApiError::Api { status, body })
        }
    }
}

impl PhotoApiError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            PhotoApiError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        ) || matches!(self, PhotoApiError::Request(err) if err.is_timeout() || err.is_connect())
    }

    /// Message suitable for showing to a user. API errors prefer the backend's
    /// `detail` field over the raw body.
    pub fn detail(&self) -> String {
        match self {
            PhotoApiError::Api { status, body } => extract_detail(body).unwrap_or_else(|| {
                let trimmed = body.trim();
                if trimmed.is_empty() {
                    status
                        .canonical_reason()
                        .unwrap_or("request failed")
                        .to_string()
                } else {
                    trimmed.to_string()
                }
            }),
            other => other.to_string(),
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

fn extract_detail(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    match value.get("detail")? {
        serde_json::Value::String(message) => Some(message.clone()),
        // Validation errors come back as a list of {loc, msg, type}.
        serde_json::Value::Array(entries) => entries
            .iter()
            .find_map(|entry| entry.get("msg")?.as_str().map(str::to_string)),
        _ => None,
    }
}

fn append_page_params(url: &mut Url, limit: u32, cursor: Option<&str>) {
    let mut query = url.query_pairs_mut();
    query.append_pair("limit", &limit.clamp(1, MAX_PAGE_SIZE).to_string());
    if let Some(cursor) = cursor {
        query.append_pair("cursor", cursor);
    }
}

fn guess_mime(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "heif" => "image/heif",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}
