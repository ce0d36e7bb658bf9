use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// One page of a cursor-paginated listing. An absent `next_cursor` means the
/// listing is exhausted.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct Page<T> {
    #[serde(default)]
    pub items: Vec<T>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Photo {
    pub id: String,
    #[serde(default)]
    pub thumbnail_key: Option<String>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub taken_at: Option<String>,
    #[serde(default)]
    pub uploaded_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SearchHit {
    pub id: String,
    #[serde(default)]
    pub score: Option<f32>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub taken_at: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct UploadReceipt {
    #[serde(default)]
    pub uploaded: u32,
    #[serde(default)]
    pub skipped: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeleteTarget {
    Photos,
    Duplicates,
}

impl DeleteTarget {
    pub(crate) fn path(self) -> &'static str {
        match self {
            DeleteTarget::Photos => "/photos/batch-delete",
            DeleteTarget::Duplicates => "/photos/duplicates/delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct BatchDeleteResponse {
    pub deleted: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StartJobResponse {
    pub started: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Idle,
    Running,
    Error,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    #[default]
    Idle,
    Auth,
    Listing,
    Downloading,
    Extracting,
    Importing,
    Done,
    Error,
    #[serde(other)]
    Unknown,
}

impl JobPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobPhase::Idle | JobPhase::Done | JobPhase::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FailureEntry {
    pub filename: String,
    #[serde(default)]
    pub error: Option<String>,
}

/// Point-in-time view of the Drive sync job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct JobSnapshot {
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub phase: JobPhase,
    #[serde(default)]
    pub folder_id: Option<String>,
    #[serde(default)]
    pub folder_name: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub finished_at: Option<String>,
    #[serde(default)]
    pub last_sync_at: Option<String>,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub pending: u64,
    #[serde(default)]
    pub processed: u64,
    #[serde(default)]
    pub imported: u64,
    #[serde(default)]
    pub skipped: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub recent_failures: Vec<FailureEntry>,
}

impl JobSnapshot {
    /// Whether the job is doing work right now. An unrecognised phase falls back
    /// to the reported status.
    pub fn is_active(&self) -> bool {
        match self.phase {
            JobPhase::Unknown => self.status == JobStatus::Running,
            phase => !phase.is_terminal(),
        }
    }

    pub fn percent_complete(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        (self.processed.min(self.total).saturating_mul(100) / self.total) as u8
    }

    pub fn started_at_unix(&self) -> Result<Option<i64>, time::error::Parse> {
        parse_timestamp(self.started_at.as_deref())
    }

    pub fn finished_at_unix(&self) -> Result<Option<i64>, time::error::Parse> {
        parse_timestamp(self.finished_at.as_deref())
    }

    /// Seconds since the job started, measured against `now` (unix seconds).
    pub fn elapsed_secs(&self, now: i64) -> Option<u64> {
        let started = self.started_at_unix().ok()??;
        let end = self.finished_at_unix().ok().flatten().unwrap_or(now);
        u64::try_from(end.saturating_sub(started)).ok()
    }
}

fn parse_timestamp(value: Option<&str>) -> Result<Option<i64>, time::error::Parse> {
    let Some(value) = value else {
        return Ok(None);
    };
    let parsed = OffsetDateTime::parse(value, &Rfc3339)?;
    Ok(Some(parsed.unix_timestamp()))
}
