use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::poller::PollSchedule;
use crate::upload::UploadConfig;

const DEFAULT_API_URL: &str = "http://localhost:8000";
const DEFAULT_PAGE_SIZE: u64 = 50;
const DEFAULT_DELETE_CHUNK_SIZE: u64 = 40;
const DEFAULT_UPLOAD_CONCURRENCY: u64 = 2;
const DEFAULT_UPLOAD_CLEAN_DELAY_MS: u64 = 1500;
const DEFAULT_POLL_ACTIVE_MS: u64 = 3000;
const DEFAULT_POLL_IDLE_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid PHOTOSYNC_API_URL: {0}")]
    ApiUrl(#[from] url::ParseError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpsConfig {
    pub api_url: String,
    pub page_size: u32,
    pub delete_chunk_size: usize,
    pub upload_concurrency: usize,
    pub upload_clean_delay: Duration,
    pub poll_active_interval: Duration,
    pub poll_idle_interval: Duration,
}

impl OpsConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_url = std::env::var("PHOTOSYNC_API_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        Ok(Self {
            api_url: Url::parse(api_url.trim())?.to_string(),
            page_size: read_u64_env("PHOTOSYNC_PAGE_SIZE", DEFAULT_PAGE_SIZE)
                .min(u64::from(photosync_core::MAX_PAGE_SIZE)) as u32,
            delete_chunk_size: read_u64_env(
                "PHOTOSYNC_DELETE_CHUNK_SIZE",
                DEFAULT_DELETE_CHUNK_SIZE,
            ) as usize,
            upload_concurrency: read_u64_env(
                "PHOTOSYNC_UPLOAD_CONCURRENCY",
                DEFAULT_UPLOAD_CONCURRENCY,
            ) as usize,
            upload_clean_delay: Duration::from_millis(read_u64_env(
                "PHOTOSYNC_UPLOAD_CLEAN_DELAY_MS",
                DEFAULT_UPLOAD_CLEAN_DELAY_MS,
            )),
            poll_active_interval: Duration::from_millis(read_u64_env(
                "PHOTOSYNC_POLL_ACTIVE_MS",
                DEFAULT_POLL_ACTIVE_MS,
            )),
            poll_idle_interval: Duration::from_secs(read_u64_env(
                "PHOTOSYNC_POLL_IDLE_SECS",
                DEFAULT_POLL_IDLE_SECS,
            )),
        })
    }

    pub fn poll_schedule(&self) -> PollSchedule {
        PollSchedule::new(self.poll_active_interval, self.poll_idle_interval)
    }

    pub fn upload(&self) -> UploadConfig {
        UploadConfig {
            concurrency: self.upload_concurrency,
            clean_delay: self.upload_clean_delay,
        }
    }
}

impl Default for OpsConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            page_size: DEFAULT_PAGE_SIZE as u32,
            delete_chunk_size: DEFAULT_DELETE_CHUNK_SIZE as usize,
            upload_concurrency: DEFAULT_UPLOAD_CONCURRENCY as usize,
            upload_clean_delay: Duration::from_millis(DEFAULT_UPLOAD_CLEAN_DELAY_MS),
            poll_active_interval: Duration::from_millis(DEFAULT_POLL_ACTIVE_MS),
            poll_idle_interval: Duration::from_secs(DEFAULT_POLL_IDLE_SECS),
        }
    }
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}
