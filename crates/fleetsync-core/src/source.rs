// ── Configuration source fetching ──
//
// Resolves a domain's source URL into bytes plus the timestamp used to
// detect source changes:
//   file://...                  bytes + filesystem mtime
//   http(s)://...               GET body + `Last-Modified`
//   device://<serial>/<domain>  export from another managed device, no timestamp

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header::LAST_MODIFIED;
use tracing::debug;
use url::Url;

use crate::error::CoreError;
use crate::manager::Manager;
use crate::model::domain::device_reference;

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Bytes read from a source, with its modification time when known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub bytes: Bytes,
    pub timestamp: Option<DateTime<Utc>>,
}

/// HTTP and filesystem access for configuration sources.
#[derive(Debug, Clone)]
pub struct SourceFetcher {
    http: reqwest::Client,
}

impl SourceFetcher {
    pub fn new() -> Result<Self, CoreError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| CoreError::Internal(format!("HTTP client setup failed: {e}")))?;
        Ok(Self { http })
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn read_file(url: &Url) -> Result<Fetched, CoreError> {
        let path = url
            .to_file_path()
            .map_err(|()| unavailable(url, "not a local file path"))?;
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| unavailable(url, e))?;
        let timestamp = Self::file_timestamp(url).await?;
        Ok(Fetched {
            bytes: Bytes::from(bytes),
            timestamp,
        })
    }

    async fn file_timestamp(url: &Url) -> Result<Option<DateTime<Utc>>, CoreError> {
        let path = url
            .to_file_path()
            .map_err(|()| unavailable(url, "not a local file path"))?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| unavailable(url, e))?;
        Ok(meta.modified().ok().map(DateTime::<Utc>::from))
    }

    async fn get(&self, url: &Url) -> Result<Fetched, CoreError> {
        let resp = self
            .http
            .get(url.clone())
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| unavailable(url, e))?;
        let timestamp = last_modified(&resp);
        let bytes = resp.bytes().await.map_err(|e| unavailable(url, e))?;
        debug!(url = %url, len = bytes.len(), "fetched http source");
        Ok(Fetched { bytes, timestamp })
    }

    async fn head(&self, url: &Url) -> Result<Option<DateTime<Utc>>, CoreError> {
        let resp = self
            .http
            .head(url.clone())
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| unavailable(url, e))?;
        Ok(last_modified(&resp))
    }
}

fn last_modified(resp: &reqwest::Response) -> Option<DateTime<Utc>> {
    let raw = resp.headers().get(LAST_MODIFIED)?.to_str().ok()?;
    DateTime::parse_from_rfc2822(raw)
        .map(|t| t.with_timezone(&Utc))
        .ok()
}

fn unavailable(url: &Url, reason: impl std::fmt::Display) -> CoreError {
    CoreError::SourceUnavailable {
        url: url.to_string(),
        reason: reason.to_string(),
    }
}

/// Fetch the bytes behind `url`.
pub(crate) async fn fetch(manager: &Manager, url: &Url) -> Result<Fetched, CoreError> {
    match url.scheme() {
        "file" => SourceFetcher::read_file(url).await,
        "http" | "https" => manager.fetcher().get(url).await,
        _ => {
            let key = device_reference(url)
                .ok_or_else(|| unavailable(url, "unsupported source scheme"))?;
            let device = manager.registry().device(&key.serial)?;
            let bytes = manager
                .client()
                .export_domain(device.context(), &key.name)
                .await?;
            Ok(Fetched {
                bytes,
                timestamp: None,
            })
        }
    }
}

/// Current modification time of `url` without downloading it. `None` when
/// the source has no notion of one.
pub(crate) async fn timestamp(
    manager: &Manager,
    url: &Url,
) -> Result<Option<DateTime<Utc>>, CoreError> {
    match url.scheme() {
        "file" => SourceFetcher::file_timestamp(url).await,
        "http" | "https" => manager.fetcher().head(url).await,
        _ => Ok(None),
    }
}
