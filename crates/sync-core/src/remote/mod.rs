//! Remote note services.
//!
//! Both services sit behind [`RemoteService`]; [`select_remote`] builds the
//! variant chosen in [`Settings`]. Pagination is cursor based: each page is
//! requested relative to the last item of the previous one.

#[cfg(test)]
pub(crate) mod fake;
mod http;
pub mod memos;
pub mod notes;

pub use http::HttpClient;
pub use memos::{MemosClient, sign_params};
pub use notes::NotesClient;

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::retry::retry_remote;
use crate::settings::{RetryPolicy, ServiceKind, Settings};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use std::sync::Arc;
use tracing::{debug, info};

/// A note as returned by a remote service. Lives for one sync pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteNote {
    pub id: String,
    pub title: String,
    pub body: String,
    pub tags: Vec<String>,
    pub source: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl RemoteNote {
    /// Most recent known modification time.
    pub fn modified_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at.or(self.created_at)
    }

    /// Title if present, otherwise the id. Used to label errors.
    pub fn label(&self) -> &str {
        if self.title.trim().is_empty() {
            &self.id
        } else {
            &self.title
        }
    }
}

/// Content sent when creating or updating a note.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NoteDraft {
    pub title: String,
    pub body: String,
    pub tags: Vec<String>,
    pub source: Option<String>,
}

/// Filters for one page request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageRequest {
    /// Only return notes after this id.
    pub since_id: Option<String>,
    /// Only return notes changed after this time.
    pub updated_after: Option<DateTime<Utc>>,
    /// Page size. `None` leaves it to the server.
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    pub items: Vec<RemoteNote>,
    pub has_more: bool,
}

/// How a service decides whether a local copy is out of date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeDetection {
    /// Byte comparison of the note bodies.
    Body,
    /// Remote `updated_at` newer than the local one.
    Timestamp,
}

#[async_trait]
pub trait RemoteService: Send + Sync {
    fn kind(&self) -> ServiceKind;

    fn change_detection(&self) -> ChangeDetection;

    /// Issue one page request.
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page>;

    /// Request for the page following `last`.
    fn next_page(&self, request: &PageRequest, last: &RemoteNote) -> PageRequest {
        PageRequest {
            since_id: Some(last.id.clone()),
            ..request.clone()
        }
    }

    /// Create a note and return its server-assigned id.
    async fn create_note(&self, draft: &NoteDraft) -> Result<String>;

    /// Replace the note `id`. Returns the id the note has afterwards, which
    /// may differ from `id`.
    async fn update_note(&self, id: &str, draft: &NoteDraft) -> Result<String>;

    /// Cheapest authenticated call the service offers.
    async fn test_connection(&self) -> Result<()>;
}

/// Result of [`fetch_all`].
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub items: Vec<RemoteNote>,
    pub pages: usize,
    pub cancelled: bool,
}

/// Follow pages from `start` until the service runs out of data.
///
/// Stops when a page reports no more data, a page comes back empty,
/// `max_pages` pages have been fetched, `limit_total` items have been
/// collected, or `cancel` is set. Each page request goes through the retry
/// policy.
pub async fn fetch_all(
    service: &dyn RemoteService,
    start: PageRequest,
    max_pages: usize,
    limit_total: Option<usize>,
    retry: &RetryPolicy,
    cancel: &CancelToken,
) -> Result<FetchOutcome> {
    let mut outcome = FetchOutcome::default();
    let mut request = start;

    while outcome.pages < max_pages.max(1) {
        if cancel.is_cancelled() {
            outcome.cancelled = true;
            break;
        }

        let page = retry_remote(retry, "fetch_page", || service.fetch_page(&request)).await?;
        outcome.pages += 1;
        debug!(
            service = %service.kind(),
            page = outcome.pages,
            items = page.items.len(),
            has_more = page.has_more,
            "Fetched page"
        );

        let Some(last) = page.items.last().cloned() else {
            break;
        };
        outcome.items.extend(page.items);

        if let Some(limit) = limit_total {
            if outcome.items.len() >= limit {
                outcome.items.truncate(limit);
                break;
            }
        }
        if !page.has_more {
            break;
        }
        request = service.next_page(&request, &last);
        if outcome.pages >= max_pages {
            info!(service = %service.kind(), max_pages, "Stopped at page ceiling");
        }
    }

    Ok(outcome)
}

/// Build the client for the service selected in `settings`.
pub fn select_remote(settings: &Settings) -> Result<Arc<dyn RemoteService>> {
    let service = settings.active();
    let timeout = settings.request_timeout();
    let remote: Arc<dyn RemoteService> = match settings.service {
        ServiceKind::Notes => Arc::new(NotesClient::new(&service.base_url, &service.token, timeout)?),
        ServiceKind::Memos => Arc::new(MemosClient::new(
            &service.base_url,
            &service.token,
            settings.signing.clone(),
            timeout,
        )?),
    };
    Ok(remote)
}

/// Parse the timestamp formats the services emit.
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS` (read as UTC) and unix seconds.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    raw.parse::<i64>()
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

/// Accept ids sent as either JSON strings or numbers.
pub(crate) fn id_from_json<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;
    use serde::de::Error;

    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(D::Error::custom(format!("invalid id: {other}"))),
    }
}
