//! Scripted [`RemoteService`] for orchestrator tests.

use super::{ChangeDetection, NoteDraft, Page, PageRequest, RemoteNote, RemoteService};
use crate::error::{Result, SyncError};
use crate::settings::ServiceKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

pub(crate) fn remote_note(id: &str, title: &str, body: &str) -> RemoteNote {
    RemoteNote {
        id: id.to_string(),
        title: title.to_string(),
        body: body.to_string(),
        tags: Vec::new(),
        source: None,
        created_at: None,
        updated_at: None,
    }
}

pub(crate) fn at(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339)
        .unwrap()
        .with_timezone(&Utc)
}

#[derive(Default)]
pub(crate) struct FakeRemote {
    pub kind: Option<ServiceKind>,
    pub detection: Option<ChangeDetection>,
    pages: Mutex<VecDeque<Result<Page>>>,
    pub requests: Mutex<Vec<PageRequest>>,
    pub created: Mutex<Vec<NoteDraft>>,
    pub updated: Mutex<Vec<(String, NoteDraft)>>,
    next_id: AtomicUsize,
    /// When set, `fetch_page` signals `started` and waits for `release`.
    pub gate: Option<(Notify, Notify)>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `notes` as a single final page.
    pub fn with_notes(notes: Vec<RemoteNote>) -> Self {
        let remote = Self::new();
        remote.push_page(notes, false);
        remote
    }

    /// Behaves like the memo service: timestamp change detection.
    pub fn memos() -> Self {
        Self {
            kind: Some(ServiceKind::Memos),
            detection: Some(ChangeDetection::Timestamp),
            ..Self::default()
        }
    }

    pub fn gated() -> Self {
        Self {
            gate: Some((Notify::new(), Notify::new())),
            ..Self::default()
        }
    }

    pub fn push_page(&self, items: Vec<RemoteNote>, has_more: bool) {
        self.pages
            .lock()
            .unwrap()
            .push_back(Ok(Page { items, has_more }));
    }

    pub fn push_error(&self, err: SyncError) {
        self.pages.lock().unwrap().push_back(Err(err));
    }

    pub fn requests(&self) -> Vec<PageRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn created(&self) -> Vec<NoteDraft> {
        self.created.lock().unwrap().clone()
    }

    pub fn updated(&self) -> Vec<(String, NoteDraft)> {
        self.updated.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteService for FakeRemote {
    fn kind(&self) -> ServiceKind {
        self.kind.unwrap_or(ServiceKind::Notes)
    }

    fn change_detection(&self) -> ChangeDetection {
        self.detection.unwrap_or(ChangeDetection::Body)
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<Page> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some((started, release)) = &self.gate {
            started.notify_one();
            release.notified().await;
        }
        let next = self.pages.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(Page::default()))
    }

    async fn create_note(&self, draft: &NoteDraft) -> Result<String> {
        self.created.lock().unwrap().push(draft.clone());
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("srv-{n}"))
    }

    async fn update_note(&self, id: &str, draft: &NoteDraft) -> Result<String> {
        self.updated
            .lock()
            .unwrap()
            .push((id.to_string(), draft.clone()));
        Ok(id.to_string())
    }

    async fn test_connection(&self) -> Result<()> {
        Ok(())
    }
}
