//! Sync orchestration between the vault and the active remote service.
//!
//! A pull fetches remote notes, advances the stored cursor and merges every
//! note into the sync folder. A push walks the sync folder and creates or
//! updates each note remotely, writing the assigned id back into front
//! matter. Only one pass runs at a time; per-note failures are recorded and
//! the pass carries on.

use crate::cancel::CancelToken;
use crate::error::{Result, SyncError};
use crate::events::{EventBus, ItemOutcome, Subscription, SyncEvent};
use crate::frontmatter::{self, FrontMatter, NoteSyncState, ParsedNote};
use crate::fs::{self, FileSystem, FsError, join_path};
use crate::remote::{self, ChangeDetection, NoteDraft, PageRequest, RemoteNote, RemoteService};
use crate::retry::retry_remote;
use crate::settings::{ConflictPolicy, ServiceKind, Settings};
use crate::state::{PersistedState, StateStore, SyncCursor};
use crate::status::{SyncDirection, SyncErrorEntry, SyncPhase, SyncStatus, SyncSummary};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Slack between a file's mtime and its `last_synced` stamp, covering the
/// write that set the stamp.
const MTIME_TOLERANCE_MS: i64 = 2_000;
const MAX_STEM_CHARS: usize = 100;
const ID_PREFIX_CHARS: usize = 8;

/// Which notes a pull asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullMode {
    /// Everything, ignoring the stored cursor and the fetch limit.
    Full,
    /// Notes after the last seen id.
    IncrementalById(String),
    /// Notes changed after the last sync time, when no id was stored.
    IncrementalByTime(DateTime<Utc>),
    /// First sync: at most this many notes.
    BoundedInitial(Option<usize>),
}

impl PullMode {
    pub fn select(full: bool, cursor: &SyncCursor, fetch_limit: usize) -> Self {
        if full {
            PullMode::Full
        } else if let Some(id) = &cursor.last_sync_id {
            PullMode::IncrementalById(id.clone())
        } else if let Some(time) = cursor.last_sync_time {
            PullMode::IncrementalByTime(time)
        } else {
            PullMode::BoundedInitial((fetch_limit > 0).then_some(fetch_limit))
        }
    }

    /// First page request and the overall item limit.
    pub fn start(&self) -> (PageRequest, Option<usize>) {
        match self {
            PullMode::Full => (PageRequest::default(), None),
            PullMode::IncrementalById(id) => (
                PageRequest {
                    since_id: Some(id.clone()),
                    ..PageRequest::default()
                },
                None,
            ),
            PullMode::IncrementalByTime(time) => (
                PageRequest {
                    updated_after: Some(*time),
                    ..PageRequest::default()
                },
                None,
            ),
            PullMode::BoundedInitial(limit) => (
                PageRequest {
                    limit: *limit,
                    ..PageRequest::default()
                },
                *limit,
            ),
        }
    }
}

/// Clears the running flag when a pass ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct PullContext {
    kind: ServiceKind,
    folder: String,
    policy: ConflictPolicy,
    detection: ChangeDetection,
}

/// Drives pull and push passes for one remote service.
pub struct SyncManager<F: FileSystem> {
    fs: F,
    remote: Arc<dyn RemoteService>,
    store: Arc<dyn StateStore>,
    /// Held for the whole of a pass.
    state: Mutex<PersistedState>,
    status: RwLock<SyncStatus>,
    running: AtomicBool,
    cancel: CancelToken,
    events: Arc<EventBus>,
}

impl<F: FileSystem> SyncManager<F> {
    /// Load state from `store` and connect to the service it selects.
    pub fn new(fs: F, store: Arc<dyn StateStore>) -> Result<Self> {
        let state = store.load()?;
        let remote = remote::select_remote(&state.settings)?;
        Ok(Self::from_parts(fs, remote, store, state))
    }

    /// Use an already built remote client.
    pub fn with_remote(
        fs: F,
        remote: Arc<dyn RemoteService>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self> {
        let state = store.load()?;
        Ok(Self::from_parts(fs, remote, store, state))
    }

    fn from_parts(
        fs: F,
        remote: Arc<dyn RemoteService>,
        store: Arc<dyn StateStore>,
        state: PersistedState,
    ) -> Self {
        Self {
            fs,
            remote,
            store,
            state: Mutex::new(state),
            status: RwLock::new(SyncStatus::default()),
            running: AtomicBool::new(false),
            cancel: CancelToken::new(),
            events: Arc::new(EventBus::new()),
        }
    }

    pub fn kind(&self) -> ServiceKind {
        self.remote.kind()
    }

    pub fn fs(&self) -> &F {
        &self.fs
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn subscribe(&self, callback: impl Fn(SyncEvent) + Send + Sync + 'static) -> Subscription {
        self.events.subscribe(callback)
    }

    /// Handle that cancels whichever pass is running when triggered.
    pub fn cancel_handle(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_syncing(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Snapshot of the current progress and error list.
    pub fn sync_status(&self) -> SyncStatus {
        self.status
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn clear_errors(&self) {
        self.update_status(SyncStatus::clear_errors);
    }

    /// Ask the running pass to stop after the current note or page.
    pub fn cancel_sync(&self) {
        if self.is_syncing() {
            info!("Cancelling sync");
        }
        self.cancel.cancel();
    }

    /// Copy of the persisted state. Waits for a running pass to finish.
    pub async fn state_snapshot(&self) -> PersistedState {
        self.state.lock().await.clone()
    }

    pub async fn test_connection(&self) -> Result<()> {
        match self.remote.test_connection().await {
            Ok(()) => {
                info!(service = %self.kind(), "Connection OK");
                Ok(())
            }
            Err(e) => {
                warn!(service = %self.kind(), error = %e, "Connection test failed");
                Err(e)
            }
        }
    }

    /// Pull remote notes into the vault.
    ///
    /// `full` ignores the stored cursor and the first-sync limit.
    pub async fn sync_from_server(&self, full: bool) -> Result<SyncSummary> {
        let _running = self.begin_pass()?;
        let mut state = self.state.lock().await;
        let result = self.pull(&mut state, full).await;
        self.finish(SyncDirection::Pull, result)
    }

    /// Push vault notes to the remote service.
    pub async fn sync_to_server(&self) -> Result<SyncSummary> {
        let _running = self.begin_pass()?;
        let mut state = self.state.lock().await;
        let result = self.push(&mut state).await;
        self.finish(SyncDirection::Push, result)
    }

    fn begin_pass(&self) -> Result<RunGuard<'_>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Sync requested while another is running");
            return Err(SyncError::AlreadyRunning);
        }
        self.cancel.reset();
        self.update_status(SyncStatus::reset);
        self.events.emit(SyncEvent::PhaseChanged {
            phase: SyncPhase::Preparing,
        });
        Ok(RunGuard(&self.running))
    }

    fn finish(&self, direction: SyncDirection, result: Result<SyncSummary>) -> Result<SyncSummary> {
        let (summary, phase) = match &result {
            Ok(summary) => {
                info!(%summary, "Sync finished");
                let phase = if summary.cancelled {
                    SyncPhase::Cancelled
                } else {
                    SyncPhase::Completed
                };
                (*summary, phase)
            }
            Err(e) => {
                error!(%direction, error = %e, "Sync failed");
                self.record_error(direction.to_string(), e.to_string());
                let status = self.sync_status();
                let summary = SyncSummary {
                    direction,
                    total: status.total,
                    succeeded: status.completed,
                    skipped: status.skipped,
                    errored: status.errored,
                    cancelled: false,
                };
                (summary, SyncPhase::Failed)
            }
        };

        self.update_status(|s| {
            s.current_item = None;
            s.last_summary = Some(summary);
        });
        self.set_phase(phase);
        self.events.emit(SyncEvent::Finished { summary });
        result
    }

    async fn pull(&self, state: &mut PersistedState, full: bool) -> Result<SyncSummary> {
        let kind = self.remote.kind();
        let settings = state.settings.clone();
        let service = settings.service_settings(kind);
        let prior = state.cursor(kind);
        let mode = PullMode::select(full, &prior, service.fetch_limit);
        let (start, limit_total) = mode.start();
        info!(service = %kind, ?mode, "Pulling from server");

        self.set_phase(SyncPhase::Fetching);
        let fetched = remote::fetch_all(
            self.remote.as_ref(),
            start,
            settings.max_pages,
            limit_total,
            &settings.retry,
            &self.cancel,
        )
        .await?;

        let total = fetched.items.len();
        let mut summary = SyncSummary::new(SyncDirection::Pull, total);
        self.update_status(|s| s.total = total);
        if fetched.cancelled {
            summary.cancelled = true;
            return Ok(summary);
        }
        if total == 0 {
            return Ok(summary);
        }

        let ctx = PullContext {
            kind,
            folder: service.sync_folder.trim_matches('/').to_string(),
            policy: settings.conflict_policy,
            detection: self.remote.change_detection(),
        };

        // Store the cursor before processing so an interrupted pass does not refetch everything
        if let Some(cursor) = newest_cursor(&fetched.items, &prior) {
            state.set_cursor(kind, cursor);
        }
        if let Err(e) = self.prepare_folder(state, &ctx.folder).await {
            warn!(folder = %ctx.folder, error = %e, "Pull aborted before processing, restoring cursor");
            state.set_cursor(kind, prior);
            if let Err(save_err) = self.store.save(state) {
                warn!(error = %save_err, "Could not persist restored cursor");
            }
            return Err(e);
        }

        let mut seen = HashSet::new();
        let mut rebuilt = false;
        for (index, note) in fetched.items.iter().enumerate() {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            self.begin_item(index, total, note.label());

            let outcome = if seen.insert(note.id.as_str()) {
                self.merge_remote_note(state, note, &ctx, &mut rebuilt).await
            } else {
                debug!(id = %note.id, "Duplicate note in batch");
                Ok(ItemOutcome::Skipped)
            };
            self.tally(&mut summary, note.label(), outcome);
        }

        self.persist(state);
        Ok(summary)
    }

    async fn prepare_folder(&self, state: &PersistedState, folder: &str) -> Result<()> {
        self.store.save(state)?;
        self.fs.mkdir(folder).await?;
        Ok(())
    }

    async fn merge_remote_note(
        &self,
        state: &mut PersistedState,
        note: &RemoteNote,
        ctx: &PullContext,
        rebuilt: &mut bool,
    ) -> Result<ItemOutcome> {
        match self.locate(state, &note.id, &ctx.folder, rebuilt).await {
            Some(path) => self.reconcile(&path, note, ctx).await,
            None => {
                self.create_local(state, note, ctx).await?;
                Ok(ItemOutcome::Created)
            }
        }
    }

    /// Find the file holding `remote_id`, rebuilding the cache on the first
    /// miss of the pass.
    async fn locate(
        &self,
        state: &mut PersistedState,
        remote_id: &str,
        folder: &str,
        rebuilt: &mut bool,
    ) -> Option<String> {
        if let Some(path) = state.id_cache.resolve(&self.fs, remote_id).await {
            return Some(path);
        }
        if *rebuilt {
            return None;
        }
        *rebuilt = true;

        match state.id_cache.rebuild(&self.fs, folder).await {
            Ok(entries) => debug!(entries, "Rebuilt id cache after miss"),
            Err(e) => {
                warn!(folder, error = %e, "Could not rebuild id cache");
                return None;
            }
        }
        state.id_cache.resolve(&self.fs, remote_id).await
    }

    async fn create_local(
        &self,
        state: &mut PersistedState,
        note: &RemoteNote,
        ctx: &PullContext,
    ) -> Result<String> {
        let dir = note
            .tags
            .first()
            .map(|tag| sanitize_file_stem(tag))
            .filter(|tag| !tag.is_empty())
            .map(|tag| join_path(&ctx.folder, &tag))
            .unwrap_or_else(|| ctx.folder.clone());

        let mut stem = sanitize_file_stem(&note.title);
        if stem.is_empty() {
            stem = sanitize_file_stem(&note.id);
        }
        if stem.is_empty() {
            stem = "Untitled".to_string();
        }

        let path = self.free_path(&dir, &stem, &note.id).await?;
        let mut front_matter = FrontMatter::new();
        apply_remote_fields(&mut front_matter, note, ctx.kind);
        self.fs
            .write(&path, frontmatter::encode(&front_matter, &note.body).as_bytes())
            .await?;

        state.id_cache.record(&note.id, &path);
        self.store.save(state)?;
        debug!(id = %note.id, path = %path, "Created local note");
        Ok(path)
    }

    /// `<stem>.md`, then `<stem>-<id prefix>.md`, then `<stem>-<timestamp>.md`.
    async fn free_path(&self, dir: &str, stem: &str, remote_id: &str) -> Result<String> {
        let id_prefix: String = sanitize_file_stem(remote_id)
            .chars()
            .take(ID_PREFIX_CHARS)
            .collect();
        let stamp = Utc::now().format("%Y%m%d%H%M%S").to_string();

        for candidate in [
            stem.to_string(),
            format!("{stem}-{id_prefix}"),
            format!("{stem}-{stamp}"),
        ] {
            let path = join_path(dir, &format!("{candidate}.md"));
            if !self.fs.exists(&path).await? {
                return Ok(path);
            }
        }
        Err(FsError::AlreadyExists(join_path(dir, &format!("{stem}.md"))).into())
    }

    async fn reconcile(&self, path: &str, note: &RemoteNote, ctx: &PullContext) -> Result<ItemOutcome> {
        let text = self.fs.read_to_string(path).await?;
        let local = ParsedNote::from_text(&text);

        if !remote_differs(ctx.detection, &local, note) {
            return Ok(ItemOutcome::Skipped);
        }

        match ctx.policy {
            ConflictPolicy::PreferRemote => {
                let mut front_matter = local.front_matter;
                apply_remote_fields(&mut front_matter, note, ctx.kind);
                self.fs
                    .write(path, frontmatter::encode(&front_matter, &note.body).as_bytes())
                    .await?;
                debug!(id = %note.id, path, "Overwrote local note");
                Ok(ItemOutcome::Updated)
            }
            ConflictPolicy::PreferLocal => {
                debug!(id = %note.id, path, "Keeping local version");
                Ok(ItemOutcome::Skipped)
            }
            ConflictPolicy::Manual => {
                // Already carries markers from an earlier pass
                if local.front_matter.sync_state() == Some(NoteSyncState::Conflict) {
                    return Err(SyncError::ConflictDetected(path.to_string()));
                }
                let mut front_matter = local.front_matter;
                front_matter.set_sync_state(NoteSyncState::Conflict);
                let body = conflict_body(&local.body, &note.body);
                self.fs
                    .write(path, frontmatter::encode(&front_matter, &body).as_bytes())
                    .await?;
                Err(SyncError::ConflictDetected(path.to_string()))
            }
        }
    }

    async fn push(&self, state: &mut PersistedState) -> Result<SyncSummary> {
        let kind = self.remote.kind();
        let settings = state.settings.clone();
        let folder = settings
            .service_settings(kind)
            .sync_folder
            .trim_matches('/')
            .to_string();
        info!(service = %kind, folder = %folder, "Pushing to server");

        let files = fs::list_markdown_files(&self.fs, &folder).await?;
        let total = files.len();
        let mut summary = SyncSummary::new(SyncDirection::Push, total);
        self.update_status(|s| s.total = total);

        for (index, path) in files.iter().enumerate() {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            self.begin_item(index, total, path);
            let outcome = self.push_file(state, path, &settings).await;
            self.tally(&mut summary, path, outcome);
        }

        self.persist(state);
        Ok(summary)
    }

    async fn push_file(
        &self,
        state: &mut PersistedState,
        path: &str,
        settings: &Settings,
    ) -> Result<ItemOutcome> {
        let kind = self.remote.kind();
        let text = self.fs.read_to_string(path).await?;
        let ParsedNote {
            mut front_matter,
            body,
        } = ParsedNote::from_text(&text);

        if front_matter.sync_state() == Some(NoteSyncState::Conflict) {
            return Err(SyncError::ConflictDetected(path.to_string()));
        }

        let draft = NoteDraft {
            title: front_matter
                .title()
                .map(str::to_string)
                .unwrap_or_else(|| file_stem(path).to_string()),
            body: body.clone(),
            tags: front_matter.tags(),
            source: front_matter.get_str(frontmatter::SOURCE).map(str::to_string),
        };

        let (remote_id, outcome) = match front_matter.remote_id().map(str::to_string) {
            Some(id) => {
                if front_matter
                    .get_str(frontmatter::SERVICE)
                    .is_some_and(|service| service != kind.as_str())
                {
                    debug!(path, "Note belongs to another service");
                    return Ok(ItemOutcome::Skipped);
                }
                if front_matter.sync_state() == Some(NoteSyncState::Synced)
                    && !self.modified_since_sync(path, &front_matter).await?
                {
                    return Ok(ItemOutcome::Skipped);
                }

                let new_id = retry_remote(&settings.retry, "update_note", || {
                    self.remote.update_note(&id, &draft)
                })
                .await?;
                if new_id != id {
                    state.id_cache.remove(&id);
                }
                (new_id, ItemOutcome::Updated)
            }
            None => {
                let new_id = retry_remote(&settings.retry, "create_note", || {
                    self.remote.create_note(&draft)
                })
                .await?;
                (new_id, ItemOutcome::Created)
            }
        };

        front_matter.set_str(frontmatter::REMOTE_ID, remote_id.as_str());
        front_matter.set_str(frontmatter::SERVICE, kind.as_str());
        front_matter.set_sync_state(NoteSyncState::Synced);
        front_matter.set_timestamp(frontmatter::LAST_SYNCED, Utc::now());
        self.fs
            .write(path, frontmatter::encode(&front_matter, &body).as_bytes())
            .await?;

        state.id_cache.record(remote_id.as_str(), path);
        if outcome == ItemOutcome::Created {
            self.store.save(state)?;
        }
        debug!(path, remote_id = %remote_id, ?outcome, "Pushed note");
        Ok(outcome)
    }

    async fn modified_since_sync(&self, path: &str, front_matter: &FrontMatter) -> Result<bool> {
        let Some(last_synced) = front_matter.timestamp(frontmatter::LAST_SYNCED) else {
            return Ok(true);
        };
        let stat = self.fs.stat(path).await?;
        let mtime = i64::try_from(stat.mtime_millis).unwrap_or(i64::MAX);
        Ok(mtime > last_synced.timestamp_millis() + MTIME_TOLERANCE_MS)
    }

    fn persist(&self, state: &PersistedState) {
        if let Err(e) = self.store.save(state) {
            warn!(error = %e, "Could not persist sync state");
            self.record_error("state", e.to_string());
        }
    }

    fn begin_item(&self, index: usize, total: usize, label: &str) {
        self.update_status(|s| {
            s.phase = SyncPhase::Processing {
                current: index + 1,
                total,
            };
            s.current_item = Some(label.to_string());
        });
    }

    fn tally(&self, summary: &mut SyncSummary, label: &str, outcome: Result<ItemOutcome>) {
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(item = label, error = %e, "Note failed to sync");
                self.record_error(label, e.to_string());
                match e {
                    SyncError::ConflictDetected(_) => ItemOutcome::Conflict,
                    _ => ItemOutcome::Failed,
                }
            }
        };

        match outcome {
            ItemOutcome::Created | ItemOutcome::Updated => summary.succeeded += 1,
            ItemOutcome::Skipped => summary.skipped += 1,
            ItemOutcome::Conflict | ItemOutcome::Failed => summary.errored += 1,
        }
        self.update_status(|s| {
            s.completed = summary.succeeded;
            s.skipped = summary.skipped;
            s.errored = summary.errored;
        });
        self.events.emit(SyncEvent::ItemProcessed {
            label: label.to_string(),
            outcome,
        });
    }

    fn record_error(&self, label: impl Into<String>, message: impl Into<String>) {
        let entry = SyncErrorEntry::new(label, message);
        self.update_status(|s| s.errors.push(entry.clone()));
        self.events.emit(SyncEvent::ErrorRecorded { entry });
    }

    fn set_phase(&self, phase: SyncPhase) {
        self.update_status(|s| s.phase = phase.clone());
        self.events.emit(SyncEvent::PhaseChanged { phase });
    }

    fn update_status(&self, f: impl FnOnce(&mut SyncStatus)) {
        f(&mut self.status.write().unwrap_or_else(|e| e.into_inner()));
    }
}

/// Cursor pointing at the most recently modified note of a batch, falling
/// back to the first note when none carries a timestamp.
fn newest_cursor(items: &[RemoteNote], prior: &SyncCursor) -> Option<SyncCursor> {
    let newest = items
        .iter()
        .filter(|n| n.modified_at().is_some())
        .max_by_key(|n| n.modified_at())
        .or_else(|| items.first())?;

    Some(SyncCursor {
        last_sync_id: Some(newest.id.clone()),
        last_sync_time: newest.modified_at().or(prior.last_sync_time),
    })
}

fn remote_differs(detection: ChangeDetection, local: &ParsedNote, note: &RemoteNote) -> bool {
    match detection {
        ChangeDetection::Body => local.body != note.body,
        ChangeDetection::Timestamp => {
            match (
                note.modified_at(),
                local.front_matter.timestamp(frontmatter::UPDATED_AT),
            ) {
                (Some(remote), Some(local)) => remote > local,
                _ => local.body != note.body,
            }
        }
    }
}

fn apply_remote_fields(front_matter: &mut FrontMatter, note: &RemoteNote, kind: ServiceKind) {
    front_matter.set_str(frontmatter::REMOTE_ID, note.id.as_str());
    front_matter.set_str(frontmatter::SERVICE, kind.as_str());
    if !note.title.trim().is_empty() {
        front_matter.set_str(frontmatter::TITLE, note.title.as_str());
    }
    front_matter.set_list(frontmatter::TAGS, note.tags.clone());
    if let Some(source) = &note.source {
        front_matter.set_str(frontmatter::SOURCE, source.as_str());
    }
    if let Some(created) = note.created_at {
        front_matter.set_timestamp(frontmatter::CREATED_AT, created);
    }
    if let Some(updated) = note.updated_at {
        front_matter.set_timestamp(frontmatter::UPDATED_AT, updated);
    }
    front_matter.set_sync_state(NoteSyncState::Synced);
    front_matter.set_timestamp(frontmatter::LAST_SYNCED, Utc::now());
}

fn conflict_body(local: &str, remote: &str) -> String {
    format!(
        "<<<<<<< LOCAL\n{}\n=======\n{}\n>>>>>>> REMOTE\n",
        local.trim_end_matches('\n'),
        remote.trim_end_matches('\n')
    )
}

/// Turn a title or tag into something safe to use as a file or folder name.
fn sanitize_file_stem(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '#' | '^' | '[' | ']' => '-',
            c if c.is_control() => ' ',
            c => c,
        })
        .collect();

    let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_matches(|c: char| c == '.' || c == '-' || c == ' ');
    trimmed
        .chars()
        .take(MAX_STEM_CHARS)
        .collect::<String>()
        .trim_end()
        .to_string()
}

fn file_stem(path: &str) -> &str {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.strip_suffix(".md").unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{FileEntry, FileStat, InMemoryFs};
    use crate::remote::fake::{FakeRemote, at, remote_note};
    use crate::state::MemoryStateStore;
    use async_trait::async_trait;

    fn test_settings(policy: ConflictPolicy) -> Settings {
        let mut settings = Settings {
            conflict_policy: policy,
            ..Settings::default()
        };
        settings.retry.initial_delay_ms = 1;
        settings
    }

    fn state_with(policy: ConflictPolicy) -> PersistedState {
        PersistedState::new(test_settings(policy))
    }

    fn manager<F: FileSystem>(
        fs: F,
        remote: &Arc<FakeRemote>,
        state: PersistedState,
    ) -> (SyncManager<F>, Arc<MemoryStateStore>) {
        let store = Arc::new(MemoryStateStore::with_state(state));
        let manager = SyncManager::with_remote(
            fs,
            remote.clone() as Arc<dyn RemoteService>,
            store.clone() as Arc<dyn StateStore>,
        )
        .unwrap();
        (manager, store)
    }

    async fn local_note(fs: &InMemoryFs, path: &str, remote_id: &str, body: &str) {
        let text = format!("---\nremote_id: {remote_id}\nservice: notes\nsync_status: synced\n---\n\n{body}");
        fs.write(path, text.as_bytes()).await.unwrap();
    }

    /// Fails every write whose path contains `fail_on`.
    struct FailingFs {
        inner: InMemoryFs,
        fail_on: String,
    }

    #[async_trait]
    impl FileSystem for FailingFs {
        async fn read(&self, path: &str) -> fs::Result<Vec<u8>> {
            self.inner.read(path).await
        }

        async fn write(&self, path: &str, content: &[u8]) -> fs::Result<()> {
            if path.contains(&self.fail_on) {
                return Err(FsError::Io(format!("disk full writing {path}")));
            }
            self.inner.write(path, content).await
        }

        async fn list(&self, path: &str) -> fs::Result<Vec<FileEntry>> {
            self.inner.list(path).await
        }

        async fn exists(&self, path: &str) -> fs::Result<bool> {
            self.inner.exists(path).await
        }

        async fn stat(&self, path: &str) -> fs::Result<FileStat> {
            self.inner.stat(path).await
        }

        async fn mkdir(&self, path: &str) -> fs::Result<()> {
            self.inner.mkdir(path).await
        }
    }

    #[test]
    fn test_pull_mode_selection() {
        let empty = SyncCursor::default();
        let by_id = SyncCursor {
            last_sync_id: Some("abc123".into()),
            last_sync_time: Some(at("2024-01-01T00:00:00Z")),
        };
        let by_time = SyncCursor {
            last_sync_id: None,
            last_sync_time: Some(at("2024-01-01T00:00:00Z")),
        };

        assert_eq!(PullMode::select(true, &by_id, 50), PullMode::Full);
        assert_eq!(
            PullMode::select(false, &by_id, 50),
            PullMode::IncrementalById("abc123".into())
        );
        assert_eq!(
            PullMode::select(false, &by_time, 50),
            PullMode::IncrementalByTime(at("2024-01-01T00:00:00Z"))
        );
        assert_eq!(PullMode::select(false, &empty, 50), PullMode::BoundedInitial(Some(50)));
        assert_eq!(PullMode::select(false, &empty, 0), PullMode::BoundedInitial(None));
    }

    #[test]
    fn test_sanitize_file_stem() {
        assert_eq!(sanitize_file_stem("Plan: Q3/Q4"), "Plan- Q3-Q4");
        assert_eq!(sanitize_file_stem("  ..hidden  "), "hidden");
        assert_eq!(sanitize_file_stem("a\tb\nc"), "a b c");
        assert_eq!(sanitize_file_stem("###"), "");
        assert_eq!(sanitize_file_stem(&"x".repeat(300)).len(), MAX_STEM_CHARS);
    }

    #[tokio::test]
    async fn test_pull_creates_notes_under_tag_folders() {
        let fs = Arc::new(InMemoryFs::new());
        let mut tagged = remote_note("n1", "Plan", "step one");
        tagged.tags = vec!["work".into(), "q3".into()];
        tagged.updated_at = Some(at("2024-05-02T00:00:00Z"));
        let mut plain = remote_note("n2", "Groceries", "milk");
        plain.updated_at = Some(at("2024-05-01T00:00:00Z"));
        let remote = Arc::new(FakeRemote::with_notes(vec![plain, tagged]));
        let (manager, store) = manager(fs.clone(), &remote, state_with(ConflictPolicy::Manual));

        let summary = manager.sync_from_server(false).await.unwrap();

        assert_eq!((summary.total, summary.succeeded, summary.skipped, summary.errored), (2, 2, 0, 0));
        let note = frontmatter::decode(&fs.text("Notes/work/Plan.md").unwrap()).unwrap();
        assert_eq!(note.body, "step one");
        assert_eq!(note.front_matter.remote_id(), Some("n1"));
        assert_eq!(note.front_matter.tags(), vec!["work", "q3"]);
        assert_eq!(note.front_matter.sync_state(), Some(NoteSyncState::Synced));
        assert!(fs.text("Notes/Groceries.md").is_some());

        let saved = store.load().unwrap();
        assert_eq!(saved.id_cache.lookup("n1"), Some("Notes/work/Plan.md"));
        // Newest by modification time, not list position
        assert_eq!(saved.cursor(ServiceKind::Notes).last_sync_id.as_deref(), Some("n1"));

        let status = manager.sync_status();
        assert_eq!(status.phase, SyncPhase::Completed);
        assert_eq!(status.last_summary, Some(summary));
        assert!(!manager.is_syncing());
    }

    #[tokio::test]
    async fn test_failed_write_is_counted_and_pass_continues() {
        let fs = Arc::new(FailingFs {
            inner: InMemoryFs::new(),
            fail_on: "Note 3".into(),
        });
        let notes = (1..=5)
            .map(|i| remote_note(&format!("id-{i}"), &format!("Note {i}"), "body"))
            .collect();
        let remote = Arc::new(FakeRemote::with_notes(notes));
        let (manager, _store) = manager(fs.clone(), &remote, state_with(ConflictPolicy::Manual));

        let summary = manager.sync_from_server(false).await.unwrap();

        assert_eq!(summary.total, 5);
        assert_eq!(summary.succeeded, 4);
        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.errored, 1);

        let status = manager.sync_status();
        assert_eq!(status.errors.len(), 1);
        assert_eq!(status.errors[0].label, "Note 3");
        assert!(fs.inner.text("Notes/Note 5.md").is_some());
        assert!(fs.inner.text("Notes/Note 3.md").is_none());
    }

    #[tokio::test]
    async fn test_stored_cursor_requests_since_id_without_limit() {
        let fs = Arc::new(InMemoryFs::new());
        let remote = Arc::new(FakeRemote::new());
        let mut state = state_with(ConflictPolicy::Manual);
        state.set_cursor(
            ServiceKind::Notes,
            SyncCursor {
                last_sync_id: Some("abc123".into()),
                last_sync_time: None,
            },
        );
        let (manager, _store) = manager(fs, &remote, state);

        manager.sync_from_server(false).await.unwrap();

        let requests = remote.requests();
        assert_eq!(requests[0].since_id.as_deref(), Some("abc123"));
        assert_eq!(requests[0].limit, None);
    }

    #[tokio::test]
    async fn test_first_sync_applies_fetch_limit() {
        let fs = Arc::new(InMemoryFs::new());
        let remote = Arc::new(FakeRemote::new());
        let (manager, _store) = manager(fs, &remote, state_with(ConflictPolicy::Manual));

        manager.sync_from_server(false).await.unwrap();

        assert_eq!(remote.requests()[0].limit, Some(100));
    }

    #[tokio::test]
    async fn test_full_sync_ignores_cursor_and_limit() {
        let fs = Arc::new(InMemoryFs::new());
        let remote = Arc::new(FakeRemote::new());
        remote.push_page(vec![remote_note("a", "A", "")], true);
        remote.push_page(vec![remote_note("b", "B", "")], false);
        let mut state = state_with(ConflictPolicy::Manual);
        state.set_cursor(
            ServiceKind::Notes,
            SyncCursor {
                last_sync_id: Some("abc123".into()),
                last_sync_time: Some(at("2024-01-01T00:00:00Z")),
            },
        );
        let (manager, _store) = manager(fs, &remote, state);

        let summary = manager.sync_from_server(true).await.unwrap();

        let requests = remote.requests();
        assert_eq!(requests[0], PageRequest::default());
        assert_eq!(requests[1].since_id.as_deref(), Some("a"));
        assert_eq!(requests[1].limit, None);
        assert_eq!(summary.succeeded, 2);
    }

    #[tokio::test]
    async fn test_duplicate_ids_processed_once() {
        let fs = Arc::new(InMemoryFs::new());
        let remote = Arc::new(FakeRemote::with_notes(vec![
            remote_note("a", "Alpha", "one"),
            remote_note("a", "Alpha", "one"),
            remote_note("b", "Beta", "two"),
        ]));
        let (manager, _store) = manager(fs.clone(), &remote, state_with(ConflictPolicy::Manual));

        let summary = manager.sync_from_server(false).await.unwrap();

        assert_eq!((summary.succeeded, summary.skipped, summary.errored), (2, 1, 0));
        assert_eq!(fs.paths(), vec!["Notes/Alpha.md", "Notes/Beta.md"]);
    }

    #[tokio::test]
    async fn test_unchanged_note_is_skipped() {
        let fs = Arc::new(InMemoryFs::new());
        let remote = Arc::new(FakeRemote::new());
        remote.push_page(vec![remote_note("a", "Alpha", "same")], false);
        remote.push_page(vec![remote_note("a", "Alpha", "same")], false);
        let (manager, _store) = manager(fs.clone(), &remote, state_with(ConflictPolicy::Manual));

        manager.sync_from_server(false).await.unwrap();
        let second = manager.sync_from_server(false).await.unwrap();

        assert_eq!((second.succeeded, second.skipped, second.errored), (0, 1, 0));
        assert_eq!(fs.paths().len(), 1);
    }

    async fn pull_against_local_edit(policy: ConflictPolicy) -> (Arc<InMemoryFs>, SyncManager<Arc<InMemoryFs>>, SyncSummary) {
        let fs = Arc::new(InMemoryFs::new());
        local_note(&fs, "Notes/Plan.md", "n1", "local edit").await;
        let mut state = state_with(policy);
        state.id_cache.record("n1", "Notes/Plan.md");
        let remote = Arc::new(FakeRemote::with_notes(vec![remote_note("n1", "Plan", "remote text")]));
        let (manager, _store) = manager(fs.clone(), &remote, state);
        let summary = manager.sync_from_server(false).await.unwrap();
        (fs, manager, summary)
    }

    #[tokio::test]
    async fn test_conflict_prefer_remote_overwrites() {
        let (fs, _manager, summary) = pull_against_local_edit(ConflictPolicy::PreferRemote).await;

        assert_eq!(summary.succeeded, 1);
        let note = frontmatter::decode(&fs.text("Notes/Plan.md").unwrap()).unwrap();
        assert_eq!(note.body, "remote text");
        assert_eq!(note.front_matter.sync_state(), Some(NoteSyncState::Synced));
    }

    #[tokio::test]
    async fn test_conflict_prefer_local_keeps_file() {
        let (fs, _manager, summary) = pull_against_local_edit(ConflictPolicy::PreferLocal).await;

        assert_eq!(summary.skipped, 1);
        assert!(fs.text("Notes/Plan.md").unwrap().ends_with("local edit"));
    }

    #[tokio::test]
    async fn test_conflict_manual_writes_markers() {
        let (fs, manager, summary) = pull_against_local_edit(ConflictPolicy::Manual).await;

        assert_eq!(summary.errored, 1);
        let note = frontmatter::decode(&fs.text("Notes/Plan.md").unwrap()).unwrap();
        assert_eq!(note.front_matter.sync_state(), Some(NoteSyncState::Conflict));
        assert_eq!(
            note.body,
            "<<<<<<< LOCAL\nlocal edit\n=======\nremote text\n>>>>>>> REMOTE\n"
        );

        let status = manager.sync_status();
        assert_eq!(status.errors.len(), 1);
        assert_eq!(status.errors[0].label, "Plan");
        assert!(status.errors[0].message.contains("Notes/Plan.md"));
    }

    #[tokio::test]
    async fn test_timestamp_detection_skips_older_remote() {
        let fs = Arc::new(InMemoryFs::new());
        let text = "---\nremote_id: m1\nupdated_at: 2024-06-01T00:00:00+00:00\n---\n\nlocal body";
        fs.write("Memos/m.md", text.as_bytes()).await.unwrap();
        let mut memo = remote_note("m1", "m", "remote body");
        memo.updated_at = Some(at("2024-05-01T00:00:00Z"));
        let remote = Arc::new(FakeRemote::memos());
        remote.push_page(vec![memo], false);
        let (manager, _store) = manager(fs.clone(), &remote, state_with(ConflictPolicy::PreferRemote));

        let summary = manager.sync_from_server(false).await.unwrap();

        assert_eq!(summary.skipped, 1);
        assert!(fs.text("Memos/m.md").unwrap().ends_with("local body"));
    }

    #[tokio::test]
    async fn test_cache_miss_finds_existing_file() {
        let fs = Arc::new(InMemoryFs::new());
        local_note(&fs, "Notes/renamed/Old name.md", "n1", "old").await;
        let remote = Arc::new(FakeRemote::with_notes(vec![
            remote_note("n1", "Plan", "new"),
            remote_note("n2", "Other", "x"),
        ]));
        let (manager, store) = manager(fs.clone(), &remote, state_with(ConflictPolicy::PreferRemote));

        let summary = manager.sync_from_server(false).await.unwrap();

        assert_eq!(summary.succeeded, 2);
        assert!(fs.text("Notes/renamed/Old name.md").unwrap().ends_with("new"));
        assert!(fs.text("Notes/Plan.md").is_none());
        let saved = store.load().unwrap();
        assert_eq!(saved.id_cache.lookup("n1"), Some("Notes/renamed/Old name.md"));
        assert_eq!(saved.id_cache.lookup("n2"), Some("Notes/Other.md"));
    }

    #[tokio::test]
    async fn test_name_collision_appends_id_prefix() {
        let fs = Arc::new(InMemoryFs::new());
        fs.write("Notes/Plan.md", b"my own file").await.unwrap();
        let remote = Arc::new(FakeRemote::with_notes(vec![remote_note("abcdefgh1234", "Plan", "x")]));
        let (manager, _store) = manager(fs.clone(), &remote, state_with(ConflictPolicy::Manual));

        manager.sync_from_server(false).await.unwrap();

        assert_eq!(fs.text("Notes/Plan.md").unwrap(), "my own file");
        assert!(fs.text("Notes/Plan-abcdefgh.md").is_some());
    }

    #[tokio::test]
    async fn test_folder_failure_restores_cursor() {
        let fs = Arc::new(InMemoryFs::new());
        // A file where the sync folder should be
        fs.write("Notes", b"not a folder").await.unwrap();
        let prior = SyncCursor {
            last_sync_id: Some("old".into()),
            last_sync_time: None,
        };
        let mut state = state_with(ConflictPolicy::Manual);
        state.set_cursor(ServiceKind::Notes, prior.clone());
        let remote = Arc::new(FakeRemote::with_notes(vec![remote_note("new", "New", "x")]));
        let (manager, store) = manager(fs, &remote, state);

        let err = manager.sync_from_server(false).await.unwrap_err();

        assert!(matches!(err, SyncError::Filesystem(FsError::NotDirectory(_))));
        assert_eq!(store.load().unwrap().cursor(ServiceKind::Notes), prior);
        let status = manager.sync_status();
        assert_eq!(status.phase, SyncPhase::Failed);
        assert_eq!(status.errors.len(), 1);
        assert_eq!(status.last_summary.map(|s| s.total), Some(1));
    }

    #[tokio::test]
    async fn test_fetch_error_fails_pass_without_touching_cursor() {
        let fs = Arc::new(InMemoryFs::new());
        let remote = Arc::new(FakeRemote::new());
        remote.push_error(SyncError::RequestFailed {
            status: 401,
            message: "bad token".into(),
        });
        let (manager, store) = manager(fs, &remote, state_with(ConflictPolicy::Manual));

        let err = manager.sync_from_server(false).await.unwrap_err();

        assert_eq!(err.status(), Some(401));
        assert!(store.load().unwrap().cursors.is_empty());
        assert_eq!(manager.sync_status().phase, SyncPhase::Failed);
    }

    #[tokio::test]
    async fn test_cancel_stops_item_processing() {
        let fs = Arc::new(InMemoryFs::new());
        let remote = Arc::new(FakeRemote::with_notes(vec![
            remote_note("a", "A", "1"),
            remote_note("b", "B", "2"),
            remote_note("c", "C", "3"),
        ]));
        let (manager, _store) = manager(fs.clone(), &remote, state_with(ConflictPolicy::Manual));
        let cancel = manager.cancel_handle();
        let _sub = manager.subscribe(move |event| {
            if let SyncEvent::ItemProcessed { .. } = event {
                cancel.cancel();
            }
        });

        let summary = manager.sync_from_server(false).await.unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(fs.paths(), vec!["Notes/A.md"]);
        assert_eq!(manager.sync_status().phase, SyncPhase::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_keeps_recorded_errors() {
        let fs = Arc::new(FailingFs {
            inner: InMemoryFs::new(),
            fail_on: "Broken".into(),
        });
        let remote = Arc::new(FakeRemote::with_notes(vec![
            remote_note("a", "Broken", "1"),
            remote_note("b", "Second", "2"),
            remote_note("c", "Third", "3"),
        ]));
        let (manager, _store) = manager(fs.clone(), &remote, state_with(ConflictPolicy::Manual));
        let cancel = manager.cancel_handle();
        let _sub = manager.subscribe(move |event| {
            if let SyncEvent::ItemProcessed { outcome: ItemOutcome::Failed, .. } = event {
                cancel.cancel();
            }
        });

        let summary = manager.sync_from_server(false).await.unwrap();

        assert!(summary.cancelled);
        assert_eq!((summary.succeeded, summary.errored), (0, 1));
        assert!(fs.inner.paths().is_empty());
        let status = manager.sync_status();
        assert_eq!(status.phase, SyncPhase::Cancelled);
        assert_eq!(status.errors.len(), 1);
        assert_eq!(status.errors[0].label, "Broken");
        assert_eq!(status.last_summary, Some(summary));
    }

    #[tokio::test]
    async fn test_second_sync_rejected_while_running() {
        let fs = Arc::new(InMemoryFs::new());
        let remote = Arc::new(FakeRemote::gated());
        let (manager, _store) = manager(fs, &remote, state_with(ConflictPolicy::Manual));
        let (started, release) = remote.gate.as_ref().unwrap();

        let (first, second) = tokio::join!(manager.sync_from_server(false), async {
            started.notified().await;
            let second = manager.sync_to_server().await;
            release.notify_one();
            second
        });

        assert!(first.is_ok());
        assert!(matches!(second, Err(SyncError::AlreadyRunning)));
        assert!(!manager.is_syncing());
    }

    #[tokio::test]
    async fn test_push_creates_and_writes_back_id() {
        let fs = Arc::new(InMemoryFs::new());
        fs.write("Notes/idea.md", b"---\ntitle: Big idea\ntags: [inbox]\n---\n\nwhat if")
            .await
            .unwrap();
        fs.write("Notes/plain.md", b"no front matter").await.unwrap();
        let remote = Arc::new(FakeRemote::new());
        let (manager, store) = manager(fs.clone(), &remote, state_with(ConflictPolicy::Manual));

        let summary = manager.sync_to_server().await.unwrap();

        assert_eq!((summary.total, summary.succeeded), (2, 2));
        let created = remote.created();
        assert_eq!(created[0].title, "Big idea");
        assert_eq!(created[0].body, "what if");
        assert_eq!(created[0].tags, vec!["inbox"]);
        assert_eq!(created[1].title, "plain");

        let idea = frontmatter::decode(&fs.text("Notes/idea.md").unwrap()).unwrap();
        assert_eq!(idea.front_matter.remote_id(), Some("srv-1"));
        assert_eq!(idea.front_matter.get_str(frontmatter::SERVICE), Some("notes"));
        assert_eq!(idea.front_matter.sync_state(), Some(NoteSyncState::Synced));
        assert!(idea.front_matter.timestamp(frontmatter::LAST_SYNCED).is_some());
        assert_eq!(idea.body, "what if");

        let plain = frontmatter::decode(&fs.text("Notes/plain.md").unwrap()).unwrap();
        assert_eq!(plain.front_matter.remote_id(), Some("srv-2"));
        assert_eq!(plain.body, "no front matter");
        assert_eq!(store.load().unwrap().id_cache.lookup("srv-2"), Some("Notes/plain.md"));
    }

    #[tokio::test]
    async fn test_push_keeps_foreign_front_matter_keys() {
        let fs = Arc::new(InMemoryFs::new());
        fs.write(
            "Notes/idea.md",
            b"---\nCreated Date: 2024-01-01\ntitle: Big idea\n---\n\nwhat if",
        )
        .await
        .unwrap();
        let remote = Arc::new(FakeRemote::new());
        let (manager, _store) = manager(fs.clone(), &remote, state_with(ConflictPolicy::Manual));

        manager.sync_to_server().await.unwrap();

        let created = remote.created();
        assert_eq!(created[0].title, "Big idea");
        assert_eq!(created[0].body, "what if");

        let text = fs.text("Notes/idea.md").unwrap();
        assert_eq!(text.matches("---\n").count(), 2);
        let idea = frontmatter::decode(&text).unwrap();
        assert_eq!(idea.front_matter.get_str("Created Date"), Some("2024-01-01"));
        assert_eq!(idea.front_matter.remote_id(), Some("srv-1"));
        assert_eq!(idea.body, "what if");
    }

    #[tokio::test]
    async fn test_push_updates_only_modified_notes() {
        let fs = Arc::new(InMemoryFs::new());
        let now = Utc::now();
        let fresh = format!(
            "---\nremote_id: r1\nsync_status: synced\nlast_synced: {}\n---\n\nunchanged",
            now.to_rfc3339()
        );
        fs.write("Notes/fresh.md", fresh.as_bytes()).await.unwrap();
        fs.set_mtime("Notes/fresh.md", now.timestamp_millis() as u64);
        fs.write(
            "Notes/edited.md",
            b"---\nremote_id: r2\nsync_status: synced\nlast_synced: 2020-01-01T00:00:00+00:00\n---\n\nedited",
        )
        .await
        .unwrap();
        let remote = Arc::new(FakeRemote::new());
        let (manager, _store) = manager(fs.clone(), &remote, state_with(ConflictPolicy::Manual));

        let summary = manager.sync_to_server().await.unwrap();

        assert_eq!((summary.succeeded, summary.skipped), (1, 1));
        let updated = remote.updated();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].0, "r2");
        assert_eq!(updated[0].1.body, "edited");
        assert!(remote.created().is_empty());
    }

    #[tokio::test]
    async fn test_push_reports_unresolved_conflicts() {
        let fs = Arc::new(InMemoryFs::new());
        fs.write("Notes/c.md", b"---\nremote_id: r1\nsync_status: conflict\n---\n\nmarkers")
            .await
            .unwrap();
        let remote = Arc::new(FakeRemote::new());
        let (manager, _store) = manager(fs, &remote, state_with(ConflictPolicy::Manual));

        let summary = manager.sync_to_server().await.unwrap();

        assert_eq!(summary.errored, 1);
        assert!(remote.updated().is_empty());
        assert_eq!(manager.sync_status().errors[0].label, "Notes/c.md");

        manager.clear_errors();
        assert!(manager.sync_status().errors.is_empty());
    }
}
