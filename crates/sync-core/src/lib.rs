//! sync-core: pull/push synchronization between a Markdown vault and a remote
//! note service.
//!
//! This crate provides:
//! - Clients for the two supported note services behind one `RemoteService` trait
//! - Front-matter parsing/serializing for synced notes
//! - A remote-id → path cache persisted with the sync state
//! - `SyncManager`, which runs pull and push passes with progress reporting
//! - The `FileSystem` trait the manager uses to reach the vault

pub mod auto_sync;
pub mod cancel;
pub mod error;
pub mod events;
pub mod frontmatter;
pub mod fs;
pub mod id_cache;
pub mod manager;
pub mod remote;
pub mod retry;
pub mod settings;
pub mod state;
pub mod status;

pub use auto_sync::{AutoSyncHandle, spawn_auto_sync};
pub use cancel::CancelToken;
pub use error::{Result, SyncError};
pub use events::{EventBus, ItemOutcome, Subscription, SyncEvent};
pub use frontmatter::{FieldValue, FrontMatter, NoteSyncState, ParsedNote};
pub use fs::{FileEntry, FileStat, FileSystem, FsError, InMemoryFs};
pub use id_cache::IdCache;
pub use manager::{PullMode, SyncManager};
pub use remote::{NoteDraft, Page, PageRequest, RemoteNote, RemoteService, select_remote};
pub use settings::{ConflictPolicy, RetryPolicy, ServiceKind, ServiceSettings, Settings, SigningSettings};
pub use state::{MemoryStateStore, PersistedState, StateStore, SyncCursor};
pub use status::{SyncDirection, SyncErrorEntry, SyncPhase, SyncStatus, SyncSummary};
