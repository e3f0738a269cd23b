//! State that survives restarts: settings, per-service cursors and the ID cache.
//!
//! Stored as one JSON blob. Where the blob lives is up to the [`StateStore`];
//! the daemon keeps it in a file inside the vault.

use crate::error::Result;
use crate::id_cache::IdCache;
use crate::settings::{ServiceKind, Settings};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Where the last pull stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncCursor {
    pub last_sync_id: Option<String>,
    pub last_sync_time: Option<DateTime<Utc>>,
}

impl SyncCursor {
    pub fn is_empty(&self) -> bool {
        self.last_sync_id.is_none() && self.last_sync_time.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    pub settings: Settings,
    pub cursors: BTreeMap<ServiceKind, SyncCursor>,
    pub id_cache: IdCache,
}

impl PersistedState {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    pub fn cursor(&self, kind: ServiceKind) -> SyncCursor {
        self.cursors.get(&kind).cloned().unwrap_or_default()
    }

    pub fn set_cursor(&mut self, kind: ServiceKind, cursor: SyncCursor) {
        if cursor.is_empty() {
            self.cursors.remove(&kind);
        } else {
            self.cursors.insert(kind, cursor);
        }
    }
}

/// Loads and saves [`PersistedState`].
pub trait StateStore: Send + Sync {
    /// Stored state, or defaults when nothing has been saved yet.
    fn load(&self) -> Result<PersistedState>;

    fn save(&self, state: &PersistedState) -> Result<()>;
}

/// Keeps the state in memory. Used in tests and for one-shot runs.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<Option<PersistedState>>,
    saves: Mutex<usize>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: PersistedState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
            saves: Mutex::new(0),
        }
    }

    /// Number of completed saves.
    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<PersistedState> {
        Ok(self
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_default())
    }

    fn save(&self, state: &PersistedState) -> Result<()> {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = Some(state.clone());
        *self.saves.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }
}
