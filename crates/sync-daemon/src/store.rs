//! On-disk sync state.
//!
//! Settings, cursors and the id cache live in `.note-sync/state.json` within
//! the vault. Dot-folders are never treated as notes, so the file stays out of
//! every sync pass.

use std::fs;
use std::path::{Path, PathBuf};
use sync_core::error::{Result, SyncError};
use sync_core::state::{PersistedState, StateStore};
use tracing::debug;

pub const STATE_DIR: &str = ".note-sync";
pub const STATE_FILE: &str = "state.json";

/// [`StateStore`] backed by a pretty-printed JSON file.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Store for the vault at `vault_path`.
    pub fn for_vault(vault_path: &Path) -> Self {
        Self::new(vault_path.join(STATE_DIR).join(STATE_FILE))
    }

    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for JsonFileStore {
    fn load(&self) -> Result<PersistedState> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No saved state, using defaults");
            return Ok(PersistedState::default());
        }

        let contents = fs::read_to_string(&self.path)
            .map_err(|e| SyncError::State(format!("{}: {e}", self.path.display())))?;
        serde_json::from_str(&contents)
            .map_err(|e| SyncError::State(format!("{}: {e}", self.path.display())))
    }

    fn save(&self, state: &PersistedState) -> Result<()> {
        // Ensure directory exists
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| SyncError::State(e.to_string()))?;
        }

        let contents =
            serde_json::to_string_pretty(state).map_err(|e| SyncError::State(e.to_string()))?;
        fs::write(&self.path, contents).map_err(|e| SyncError::State(e.to_string()))
    }
}
