//! User-facing configuration, persisted alongside the sync state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Which remote service a manager talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// Cursor-paginated notes API with bearer auth.
    Notes,
    /// Signed memo API with `{ code, data }` envelopes.
    Memos,
}

impl ServiceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceKind::Notes => "notes",
            ServiceKind::Memos => "memos",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "notes" => Ok(ServiceKind::Notes),
            "memos" => Ok(ServiceKind::Memos),
            other => Err(format!("unknown service: {other} (expected notes or memos)")),
        }
    }
}

/// What to do when a pulled note differs from its local copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Overwrite the local body with the remote one.
    PreferRemote,
    /// Keep the local file untouched.
    PreferLocal,
    /// Write both versions between conflict markers and flag the note.
    #[default]
    Manual,
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prefer-remote" | "remote" => Ok(ConflictPolicy::PreferRemote),
            "prefer-local" | "local" => Ok(ConflictPolicy::PreferLocal),
            "manual" => Ok(ConflictPolicy::Manual),
            other => Err(format!(
                "unknown conflict policy: {other} (expected prefer-remote, prefer-local or manual)"
            )),
        }
    }
}

/// Connection details for one remote service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    pub base_url: String,
    /// Bearer token. Empty means not configured.
    pub token: String,
    /// Vault folder that holds this service's notes.
    pub sync_folder: String,
    /// Item limit for the first (bounded) sync.
    pub fetch_limit: usize,
}

impl ServiceSettings {
    fn defaults_for(kind: ServiceKind) -> Self {
        match kind {
            ServiceKind::Notes => Self {
                base_url: "https://notes.example.com/api".to_string(),
                token: String::new(),
                sync_folder: "Notes".to_string(),
                fetch_limit: 100,
            },
            ServiceKind::Memos => Self {
                base_url: "https://memos.example.com".to_string(),
                token: String::new(),
                sync_folder: "Memos".to_string(),
                fetch_limit: 200,
            },
        }
    }
}

/// Extra parameters the memo service folds into every signed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningSettings {
    pub api_key: String,
    pub secret: String,
    pub app_version: String,
    pub platform: String,
}

impl Default for SigningSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            secret: String::new(),
            app_version: "4.0".to_string(),
            platform: "web".to_string(),
        }
    }
}

/// Retry behavior for transient remote failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: u32,
    /// Application error codes treated as transient.
    pub retryable_codes: Vec<i64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_factor: 2,
            retryable_codes: vec![429, 500, 502, 503, 504],
        }
    }
}

impl RetryPolicy {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub service: ServiceKind,
    pub notes: ServiceSettings,
    pub memos: ServiceSettings,
    pub signing: SigningSettings,
    pub conflict_policy: ConflictPolicy,
    /// Periodic pull interval; `None` disables auto-sync.
    pub auto_sync_interval_minutes: Option<u64>,
    /// Page ceiling for one fetch, guarding against servers that never
    /// report the end of the list.
    pub max_pages: usize,
    pub request_timeout_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            service: ServiceKind::Notes,
            notes: ServiceSettings::defaults_for(ServiceKind::Notes),
            memos: ServiceSettings::defaults_for(ServiceKind::Memos),
            signing: SigningSettings::default(),
            conflict_policy: ConflictPolicy::default(),
            auto_sync_interval_minutes: None,
            max_pages: 50,
            request_timeout_secs: 30,
            retry: RetryPolicy::default(),
        }
    }
}

impl Settings {
    /// Settings of the currently selected service.
    pub fn active(&self) -> &ServiceSettings {
        self.service_settings(self.service)
    }

    pub fn service_settings(&self, kind: ServiceKind) -> &ServiceSettings {
        match kind {
            ServiceKind::Notes => &self.notes,
            ServiceKind::Memos => &self.memos,
        }
    }

    pub fn service_settings_mut(&mut self, kind: ServiceKind) -> &mut ServiceSettings {
        match kind {
            ServiceKind::Notes => &mut self.notes,
            ServiceKind::Memos => &mut self.memos,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
