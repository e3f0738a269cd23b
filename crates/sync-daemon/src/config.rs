use std::path::PathBuf;
use sync_core::settings::{ConflictPolicy, ServiceKind, Settings};

/// Vault location resolved from the command line.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the vault root directory
    pub vault_path: PathBuf,
    /// Name of the vault (derived from vault_path)
    pub vault_name: String,
}

impl Config {
    /// Resolve `raw` (supports ~ for home directory) and check it is a directory.
    pub fn from_path(raw: &str) -> Result<Self, ConfigError> {
        let vault_path = expand_tilde(raw);
        if !vault_path.is_dir() {
            return Err(ConfigError::VaultNotFound(vault_path));
        }

        let vault_name = vault_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("vault")
            .to_string();

        Ok(Self {
            vault_path,
            vault_name,
        })
    }
}

/// Settings given on the command line or through the environment. They take
/// precedence over the persisted settings and are saved with them.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub service: Option<ServiceKind>,
    pub base_url: Option<String>,
    pub token: Option<String>,
    pub api_key: Option<String>,
    pub secret: Option<String>,
    pub folder: Option<String>,
    pub conflict_policy: Option<ConflictPolicy>,
    pub interval_minutes: Option<u64>,
}

impl Overrides {
    /// Apply to `settings`. Service-specific values go to the service that
    /// ends up selected.
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(service) = self.service {
            settings.service = service;
        }
        if let Some(policy) = self.conflict_policy {
            settings.conflict_policy = policy;
        }
        if let Some(minutes) = self.interval_minutes {
            settings.auto_sync_interval_minutes = Some(minutes);
        }
        if let Some(api_key) = &self.api_key {
            settings.signing.api_key = api_key.clone();
        }
        if let Some(secret) = &self.secret {
            settings.signing.secret = secret.clone();
        }

        let active = settings.service_settings_mut(settings.service);
        if let Some(base_url) = &self.base_url {
            active.base_url = base_url.clone();
        }
        if let Some(token) = &self.token {
            active.token = token.clone();
        }
        if let Some(folder) = &self.folder {
            active.sync_folder = folder.trim_matches('/').to_string();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.service.is_none()
            && self.base_url.is_none()
            && self.token.is_none()
            && self.api_key.is_none()
            && self.secret.is_none()
            && self.folder.is_none()
            && self.conflict_policy.is_none()
            && self.interval_minutes.is_none()
    }
}

/// Expand ~ or ~/ prefix to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"))
    } else if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path))
    } else {
        PathBuf::from(path)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Vault directory not found: {0}")]
    VaultNotFound(PathBuf),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_expand_tilde() {
        assert_eq!(expand_tilde("/srv/vault"), PathBuf::from("/srv/vault"));
        assert_eq!(expand_tilde("notes~/x"), PathBuf::from("notes~/x"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde("~"), home);
            assert_eq!(expand_tilde("~/vault"), home.join("vault"));
        }
    }

    #[test]
    fn test_config_requires_directory() {
        let dir = TempDir::new().unwrap();
        let config = Config::from_path(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(config.vault_path, dir.path());

        let missing = dir.path().join("missing");
        assert!(matches!(
            Config::from_path(missing.to_str().unwrap()),
            Err(ConfigError::VaultNotFound(_))
        ));
    }

    #[test]
    fn test_overrides_target_selected_service() {
        let mut settings = Settings::default();
        let overrides = Overrides {
            service: Some(ServiceKind::Memos),
            token: Some("tok".into()),
            folder: Some("/Inbox/".into()),
            secret: Some("s3cret".into()),
            conflict_policy: Some(ConflictPolicy::PreferLocal),
            ..Overrides::default()
        };

        overrides.apply(&mut settings);

        assert_eq!(settings.service, ServiceKind::Memos);
        assert_eq!(settings.memos.token, "tok");
        assert_eq!(settings.memos.sync_folder, "Inbox");
        assert_eq!(settings.notes.token, "");
        assert_eq!(settings.notes.sync_folder, "Notes");
        assert_eq!(settings.signing.secret, "s3cret");
        assert_eq!(settings.conflict_policy, ConflictPolicy::PreferLocal);
    }

    #[test]
    fn test_empty_overrides_change_nothing() {
        let overrides = Overrides::default();
        assert!(overrides.is_empty());

        let mut settings = Settings::default();
        overrides.apply(&mut settings);
        assert_eq!(settings, Settings::default());
    }
}
