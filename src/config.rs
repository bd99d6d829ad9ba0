use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use serde::Deserialize;

use crate::profile::ProfileConfig;
use crate::profile::edit::EditPolicy;

/// Application configuration loaded from TOML config file.
/// All fields have defaults, so the config file is optional.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Custom store path (overrides XDG default).
    pub db_path: Option<PathBuf>,
    /// Superseded store locations to import from when `db_path` does not exist yet.
    pub legacy_db_paths: Vec<PathBuf>,
    /// Longest silence (seconds) between plays of one listening session.
    pub session_gap_secs: u64,
    /// What happens to an artist or album once its last song is deleted.
    pub empty_parent_policy: EmptyParentPolicy,
    /// Keep renamed or manually rated songs when their last play is removed.
    pub retain_overridden_songs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            legacy_db_paths: default_legacy_paths(),
            session_gap_secs: 30 * 60,
            empty_parent_policy: EmptyParentPolicy::Delete,
            retain_overridden_songs: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmptyParentPolicy {
    #[default]
    Delete,
    Retain,
}

impl AppConfig {
    /// Load config from `~/.config/listenlog/config.toml`.
    /// Returns default config if file doesn't exist.
    /// Logs a warning if the file exists but can't be parsed.
    pub fn load() -> Self {
        let config_path = Self::config_path();
        match config_path {
            Some(path) if path.exists() => {
                match std::fs::read_to_string(&path) {
                    Ok(contents) => match Self::parse(&contents) {
                        Ok(config) => {
                            log::info!("Loaded config from {}", path.display());
                            config
                        }
                        Err(e) => {
                            log::warn!(
                                "Failed to parse {}: {}. Using defaults.",
                                path.display(),
                                e
                            );
                            Self::default()
                        }
                    },
                    Err(e) => {
                        log::warn!(
                            "Failed to read {}: {}. Using defaults.",
                            path.display(),
                            e
                        );
                        Self::default()
                    }
                }
            }
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Facade settings for a store at `db_path`.
    pub fn profile_config(&self, db_path: PathBuf) -> ProfileConfig {
        ProfileConfig {
            db_path,
            legacy_db_paths: self.legacy_db_paths.clone(),
            session_gap: Duration::from_secs(self.session_gap_secs),
            policy: EditPolicy {
                empty_parents: self.empty_parent_policy,
                retain_overridden_songs: self.retain_overridden_songs,
            },
        }
    }

    /// Get the config file path.
    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

/// Resolve the default store path using XDG data directory.
pub fn default_db_path() -> PathBuf {
    if let Some(dirs) = ProjectDirs::from("", "", crate::APP_NAME) {
        dirs.data_dir().join("profile.db")
    } else {
        // Fallback: current directory
        PathBuf::from("profile.db")
    }
}

/// Where earlier releases kept the store.
fn default_legacy_paths() -> Vec<PathBuf> {
    ProjectDirs::from("", "", crate::APP_NAME)
        .map(|dirs| vec![dirs.data_dir().join("toplists.data")])
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.session_gap_secs, 1800);
        assert_eq!(config.empty_parent_policy, EmptyParentPolicy::Delete);
        assert!(config.retain_overridden_songs);
        assert!(config.db_path.is_none());
    }

    #[test]
    fn test_partial_config_overrides() {
        let config = AppConfig::parse(
            r#"
            session_gap_secs = 300
            empty_parent_policy = "retain"
            legacy_db_paths = ["/tmp/old.data"]
            "#,
        )
        .unwrap();
        assert_eq!(config.session_gap_secs, 300);
        assert_eq!(config.empty_parent_policy, EmptyParentPolicy::Retain);
        assert_eq!(config.legacy_db_paths, vec![PathBuf::from("/tmp/old.data")]);

        let profile = config.profile_config(PathBuf::from("/tmp/p.db"));
        assert_eq!(profile.session_gap, Duration::from_secs(300));
        assert_eq!(profile.policy.empty_parents, EmptyParentPolicy::Retain);
    }

    #[test]
    fn test_unknown_policy_is_rejected() {
        assert!(AppConfig::parse("empty_parent_policy = \"explode\"").is_err());
    }
}
