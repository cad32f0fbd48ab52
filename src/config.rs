use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::logger::LogConfig;

pub const LOG_LEVEL: &str = "SLANG_LOG_LEVEL";
pub const LOG_DIR: &str = "SLANG_LOG_DIR";
pub const LIBRARY_DIR: &str = "SLANG_LIBRARY_DIR";
pub const JSON_LOGS: &str = "SLANG_JSON_LOGS";

/// Process settings, read from the environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
    /// Directory of operator definitions registered by file stem.
    pub library_dir: Option<PathBuf>,
    pub json_logs: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            library_dir: None,
            json_logs: false,
        }
    }
}

/// What happened to the `.env` file handed to `Config::from_env`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvFile {
    NotRequested,
    Loaded(PathBuf),
    Missing(PathBuf),
    Failed(PathBuf, String),
}

impl EnvFile {
    pub fn log(&self) {
        match self {
            EnvFile::NotRequested => {}
            EnvFile::Loaded(path) => info!("loaded .env from {}", path.display()),
            EnvFile::Missing(path) => warn!("no .env at {}", path.display()),
            EnvFile::Failed(path, e) => warn!("could not load .env from {}: {e}", path.display()),
        }
    }
}

impl Config {
    /// Loads `env_file` (if any) into the environment, then reads the
    /// `SLANG_*` variables. Variables already set win over the file.
    ///
    /// This runs before logging is set up, so the outcome of loading the
    /// file is returned for the caller to `log` afterwards.
    pub fn from_env(env_file: Option<&Path>) -> (Self, EnvFile) {
        let loaded = match env_file {
            None => EnvFile::NotRequested,
            Some(path) if !path.exists() => EnvFile::Missing(path.to_path_buf()),
            Some(path) => match dotenvy::from_path(path) {
                Ok(()) => EnvFile::Loaded(path.to_path_buf()),
                Err(e) => EnvFile::Failed(path.to_path_buf(), e.to_string()),
            },
        };
        (Self::from_vars(|key| env::var(key).ok()), loaded)
    }

    fn from_vars(get: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_empty = |key: &str| get(key).filter(|v| !v.trim().is_empty());
        Self {
            log_level: non_empty(LOG_LEVEL).unwrap_or(defaults.log_level),
            log_dir: non_empty(LOG_DIR).map(PathBuf::from),
            library_dir: non_empty(LIBRARY_DIR).map(PathBuf::from),
            json_logs: non_empty(JSON_LOGS)
                .is_some_and(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")),
        }
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            log_level: self.log_level.clone(),
            log_dir: self.log_dir.clone(),
            json: self.json_logs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_variables() {
        assert_eq!(Config::from_vars(lookup(&[])), Config::default());
    }

    #[test]
    fn test_reads_variables() {
        let config = Config::from_vars(lookup(&[
            (LOG_LEVEL, "debug"),
            (LOG_DIR, "/var/log/slang"),
            (LIBRARY_DIR, "ops"),
            (JSON_LOGS, "True"),
        ]));
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.log_dir, Some(PathBuf::from("/var/log/slang")));
        assert_eq!(config.library_dir, Some(PathBuf::from("ops")));
        assert!(config.json_logs);

        let log = config.log_config();
        assert_eq!(log.log_level, "debug");
        assert!(log.json);
    }

    #[test]
    fn test_blank_values_fall_back() {
        let config = Config::from_vars(lookup(&[(LOG_LEVEL, "  "), (JSON_LOGS, "no")]));
        assert_eq!(config.log_level, "info");
        assert!(!config.json_logs);
    }

    #[test]
    fn test_env_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        fs::write(&path, format!("{LIBRARY_DIR}=from-dotenv\n")).unwrap();

        let (config, loaded) = Config::from_env(Some(path.as_path()));
        assert_eq!(config.library_dir, Some(PathBuf::from("from-dotenv")));
        assert_eq!(loaded, EnvFile::Loaded(path.clone()));

        let missing_path = dir.path().join("missing.env");
        let (missing, outcome) = Config::from_env(Some(missing_path.as_path()));
        assert!(!missing.log_level.is_empty());
        assert_eq!(outcome, EnvFile::Missing(missing_path));

        let (_, outcome) = Config::from_env(None);
        assert_eq!(outcome, EnvFile::NotRequested);
    }
}
