use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Registry};

pub const LOG_FILE: &str = "slang.log";
pub const EVENT_FILE: &str = "events.json";

// keeps the file writers flushing until the process exits
static GUARDS: OnceCell<Vec<WorkerGuard>> = OnceCell::new();

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogConfig {
    /// An `EnvFilter` directive, e.g. `info` or `slang=debug`.
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
    /// Write stdout as newline-delimited JSON instead of text.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            json: false,
        }
    }
}

/// Installs the global subscriber.
///
/// - stdout gets text or JSON depending on `config.json`
/// - with a `log_dir`, a daily rolling text log and a daily rolling JSON
///   event file are written there as well
pub fn init_tracing(config: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.log_level)
        .with_context(|| format!("invalid log level {:?}", config.log_level))?;

    let stdout_text = (!config.json).then(|| fmt::layer().with_thread_names(true));
    let stdout_json = config.json.then(|| fmt::layer().json().with_target(true));

    let mut guards = Vec::new();
    let (file_text, file_json) = match &config.log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("could not create log dir {}", dir.display()))?;

            let (txt_writer, txt_guard) =
                tracing_appender::non_blocking(RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE));
            let (json_writer, json_guard) =
                tracing_appender::non_blocking(RollingFileAppender::new(Rotation::DAILY, dir, EVENT_FILE));
            guards.push(txt_guard);
            guards.push(json_guard);

            let txt_layer = fmt::layer().with_writer(txt_writer).with_ansi(false);
            let json_layer = fmt::layer()
                .json()
                .with_writer(json_writer)
                .with_target(true)
                .with_current_span(true);
            (Some(txt_layer), Some(json_layer))
        }
        None => (None, None),
    };

    Registry::default()
        .with(filter)
        .with(stdout_text)
        .with(stdout_json)
        .with(file_text)
        .with(file_json)
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    let _ = GUARDS.set(guards);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_is_rejected() {
        let config = LogConfig {
            log_level: "slang=loud".into(),
            ..LogConfig::default()
        };
        assert!(init_tracing(&config).is_err());
    }

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.log_level, "info");
        assert!(config.log_dir.is_none());
        assert!(!config.json);
    }
}
