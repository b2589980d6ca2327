//! Optional `tracing` subscriber for hosts that do not install their own.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// `EnvFilter` directives, e.g. `warn,consult_orchestrator=debug`.
pub const LOG_ENV: &str = "CONSULT_LOG";
pub const LOG_FILE_ENV: &str = "CONSULT_LOG_FILE";

pub const DEFAULT_DIRECTIVES: &str = "warn,consult_orchestrator=info,recording_sdk=info";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogConfig {
    pub directives: String,
    /// Appends to this file instead of stderr.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directives: DEFAULT_DIRECTIVES.to_string(),
            file: None,
        }
    }
}

impl LogConfig {
    pub fn from_env() -> Self {
        let read = |var: &str| {
            std::env::var(var)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        Self {
            directives: read(LOG_ENV).unwrap_or_else(|| DEFAULT_DIRECTIVES.to_string()),
            file: read(LOG_FILE_ENV).map(PathBuf::from),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("invalid log directives {directives:?}: {source}")]
    Directives {
        directives: String,
        source: tracing_subscriber::filter::ParseError,
    },
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("another global subscriber is already installed")]
    AlreadyInstalled,
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Repeated calls after a successful one are
/// no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }
    let filter = EnvFilter::try_new(&config.directives).map_err(|source| InitError::Directives {
        directives: config.directives.clone(),
        source,
    })?;

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber).map_err(|_| InitError::AlreadyInstalled)?;
    let _ = GUARD.set(guard);

    tracing::debug!(
        target = "consult::telemetry",
        directives = %config.directives,
        file = ?config.file,
        "logging initialized"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    #[test]
    fn config_reads_directives_and_file_from_env() {
        let _guard = ENV_MUTEX.lock().unwrap();
        unsafe {
            std::env::set_var(LOG_ENV, " consult_orchestrator=trace ");
            std::env::set_var(LOG_FILE_ENV, "/tmp/consult.log");
        }
        let config = LogConfig::from_env();
        assert_eq!(config.directives, "consult_orchestrator=trace");
        assert_eq!(config.file, Some(PathBuf::from("/tmp/consult.log")));

        unsafe {
            std::env::set_var(LOG_ENV, "");
            std::env::remove_var(LOG_FILE_ENV);
        }
        assert_eq!(LogConfig::from_env(), LogConfig::default());
        unsafe {
            std::env::remove_var(LOG_ENV);
        }
    }

    #[test]
    fn bad_directives_are_rejected_before_installing() {
        let config = LogConfig {
            directives: "consult_orchestrator=loud".into(),
            file: None,
        };
        assert!(matches!(init(&config), Err(InitError::Directives { .. })));
    }

    #[test]
    fn unwritable_file_is_reported() {
        let config = LogConfig {
            directives: DEFAULT_DIRECTIVES.into(),
            file: Some(PathBuf::from("/nonexistent-dir/consult.log")),
        };
        assert!(matches!(init(&config), Err(InitError::Io { .. })));
    }
}
