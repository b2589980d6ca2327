use std::time::Duration;

use recording_sdk::{RecordingApiError, RecordingClient};
use thiserror::Error;

use crate::media::MediaConstraints;

pub const CONNECT_TIMEOUT_ENV: &str = "CONSULT_CONNECT_TIMEOUT_MS";
pub const VIDEO_RESOLUTION_ENV: &str = "CONSULT_VIDEO_RESOLUTION";
pub const FRAME_RATE_ENV: &str = "CONSULT_FRAME_RATE";
pub const FALLBACK_NAME_ENV: &str = "CONSULT_FALLBACK_NAME";
pub const CHAT_MAX_LENGTH_ENV: &str = "CONSULT_CHAT_MAX_LENGTH";
pub const CHAT_HISTORY_ENV: &str = "CONSULT_CHAT_HISTORY";
pub const EVENT_CAPACITY_ENV: &str = "CONSULT_EVENT_CAPACITY";
pub const RECORDING_API_ENV: &str = "CONSULT_RECORDING_API";

pub const DEFAULT_FALLBACK_NAME: &str = "참가자";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} has invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("no recording API configured (set {RECORDING_API_ENV})")]
    MissingRecordingApi,
    #[error(transparent)]
    Recording(#[from] RecordingApiError),
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound for a connect attempt, permission check included.
    pub connect_timeout: Duration,
    pub media: MediaConstraints,
    /// Label for participants whose metadata carries no name.
    pub fallback_name: String,
    pub chat_max_length: usize,
    pub chat_history: usize,
    pub event_capacity: usize,
    pub recording_api_base: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(15_000),
            media: MediaConstraints::default(),
            fallback_name: DEFAULT_FALLBACK_NAME.to_string(),
            chat_max_length: 1_000,
            chat_history: 500,
            event_capacity: 256,
            recording_api_base: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(ms) = parse_var::<u64>(CONNECT_TIMEOUT_ENV)? {
            if ms == 0 {
                return Err(invalid(CONNECT_TIMEOUT_ENV, "0", "must be positive"));
            }
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(raw) = read_var(VIDEO_RESOLUTION_ENV) {
            let (width, height) = parse_resolution(&raw)
                .ok_or_else(|| invalid(VIDEO_RESOLUTION_ENV, &raw, "expected WIDTHxHEIGHT"))?;
            config.media.width = width;
            config.media.height = height;
        }
        if let Some(fps) = parse_var::<u32>(FRAME_RATE_ENV)? {
            config.media.frame_rate = fps;
        }
        if let Some(name) = read_var(FALLBACK_NAME_ENV) {
            config.fallback_name = name;
        }
        if let Some(len) = parse_var::<usize>(CHAT_MAX_LENGTH_ENV)? {
            config.chat_max_length = len;
        }
        if let Some(history) = parse_var::<usize>(CHAT_HISTORY_ENV)? {
            config.chat_history = history;
        }
        if let Some(capacity) = parse_var::<usize>(EVENT_CAPACITY_ENV)? {
            config.event_capacity = capacity;
        }
        config.recording_api_base = read_var(RECORDING_API_ENV);

        for (var, value) in [
            (FRAME_RATE_ENV, config.media.frame_rate as usize),
            (CHAT_MAX_LENGTH_ENV, config.chat_max_length),
            (CHAT_HISTORY_ENV, config.chat_history),
            (EVENT_CAPACITY_ENV, config.event_capacity),
        ] {
            if value == 0 {
                return Err(invalid(var, "0", "must be positive"));
            }
        }
        Ok(config)
    }

    /// REST client for the configured recording API.
    pub fn recording_client(&self, bearer: &str) -> Result<RecordingClient, ConfigError> {
        let base = self
            .recording_api_base
            .as_deref()
            .ok_or(ConfigError::MissingRecordingApi)?;
        Ok(RecordingClient::new(base, bearer)?)
    }
}

fn read_var(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_var<T>(var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    read_var(var)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|err| invalid(var, &raw, &err.to_string()))
        })
        .transpose()
}

fn parse_resolution(raw: &str) -> Option<(u32, u32)> {
    let (width, height) = raw.split_once(['x', 'X'])?;
    let width = width.trim().parse().ok().filter(|w: &u32| *w > 0)?;
    let height = height.trim().parse().ok().filter(|h: &u32| *h > 0)?;
    Some((width, height))
}

fn invalid(var: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const ALL_VARS: &[&str] = &[
        CONNECT_TIMEOUT_ENV,
        VIDEO_RESOLUTION_ENV,
        FRAME_RATE_ENV,
        FALLBACK_NAME_ENV,
        CHAT_MAX_LENGTH_ENV,
        CHAT_HISTORY_ENV,
        EVENT_CAPACITY_ENV,
        RECORDING_API_ENV,
    ];

    fn clear_env() {
        for var in ALL_VARS {
            unsafe {
                std::env::remove_var(var);
            }
        }
    }

    #[test]
    fn defaults_without_environment() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        let config = OrchestratorConfig::from_env().expect("defaults");
        assert_eq!(config.connect_timeout, Duration::from_secs(15));
        assert_eq!(config.media.resolution(), "640x480");
        assert_eq!(config.media.frame_rate, 30);
        assert_eq!(config.fallback_name, "참가자");
        assert_eq!(config.chat_max_length, 1_000);
        assert_eq!(config.chat_history, 500);
        assert!(config.recording_api_base.is_none());
        assert!(matches!(
            config.recording_client("token"),
            Err(ConfigError::MissingRecordingApi)
        ));
    }

    #[test]
    fn overrides_are_applied() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            std::env::set_var(CONNECT_TIMEOUT_ENV, "2500");
            std::env::set_var(VIDEO_RESOLUTION_ENV, "1280X720");
            std::env::set_var(FALLBACK_NAME_ENV, " Guest ");
            std::env::set_var(RECORDING_API_ENV, "localhost:8080/api");
        }
        let config = OrchestratorConfig::from_env().expect("config");
        assert_eq!(config.connect_timeout, Duration::from_millis(2_500));
        assert_eq!((config.media.width, config.media.height), (1280, 720));
        assert_eq!(config.fallback_name, "Guest");
        let client = config.recording_client("token").expect("client");
        assert_eq!(client.base_url().scheme(), "http");
        clear_env();
    }

    #[test]
    fn invalid_values_are_errors() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            std::env::set_var(VIDEO_RESOLUTION_ENV, "wide");
        }
        assert!(matches!(
            OrchestratorConfig::from_env(),
            Err(ConfigError::Invalid {
                var: VIDEO_RESOLUTION_ENV,
                ..
            })
        ));
        clear_env();
        unsafe {
            std::env::set_var(CHAT_HISTORY_ENV, "0");
        }
        assert!(OrchestratorConfig::from_env().is_err());
        unsafe {
            std::env::set_var(CHAT_HISTORY_ENV, "many");
        }
        assert!(OrchestratorConfig::from_env().is_err());
        clear_env();
    }
}
