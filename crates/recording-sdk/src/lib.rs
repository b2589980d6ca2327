//! Asynchronous client for the consultation recording endpoints.
//!
//! Recordings are server-side resources tied to a live session. The client
//! only knows how to start and stop them; whether a session is eligible for
//! recording is decided by the caller.

mod memory;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub use memory::InMemoryRecordingApi;
pub use reqwest::StatusCode as HttpStatus;

#[derive(Debug, Error)]
pub enum RecordingApiError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus { status: StatusCode, body: String },
    #[error("invalid recording endpoint {url}: {reason}")]
    InvalidEndpoint { url: String, reason: String },
    #[error("invalid recording response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRecordingRequest {
    pub consultation_id: String,
}

/// Acknowledgement returned by the start endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingStarted {
    #[serde(alias = "id")]
    pub recording_id: String,
    #[serde(default)]
    pub status: Option<String>,
}

#[async_trait]
pub trait RecordingApi: Send + Sync {
    async fn start(
        &self,
        session_id: &str,
        consultation_id: &str,
    ) -> Result<RecordingStarted, RecordingApiError>;

    async fn stop(&self, recording_id: &str) -> Result<(), RecordingApiError>;
}

#[derive(Clone)]
pub struct RecordingClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl RecordingClient {
    /// Builds a client for `base_url`. A missing scheme is inferred: `http://`
    /// for loopback and private hosts, `https://` otherwise.
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, RecordingApiError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .build()?;
        Self::with_http(http, base_url, token)
    }

    pub fn with_http(
        http: Client,
        base_url: &str,
        token: impl Into<String>,
    ) -> Result<Self, RecordingApiError> {
        let normalized = normalize_base(base_url);
        let base_url = Url::parse(&normalized).map_err(|err| RecordingApiError::InvalidEndpoint {
            url: normalized.clone(),
            reason: err.to_string(),
        })?;
        if base_url.cannot_be_a_base() {
            return Err(RecordingApiError::InvalidEndpoint {
                url: normalized,
                reason: "url cannot be used as a base".into(),
            });
        }
        Ok(Self {
            http,
            base_url,
            token: token.into(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, RecordingApiError> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| RecordingApiError::InvalidEndpoint {
                    url: self.base_url.to_string(),
                    reason: "url cannot be used as a base".into(),
                })?;
            path.pop_if_empty().extend(segments);
        }
        Ok(url)
    }

    async fn expect_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, RecordingApiError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(RecordingApiError::UnexpectedStatus { status, body })
    }
}

#[async_trait]
impl RecordingApi for RecordingClient {
    async fn start(
        &self,
        session_id: &str,
        consultation_id: &str,
    ) -> Result<RecordingStarted, RecordingApiError> {
        let url = self.endpoint(&["recordings", "start", session_id])?;
        tracing::debug!(
            target = "consult::recording",
            %url,
            session_id,
            consultation_id,
            "requesting recording start"
        );
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&StartRecordingRequest {
                consultation_id: consultation_id.to_string(),
            })
            .send()
            .await?;
        let response = Self::expect_success(response).await?;
        let body = response.text().await?;
        let started: RecordingStarted = serde_json::from_str(&body)
            .map_err(|err| RecordingApiError::InvalidResponse(format!("{err}: {body}")))?;
        if started.recording_id.trim().is_empty() {
            return Err(RecordingApiError::InvalidResponse(
                "recording id missing from start response".into(),
            ));
        }
        Ok(started)
    }

    async fn stop(&self, recording_id: &str) -> Result<(), RecordingApiError> {
        let url = self.endpoint(&["recordings", "stop", recording_id])?;
        tracing::debug!(
            target = "consult::recording",
            %url,
            recording_id,
            "requesting recording stop"
        );
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::expect_success(response).await?;
        Ok(())
    }
}

fn normalize_base(base: &str) -> String {
    let trimmed = base.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        format!("{trimmed}/")
    } else {
        format!("{}{trimmed}/", infer_scheme(trimmed))
    }
}

fn infer_scheme(base: &str) -> &'static str {
    let host_part = base
        .split('/')
        .next()
        .unwrap_or(base)
        .trim_start_matches('[')
        .split([']', ':'])
        .next()
        .unwrap_or(base);
    let host_lower = host_part.to_ascii_lowercase();
    let private_172 = host_lower
        .strip_prefix("172.")
        .and_then(|rest| rest.split('.').next())
        .and_then(|octet| octet.parse::<u8>().ok())
        .map(|octet| (16..32).contains(&octet))
        .unwrap_or(false);
    if host_lower.starts_with("localhost")
        || host_lower == "0.0.0.0"
        || host_lower.starts_with("127.")
        || host_lower.is_empty()
        || host_lower.starts_with("10.")
        || host_lower.starts_with("192.168.")
        || private_172
    {
        "http://"
    } else {
        "https://"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_scheme_for_private_hosts() {
        assert_eq!(normalize_base("localhost:5000"), "http://localhost:5000/");
        assert_eq!(normalize_base("172.20.1.4/api"), "http://172.20.1.4/api/");
        assert_eq!(normalize_base("api.example.com/v1/"), "https://api.example.com/v1/");
        assert_eq!(
            normalize_base("https://api.example.com"),
            "https://api.example.com/"
        );
    }

    #[test]
    fn endpoints_are_appended_to_the_base_path() {
        let client = RecordingClient::new("https://api.example.com/v1", "secret").expect("client");
        let url = client
            .endpoint(&["recordings", "start", "ses_1"])
            .expect("endpoint");
        assert_eq!(url.as_str(), "https://api.example.com/v1/recordings/start/ses_1");
    }

    #[test]
    fn path_segments_are_escaped() {
        let client = RecordingClient::new("http://localhost:8080", "secret").expect("client");
        let url = client
            .endpoint(&["recordings", "stop", "ses a~1/2"])
            .expect("endpoint");
        assert_eq!(
            url.as_str(),
            "http://localhost:8080/recordings/stop/ses%20a~1%2F2"
        );
    }

    #[test]
    fn start_response_accepts_either_id_field() {
        let from_id: RecordingStarted =
            serde_json::from_str(r#"{"id":"ses_1~3","status":"started"}"#).expect("id form");
        assert_eq!(from_id.recording_id, "ses_1~3");
        let from_named: RecordingStarted =
            serde_json::from_str(r#"{"recordingId":"ses_1~4"}"#).expect("named form");
        assert_eq!(from_named.recording_id, "ses_1~4");
        assert_eq!(from_named.status, None);
    }
}
