use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::sync::Mutex;

use crate::{RecordingApi, RecordingApiError, RecordingStarted};

/// In-memory recording service for tests and local wiring.
///
/// Recording ids follow the `<session>~<n>` shape the media server uses.
#[derive(Default)]
pub struct InMemoryRecordingApi {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    active: HashMap<String, String>,
    counters: HashMap<String, u32>,
    started: Vec<(String, String)>,
    stopped: Vec<String>,
    fail_next_start: Option<(StatusCode, String)>,
    fail_next_stop: Option<(StatusCode, String)>,
    start_delay: Option<Duration>,
}

impl InMemoryRecordingApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn fail_next_start(&self, status: StatusCode, body: impl Into<String>) {
        self.state.lock().await.fail_next_start = Some((status, body.into()));
    }

    pub async fn fail_next_stop(&self, status: StatusCode, body: impl Into<String>) {
        self.state.lock().await.fail_next_stop = Some((status, body.into()));
    }

    /// Makes every following start take `delay` before it is acknowledged.
    pub async fn delay_starts(&self, delay: Duration) {
        self.state.lock().await.start_delay = Some(delay);
    }

    /// `(session_id, consultation_id)` for every accepted start.
    pub async fn started(&self) -> Vec<(String, String)> {
        self.state.lock().await.started.clone()
    }

    pub async fn stopped(&self) -> Vec<String> {
        self.state.lock().await.stopped.clone()
    }

    pub async fn active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().await.active.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl RecordingApi for InMemoryRecordingApi {
    async fn start(
        &self,
        session_id: &str,
        consultation_id: &str,
    ) -> Result<RecordingStarted, RecordingApiError> {
        let delay = self.state.lock().await.start_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut guard = self.state.lock().await;
        if let Some((status, body)) = guard.fail_next_start.take() {
            return Err(RecordingApiError::UnexpectedStatus { status, body });
        }
        if guard.active.values().any(|session| session == session_id) {
            return Err(RecordingApiError::UnexpectedStatus {
                status: StatusCode::CONFLICT,
                body: format!("session {session_id} is already being recorded"),
            });
        }
        let counter = guard.counters.entry(session_id.to_string()).or_insert(0);
        *counter += 1;
        let recording_id = format!("{session_id}~{counter}");
        guard
            .active
            .insert(recording_id.clone(), session_id.to_string());
        guard
            .started
            .push((session_id.to_string(), consultation_id.to_string()));
        Ok(RecordingStarted {
            recording_id,
            status: Some("started".into()),
        })
    }

    async fn stop(&self, recording_id: &str) -> Result<(), RecordingApiError> {
        let mut guard = self.state.lock().await;
        if let Some((status, body)) = guard.fail_next_stop.take() {
            return Err(RecordingApiError::UnexpectedStatus { status, body });
        }
        if guard.active.remove(recording_id).is_none() {
            return Err(RecordingApiError::UnexpectedStatus {
                status: StatusCode::NOT_FOUND,
                body: format!("recording {recording_id} not found"),
            });
        }
        guard.stopped.push(recording_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_then_stop_tracks_active_recordings() {
        let api = InMemoryRecordingApi::new();
        let started = api.start("ses_1", "consult-9").await.expect("start");
        assert_eq!(started.recording_id, "ses_1~1");
        assert_eq!(api.active().await, vec!["ses_1~1".to_string()]);

        api.stop(&started.recording_id).await.expect("stop");
        assert!(api.active().await.is_empty());
        assert_eq!(api.stopped().await, vec!["ses_1~1".to_string()]);

        let again = api.start("ses_1", "consult-9").await.expect("restart");
        assert_eq!(again.recording_id, "ses_1~2");
    }

    #[tokio::test]
    async fn concurrent_recording_of_one_session_conflicts() {
        let api = InMemoryRecordingApi::new();
        api.start("ses_1", "c").await.expect("first start");
        let err = api.start("ses_1", "c").await.expect_err("second start");
        assert!(matches!(
            err,
            RecordingApiError::UnexpectedStatus { status, .. } if status == StatusCode::CONFLICT
        ));
    }

    #[tokio::test]
    async fn injected_failures_apply_once() {
        let api = InMemoryRecordingApi::new();
        api.fail_next_start(StatusCode::BAD_GATEWAY, "media server down")
            .await;
        assert!(api.start("ses_1", "c").await.is_err());
        assert!(api.start("ses_1", "c").await.is_ok());

        let err = api.stop("ses_9~1").await.expect_err("unknown recording");
        assert!(matches!(
            err,
            RecordingApiError::UnexpectedStatus { status, .. } if status == StatusCode::NOT_FOUND
        ));
    }
}
