//! Server-side recording of a live session.
//!
//! Recording is an independent sub-resource: its failures are reported to
//! the caller and never move the session out of `Active`.

use std::sync::Arc;

use parking_lot::Mutex;
use recording_sdk::{RecordingApi, RecordingApiError};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, watch};

use crate::events::{EventHub, EventKind};
use crate::session::SessionState;

pub type RecordingId = String;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecordingStatus {
    #[default]
    Idle,
    Starting,
    Recording,
    Stopping,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordingState {
    pub status: RecordingStatus,
    pub recording_id: Option<RecordingId>,
}

#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("recording requires an active session")]
    SessionNotActive,
    #[error("recording is {actual:?}, expected {expected:?}")]
    InvalidStatus {
        expected: RecordingStatus,
        actual: RecordingStatus,
    },
    #[error("unknown recording {0}")]
    UnknownRecording(RecordingId),
    #[error("session ended before the recording started")]
    SessionEnded,
    #[error(transparent)]
    Api(#[from] RecordingApiError),
}

impl RecordingError {
    pub fn user_message(&self) -> &'static str {
        match self {
            RecordingError::SessionNotActive | RecordingError::SessionEnded => {
                "Recording is only available during a consultation."
            }
            RecordingError::InvalidStatus { .. } | RecordingError::UnknownRecording(_) => {
                "The recording is already being changed. Try again in a moment."
            }
            RecordingError::Api(_) => {
                "The recording could not be changed. The consultation continues."
            }
        }
    }
}

pub struct RecordingController {
    api: Arc<dyn RecordingApi>,
    hub: Arc<EventHub>,
    session_state: watch::Receiver<SessionState>,
    state: Mutex<RecordingState>,
    /// Held for the whole of a start or stop, so teardown waits for an
    /// in-flight start before stopping.
    gate: AsyncMutex<()>,
}

impl RecordingController {
    pub fn new(
        api: Arc<dyn RecordingApi>,
        hub: Arc<EventHub>,
        session_state: watch::Receiver<SessionState>,
    ) -> Self {
        Self {
            api,
            hub,
            session_state,
            state: Mutex::new(RecordingState::default()),
            gate: AsyncMutex::new(()),
        }
    }

    pub fn state(&self) -> RecordingState {
        self.state.lock().clone()
    }

    fn session_active(&self) -> bool {
        self.session_state.borrow().is_active()
    }

    fn set(&self, next: RecordingState) {
        let mut state = self.state.lock();
        if *state == next {
            return;
        }
        *state = next.clone();
        tracing::debug!(
            target = "consult::recording",
            status = ?next.status,
            recording_id = ?next.recording_id,
            "recording state changed"
        );
        self.hub
            .apply(EventKind::RecordingChanged, |snap| snap.recording = next);
    }

    pub async fn start(
        &self,
        session_id: &str,
        consultation_id: &str,
    ) -> Result<RecordingId, RecordingError> {
        if !self.session_active() {
            return Err(RecordingError::SessionNotActive);
        }
        let _gate = self.gate.lock().await;
        if !self.session_active() {
            return Err(RecordingError::SessionNotActive);
        }
        {
            let mut state = self.state.lock();
            if state.status != RecordingStatus::Idle {
                return Err(RecordingError::InvalidStatus {
                    expected: RecordingStatus::Idle,
                    actual: state.status,
                });
            }
            state.status = RecordingStatus::Starting;
            let snapshot = state.clone();
            self.hub
                .apply(EventKind::RecordingChanged, |snap| snap.recording = snapshot);
        }

        let started = match self.api.start(session_id, consultation_id).await {
            Ok(started) => started,
            Err(err) => {
                tracing::warn!(
                    target = "consult::recording",
                    session_id,
                    error = %err,
                    "recording start failed"
                );
                self.set(RecordingState::default());
                return Err(err.into());
            }
        };

        if !self.session_active() {
            tracing::info!(
                target = "consult::recording",
                recording_id = %started.recording_id,
                "session ended while recording was starting; stopping it"
            );
            if let Err(err) = self.api.stop(&started.recording_id).await {
                tracing::warn!(
                    target = "consult::recording",
                    error = %err,
                    "stopping orphaned recording failed"
                );
            }
            self.set(RecordingState::default());
            return Err(RecordingError::SessionEnded);
        }

        tracing::info!(
            target = "consult::recording",
            session_id,
            recording_id = %started.recording_id,
            "recording started"
        );
        self.set(RecordingState {
            status: RecordingStatus::Recording,
            recording_id: Some(started.recording_id.clone()),
        });
        Ok(started.recording_id)
    }

    pub async fn stop(&self, recording_id: &str) -> Result<(), RecordingError> {
        let _gate = self.gate.lock().await;
        self.stop_locked(recording_id).await
    }

    async fn stop_locked(&self, recording_id: &str) -> Result<(), RecordingError> {
        {
            let mut state = self.state.lock();
            if state.status != RecordingStatus::Recording {
                return Err(RecordingError::InvalidStatus {
                    expected: RecordingStatus::Recording,
                    actual: state.status,
                });
            }
            if state.recording_id.as_deref() != Some(recording_id) {
                return Err(RecordingError::UnknownRecording(recording_id.to_string()));
            }
            state.status = RecordingStatus::Stopping;
            let snapshot = state.clone();
            self.hub
                .apply(EventKind::RecordingChanged, |snap| snap.recording = snapshot);
        }

        match self.api.stop(recording_id).await {
            Ok(()) => {
                tracing::info!(target = "consult::recording", recording_id, "recording stopped");
                self.set(RecordingState::default());
                Ok(())
            }
            Err(err) => {
                tracing::warn!(
                    target = "consult::recording",
                    recording_id,
                    error = %err,
                    "recording stop failed"
                );
                self.set(RecordingState {
                    status: RecordingStatus::Recording,
                    recording_id: Some(recording_id.to_string()),
                });
                Err(err.into())
            }
        }
    }

    /// Best-effort stop used during teardown; always ends `Idle`. A start in
    /// flight is waited for first.
    pub async fn stop_if_active(&self) {
        let _gate = self.gate.lock().await;
        let recording_id = {
            let state = self.state.lock();
            match (state.status, &state.recording_id) {
                (RecordingStatus::Recording, Some(id)) => id.clone(),
                _ => return,
            }
        };
        if let Err(err) = self.stop_locked(&recording_id).await {
            tracing::warn!(
                target = "consult::recording",
                recording_id = %recording_id,
                error = %err,
                "recording could not be stopped during teardown"
            );
        }
        self.set(RecordingState::default());
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use recording_sdk::{HttpStatus as StatusCode, InMemoryRecordingApi};

    struct Rig {
        api: Arc<InMemoryRecordingApi>,
        state_tx: watch::Sender<SessionState>,
        recording: RecordingController,
    }

    fn rig(session: SessionState) -> Rig {
        let api = InMemoryRecordingApi::new();
        let (state_tx, state_rx) = watch::channel(session);
        let recording = RecordingController::new(api.clone(), Arc::new(EventHub::new(16)), state_rx);
        Rig {
            api,
            state_tx,
            recording,
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn start_requires_an_active_session() {
        let rig = rig(SessionState::Idle);
        let err = rig
            .recording
            .start("ses_1", "consult-1")
            .await
            .expect_err("idle session");
        assert!(matches!(err, RecordingError::SessionNotActive));
        assert_eq!(rig.recording.state(), RecordingState::default());
        assert!(rig.api.started().await.is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn start_and_stop_use_the_returned_recording_id() {
        let rig = rig(SessionState::Active);
        let id = rig
            .recording
            .start("ses_1", "consult-1")
            .await
            .expect("start");
        assert_eq!(id, "ses_1~1");
        assert_eq!(
            rig.recording.state(),
            RecordingState {
                status: RecordingStatus::Recording,
                recording_id: Some(id.clone()),
            }
        );

        let err = rig.recording.stop("ses_1").await.expect_err("wrong id");
        assert!(matches!(err, RecordingError::UnknownRecording(_)));

        rig.recording.stop(&id).await.expect("stop");
        assert_eq!(rig.recording.state(), RecordingState::default());
        assert_eq!(rig.api.stopped().await, vec![id]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn api_failures_revert_state() {
        let rig = rig(SessionState::Active);
        rig.api
            .fail_next_start(StatusCode::BAD_GATEWAY, "media server down")
            .await;
        let err = rig
            .recording
            .start("ses_1", "c")
            .await
            .expect_err("start fails");
        assert!(matches!(err, RecordingError::Api(_)));
        assert_eq!(rig.recording.state().status, RecordingStatus::Idle);

        let id = rig.recording.start("ses_1", "c").await.expect("retry");
        rig.api
            .fail_next_stop(StatusCode::INTERNAL_SERVER_ERROR, "busy")
            .await;
        assert!(rig.recording.stop(&id).await.is_err());
        assert_eq!(rig.recording.state().status, RecordingStatus::Recording);
        assert_eq!(*rig.state_tx.borrow(), SessionState::Active);
    }

    #[test_timeout::tokio_timeout_test]
    async fn second_start_is_rejected_while_recording() {
        let rig = rig(SessionState::Active);
        rig.recording.start("ses_1", "c").await.expect("start");
        let err = rig.recording.start("ses_1", "c").await.expect_err("again");
        assert!(matches!(
            err,
            RecordingError::InvalidStatus {
                actual: RecordingStatus::Recording,
                ..
            }
        ));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn start_acknowledged_after_session_end_is_stopped() {
        let rig = rig(SessionState::Active);
        rig.api.delay_starts(Duration::from_millis(100)).await;

        let start = rig.recording.start("ses_1", "c");
        let teardown = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(rig.recording.state().status, RecordingStatus::Starting);
            rig.state_tx.send_replace(SessionState::Leaving);
            rig.recording.stop_if_active().await;
            rig.recording.state()
        };
        let (started, after_teardown) = tokio::join!(start, teardown);

        assert!(matches!(started, Err(RecordingError::SessionEnded)));
        assert_eq!(after_teardown, RecordingState::default());
        assert_eq!(rig.api.stopped().await, vec!["ses_1~1".to_string()]);
        assert!(rig.api.active().await.is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn teardown_stop_is_best_effort() {
        let rig = rig(SessionState::Active);
        let id = rig.recording.start("ses_1", "c").await.expect("start");
        rig.api
            .fail_next_stop(StatusCode::INTERNAL_SERVER_ERROR, "busy")
            .await;
        rig.state_tx.send_replace(SessionState::Leaving);
        rig.recording.stop_if_active().await;
        assert_eq!(rig.recording.state(), RecordingState::default());
        assert!(rig.api.stopped().await.is_empty());
        assert_eq!(rig.api.active().await, vec![id]);
    }
}
