use std::sync::Arc;

use recording_sdk::RecordingApi;
use tokio::sync::watch;

use crate::backend::{RtcBackend, SessionHandle, TrackId};
use crate::chat::{ChatError, ChatMessage};
use crate::config::OrchestratorConfig;
use crate::context::SessionContext;
use crate::error::ConnectError;
use crate::events::{EventKind, EventReceiver, Notice, Snapshot};
use crate::media::{LocalMediaState, MediaDevices, MediaError};
use crate::recording::{RecordingError, RecordingId, RecordingState, RecordingStatus};
use crate::session::{LocalIdentity, RemoteParticipant, SessionLifecycleManager, SessionState};

/// Single entry point for a consultation screen.
///
/// Owns one session context; every operation a UI needs goes through here
/// and every change is announced on the event bus (see [`crate::events`]).
#[derive(Clone)]
pub struct SessionOrchestrator {
    ctx: Arc<SessionContext>,
    lifecycle: SessionLifecycleManager,
}

impl SessionOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        backend: Arc<dyn RtcBackend>,
        devices: Arc<dyn MediaDevices>,
        recording_api: Arc<dyn RecordingApi>,
    ) -> Self {
        let ctx = Arc::new(SessionContext::new(config, backend, devices, recording_api));
        Self {
            lifecycle: SessionLifecycleManager::new(ctx.clone()),
            ctx,
        }
    }

    pub fn lifecycle(&self) -> &SessionLifecycleManager {
        &self.lifecycle
    }

    pub async fn connect(
        &self,
        token: &str,
        identity: LocalIdentity,
    ) -> Result<SessionHandle, ConnectError> {
        self.lifecycle.connect(token, identity).await
    }

    pub async fn leave(&self) {
        self.lifecycle.leave().await
    }

    pub async fn toggle_camera(&self) -> Result<LocalMediaState, MediaError> {
        let result = self.ctx.media.toggle_camera().await;
        self.report_media(&result);
        result
    }

    pub async fn toggle_mic(&self) -> Result<LocalMediaState, MediaError> {
        let result = self.ctx.media.toggle_mic().await;
        self.report_media(&result);
        result
    }

    pub async fn start_screen_share(&self) -> Result<TrackId, MediaError> {
        let result = self.ctx.media.start_screen_share().await;
        self.report_media(&result);
        result
    }

    pub async fn stop_screen_share(&self) {
        self.ctx.media.stop_screen_share().await
    }

    pub async fn start_recording(&self, consultation_id: &str) -> Result<RecordingId, RecordingError> {
        let session_id = self
            .lifecycle
            .handle()
            .map(|handle| handle.session_id().to_string());
        let result = match session_id {
            Some(session_id) => {
                self.ctx
                    .recording
                    .start(&session_id, consultation_id)
                    .await
            }
            None => Err(RecordingError::SessionNotActive),
        };
        if let Err(err) = &result {
            self.notice(err.user_message());
        }
        result
    }

    pub async fn stop_recording(&self) -> Result<(), RecordingError> {
        let Some(recording_id) = self.ctx.recording.state().recording_id else {
            return Err(RecordingError::InvalidStatus {
                expected: RecordingStatus::Recording,
                actual: self.ctx.recording.state().status,
            });
        };
        let result = self.ctx.recording.stop(&recording_id).await;
        if let Err(err) = &result {
            self.notice(err.user_message());
        }
        result
    }

    pub async fn send_chat(&self, text: &str) -> Result<ChatMessage, ChatError> {
        let session = {
            let slot = self.ctx.slot.lock();
            match (&slot.state, &slot.handle, &slot.identity) {
                (SessionState::Active, Some(handle), Some(identity)) => {
                    Some((handle.clone(), identity.clone()))
                }
                _ => None,
            }
        };
        let Some((handle, identity)) = session else {
            return Err(ChatError::NotConnected);
        };
        let result = self.ctx.chat.send(&handle, &identity, text).await;
        if let Err(err @ (ChatError::Backend(_) | ChatError::NotConnected)) = &result {
            self.notice(err.user_message());
        }
        result
    }

    pub fn subscribe(&self, topic: &str) -> EventReceiver {
        self.ctx.hub.subscribe(topic)
    }

    pub fn subscribe_all(&self) -> EventReceiver {
        self.ctx.hub.subscribe_all()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.ctx.hub.snapshot()
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.lifecycle.watch()
    }

    pub fn participants(&self) -> Vec<RemoteParticipant> {
        self.ctx.registry.participants()
    }

    pub fn participant_count(&self) -> usize {
        self.ctx.registry.count()
    }

    pub fn chat_log(&self) -> Vec<ChatMessage> {
        self.ctx.chat.messages()
    }

    pub fn local_media(&self) -> LocalMediaState {
        self.ctx.media.state()
    }

    pub fn recording(&self) -> RecordingState {
        self.ctx.recording.state()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.ctx.config
    }

    fn report_media<T>(&self, result: &Result<T, MediaError>) {
        if let Err(err) = result {
            self.notice(err.user_message());
        }
    }

    fn notice(&self, message: impl Into<String>) {
        self.ctx
            .hub
            .notify(EventKind::Notice(Notice::warning(message)));
    }
}
