use std::sync::Arc;

use parking_lot::Mutex;
use recording_sdk::RecordingApi;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::backend::{ConnectionId, RtcBackend, SessionHandle};
use crate::chat::SignalingChannel;
use crate::config::OrchestratorConfig;
use crate::events::{EventHub, EventKind};
use crate::media::{LocalMediaController, MediaDevices, MediaPermissionGate};
use crate::recording::RecordingController;
use crate::session::{LocalIdentity, RemoteParticipantRegistry, SessionState};

/// Mutable part of the session owned by the lifecycle manager.
#[derive(Default)]
pub(crate) struct LifecycleSlot {
    pub state: SessionState,
    pub handle: Option<SessionHandle>,
    pub identity: Option<LocalIdentity>,
    pub connection_id: Option<ConnectionId>,
    pub leave_requested: bool,
    /// The backend dropped the session before it became active.
    pub connection_lost: bool,
    pub pump: Option<JoinHandle<()>>,
}

/// Everything one orchestrator instance owns, shared by its components.
pub(crate) struct SessionContext {
    pub config: OrchestratorConfig,
    pub backend: Arc<dyn RtcBackend>,
    pub hub: Arc<EventHub>,
    pub gate: MediaPermissionGate,
    pub media: LocalMediaController,
    pub registry: RemoteParticipantRegistry,
    pub recording: RecordingController,
    pub chat: SignalingChannel,
    pub slot: Mutex<LifecycleSlot>,
    state_tx: watch::Sender<SessionState>,
}

impl SessionContext {
    pub fn new(
        config: OrchestratorConfig,
        backend: Arc<dyn RtcBackend>,
        devices: Arc<dyn MediaDevices>,
        recording_api: Arc<dyn RecordingApi>,
    ) -> Self {
        let hub = Arc::new(EventHub::new(config.event_capacity));
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        Self {
            gate: MediaPermissionGate::new(devices.clone()),
            media: LocalMediaController::new(backend.clone(), devices, hub.clone()),
            registry: RemoteParticipantRegistry::new(
                backend.clone(),
                hub.clone(),
                config.fallback_name.clone(),
            ),
            recording: RecordingController::new(recording_api, hub.clone(), state_rx),
            chat: SignalingChannel::new(
                backend.clone(),
                hub.clone(),
                config.chat_max_length,
                config.chat_history,
                config.fallback_name.clone(),
            ),
            slot: Mutex::new(LifecycleSlot::default()),
            state_tx,
            hub,
            backend,
            config,
        }
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Moves the session to `next`. Callers hold the slot lock, which keeps
    /// transitions serialized.
    pub fn transition(&self, slot: &mut LifecycleSlot, next: SessionState) {
        if slot.state == next {
            return;
        }
        let previous = std::mem::replace(&mut slot.state, next.clone());
        tracing::debug!(
            target = "consult::session",
            from = ?previous,
            to = ?next,
            "session state transition"
        );
        self.state_tx.send_replace(next.clone());
        self.hub.apply(EventKind::SessionStateChanged { previous }, |snap| {
            snap.session = next
        });
    }
}
