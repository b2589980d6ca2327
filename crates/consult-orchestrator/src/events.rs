//! Notifications for UI layers.
//!
//! Every event is published on a topic of the orchestrator's [`LocalBus`]
//! and carries the full [`Snapshot`] as of the moment it was emitted, so
//! handlers never have to read state through a stale reference.

use consult_bus::{Bus, BusMessage, LocalBus};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::backend::{StreamId, TrackId};
use crate::chat::ChatMessage;
use crate::error::FailureReason;
use crate::media::LocalMediaState;
use crate::recording::RecordingState;
use crate::session::{RemoteParticipant, SessionState};

pub const TOPIC_SESSION: &str = "consult.session";
pub const TOPIC_MEDIA: &str = "consult.media";
pub const TOPIC_PARTICIPANTS: &str = "consult.participants";
pub const TOPIC_RECORDING: &str = "consult.recording";
pub const TOPIC_CHAT: &str = "consult.chat";
pub const TOPIC_NOTICES: &str = "consult.notices";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub session: SessionState,
    pub media: LocalMediaState,
    pub participants: Vec<RemoteParticipant>,
    pub recording: RecordingState,
    pub chat_messages: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Message meant for a toast or banner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
    pub retry: bool,
}

impl Notice {
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Warning,
            message: message.into(),
            retry: false,
        }
    }

    pub fn failure(reason: FailureReason) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: reason.user_message().to_string(),
            retry: reason.retryable(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    SessionStateChanged { previous: SessionState },
    LocalMediaChanged,
    LocalTrackRenderable { track_ids: Vec<TrackId> },
    ParticipantJoined { stream_id: StreamId },
    ParticipantUpdated { stream_id: StreamId },
    ParticipantLeft { stream_id: StreamId },
    ParticipantsCleared,
    RemoteTrackRenderable { stream_id: StreamId },
    RecordingChanged,
    ChatMessage(ChatMessage),
    ChatCleared,
    Notice(Notice),
}

impl EventKind {
    pub fn topic(&self) -> &'static str {
        match self {
            EventKind::SessionStateChanged { .. } => TOPIC_SESSION,
            EventKind::LocalMediaChanged | EventKind::LocalTrackRenderable { .. } => TOPIC_MEDIA,
            EventKind::ParticipantJoined { .. }
            | EventKind::ParticipantUpdated { .. }
            | EventKind::ParticipantLeft { .. }
            | EventKind::ParticipantsCleared
            | EventKind::RemoteTrackRenderable { .. } => TOPIC_PARTICIPANTS,
            EventKind::RecordingChanged => TOPIC_RECORDING,
            EventKind::ChatMessage(_) | EventKind::ChatCleared => TOPIC_CHAT,
            EventKind::Notice(_) => TOPIC_NOTICES,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorEvent {
    pub seq: u64,
    pub kind: EventKind,
    pub snapshot: Snapshot,
}

pub type EventReceiver = broadcast::Receiver<BusMessage<OrchestratorEvent>>;

struct HubState {
    seq: u64,
    snapshot: Snapshot,
}

/// Owns the published snapshot and the bus events go out on.
///
/// Components mutate their own state first and then call [`EventHub::apply`]
/// while still holding their lock, which keeps the snapshot sequence in the
/// same order as the mutations. The hub never calls back into components.
pub struct EventHub {
    bus: LocalBus<OrchestratorEvent>,
    state: Mutex<HubState>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            bus: LocalBus::with_capacity(capacity),
            state: Mutex::new(HubState {
                seq: 0,
                snapshot: Snapshot::default(),
            }),
        }
    }

    pub fn apply(&self, kind: EventKind, update: impl FnOnce(&mut Snapshot)) {
        let mut state = self.state.lock();
        update(&mut state.snapshot);
        state.seq += 1;
        let event = OrchestratorEvent {
            seq: state.seq,
            kind,
            snapshot: state.snapshot.clone(),
        };
        let topic = event.kind.topic();
        let reached = self.bus.publish(topic, event);
        tracing::trace!(
            target = "consult::events",
            seq = state.seq,
            topic,
            reached,
            "emitted orchestrator event"
        );
    }

    pub fn notify(&self, kind: EventKind) {
        self.apply(kind, |_| {});
    }

    pub fn snapshot(&self) -> Snapshot {
        self.state.lock().snapshot.clone()
    }

    pub fn subscribe(&self, topic: &str) -> EventReceiver {
        self.bus.subscribe(topic)
    }

    pub fn subscribe_all(&self) -> EventReceiver {
        self.bus.subscribe_all()
    }
}
