//! Seam between the orchestrator and the real-time media backend (SFU).
//!
//! The orchestrator never talks to a WebRTC stack directly. Everything it
//! needs from the media server is expressed by [`RtcBackend`]: session
//! open/connect/disconnect, publishing local track bundles, the in-place
//! mute primitive, subscribing to remote streams, and a generic signal
//! broadcast. Server-pushed notifications arrive as [`BackendEvent`]s on the
//! channel returned by [`RtcBackend::events`].

pub mod loopback;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub type ConnectionId = String;
pub type StreamId = String;
pub type TrackId = String;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    #[error("session token rejected: {0}")]
    TokenRejected(String),
    #[error("session is not connected")]
    NotConnected,
    #[error("backend rejected request: {0}")]
    Rejected(String),
}

/// Handle to one opened backend session. Immutable once created; the
/// token it was opened with stays with the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    id: String,
    session_id: String,
}

impl SessionHandle {
    pub fn new(id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
        }
    }

    /// Client-side identifier of this handle.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Identifier of the backend session (room) the handle belongs to.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.session_id, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Camera,
    Microphone,
    Screen,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TrackKind::Camera => "camera",
            TrackKind::Microphone => "microphone",
            TrackKind::Screen => "screen",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: TrackId,
    pub kind: TrackKind,
    pub label: String,
}

/// Set of local tracks published together as one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackBundle {
    pub id: String,
    pub tracks: Vec<LocalTrack>,
}

impl TrackBundle {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: format!("pub_{}", uuid::Uuid::new_v4().simple()),
            tracks,
        }
    }

    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|track| track.kind == kind)
    }

    pub fn has(&self, kind: TrackKind) -> bool {
        self.track(kind).is_some()
    }

    pub fn track_ids(&self) -> impl Iterator<Item = TrackId> + '_ {
        self.tracks.iter().map(|track| track.id.clone())
    }

    pub fn stream_kind(&self) -> StreamKind {
        if self.has(TrackKind::Screen) {
            StreamKind::Screen
        } else {
            StreamKind::Camera
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Camera,
    Screen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamProperty {
    Audio,
    Video,
}

/// A participant's connection as announced by the backend. `data` is the
/// raw application payload the participant supplied when connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConnection {
    pub connection_id: ConnectionId,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub stream_id: StreamId,
    pub connection: RemoteConnection,
    pub kind: StreamKind,
    pub has_audio: bool,
    pub has_video: bool,
    /// `None` when the backend did not report the flag.
    pub audio_active: Option<bool>,
    pub video_active: Option<bool>,
}

/// Reference to a subscription created by [`RtcBackend::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrackRef {
    pub stream_id: StreamId,
    pub subscription_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalPayload {
    pub kind: String,
    pub from: Option<ConnectionId>,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyTarget {
    Local { bundle_id: String },
    Remote { stream_id: StreamId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    StreamCreated(RemoteStream),
    StreamDestroyed {
        stream_id: StreamId,
        reason: String,
    },
    StreamPropertyChanged {
        stream_id: StreamId,
        property: StreamProperty,
        enabled: bool,
    },
    ConnectionCreated(RemoteConnection),
    ConnectionDestroyed {
        connection_id: ConnectionId,
        reason: String,
    },
    Signal(SignalPayload),
    /// A published or subscribed track can now be attached to a surface.
    TrackReady(ReadyTarget),
    /// The backend dropped the session without being asked to.
    Disconnected {
        reason: String,
    },
}

#[async_trait]
pub trait RtcBackend: Send + Sync {
    async fn open_session(&self, token: &str) -> Result<SessionHandle, BackendError>;

    /// Registers the event sink for `handle`. Must be called before
    /// [`RtcBackend::connect`] so no stream announcement is missed.
    fn events(
        &self,
        handle: &SessionHandle,
    ) -> Result<mpsc::UnboundedReceiver<BackendEvent>, BackendError>;

    async fn connect(
        &self,
        handle: &SessionHandle,
        app_data: &str,
    ) -> Result<ConnectionId, BackendError>;

    async fn disconnect(&self, handle: &SessionHandle) -> Result<(), BackendError>;

    async fn publish(&self, handle: &SessionHandle, bundle: &TrackBundle)
        -> Result<(), BackendError>;

    async fn unpublish(
        &self,
        handle: &SessionHandle,
        bundle: &TrackBundle,
    ) -> Result<(), BackendError>;

    /// Mutes or unmutes a published track in place.
    async fn set_track_enabled(
        &self,
        handle: &SessionHandle,
        track_id: &str,
        enabled: bool,
    ) -> Result<(), BackendError>;

    async fn subscribe(
        &self,
        handle: &SessionHandle,
        stream: &RemoteStream,
    ) -> Result<RemoteTrackRef, BackendError>;

    async fn unsubscribe(
        &self,
        handle: &SessionHandle,
        track: &RemoteTrackRef,
    ) -> Result<(), BackendError>;

    async fn send_signal(
        &self,
        handle: &SessionHandle,
        signal: &SignalPayload,
    ) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_displays_session_then_client_id() {
        let handle = SessionHandle::new("h1", "ses_room");
        assert_eq!(handle.to_string(), "ses_room (h1)");
        assert_eq!(handle.session_id(), "ses_room");
        assert_eq!(handle.id(), "h1");
    }

    #[test]
    fn bundle_kind_follows_its_tracks() {
        let camera = TrackBundle::new(vec![
            LocalTrack {
                id: "t1".into(),
                kind: TrackKind::Camera,
                label: "cam".into(),
            },
            LocalTrack {
                id: "t2".into(),
                kind: TrackKind::Microphone,
                label: "mic".into(),
            },
        ]);
        assert_eq!(camera.stream_kind(), StreamKind::Camera);
        assert_eq!(camera.track_ids().collect::<Vec<_>>(), vec!["t1", "t2"]);

        let screen = TrackBundle::new(vec![LocalTrack {
            id: "t3".into(),
            kind: TrackKind::Screen,
            label: "screen".into(),
        }]);
        assert_eq!(screen.stream_kind(), StreamKind::Screen);
        assert_ne!(camera.id, screen.id);
    }
}
