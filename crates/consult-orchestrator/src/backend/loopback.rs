//! In-process media backend.
//!
//! A [`LoopbackHub`] plays the media server: it owns rooms, issues tokens and
//! fans events out to every client connected to a room. Each orchestrator
//! gets its own [`LoopbackBackend`] bound to the shared hub, so several
//! participants can run in one process. No media flows; tracks are opaque ids.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    BackendError, BackendEvent, ConnectionId, LocalTrack, ReadyTarget, RemoteConnection,
    RemoteStream, RemoteTrackRef, RtcBackend, SessionHandle, SignalPayload, StreamId,
    StreamProperty, TrackBundle, TrackKind,
};

#[derive(Default)]
struct Room {
    connections: Vec<RemoteConnection>,
    streams: Vec<RemoteStream>,
}

struct PublishedBundle {
    stream_id: StreamId,
    tracks: Vec<LocalTrack>,
}

struct ClientSlot {
    room: String,
    events: Option<mpsc::UnboundedSender<BackendEvent>>,
    connection: Option<RemoteConnection>,
    published: HashMap<String, PublishedBundle>,
    subscriptions: HashMap<String, StreamId>,
}

impl ClientSlot {
    fn send(&self, event: BackendEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn connection_id(&self) -> Result<&ConnectionId, BackendError> {
        self.connection
            .as_ref()
            .map(|connection| &connection.connection_id)
            .ok_or(BackendError::NotConnected)
    }
}

#[derive(Default)]
struct HubState {
    tokens: HashMap<String, String>,
    rooms: HashMap<String, Room>,
    clients: HashMap<String, ClientSlot>,
}

impl HubState {
    fn slot(&self, handle: &SessionHandle) -> Result<&ClientSlot, BackendError> {
        self.clients.get(handle.id()).ok_or(BackendError::NotConnected)
    }

    fn slot_mut(&mut self, handle: &SessionHandle) -> Result<&mut ClientSlot, BackendError> {
        self.clients
            .get_mut(handle.id())
            .ok_or(BackendError::NotConnected)
    }

    /// Delivers `event` to every connected client of `room` except `skip`.
    fn fan_out(&self, room: &str, skip: Option<&str>, event: &BackendEvent) {
        self.clients
            .iter()
            .filter(|(id, slot)| {
                slot.room == room && slot.connection.is_some() && Some(id.as_str()) != skip
            })
            .for_each(|(_, slot)| slot.send(event.clone()));
    }

    /// Removes everything `client_id` owns from its room and tells the others.
    fn evict(&mut self, client_id: &str, reason: &str) -> Option<ClientSlot> {
        let slot = self.clients.remove(client_id)?;
        let Some(connection) = slot.connection.as_ref() else {
            return Some(slot);
        };
        let room_name = slot.room.clone();
        let (gone, connection_id) = {
            let room = self.rooms.entry(room_name.clone()).or_default();
            let (gone, kept): (Vec<RemoteStream>, Vec<RemoteStream>) =
                std::mem::take(&mut room.streams)
                    .into_iter()
                    .partition(|stream| stream.connection.connection_id == connection.connection_id);
            room.streams = kept;
            room.connections
                .retain(|known| known.connection_id != connection.connection_id);
            (gone, connection.connection_id.clone())
        };
        for stream in gone {
            self.fan_out(
                &room_name,
                None,
                &BackendEvent::StreamDestroyed {
                    stream_id: stream.stream_id,
                    reason: reason.to_string(),
                },
            );
        }
        self.fan_out(
            &room_name,
            None,
            &BackendEvent::ConnectionDestroyed {
                connection_id,
                reason: reason.to_string(),
            },
        );
        Some(slot)
    }
}

/// Shared in-memory media server.
#[derive(Default)]
pub struct LoopbackHub {
    state: Mutex<HubState>,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Issues a token that opens a session in `room`.
    pub fn issue_token(&self, room: &str) -> String {
        let token = format!("tok_{}", uuid::Uuid::new_v4().simple());
        self.register_token(&token, room);
        token
    }

    /// Accepts a token minted elsewhere for `room`.
    pub fn register_token(&self, token: &str, room: &str) {
        let mut state = self.state.lock();
        state.tokens.insert(token.to_string(), room.to_string());
        state.rooms.entry(room.to_string()).or_default();
    }

    /// Streams currently published in `room`.
    pub fn published_streams(&self, room: &str) -> usize {
        self.state
            .lock()
            .rooms
            .get(room)
            .map_or(0, |room| room.streams.len())
    }

    /// Connections currently present in `room`.
    pub fn connection_count(&self, room: &str) -> usize {
        self.state
            .lock()
            .rooms
            .get(room)
            .map_or(0, |room| room.connections.len())
    }

    /// Drops a connection from the server side, as a network failure would.
    /// Returns `false` when no such connection exists.
    pub fn drop_connection(&self, connection_id: &str, reason: &str) -> bool {
        let mut state = self.state.lock();
        let client_id = state.clients.iter().find_map(|(id, slot)| {
            slot.connection
                .as_ref()
                .filter(|connection| connection.connection_id == connection_id)
                .map(|_| id.clone())
        });
        let Some(client_id) = client_id else {
            return false;
        };
        tracing::info!(
            target = "consult::loopback",
            connection = %connection_id,
            reason,
            "dropping connection"
        );
        if let Some(slot) = state.evict(&client_id, reason) {
            slot.send(BackendEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
        true
    }
}

/// Failures and latency a [`LoopbackBackend`] injects into its calls.
#[derive(Debug, Clone, Default)]
pub struct LoopbackFaults {
    pub connect_delay: Option<Duration>,
    pub fail_connect: Option<BackendError>,
    pub fail_publish: Option<BackendError>,
    /// Delay between the publish taking effect (track-ready sent) and the
    /// call returning.
    pub publish_ack_delay: Option<Duration>,
    pub fail_mute: Option<BackendError>,
    pub fail_signal: Option<BackendError>,
}

/// One participant's view of a [`LoopbackHub`].
pub struct LoopbackBackend {
    hub: Arc<LoopbackHub>,
    faults: Mutex<LoopbackFaults>,
    publish_calls: AtomicUsize,
    open_sessions: AtomicUsize,
}

impl LoopbackBackend {
    pub fn new(hub: Arc<LoopbackHub>) -> Arc<Self> {
        Arc::new(Self {
            hub,
            faults: Mutex::new(LoopbackFaults::default()),
            publish_calls: AtomicUsize::new(0),
            open_sessions: AtomicUsize::new(0),
        })
    }

    pub fn set_faults(&self, faults: LoopbackFaults) {
        *self.faults.lock() = faults;
    }

    pub fn publish_calls(&self) -> usize {
        self.publish_calls.load(Ordering::SeqCst)
    }

    /// Successful `open_session` calls so far.
    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }

    pub fn published_streams(&self, room: &str) -> usize {
        self.hub.published_streams(room)
    }

    fn fault(&self, pick: impl FnOnce(&LoopbackFaults) -> &Option<BackendError>) -> Result<(), BackendError> {
        match pick(&self.faults.lock()) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn publish_now(&self, handle: &SessionHandle, bundle: &TrackBundle) -> Result<(), BackendError> {
        let mut state = self.hub.state.lock();
        let slot = state.slot(handle)?;
        let connection = slot.connection.clone().ok_or(BackendError::NotConnected)?;
        if slot.published.contains_key(&bundle.id) {
            return Err(BackendError::Rejected(format!(
                "bundle {} already published",
                bundle.id
            )));
        }
        let room_name = slot.room.clone();
        let has_audio = bundle.has(TrackKind::Microphone);
        let has_video = bundle.has(TrackKind::Camera) || bundle.has(TrackKind::Screen);
        let stream = RemoteStream {
            stream_id: format!("str_{}", uuid::Uuid::new_v4().simple()),
            connection,
            kind: bundle.stream_kind(),
            has_audio,
            has_video,
            audio_active: Some(has_audio),
            video_active: Some(has_video),
        };

        state
            .rooms
            .entry(room_name.clone())
            .or_default()
            .streams
            .push(stream.clone());
        let slot = state.slot_mut(handle)?;
        slot.published.insert(
            bundle.id.clone(),
            PublishedBundle {
                stream_id: stream.stream_id.clone(),
                tracks: bundle.tracks.clone(),
            },
        );
        slot.send(BackendEvent::TrackReady(ReadyTarget::Local {
            bundle_id: bundle.id.clone(),
        }));
        state.fan_out(
            &room_name,
            Some(handle.id()),
            &BackendEvent::StreamCreated(stream),
        );
        Ok(())
    }
}

#[async_trait]
impl RtcBackend for LoopbackBackend {
    async fn open_session(&self, token: &str) -> Result<SessionHandle, BackendError> {
        let mut state = self.hub.state.lock();
        let room = state
            .tokens
            .get(token)
            .cloned()
            .ok_or_else(|| BackendError::TokenRejected("unknown token".into()))?;
        let handle = SessionHandle::new(
            format!("cli_{}", uuid::Uuid::new_v4().simple()),
            room.clone(),
        );
        state.clients.insert(
            handle.id().to_string(),
            ClientSlot {
                room,
                events: None,
                connection: None,
                published: HashMap::new(),
                subscriptions: HashMap::new(),
            },
        );
        self.open_sessions.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(target = "consult::loopback", session = %handle, "session opened");
        Ok(handle)
    }

    fn events(
        &self,
        handle: &SessionHandle,
    ) -> Result<mpsc::UnboundedReceiver<BackendEvent>, BackendError> {
        let mut state = self.hub.state.lock();
        let slot = state.slot_mut(handle)?;
        let (tx, rx) = mpsc::unbounded_channel();
        slot.events = Some(tx);
        Ok(rx)
    }

    async fn connect(
        &self,
        handle: &SessionHandle,
        app_data: &str,
    ) -> Result<ConnectionId, BackendError> {
        let delay = self.faults.lock().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.fault(|faults| &faults.fail_connect)?;

        let mut state = self.hub.state.lock();
        let slot = state.slot(handle)?;
        if slot.connection.is_some() {
            return Err(BackendError::Rejected("already connected".into()));
        }
        let room_name = slot.room.clone();
        let connection = RemoteConnection {
            connection_id: format!("con_{}", uuid::Uuid::new_v4().simple()),
            data: app_data.to_string(),
        };

        {
            let room = state.rooms.entry(room_name.clone()).or_default();
            let replay: Vec<BackendEvent> = room
                .connections
                .iter()
                .cloned()
                .map(BackendEvent::ConnectionCreated)
                .chain(room.streams.iter().cloned().map(BackendEvent::StreamCreated))
                .collect();
            room.connections.push(connection.clone());
            if let Some(slot) = state.clients.get(handle.id()) {
                replay.into_iter().for_each(|event| slot.send(event));
            }
        }

        state.fan_out(
            &room_name,
            Some(handle.id()),
            &BackendEvent::ConnectionCreated(connection.clone()),
        );
        let connection_id = connection.connection_id.clone();
        state.slot_mut(handle)?.connection = Some(connection);
        tracing::debug!(
            target = "consult::loopback",
            session = %handle,
            connection = %connection_id,
            "connected"
        );
        Ok(connection_id)
    }

    async fn disconnect(&self, handle: &SessionHandle) -> Result<(), BackendError> {
        let mut state = self.hub.state.lock();
        state
            .evict(handle.id(), "disconnect")
            .map(|_| ())
            .ok_or(BackendError::NotConnected)
    }

    async fn publish(
        &self,
        handle: &SessionHandle,
        bundle: &TrackBundle,
    ) -> Result<(), BackendError> {
        self.publish_calls.fetch_add(1, Ordering::SeqCst);
        self.fault(|faults| &faults.fail_publish)?;
        self.publish_now(handle, bundle)?;

        let ack_delay = self.faults.lock().publish_ack_delay;
        if let Some(delay) = ack_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn unpublish(
        &self,
        handle: &SessionHandle,
        bundle: &TrackBundle,
    ) -> Result<(), BackendError> {
        let mut state = self.hub.state.lock();
        let slot = state.slot_mut(handle)?;
        let published = slot
            .published
            .remove(&bundle.id)
            .ok_or_else(|| BackendError::Rejected(format!("bundle {} not published", bundle.id)))?;
        let room_name = slot.room.clone();
        if let Some(room) = state.rooms.get_mut(&room_name) {
            room.streams
                .retain(|stream| stream.stream_id != published.stream_id);
        }
        state.fan_out(
            &room_name,
            Some(handle.id()),
            &BackendEvent::StreamDestroyed {
                stream_id: published.stream_id,
                reason: "unpublish".into(),
            },
        );
        Ok(())
    }

    async fn set_track_enabled(
        &self,
        handle: &SessionHandle,
        track_id: &str,
        enabled: bool,
    ) -> Result<(), BackendError> {
        self.fault(|faults| &faults.fail_mute)?;

        let mut state = self.hub.state.lock();
        let slot = state.slot(handle)?;
        slot.connection_id()?;
        let (stream_id, kind) = slot
            .published
            .values()
            .find_map(|published| {
                published
                    .tracks
                    .iter()
                    .find(|track| track.id == track_id)
                    .map(|track| (published.stream_id.clone(), track.kind))
            })
            .ok_or_else(|| BackendError::Rejected(format!("unknown track {track_id}")))?;
        let room_name = slot.room.clone();
        let property = match kind {
            TrackKind::Microphone => StreamProperty::Audio,
            TrackKind::Camera | TrackKind::Screen => StreamProperty::Video,
        };

        if let Some(stream) = state
            .rooms
            .get_mut(&room_name)
            .and_then(|room| room.streams.iter_mut().find(|stream| stream.stream_id == stream_id))
        {
            match property {
                StreamProperty::Audio => stream.audio_active = Some(enabled),
                StreamProperty::Video => stream.video_active = Some(enabled),
            }
        }
        state.fan_out(
            &room_name,
            Some(handle.id()),
            &BackendEvent::StreamPropertyChanged {
                stream_id,
                property,
                enabled,
            },
        );
        Ok(())
    }

    async fn subscribe(
        &self,
        handle: &SessionHandle,
        stream: &RemoteStream,
    ) -> Result<RemoteTrackRef, BackendError> {
        let mut state = self.hub.state.lock();
        let slot = state.slot(handle)?;
        slot.connection_id()?;
        let known = state
            .rooms
            .get(&slot.room)
            .is_some_and(|room| room.streams.iter().any(|known| known.stream_id == stream.stream_id));
        if !known {
            return Err(BackendError::Rejected(format!(
                "unknown stream {}",
                stream.stream_id
            )));
        }
        let track_ref = RemoteTrackRef {
            stream_id: stream.stream_id.clone(),
            subscription_id: format!("sub_{}", uuid::Uuid::new_v4().simple()),
        };
        let slot = state.slot_mut(handle)?;
        slot.subscriptions
            .insert(track_ref.subscription_id.clone(), track_ref.stream_id.clone());
        slot.send(BackendEvent::TrackReady(ReadyTarget::Remote {
            stream_id: track_ref.stream_id.clone(),
        }));
        Ok(track_ref)
    }

    async fn unsubscribe(
        &self,
        handle: &SessionHandle,
        track: &RemoteTrackRef,
    ) -> Result<(), BackendError> {
        let mut state = self.hub.state.lock();
        state
            .slot_mut(handle)?
            .subscriptions
            .remove(&track.subscription_id)
            .map(|_| ())
            .ok_or_else(|| {
                BackendError::Rejected(format!("unknown subscription {}", track.subscription_id))
            })
    }

    async fn send_signal(
        &self,
        handle: &SessionHandle,
        signal: &SignalPayload,
    ) -> Result<(), BackendError> {
        self.fault(|faults| &faults.fail_signal)?;

        let state = self.hub.state.lock();
        let slot = state.slot(handle)?;
        let from = slot.connection_id()?.clone();
        // Signals reach every connection in the room, the sender included.
        state.fan_out(
            &slot.room,
            None,
            &BackendEvent::Signal(SignalPayload {
                kind: signal.kind.clone(),
                from: Some(from),
                data: signal.data.clone(),
            }),
        );
        Ok(())
    }
}
