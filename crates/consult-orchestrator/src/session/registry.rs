use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{ConnectionMetadata, Role};
use crate::backend::{
    ConnectionId, RemoteConnection, RemoteStream, RemoteTrackRef, RtcBackend, SessionHandle,
    StreamId, StreamKind, StreamProperty,
};
use crate::events::{EventHub, EventKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteParticipant {
    pub stream_id: StreamId,
    pub participant_id: ConnectionId,
    pub display_name: String,
    pub role: Role,
    pub kind: StreamKind,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub renderable: bool,
    pub track_ref: RemoteTrackRef,
}

#[derive(Default)]
struct RegistryInner {
    accepting: bool,
    entries: Vec<RemoteParticipant>,
    connections: HashMap<ConnectionId, ConnectionMetadata>,
}

impl RegistryInner {
    fn position(&self, stream_id: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|participant| participant.stream_id == stream_id)
    }
}

/// Remote streams this client is subscribed to, in arrival order.
///
/// Apart from the subscribe issued for each new stream the registry only
/// observes; it never publishes, mutes or disconnects anything.
pub struct RemoteParticipantRegistry {
    backend: Arc<dyn RtcBackend>,
    hub: Arc<EventHub>,
    placeholder: String,
    inner: Mutex<RegistryInner>,
}

impl RemoteParticipantRegistry {
    pub fn new(backend: Arc<dyn RtcBackend>, hub: Arc<EventHub>, placeholder: String) -> Self {
        Self {
            backend,
            hub,
            placeholder,
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    /// Starts accepting stream announcements for a new session.
    pub fn open(&self) {
        let mut inner = self.inner.lock();
        inner.accepting = true;
        inner.entries.clear();
        inner.connections.clear();
    }

    /// Stops accepting announcements and hands back every entry so the
    /// caller can release the subscriptions.
    pub fn close(&self) -> Vec<RemoteParticipant> {
        let mut inner = self.inner.lock();
        inner.accepting = false;
        inner.connections.clear();
        let drained = std::mem::take(&mut inner.entries);
        if !drained.is_empty() {
            tracing::debug!(
                target = "consult::participants",
                count = drained.len(),
                "cleared participant registry"
            );
            self.hub
                .apply(EventKind::ParticipantsCleared, |snap| snap.participants.clear());
        }
        drained
    }

    pub fn participants(&self) -> Vec<RemoteParticipant> {
        self.inner.lock().entries.clone()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn get(&self, stream_id: &str) -> Option<RemoteParticipant> {
        let inner = self.inner.lock();
        inner.position(stream_id).map(|idx| inner.entries[idx].clone())
    }

    pub fn display_name_for(&self, connection_id: &str) -> Option<String> {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .find(|participant| participant.participant_id == connection_id)
            .map(|participant| participant.display_name.clone())
            .or_else(|| {
                inner
                    .connections
                    .get(connection_id)
                    .and_then(|metadata| metadata.display_name.clone())
            })
    }

    /// Subscribes to `stream` and records it. Duplicate announcements and
    /// announcements arriving after [`close`](Self::close) are ignored.
    pub async fn on_stream_created(
        &self,
        handle: &SessionHandle,
        stream: RemoteStream,
        local_role: Role,
    ) -> Option<RemoteParticipant> {
        {
            let inner = self.inner.lock();
            if !inner.accepting {
                return None;
            }
            if inner.position(&stream.stream_id).is_some() {
                tracing::debug!(
                    target = "consult::participants",
                    stream = %stream.stream_id,
                    "ignoring duplicate stream announcement"
                );
                return None;
            }
        }

        let track_ref = match self.backend.subscribe(handle, &stream).await {
            Ok(track_ref) => track_ref,
            Err(err) => {
                tracing::warn!(
                    target = "consult::participants",
                    stream = %stream.stream_id,
                    error = %err,
                    "subscribing to remote stream failed"
                );
                return None;
            }
        };

        let inserted = {
            let mut inner = self.inner.lock();
            if !inner.accepting || inner.position(&stream.stream_id).is_some() {
                None
            } else {
                let known = inner
                    .connections
                    .get(&stream.connection.connection_id)
                    .cloned()
                    .unwrap_or_default();
                let metadata = ConnectionMetadata::parse(&stream.connection.data).or(&known);
                let (display_name, role) = metadata.resolve(local_role, &self.placeholder);
                let participant = RemoteParticipant {
                    stream_id: stream.stream_id.clone(),
                    participant_id: stream.connection.connection_id.clone(),
                    display_name,
                    role,
                    kind: stream.kind,
                    audio_enabled: stream.audio_active.unwrap_or(true),
                    video_enabled: stream.video_active.unwrap_or(true),
                    renderable: false,
                    track_ref: track_ref.clone(),
                };
                tracing::info!(
                    target = "consult::participants",
                    stream = %participant.stream_id,
                    connection = %participant.participant_id,
                    name = %participant.display_name,
                    role = %participant.role,
                    "remote participant joined"
                );
                inner.entries.push(participant.clone());
                let entries = inner.entries.clone();
                self.hub.apply(
                    EventKind::ParticipantJoined {
                        stream_id: participant.stream_id.clone(),
                    },
                    |snap| snap.participants = entries,
                );
                Some(participant)
            }
        };

        if inserted.is_none() {
            // Closed (or raced) while the subscription was in flight.
            if let Err(err) = self.backend.unsubscribe(handle, &track_ref).await {
                tracing::debug!(
                    target = "consult::participants",
                    error = %err,
                    "releasing late subscription failed"
                );
            }
        }
        inserted
    }

    /// Removes the entry for `stream_id`; unknown streams are a no-op.
    pub fn on_stream_destroyed(&self, stream_id: &str) -> Option<RemoteParticipant> {
        let mut inner = self.inner.lock();
        let Some(idx) = inner.position(stream_id) else {
            tracing::debug!(
                target = "consult::participants",
                stream = %stream_id,
                "stream destroyed for unknown entry"
            );
            return None;
        };
        let removed = inner.entries.remove(idx);
        tracing::info!(
            target = "consult::participants",
            stream = %stream_id,
            connection = %removed.participant_id,
            "remote participant left"
        );
        let entries = inner.entries.clone();
        self.hub.apply(
            EventKind::ParticipantLeft {
                stream_id: stream_id.to_string(),
            },
            |snap| snap.participants = entries,
        );
        Some(removed)
    }

    pub fn on_property_changed(&self, stream_id: &str, property: StreamProperty, enabled: bool) {
        let kind = EventKind::ParticipantUpdated {
            stream_id: stream_id.to_string(),
        };
        self.update(stream_id, kind, |participant| {
            let flag = match property {
                StreamProperty::Audio => &mut participant.audio_enabled,
                StreamProperty::Video => &mut participant.video_enabled,
            };
            let changed = *flag != enabled;
            *flag = enabled;
            changed
        });
    }

    pub fn mark_renderable(&self, stream_id: &str) {
        self.update(
            stream_id,
            EventKind::RemoteTrackRenderable {
                stream_id: stream_id.to_string(),
            },
            |participant| !std::mem::replace(&mut participant.renderable, true),
        );
    }

    /// Remembers a connection's metadata and corrects entries that were
    /// created before it was known.
    pub fn on_connection_created(&self, connection: &RemoteConnection, local_role: Role) {
        let metadata = ConnectionMetadata::parse(&connection.data);
        let mut inner = self.inner.lock();
        if !inner.accepting {
            return;
        }
        let mut updated = Vec::new();
        for participant in inner
            .entries
            .iter_mut()
            .filter(|participant| participant.participant_id == connection.connection_id)
        {
            let (display_name, role) = match (&metadata.display_name, metadata.role) {
                (None, None) => continue,
                _ => {
                    let fallback = ConnectionMetadata {
                        display_name: Some(participant.display_name.clone()),
                        role: Some(participant.role),
                    };
                    metadata
                        .clone()
                        .or(&fallback)
                        .resolve(local_role, &self.placeholder)
                }
            };
            if participant.display_name != display_name || participant.role != role {
                participant.display_name = display_name;
                participant.role = role;
                updated.push(participant.stream_id.clone());
            }
        }
        inner
            .connections
            .insert(connection.connection_id.clone(), metadata);
        for stream_id in updated {
            let entries = inner.entries.clone();
            self.hub.apply(EventKind::ParticipantUpdated { stream_id }, |snap| {
                snap.participants = entries
            });
        }
    }

    /// Drops the connection and every entry it still owns.
    pub fn on_connection_destroyed(&self, connection_id: &str) -> Vec<RemoteParticipant> {
        let mut inner = self.inner.lock();
        inner.connections.remove(connection_id);
        let (gone, kept): (Vec<RemoteParticipant>, Vec<RemoteParticipant>) =
            std::mem::take(&mut inner.entries)
                .into_iter()
                .partition(|participant| participant.participant_id == connection_id);
        inner.entries = kept;
        for participant in &gone {
            let entries = inner.entries.clone();
            self.hub.apply(
                EventKind::ParticipantLeft {
                    stream_id: participant.stream_id.clone(),
                },
                |snap| snap.participants = entries,
            );
        }
        gone
    }

    fn update(
        &self,
        stream_id: &str,
        kind: EventKind,
        change: impl FnOnce(&mut RemoteParticipant) -> bool,
    ) {
        let mut inner = self.inner.lock();
        let Some(idx) = inner.position(stream_id) else {
            return;
        };
        if change(&mut inner.entries[idx]) {
            let entries = inner.entries.clone();
            self.hub.apply(kind, |snap| snap.participants = entries);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::loopback::{LoopbackBackend, LoopbackHub};
    use crate::backend::{BackendEvent, LocalTrack, TrackBundle, TrackKind};
    use crate::events::TOPIC_PARTICIPANTS;

    const PLACEHOLDER: &str = "참가자";

    fn stream(id: &str, connection: &str, data: &str) -> RemoteStream {
        RemoteStream {
            stream_id: id.into(),
            connection: RemoteConnection {
                connection_id: connection.into(),
                data: data.into(),
            },
            kind: StreamKind::Camera,
            has_audio: true,
            has_video: true,
            audio_active: None,
            video_active: Some(false),
        }
    }

    async fn rig() -> (RemoteParticipantRegistry, SessionHandle, Arc<EventHub>) {
        let hub = LoopbackHub::new();
        let token = hub.issue_token("ses_registry");
        let backend = LoopbackBackend::new(hub);
        let handle = backend.open_session(&token).await.expect("open");
        let events = Arc::new(EventHub::new(32));
        let registry = RemoteParticipantRegistry::new(backend, events.clone(), PLACEHOLDER.into());
        registry.open();
        (registry, handle, events)
    }

    #[test_timeout::tokio_timeout_test]
    async fn closed_registry_ignores_announcements() {
        let (registry, handle, _events) = rig().await;
        registry.close();
        let created = registry
            .on_stream_created(&handle, stream("str_1", "con_1", "{}"), Role::Advisor)
            .await;
        assert!(created.is_none());
        assert_eq!(registry.count(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn unknown_stream_removal_is_silent() {
        let (registry, _handle, events) = rig().await;
        let before = events.snapshot();
        assert!(registry.on_stream_destroyed("str_missing").is_none());
        assert!(registry.on_stream_destroyed("str_missing").is_none());
        assert_eq!(events.snapshot(), before);
    }

    #[test_timeout::tokio_timeout_test]
    async fn failed_subscription_creates_no_entry() {
        let (registry, handle, _events) = rig().await;
        let created = registry
            .on_stream_created(&handle, stream("str_ghost", "con_1", "{}"), Role::Client)
            .await;
        assert!(created.is_none());
        assert!(registry.participants().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn late_connection_metadata_corrects_and_departure_sweeps() {
        let loopback = LoopbackHub::new();
        let local = LoopbackBackend::new(loopback.clone());
        let handle = local
            .open_session(&loopback.issue_token("ses_registry"))
            .await
            .expect("open");
        let mut inbound = local.events(&handle).expect("events");
        local.connect(&handle, "{}").await.expect("connect");

        let remote = LoopbackBackend::new(loopback.clone());
        let remote_handle = remote
            .open_session(&loopback.issue_token("ses_registry"))
            .await
            .expect("open remote");
        let _remote_events = remote.events(&remote_handle).expect("remote events");
        remote
            .connect(&remote_handle, "{not json")
            .await
            .expect("connect remote");
        remote
            .publish(
                &remote_handle,
                &TrackBundle::new(vec![LocalTrack {
                    id: "camera-r".into(),
                    kind: TrackKind::Camera,
                    label: "remote cam".into(),
                }]),
            )
            .await
            .expect("publish");

        let announced = loop {
            match inbound.recv().await {
                Some(BackendEvent::StreamCreated(stream)) => break stream,
                Some(_) => continue,
                None => panic!("backend event stream ended"),
            }
        };
        let connection_id = announced.connection.connection_id.clone();
        let stream_id = announced.stream_id.clone();

        let events = Arc::new(EventHub::new(32));
        let mut updates = events.subscribe(TOPIC_PARTICIPANTS);
        let registry = RemoteParticipantRegistry::new(local, events, PLACEHOLDER.into());
        registry.open();
        let joined = registry
            .on_stream_created(&handle, announced, Role::Advisor)
            .await
            .expect("joined");
        assert_eq!(joined.display_name, PLACEHOLDER);
        assert_eq!(joined.role, Role::Client);

        registry.on_connection_created(
            &RemoteConnection {
                connection_id: connection_id.clone(),
                data: r#"{"displayName":"박상담","role":"EXPERT"}"#.into(),
            },
            Role::Advisor,
        );
        let corrected = registry.get(&stream_id).expect("entry kept");
        assert_eq!(corrected.display_name, "박상담");
        assert_eq!(corrected.role, Role::Advisor);
        assert_eq!(
            registry.display_name_for(&connection_id).as_deref(),
            Some("박상담")
        );

        let gone = registry.on_connection_destroyed(&connection_id);
        assert_eq!(gone.len(), 1);
        assert_eq!(gone[0].stream_id, stream_id);
        assert_eq!(registry.count(), 0);
        assert!(registry.on_connection_destroyed(&connection_id).is_empty());

        let kinds: Vec<EventKind> = std::iter::from_fn(|| updates.try_recv().ok())
            .map(|message| message.payload.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::ParticipantJoined {
                    stream_id: stream_id.clone()
                },
                EventKind::ParticipantUpdated {
                    stream_id: stream_id.clone()
                },
                EventKind::ParticipantLeft { stream_id },
            ]
        );
    }
}
