//! Local capture and publishing.
//!
//! Camera and microphone are captured once per session and published as a
//! single bundle; toggles go through the backend's in-place mute primitive
//! and never recreate the device. Screen share is published as a second,
//! independent bundle.

mod devices;
pub mod fake;
mod permission;

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

pub use devices::{MediaConstraints, MediaDevices};
pub use permission::MediaPermissionGate;

use crate::backend::{
    BackendError, LocalTrack, RtcBackend, SessionHandle, TrackBundle, TrackId, TrackKind,
};
use crate::events::{EventHub, EventKind};
use crate::telemetry::PerfGuard;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("media access denied")]
    AccessDenied,
    #[error("media device is in use by another application")]
    DeviceInUse,
    #[error("media device not found")]
    DeviceNotFound,
    #[error("no published {0} track")]
    NotPublishing(TrackKind),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl MediaError {
    pub fn user_message(&self) -> String {
        match self {
            MediaError::AccessDenied => "Access to the device was not granted.".into(),
            MediaError::DeviceInUse => {
                "The device is being used by another application.".into()
            }
            MediaError::DeviceNotFound => "The device could not be found.".into(),
            MediaError::NotPublishing(kind) => format!("Your {kind} is not connected."),
            MediaError::Backend(_) => "The change could not be applied. Try again.".into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalMediaState {
    pub camera_enabled: bool,
    pub mic_enabled: bool,
    pub screen_share_enabled: bool,
    pub published_track_ids: BTreeSet<TrackId>,
}

#[derive(Default)]
struct MediaInner {
    state: LocalMediaState,
    session: Option<SessionHandle>,
    main: Option<TrackBundle>,
    screen: Option<TrackBundle>,
    /// Captured and not yet released, published or not.
    live: Vec<LocalTrack>,
    /// Bundles reported ready before their publish call returned.
    early_ready: HashSet<String>,
}

impl MediaInner {
    fn take_early_ready(&mut self, bundle: &TrackBundle) -> Option<Vec<TrackId>> {
        self.early_ready
            .remove(&bundle.id)
            .then(|| bundle.track_ids().collect())
    }
}

pub struct LocalMediaController {
    backend: Arc<dyn RtcBackend>,
    devices: Arc<dyn MediaDevices>,
    hub: Arc<EventHub>,
    inner: Mutex<MediaInner>,
    publish_gate: AsyncMutex<()>,
    camera_gate: AsyncMutex<()>,
    mic_gate: AsyncMutex<()>,
    screen_gate: AsyncMutex<()>,
}

impl LocalMediaController {
    pub fn new(
        backend: Arc<dyn RtcBackend>,
        devices: Arc<dyn MediaDevices>,
        hub: Arc<EventHub>,
    ) -> Self {
        Self {
            backend,
            devices,
            hub,
            inner: Mutex::new(MediaInner::default()),
            publish_gate: AsyncMutex::new(()),
            camera_gate: AsyncMutex::new(()),
            mic_gate: AsyncMutex::new(()),
            screen_gate: AsyncMutex::new(()),
        }
    }

    pub fn state(&self) -> LocalMediaState {
        self.inner.lock().state.clone()
    }

    /// Captures camera and microphone and publishes them. Returns the current
    /// state without capturing again when a bundle is already published.
    pub async fn start_publishing(
        &self,
        handle: &SessionHandle,
        constraints: &MediaConstraints,
    ) -> Result<LocalMediaState, MediaError> {
        let _gate = self.publish_gate.lock().await;
        {
            let inner = self.inner.lock();
            if inner.main.is_some() {
                return Ok(inner.state.clone());
            }
        }

        let tracks = self.devices.capture(constraints).await?;
        self.inner.lock().live.extend(tracks.iter().cloned());
        let bundle = TrackBundle::new(tracks);

        if let Err(err) = self.backend.publish(handle, &bundle).await {
            tracing::warn!(
                target = "consult::media",
                session = %handle,
                error = %err,
                "publishing local media failed; releasing capture"
            );
            self.release_tracks(&bundle.tracks);
            return Err(err.into());
        }

        let mut inner = self.inner.lock();
        inner.session = Some(handle.clone());
        inner.state.camera_enabled = bundle.has(TrackKind::Camera);
        inner.state.mic_enabled = bundle.has(TrackKind::Microphone);
        inner.state.published_track_ids.extend(bundle.track_ids());
        tracing::info!(
            target = "consult::media",
            session = %handle,
            bundle = %bundle.id,
            tracks = bundle.tracks.len(),
            "local media published"
        );
        let ready = inner.take_early_ready(&bundle);
        inner.main = Some(bundle);
        let state = inner.state.clone();
        self.hub
            .apply(EventKind::LocalMediaChanged, |snap| snap.media = state.clone());
        if let Some(track_ids) = ready {
            self.hub.notify(EventKind::LocalTrackRenderable { track_ids });
        }
        Ok(state)
    }

    pub async fn toggle_camera(&self) -> Result<LocalMediaState, MediaError> {
        self.toggle(TrackKind::Camera).await
    }

    pub async fn toggle_mic(&self) -> Result<LocalMediaState, MediaError> {
        self.toggle(TrackKind::Microphone).await
    }

    async fn toggle(&self, kind: TrackKind) -> Result<LocalMediaState, MediaError> {
        let gate = match kind {
            TrackKind::Camera => &self.camera_gate,
            TrackKind::Microphone => &self.mic_gate,
            TrackKind::Screen => return Err(MediaError::NotPublishing(kind)),
        };
        let _serialized = gate.lock().await;
        let _perf = PerfGuard::new("media.toggle");

        let (handle, track_id, target) = {
            let inner = self.inner.lock();
            let track = inner.main.as_ref().and_then(|bundle| bundle.track(kind));
            match (&inner.session, track) {
                (Some(handle), Some(track)) => {
                    let enabled = match kind {
                        TrackKind::Camera => inner.state.camera_enabled,
                        _ => inner.state.mic_enabled,
                    };
                    (handle.clone(), track.id.clone(), !enabled)
                }
                _ => return Err(MediaError::NotPublishing(kind)),
            }
        };

        if let Err(err) = self
            .backend
            .set_track_enabled(&handle, &track_id, target)
            .await
        {
            tracing::warn!(
                target = "consult::media",
                track = %track_id,
                %kind,
                enabled = target,
                error = %err,
                "toggle rejected by backend"
            );
            return Err(err.into());
        }

        let mut inner = self.inner.lock();
        if inner.session.as_ref() != Some(&handle) {
            return Err(MediaError::NotPublishing(kind));
        }
        match kind {
            TrackKind::Camera => inner.state.camera_enabled = target,
            _ => inner.state.mic_enabled = target,
        }
        tracing::debug!(
            target = "consult::media",
            track = %track_id,
            %kind,
            enabled = target,
            "toggled local track"
        );
        let state = inner.state.clone();
        self.hub
            .apply(EventKind::LocalMediaChanged, |snap| snap.media = state.clone());
        Ok(state)
    }

    /// Publishes a screen capture next to the camera. A second call while
    /// sharing returns the existing track.
    pub async fn start_screen_share(&self) -> Result<TrackId, MediaError> {
        let _serialized = self.screen_gate.lock().await;
        let handle = {
            let inner = self.inner.lock();
            if let Some(track) = inner.screen.as_ref().and_then(|bundle| bundle.tracks.first()) {
                return Ok(track.id.clone());
            }
            inner
                .session
                .clone()
                .ok_or(MediaError::NotPublishing(TrackKind::Screen))?
        };

        let track = self.devices.capture_screen().await?;
        self.inner.lock().live.push(track.clone());
        let bundle = TrackBundle::new(vec![track.clone()]);

        if let Err(err) = self.backend.publish(&handle, &bundle).await {
            tracing::warn!(
                target = "consult::media",
                error = %err,
                "publishing screen share failed"
            );
            self.release_tracks(&bundle.tracks);
            return Err(err.into());
        }

        let mut inner = self.inner.lock();
        let ready = inner.take_early_ready(&bundle);
        inner.screen = Some(bundle);
        inner.state.screen_share_enabled = true;
        inner.state.published_track_ids.insert(track.id.clone());
        tracing::info!(target = "consult::media", track = %track.id, "screen share started");
        let state = inner.state.clone();
        self.hub
            .apply(EventKind::LocalMediaChanged, |snap| snap.media = state);
        if let Some(track_ids) = ready {
            self.hub.notify(EventKind::LocalTrackRenderable { track_ids });
        }
        Ok(track.id)
    }

    pub async fn stop_screen_share(&self) {
        let _serialized = self.screen_gate.lock().await;
        let (handle, bundle) = {
            let mut inner = self.inner.lock();
            match inner.screen.take() {
                Some(bundle) => (inner.session.clone(), bundle),
                None => return,
            }
        };

        if let Some(handle) = handle {
            if let Err(err) = self.backend.unpublish(&handle, &bundle).await {
                tracing::debug!(
                    target = "consult::media",
                    error = %err,
                    "unpublishing screen share failed"
                );
            }
        }
        self.release_tracks(&bundle.tracks);

        let mut inner = self.inner.lock();
        inner.state.screen_share_enabled = false;
        for id in bundle.track_ids() {
            inner.state.published_track_ids.remove(&id);
        }
        tracing::info!(target = "consult::media", "screen share stopped");
        let state = inner.state.clone();
        self.hub
            .apply(EventKind::LocalMediaChanged, |snap| snap.media = state);
    }

    /// Marks a published bundle as attachable. The backend may report this
    /// before `publish` returns; the event is then emitted once the bundle
    /// is recorded.
    pub fn mark_renderable(&self, bundle_id: &str) {
        let mut inner = self.inner.lock();
        let track_ids: Option<Vec<TrackId>> = [inner.main.as_ref(), inner.screen.as_ref()]
            .into_iter()
            .flatten()
            .find(|bundle| bundle.id == bundle_id)
            .map(|bundle| bundle.track_ids().collect());
        match track_ids {
            Some(track_ids) => self
                .hub
                .notify(EventKind::LocalTrackRenderable { track_ids }),
            None => {
                inner.early_ready.insert(bundle_id.to_string());
            }
        }
    }

    /// Unpublishes every bundle and releases every captured track exactly
    /// once. Waits for in-flight toggles and publishes to settle first.
    pub async fn shutdown(&self, handle: Option<&SessionHandle>) {
        let _publish = self.publish_gate.lock().await;
        let _camera = self.camera_gate.lock().await;
        let _mic = self.mic_gate.lock().await;
        let _screen = self.screen_gate.lock().await;

        let (bundles, live) = {
            let mut inner = self.inner.lock();
            inner.session = None;
            inner.early_ready.clear();
            let bundles: Vec<TrackBundle> =
                [inner.screen.take(), inner.main.take()].into_iter().flatten().collect();
            (bundles, std::mem::take(&mut inner.live))
        };

        if let Some(handle) = handle {
            for bundle in &bundles {
                if let Err(err) = self.backend.unpublish(handle, bundle).await {
                    tracing::debug!(
                        target = "consult::media",
                        bundle = %bundle.id,
                        error = %err,
                        "unpublish during shutdown failed"
                    );
                }
            }
        }
        for track in &live {
            self.devices.release(track);
        }
        if !live.is_empty() {
            tracing::debug!(
                target = "consult::media",
                released = live.len(),
                "released local tracks"
            );
        }

        let mut inner = self.inner.lock();
        if inner.state != LocalMediaState::default() {
            inner.state = LocalMediaState::default();
            self.hub.apply(EventKind::LocalMediaChanged, |snap| {
                snap.media = LocalMediaState::default()
            });
        }
    }

    fn release_tracks(&self, tracks: &[LocalTrack]) {
        let released: Vec<LocalTrack> = {
            let mut inner = self.inner.lock();
            let (released, kept): (Vec<LocalTrack>, Vec<LocalTrack>) =
                std::mem::take(&mut inner.live)
                .into_iter()
                .partition(|live| tracks.iter().any(|track| track.id == live.id));
            inner.live = kept;
            released
        };
        for track in &released {
            self.devices.release(track);
        }
    }
}
