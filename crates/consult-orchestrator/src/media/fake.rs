//! Scriptable in-memory capture devices.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{MediaConstraints, MediaDevices, MediaError};
use crate::backend::{LocalTrack, TrackId, TrackKind};

#[derive(Default)]
pub struct FakeDevices {
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    deny_permission: bool,
    capture_fault: Option<MediaError>,
    decline_screen: bool,
    next_id: u64,
    open: Vec<LocalTrack>,
    releases: HashMap<TrackId, u32>,
    captures: u32,
}

impl FakeDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deny_permission(&self) {
        self.state.lock().deny_permission = true;
    }

    pub fn grant_permission(&self) {
        self.state.lock().deny_permission = false;
    }

    /// Every permission check and camera/mic capture fails with `err` until cleared.
    pub fn fail_capture(&self, err: MediaError) {
        self.state.lock().capture_fault = Some(err);
    }

    pub fn clear_faults(&self) {
        let mut state = self.state.lock();
        state.capture_fault = None;
        state.decline_screen = false;
    }

    /// The next screen picker is dismissed by the user.
    pub fn decline_screen_picker(&self) {
        self.state.lock().decline_screen = true;
    }

    /// Tracks captured and not yet released.
    pub fn open_tracks(&self) -> Vec<LocalTrack> {
        self.state.lock().open.clone()
    }

    pub fn release_count(&self, track_id: &str) -> u32 {
        self.state
            .lock()
            .releases
            .get(track_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_releases(&self) -> u32 {
        self.state.lock().releases.values().sum()
    }

    /// Number of capture calls that produced tracks, screen included.
    pub fn captures(&self) -> u32 {
        self.state.lock().captures
    }

    fn open_track(state: &mut FakeState, kind: TrackKind, label: String) -> LocalTrack {
        state.next_id += 1;
        let track = LocalTrack {
            id: format!("{kind}-{}", state.next_id),
            kind,
            label,
        };
        state.open.push(track.clone());
        track
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn query_permission(&self) -> Result<(), MediaError> {
        let state = self.state.lock();
        if state.deny_permission {
            return Err(MediaError::AccessDenied);
        }
        match &state.capture_fault {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn capture(&self, constraints: &MediaConstraints) -> Result<Vec<LocalTrack>, MediaError> {
        let mut state = self.state.lock();
        if state.deny_permission {
            return Err(MediaError::AccessDenied);
        }
        if let Some(err) = &state.capture_fault {
            return Err(err.clone());
        }
        let mut tracks = Vec::new();
        if constraints.video {
            let label = format!(
                "fake camera {}@{}",
                constraints.resolution(),
                constraints.frame_rate
            );
            tracks.push(Self::open_track(&mut state, TrackKind::Camera, label));
        }
        if constraints.audio {
            tracks.push(Self::open_track(
                &mut state,
                TrackKind::Microphone,
                "fake microphone".into(),
            ));
        }
        state.captures += 1;
        Ok(tracks)
    }

    async fn capture_screen(&self) -> Result<LocalTrack, MediaError> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.decline_screen) {
            return Err(MediaError::AccessDenied);
        }
        state.captures += 1;
        Ok(Self::open_track(
            &mut state,
            TrackKind::Screen,
            "fake display".into(),
        ))
    }

    fn release(&self, track: &LocalTrack) {
        let mut state = self.state.lock();
        state.open.retain(|open| open.id != track.id);
        *state.releases.entry(track.id.clone()).or_insert(0) += 1;
    }
}
