use async_trait::async_trait;

use super::MediaError;
use crate::backend::LocalTrack;

/// Capture settings for the camera/microphone bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
            width: 640,
            height: 480,
            frame_rate: 30,
        }
    }
}

impl MediaConstraints {
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

/// Local capture devices.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Resolves once camera and microphone access is obtainable.
    async fn query_permission(&self) -> Result<(), MediaError>;

    async fn capture(&self, constraints: &MediaConstraints) -> Result<Vec<LocalTrack>, MediaError>;

    /// Opens the OS screen picker. A dismissed picker is `AccessDenied`.
    async fn capture_screen(&self) -> Result<LocalTrack, MediaError>;

    /// Stops the underlying device.
    fn release(&self, track: &LocalTrack);
}
