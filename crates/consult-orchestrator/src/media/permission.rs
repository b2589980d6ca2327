use std::sync::Arc;

use super::{MediaDevices, MediaError};

/// Fails fast when camera/microphone access cannot be obtained, before any
/// backend session is opened.
pub struct MediaPermissionGate {
    devices: Arc<dyn MediaDevices>,
}

impl MediaPermissionGate {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self { devices }
    }

    pub async fn ensure_granted(&self) -> Result<(), MediaError> {
        match self.devices.query_permission().await {
            Ok(()) => {
                tracing::debug!(target = "consult::media", "media permission granted");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(
                    target = "consult::media",
                    error = %err,
                    "media permission check failed"
                );
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::fake::FakeDevices;

    #[test_timeout::tokio_timeout_test]
    async fn denied_permission_is_reported_as_access_denied() {
        let devices = FakeDevices::new();
        let gate = MediaPermissionGate::new(devices.clone());
        assert_eq!(gate.ensure_granted().await, Ok(()));

        devices.deny_permission();
        assert_eq!(gate.ensure_granted().await, Err(MediaError::AccessDenied));
        assert!(devices.open_tracks().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn missing_devices_are_not_a_permission_problem() {
        let devices = FakeDevices::new();
        devices.fail_capture(MediaError::DeviceNotFound);
        let gate = MediaPermissionGate::new(devices);
        assert_eq!(gate.ensure_granted().await, Err(MediaError::DeviceNotFound));
    }
}
