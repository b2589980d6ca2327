use thiserror::Error;

use crate::backend::BackendError;
use crate::media::MediaError;
use crate::session::SessionState;

/// Device problems that are not about permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFault {
    InUse,
    NotFound,
}

/// Why a session ended up in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    PermissionDenied,
    TokenInvalid,
    BackendUnreachable,
    DeviceUnavailable(DeviceFault),
    ConnectionLost,
}

impl FailureReason {
    pub fn user_message(self) -> &'static str {
        match self {
            FailureReason::PermissionDenied => {
                "Camera and microphone access was not granted. Allow access in your browser settings and try again."
            }
            FailureReason::TokenInvalid => {
                "This consultation link is no longer valid. Request a new invitation."
            }
            FailureReason::BackendUnreachable => {
                "The consultation server could not be reached. Check your connection and retry."
            }
            FailureReason::DeviceUnavailable(DeviceFault::InUse) => {
                "Your camera or microphone is being used by another application."
            }
            FailureReason::DeviceUnavailable(DeviceFault::NotFound) => {
                "No camera or microphone was found."
            }
            FailureReason::ConnectionLost => "The connection was lost. Select retry to rejoin.",
        }
    }

    /// Whether the UI should offer an explicit retry action.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            FailureReason::BackendUnreachable | FailureReason::ConnectionLost
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("camera or microphone permission denied")]
    PermissionDenied,
    #[error("session token rejected")]
    TokenInvalid,
    #[error("session backend unreachable")]
    BackendUnreachable,
    #[error("media device unavailable: {0:?}")]
    Device(DeviceFault),
    #[error("connect rejected while session is {0:?}")]
    Busy(SessionState),
    #[error("connect abandoned because leave was requested")]
    Aborted,
}

impl ConnectError {
    pub fn reason(&self) -> FailureReason {
        match self {
            ConnectError::PermissionDenied => FailureReason::PermissionDenied,
            ConnectError::TokenInvalid => FailureReason::TokenInvalid,
            ConnectError::Device(fault) => FailureReason::DeviceUnavailable(*fault),
            ConnectError::BackendUnreachable | ConnectError::Busy(_) | ConnectError::Aborted => {
                FailureReason::BackendUnreachable
            }
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            ConnectError::Busy(_) => "A consultation is already in progress.",
            ConnectError::Aborted => "You left the consultation.",
            other => other.reason().user_message(),
        }
    }
}

impl From<BackendError> for ConnectError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::TokenRejected(_) => ConnectError::TokenInvalid,
            BackendError::Unreachable(_)
            | BackendError::NotConnected
            | BackendError::Rejected(_) => ConnectError::BackendUnreachable,
        }
    }
}

impl From<MediaError> for ConnectError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::AccessDenied => ConnectError::PermissionDenied,
            MediaError::DeviceInUse => ConnectError::Device(DeviceFault::InUse),
            MediaError::DeviceNotFound => ConnectError::Device(DeviceFault::NotFound),
            MediaError::Backend(err) => err.into(),
            MediaError::NotPublishing(_) => ConnectError::BackendUnreachable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TrackKind;

    #[test]
    fn media_errors_map_onto_connect_failures() {
        assert_eq!(
            ConnectError::from(MediaError::AccessDenied),
            ConnectError::PermissionDenied
        );
        assert_eq!(
            ConnectError::from(MediaError::DeviceInUse).reason(),
            FailureReason::DeviceUnavailable(DeviceFault::InUse)
        );
        assert_eq!(
            ConnectError::from(MediaError::Backend(BackendError::TokenRejected("expired".into()))),
            ConnectError::TokenInvalid
        );
        assert_eq!(
            ConnectError::from(MediaError::NotPublishing(TrackKind::Camera)),
            ConnectError::BackendUnreachable
        );
    }

    #[test]
    fn only_transport_failures_offer_retry() {
        assert!(FailureReason::ConnectionLost.retryable());
        assert!(FailureReason::BackendUnreachable.retryable());
        assert!(!FailureReason::PermissionDenied.retryable());
        assert!(!FailureReason::TokenInvalid.retryable());
    }
}
