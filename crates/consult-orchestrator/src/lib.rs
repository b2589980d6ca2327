//! Orchestrates a real-time advisor/client consultation: session lifecycle,
//! local capture and publishing, remote participants, server-side recording
//! and in-session chat, behind one [`SessionOrchestrator`].
//!
//! The media server is reached through [`backend::RtcBackend`] and capture
//! devices through [`media::MediaDevices`]; [`backend::loopback`] and
//! [`media::fake`] provide in-process implementations of both.

pub mod backend;
pub mod chat;
pub mod config;
mod context;
pub mod error;
pub mod events;
pub mod media;
mod orchestrator;
pub mod recording;
pub mod session;
pub mod telemetry;

pub use chat::{ChatError, ChatMessage};
pub use config::{ConfigError, OrchestratorConfig};
pub use error::{ConnectError, DeviceFault, FailureReason};
pub use events::{EventKind, Notice, NoticeLevel, OrchestratorEvent, Snapshot};
pub use media::{LocalMediaState, MediaConstraints, MediaError};
pub use orchestrator::SessionOrchestrator;
pub use recording::{RecordingError, RecordingState, RecordingStatus};
pub use session::{LocalIdentity, RemoteParticipant, Role, SessionState};
