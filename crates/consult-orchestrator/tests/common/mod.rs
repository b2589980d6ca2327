#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use consult_orchestrator::backend::loopback::{LoopbackBackend, LoopbackHub};
use consult_orchestrator::media::fake::FakeDevices;
use consult_orchestrator::telemetry::logging::{self, LOG_ENV, LogConfig};
use consult_orchestrator::{LocalIdentity, OrchestratorConfig, Role, SessionOrchestrator};
use recording_sdk::InMemoryRecordingApi;

pub const ROOM: &str = "ses_consult";

pub struct Party {
    pub orchestrator: SessionOrchestrator,
    pub backend: Arc<LoopbackBackend>,
    pub devices: Arc<FakeDevices>,
    pub recordings: Arc<InMemoryRecordingApi>,
}

pub fn party(hub: &Arc<LoopbackHub>) -> Party {
    party_with(hub, OrchestratorConfig::default())
}

/// Installs the log subscriber when `CONSULT_LOG` asks for output.
pub fn init_logging() {
    if std::env::var_os(LOG_ENV).is_some() {
        logging::init(&LogConfig::from_env()).expect("log directives");
    }
}

pub fn party_with(hub: &Arc<LoopbackHub>, config: OrchestratorConfig) -> Party {
    init_logging();
    let backend = LoopbackBackend::new(hub.clone());
    let devices = FakeDevices::new();
    let recordings = InMemoryRecordingApi::new();
    let orchestrator =
        SessionOrchestrator::new(config, backend.clone(), devices.clone(), recordings.clone());
    Party {
        orchestrator,
        backend,
        devices,
        recordings,
    }
}

pub fn advisor() -> LocalIdentity {
    LocalIdentity::new("adv-1", "김범주", Role::Advisor)
}

pub fn client() -> LocalIdentity {
    LocalIdentity::new("cli-1", "이고객", Role::Client)
}

/// Polls `check` until it holds, yielding to the runtime in between.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never held: {what}");
}

/// Lets queued backend events drain.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(25)).await;
}
