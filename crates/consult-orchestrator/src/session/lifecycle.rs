use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use super::{LocalIdentity, Role, SessionState};
use crate::backend::{BackendEvent, ConnectionId, ReadyTarget, SessionHandle};
use crate::chat::CHAT_SIGNAL_KIND;
use crate::context::SessionContext;
use crate::error::{ConnectError, FailureReason};
use crate::events::{EventKind, Notice};
use crate::telemetry::PerfGuard;

/// Drives the session state machine.
///
/// `connect` runs its attempt on a separate task so it always settles, even
/// when the caller stops waiting. Backend events are consumed by a pump task
/// registered before anything is published.
#[derive(Clone)]
pub struct SessionLifecycleManager {
    ctx: Arc<SessionContext>,
}

impl SessionLifecycleManager {
    pub(crate) fn new(ctx: Arc<SessionContext>) -> Self {
        Self { ctx }
    }

    pub fn state(&self) -> SessionState {
        self.ctx.slot.lock().state.clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.ctx.watch_state()
    }

    pub fn handle(&self) -> Option<SessionHandle> {
        self.ctx.slot.lock().handle.clone()
    }

    /// Backend connection id while connected.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.ctx.slot.lock().connection_id.clone()
    }

    pub fn identity(&self) -> Option<LocalIdentity> {
        self.ctx.slot.lock().identity.clone()
    }

    pub async fn connect(
        &self,
        token: &str,
        identity: LocalIdentity,
    ) -> Result<SessionHandle, ConnectError> {
        let token = token.trim().to_string();
        {
            let mut slot = self.ctx.slot.lock();
            if slot.state != SessionState::Idle {
                tracing::debug!(
                    target = "consult::session",
                    state = ?slot.state,
                    "rejecting connect while a session is in progress"
                );
                return Err(ConnectError::Busy(slot.state.clone()));
            }
            if token.is_empty() {
                return Err(ConnectError::TokenInvalid);
            }
            slot.identity = Some(identity.clone());
            slot.leave_requested = false;
            slot.connection_lost = false;
            self.ctx.transition(&mut slot, SessionState::Connecting);
        }
        tracing::info!(
            target = "consult::session",
            user = %identity.user_id,
            role = %identity.role,
            "connecting"
        );

        let manager = self.clone();
        let attempt = tokio::spawn(async move { manager.run_connect(token, identity).await });
        match attempt.await {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(
                    target = "consult::session",
                    error = %err,
                    "connect task ended abnormally"
                );
                self.enter_failed(FailureReason::BackendUnreachable);
                self.recover(FailureReason::BackendUnreachable, false).await;
                Err(ConnectError::BackendUnreachable)
            }
        }
    }

    async fn run_connect(
        &self,
        token: String,
        identity: LocalIdentity,
    ) -> Result<SessionHandle, ConnectError> {
        let _perf = PerfGuard::new("session.connect");
        let limit = self.ctx.config.connect_timeout;
        let outcome = match tokio::time::timeout(limit, self.establish(&token, &identity)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(
                    target = "consult::session",
                    timeout_ms = limit.as_millis() as u64,
                    "connect attempt timed out"
                );
                Err(ConnectError::BackendUnreachable)
            }
        };

        match outcome {
            Ok(handle) => self.finish_connect(handle).await,
            Err(err) => {
                tracing::warn!(
                    target = "consult::session",
                    error = %err,
                    "connect attempt failed"
                );
                let reason = err.reason();
                self.enter_failed(reason);
                self.recover(reason, false).await;
                Err(err)
            }
        }
    }

    async fn establish(
        &self,
        token: &str,
        identity: &LocalIdentity,
    ) -> Result<SessionHandle, ConnectError> {
        self.ctx.gate.ensure_granted().await?;

        let handle = self.ctx.backend.open_session(token).await?;
        self.ctx.slot.lock().handle = Some(handle.clone());

        // Handlers go in before anything is published.
        let events = self.ctx.backend.events(&handle)?;
        self.ctx.registry.open();
        self.ctx.chat.reset();
        let pump = tokio::spawn(self.clone().pump(handle.clone(), identity.role, events));
        self.ctx.slot.lock().pump = Some(pump);

        let connection_id = self
            .ctx
            .backend
            .connect(&handle, &identity.app_data())
            .await?;
        tracing::debug!(
            target = "consult::session",
            session = %handle,
            connection = %connection_id,
            "backend connected"
        );
        self.ctx.slot.lock().connection_id = Some(connection_id);

        self.ctx
            .media
            .start_publishing(&handle, &self.ctx.config.media)
            .await?;
        Ok(handle)
    }

    async fn finish_connect(&self, handle: SessionHandle) -> Result<SessionHandle, ConnectError> {
        enum Next {
            Active,
            Leave,
            Lost,
        }
        let next = {
            let mut slot = self.ctx.slot.lock();
            if slot.connection_lost {
                self.ctx
                    .transition(&mut slot, SessionState::Failed(FailureReason::ConnectionLost));
                Next::Lost
            } else if slot.leave_requested {
                self.ctx.transition(&mut slot, SessionState::Leaving);
                Next::Leave
            } else {
                self.ctx.transition(&mut slot, SessionState::Active);
                Next::Active
            }
        };

        match next {
            Next::Active => {
                tracing::info!(target = "consult::session", session = %handle, "session active");
                Ok(handle)
            }
            Next::Leave => {
                tracing::info!(
                    target = "consult::session",
                    session = %handle,
                    "leave requested during connect; tearing down"
                );
                self.release(false).await;
                let mut slot = self.ctx.slot.lock();
                self.ctx.transition(&mut slot, SessionState::Closed);
                Err(ConnectError::Aborted)
            }
            Next::Lost => {
                self.recover(FailureReason::ConnectionLost, false).await;
                Err(ConnectError::BackendUnreachable)
            }
        }
    }

    /// Ends the session. Safe to call in any state and any number of times.
    pub async fn leave(&self) {
        let mut settled = self.ctx.watch_state();
        let teardown = {
            let mut slot = self.ctx.slot.lock();
            match slot.state {
                SessionState::Idle | SessionState::Closed => return,
                SessionState::Connecting => {
                    slot.leave_requested = true;
                    false
                }
                SessionState::Active => {
                    self.ctx.transition(&mut slot, SessionState::Leaving);
                    true
                }
                SessionState::Leaving | SessionState::Failed(_) => false,
            }
        };

        if teardown {
            self.release(false).await;
            let mut slot = self.ctx.slot.lock();
            self.ctx.transition(&mut slot, SessionState::Closed);
            tracing::info!(target = "consult::session", "session closed");
            return;
        }

        tracing::debug!(
            target = "consult::session",
            "waiting for in-flight session work to settle"
        );
        let _ = settled.wait_for(SessionState::is_settled).await;
    }

    fn enter_failed(&self, reason: FailureReason) {
        let mut slot = self.ctx.slot.lock();
        self.ctx.transition(&mut slot, SessionState::Failed(reason));
    }

    /// Releases everything after a failure. Returns to `Idle` unless a
    /// `leave()` arrived during the attempt, which closes the session.
    async fn recover(&self, reason: FailureReason, from_pump: bool) {
        self.release(from_pump).await;
        let left = {
            let mut slot = self.ctx.slot.lock();
            let left = std::mem::take(&mut slot.leave_requested);
            slot.connection_lost = false;
            let next = if left {
                SessionState::Closed
            } else {
                SessionState::Idle
            };
            self.ctx.transition(&mut slot, next);
            left
        };
        if left {
            tracing::info!(
                target = "consult::session",
                reason = ?reason,
                "connect failed after leave was requested; session closed"
            );
        } else {
            self.ctx
                .hub
                .notify(EventKind::Notice(Notice::failure(reason)));
        }
    }

    /// Teardown in fixed order: recording, local media, remote
    /// subscriptions, backend connection.
    async fn release(&self, from_pump: bool) {
        let handle = self.ctx.slot.lock().handle.clone();

        self.ctx.recording.stop_if_active().await;
        self.ctx.media.shutdown(handle.as_ref()).await;
        let dropped = self.ctx.registry.close();

        if let Some(handle) = &handle {
            for participant in &dropped {
                if let Err(err) = self
                    .ctx
                    .backend
                    .unsubscribe(handle, &participant.track_ref)
                    .await
                {
                    tracing::debug!(
                        target = "consult::session",
                        stream = %participant.stream_id,
                        error = %err,
                        "unsubscribe during teardown failed"
                    );
                }
            }
            if let Err(err) = self.ctx.backend.disconnect(handle).await {
                tracing::debug!(
                    target = "consult::session",
                    session = %handle,
                    error = %err,
                    "disconnect during teardown failed"
                );
            }
        }

        let pump = {
            let mut slot = self.ctx.slot.lock();
            slot.handle = None;
            slot.connection_id = None;
            slot.pump.take()
        };
        if let Some(pump) = pump {
            if !from_pump {
                pump.abort();
            }
        }
    }

    async fn pump(
        self,
        handle: SessionHandle,
        local_role: Role,
        mut events: mpsc::UnboundedReceiver<BackendEvent>,
    ) {
        while let Some(event) = events.recv().await {
            if self
                .handle_event(&handle, local_role, event)
                .await
                .is_break()
            {
                return;
            }
        }
        tracing::debug!(target = "consult::session", session = %handle, "backend event stream ended");
        let _ = self.connection_lost("event stream closed").await;
    }

    async fn handle_event(
        &self,
        handle: &SessionHandle,
        local_role: Role,
        event: BackendEvent,
    ) -> ControlFlow<()> {
        match event {
            BackendEvent::StreamCreated(stream) => {
                self.ctx
                    .registry
                    .on_stream_created(handle, stream, local_role)
                    .await;
            }
            BackendEvent::StreamDestroyed { stream_id, reason } => {
                tracing::debug!(
                    target = "consult::session",
                    stream = %stream_id,
                    reason = %reason,
                    "remote stream destroyed"
                );
                self.ctx.registry.on_stream_destroyed(&stream_id);
            }
            BackendEvent::StreamPropertyChanged {
                stream_id,
                property,
                enabled,
            } => {
                self.ctx
                    .registry
                    .on_property_changed(&stream_id, property, enabled);
            }
            BackendEvent::ConnectionCreated(connection) => {
                self.ctx
                    .registry
                    .on_connection_created(&connection, local_role);
            }
            BackendEvent::ConnectionDestroyed {
                connection_id,
                reason,
            } => {
                tracing::debug!(
                    target = "consult::session",
                    connection = %connection_id,
                    reason = %reason,
                    "remote connection destroyed"
                );
                self.ctx.registry.on_connection_destroyed(&connection_id);
            }
            BackendEvent::Signal(signal) if signal.kind == CHAT_SIGNAL_KIND => {
                let sender = signal
                    .from
                    .as_deref()
                    .and_then(|connection_id| self.ctx.registry.display_name_for(connection_id));
                self.ctx.chat.on_receive(&signal, sender);
            }
            BackendEvent::Signal(signal) => {
                tracing::trace!(
                    target = "consult::session",
                    kind = %signal.kind,
                    "ignoring signal"
                );
            }
            BackendEvent::TrackReady(ReadyTarget::Local { bundle_id }) => {
                self.ctx.media.mark_renderable(&bundle_id);
            }
            BackendEvent::TrackReady(ReadyTarget::Remote { stream_id }) => {
                self.ctx.registry.mark_renderable(&stream_id);
            }
            BackendEvent::Disconnected { reason } => {
                return self.connection_lost(&reason).await;
            }
        }
        ControlFlow::Continue(())
    }

    /// The backend dropped the session without being asked to.
    async fn connection_lost(&self, reason: &str) -> ControlFlow<()> {
        let active = {
            let mut slot = self.ctx.slot.lock();
            match slot.state {
                SessionState::Active => {
                    self.ctx
                        .transition(&mut slot, SessionState::Failed(FailureReason::ConnectionLost));
                    true
                }
                SessionState::Connecting => {
                    slot.connection_lost = true;
                    false
                }
                _ => false,
            }
        };
        if active {
            tracing::warn!(target = "consult::session", reason, "connection lost");
            self.recover(FailureReason::ConnectionLost, true).await;
        }
        ControlFlow::Break(())
    }
}
