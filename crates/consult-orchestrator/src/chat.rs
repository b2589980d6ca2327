//! In-session chat carried over the backend's signal broadcast.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::backend::{BackendError, RtcBackend, SessionHandle, SignalPayload};
use crate::events::{EventHub, EventKind};
use crate::session::LocalIdentity;

pub const CHAT_SIGNAL_KIND: &str = "chat";

/// How many of our own message ids are remembered for echo suppression,
/// independent of the history limit.
const SENT_ID_MEMORY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default, alias = "senderName")]
    pub sender_display_name: String,
    pub text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub sent_at: OffsetDateTime,
    /// Sent from this client. Not part of the wire format.
    #[serde(skip)]
    pub local: bool,
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("chat message is empty")]
    Empty,
    #[error("chat message exceeds {limit} characters")]
    TooLong { limit: usize },
    #[error("chat requires a connected session")]
    NotConnected,
    #[error("chat broadcast failed: {0}")]
    Backend(BackendError),
    #[error("failed to encode chat message: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl From<BackendError> for ChatError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotConnected => ChatError::NotConnected,
            other => ChatError::Backend(other),
        }
    }
}

impl ChatError {
    pub fn user_message(&self) -> String {
        match self {
            ChatError::Empty => "Type a message first.".into(),
            ChatError::TooLong { limit } => {
                format!("Messages can be at most {limit} characters long.")
            }
            ChatError::NotConnected => "Chat is available once the consultation starts.".into(),
            ChatError::Backend(_) | ChatError::Encoding(_) => {
                "The message could not be sent. Try again.".into()
            }
        }
    }
}

/// Ordered chat log of the current session.
pub struct SignalingChannel {
    backend: Arc<dyn RtcBackend>,
    hub: Arc<EventHub>,
    max_len: usize,
    history_limit: usize,
    placeholder: String,
    log: Mutex<ChatLog>,
}

#[derive(Default)]
struct ChatLog {
    messages: VecDeque<ChatMessage>,
    sent_ids: VecDeque<String>,
}

impl ChatLog {
    fn remember_sent(&mut self, id: &str) {
        if self.sent_ids.len() == SENT_ID_MEMORY {
            self.sent_ids.pop_front();
        }
        self.sent_ids.push_back(id.to_string());
    }

    fn knows(&self, id: &str) -> bool {
        self.sent_ids.iter().any(|sent| sent == id)
            || self.messages.iter().any(|logged| logged.id == id)
    }
}

impl SignalingChannel {
    pub fn new(
        backend: Arc<dyn RtcBackend>,
        hub: Arc<EventHub>,
        max_len: usize,
        history_limit: usize,
        placeholder: String,
    ) -> Self {
        Self {
            backend,
            hub,
            max_len,
            history_limit: history_limit.max(1),
            placeholder,
            log: Mutex::new(ChatLog::default()),
        }
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.log.lock().messages.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.log.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.lock().messages.is_empty()
    }

    pub async fn send(
        &self,
        handle: &SessionHandle,
        identity: &LocalIdentity,
        text: &str,
    ) -> Result<ChatMessage, ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::Empty);
        }
        if text.chars().count() > self.max_len {
            return Err(ChatError::TooLong {
                limit: self.max_len,
            });
        }

        let message = ChatMessage {
            id: uuid::Uuid::new_v4().to_string(),
            sender_id: identity.user_id.clone(),
            sender_display_name: identity.display_name.clone(),
            text: text.to_string(),
            sent_at: OffsetDateTime::now_utc(),
            local: true,
        };
        let signal = SignalPayload {
            kind: CHAT_SIGNAL_KIND.to_string(),
            from: None,
            data: serde_json::to_string(&message)?,
        };

        // Logged before the broadcast so the echo is recognised as ours.
        self.log.lock().remember_sent(&message.id);
        self.append(message.clone(), false);
        if let Err(err) = self.backend.send_signal(handle, &signal).await {
            tracing::warn!(
                target = "consult::chat",
                message_id = %message.id,
                error = %err,
                "chat broadcast failed; retracting message"
            );
            let mut log = self.log.lock();
            log.messages.retain(|logged| logged.id != message.id);
            log.sent_ids.retain(|sent| *sent != message.id);
            return Err(err.into());
        }

        let count = self.log.lock().messages.len();
        tracing::debug!(target = "consult::chat", message_id = %message.id, "chat message sent");
        self.hub.apply(EventKind::ChatMessage(message.clone()), |snap| {
            snap.chat_messages = count
        });
        Ok(message)
    }

    /// Logs an incoming chat signal. `sender_name` is what the caller knows
    /// about the sending connection, used when the payload carries no name.
    pub fn on_receive(
        &self,
        signal: &SignalPayload,
        sender_name: Option<String>,
    ) -> Option<ChatMessage> {
        if signal.kind != CHAT_SIGNAL_KIND {
            return None;
        }
        let mut message: ChatMessage = match serde_json::from_str(&signal.data) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(
                    target = "consult::chat",
                    from = ?signal.from,
                    error = %err,
                    "dropping malformed chat signal"
                );
                return None;
            }
        };
        if message.text.trim().is_empty() {
            return None;
        }
        if message.text.chars().count() > self.max_len {
            tracing::warn!(
                target = "consult::chat",
                message_id = %message.id,
                limit = self.max_len,
                "dropping oversized chat message"
            );
            return None;
        }
        message.local = false;
        if message.sender_id.is_empty() {
            message.sender_id = signal.from.clone().unwrap_or_default();
        }
        if message.sender_display_name.trim().is_empty() {
            message.sender_display_name = sender_name.unwrap_or_else(|| self.placeholder.clone());
        }
        self.append(message, true)
    }

    /// Empties the log for a new session.
    pub fn reset(&self) {
        let mut log = self.log.lock();
        log.sent_ids.clear();
        if log.messages.is_empty() {
            return;
        }
        log.messages.clear();
        self.hub
            .apply(EventKind::ChatCleared, |snap| snap.chat_messages = 0);
    }

    fn append(&self, message: ChatMessage, announce: bool) -> Option<ChatMessage> {
        let mut log = self.log.lock();
        let duplicate = if announce {
            log.knows(&message.id)
        } else {
            log.messages.iter().any(|logged| logged.id == message.id)
        };
        if duplicate {
            tracing::trace!(target = "consult::chat", message_id = %message.id, "duplicate chat message");
            return None;
        }
        if log.messages.len() == self.history_limit {
            log.messages.pop_front();
        }
        log.messages.push_back(message.clone());
        if announce {
            let count = log.messages.len();
            self.hub.apply(EventKind::ChatMessage(message.clone()), |snap| {
                snap.chat_messages = count
            });
        }
        Some(message)
    }
}
