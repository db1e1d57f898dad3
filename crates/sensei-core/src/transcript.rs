//! Ordered message list shown to the user.
//!
//! The store is the single owner of transcript state. Readers take immutable
//! snapshots; mutations are copy-on-write, so a snapshot handed to the
//! presentation layer never changes underneath it. Every mutation is
//! followed by a [`TranscriptEvent`] on a broadcast channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::message::Role;

/// Opaque, ordered message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(u64);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "msg-{}", self.0)
    }
}

/// Hands out strictly increasing message ids.
#[derive(Debug, Default)]
pub struct MessageIdGen {
    next: AtomicU64,
}

impl MessageIdGen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> MessageId {
        MessageId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub text: String,
    pub is_streaming: bool,
}

impl Message {
    pub fn user(id: MessageId, text: impl Into<String>) -> Self {
        Self {
            id,
            role: Role::User,
            text: text.into(),
            is_streaming: false,
        }
    }

    pub fn model(id: MessageId, text: impl Into<String>) -> Self {
        Self {
            id,
            role: Role::Model,
            text: text.into(),
            is_streaming: false,
        }
    }

    /// Empty model message awaiting fragments.
    pub fn placeholder(id: MessageId) -> Self {
        Self {
            id,
            role: Role::Model,
            text: String::new(),
            is_streaming: true,
        }
    }
}

/// Notification published after each store mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptEvent {
    Reset,
    Appended(MessageId),
    Patched(MessageId),
    StreamingDone(MessageId),
    Removed(MessageId),
}

/// Result of [`TranscriptStore::patch_text`]. Only `Applied` changes state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    Applied,
    NotFound,
    /// The message already finished streaming and is frozen.
    Settled,
    /// The new text is shorter than the current text.
    Shrunk,
}

const EVENT_CAPACITY: usize = 256;

pub struct TranscriptStore {
    messages: Arc<Vec<Message>>,
    events: broadcast::Sender<TranscriptEvent>,
}

impl TranscriptStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            messages: Arc::new(Vec::new()),
            events,
        }
    }

    /// Subscribe to mutation events. A lagging receiver can always recover
    /// by reading a fresh [`snapshot`](Self::snapshot).
    pub fn subscribe(&self) -> broadcast::Receiver<TranscriptEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> Arc<Vec<Message>> {
        Arc::clone(&self.messages)
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn reset(&mut self) {
        self.messages = Arc::new(Vec::new());
        self.publish(TranscriptEvent::Reset);
    }

    pub fn append(&mut self, message: Message) {
        let id = message.id;
        Arc::make_mut(&mut self.messages).push(message);
        self.publish(TranscriptEvent::Appended(id));
    }

    pub fn patch_text(&mut self, id: MessageId, text: impl Into<String>) -> PatchOutcome {
        let Some(index) = self.messages.iter().position(|m| m.id == id) else {
            trace!(%id, "patch for unknown message ignored");
            return PatchOutcome::NotFound;
        };

        let text = text.into();
        let current = &self.messages[index];
        if !current.is_streaming {
            return PatchOutcome::Settled;
        }
        if text.len() < current.text.len() {
            return PatchOutcome::Shrunk;
        }

        Arc::make_mut(&mut self.messages)[index].text = text;
        self.publish(TranscriptEvent::Patched(id));
        PatchOutcome::Applied
    }

    /// Clear the streaming flag. Returns false when the message does not
    /// exist; calling it on a settled message is a no-op.
    pub fn mark_streaming_done(&mut self, id: MessageId) -> bool {
        let Some(index) = self.messages.iter().position(|m| m.id == id) else {
            return false;
        };
        if self.messages[index].is_streaming {
            Arc::make_mut(&mut self.messages)[index].is_streaming = false;
            self.publish(TranscriptEvent::StreamingDone(id));
        }
        true
    }

    /// Drop a message that is still streaming with no text. Used when a
    /// reply ends before its first fragment; anything else is kept.
    pub fn remove_empty_placeholder(&mut self, id: MessageId) -> bool {
        let Some(index) = self.messages.iter().position(|m| m.id == id) else {
            return false;
        };
        let message = &self.messages[index];
        if !message.is_streaming || !message.text.is_empty() {
            return false;
        }
        Arc::make_mut(&mut self.messages).remove(index);
        self.publish(TranscriptEvent::Removed(id));
        true
    }

    fn publish(&self, event: TranscriptEvent) {
        // Ignore send errors (no subscribers)
        let _ = self.events.send(event);
    }
}

impl Default for TranscriptStore {
    fn default() -> Self {
        Self::new()
    }
}
