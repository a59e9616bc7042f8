//! Outbound notifications for front-ends.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

use crate::conversation::{ChatMessage, Presence};

/// What produced a character message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageOrigin {
    Reply,
    Return,
    FollowUp,
    Initiative,
    Fallback,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    CharacterMessage {
        message: ChatMessage,
        origin: MessageOrigin,
    },
    PresenceChanged {
        conversation_id: String,
        presence: Presence,
    },
    ScenePromptUpdated {
        conversation_id: String,
        scene_version: u64,
        prompt: String,
    },
    SceneImageReady {
        conversation_id: String,
        scene_version: u64,
        path: PathBuf,
    },
    Error {
        conversation_id: Option<String>,
        message: String,
        at: DateTime<Utc>,
    },
}

/// Fire-and-forget event sender. A missing receiver is not an error.
#[derive(Clone)]
pub struct EventSink {
    tx: flume::Sender<EngineEvent>,
}

impl EventSink {
    pub fn new(tx: flume::Sender<EngineEvent>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, flume::Receiver<EngineEvent>) {
        let (tx, rx) = flume::unbounded();
        (Self::new(tx), rx)
    }

    pub fn emit(&self, event: EngineEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("Engine event dropped: no receiver");
        }
    }

    pub fn error(&self, conversation_id: Option<&str>, message: impl Into<String>) {
        self.emit(EngineEvent::Error {
            conversation_id: conversation_id.map(str::to_string),
            message: message.into(),
            at: Utc::now(),
        });
    }
}
