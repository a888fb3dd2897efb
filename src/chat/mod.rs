//! Chat session state
//!
//! Memory-resident history for one session plus the input line, including
//! the rules for how audio (sound-token) input is shown.

mod client;
mod sse;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use client::{ChatBackend, DeltaStream, OpenAiChat};
pub use sse::{SseEvent, SseLineParser};

use crate::voice::{SOUND_SENTINEL, is_sound_input};

/// Shown in history in place of an audio message's tokens
pub const AUDIO_MESSAGE_LABEL: &str = "🔊 This is an audio message 🔊";

/// Shown in the input line while it holds audio tokens
pub const AUDIO_INPUT_MASK: &str = "🔊 🔊 🔊 ";

/// Replaces typed text that tries to smuggle in the sound sentinel
const TYPED_SENTINEL_REPLACEMENT: &str = "This is an audio message";

/// How many words of a user message are shown in history
const USER_PREVIEW_WORDS: usize = 10;

/// Message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message in the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    /// Whether this is a user message carrying sound tokens
    #[must_use]
    pub fn is_audio(&self) -> bool {
        self.role == Role::User && is_sound_input(&self.content)
    }

    /// Text to render for this message
    ///
    /// Audio messages get a placeholder and user text is cut to its first
    /// ten words; assistant replies are shown whole.
    #[must_use]
    pub fn display_text(&self) -> String {
        match self.role {
            Role::User if self.is_audio() => AUDIO_MESSAGE_LABEL.to_string(),
            Role::User => self
                .content
                .split(' ')
                .take(USER_PREVIEW_WORDS)
                .collect::<Vec<_>>()
                .join(" "),
            Role::System | Role::Assistant => self.content.clone(),
        }
    }
}

/// Messages exchanged in this session, oldest first
#[derive(Debug, Default, Clone)]
pub struct ChatHistory {
    messages: Vec<ChatMessage>,
}

impl ChatHistory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a user message
    pub fn push_user(&mut self, content: impl Into<String>) -> Uuid {
        let message = ChatMessage::new(Role::User, content);
        let id = message.id;
        self.messages.push(message);
        id
    }

    /// Start an empty assistant reply that deltas are appended to
    pub fn begin_assistant(&mut self) -> Uuid {
        let message = ChatMessage::new(Role::Assistant, String::new());
        let id = message.id;
        self.messages.push(message);
        id
    }

    /// Append streamed text to an assistant reply
    ///
    /// Returns the reply's full text so far, or `None` for an unknown id.
    pub fn append_assistant(&mut self, id: Uuid, delta: &str) -> Option<&str> {
        let message = self
            .messages
            .iter_mut()
            .rev()
            .find(|m| m.id == id && m.role == Role::Assistant)?;
        message.content.push_str(delta);
        Some(&message.content)
    }

    /// Drop an assistant reply that produced nothing
    pub fn discard_if_empty(&mut self, id: Uuid) {
        self.messages.retain(|m| m.id != id || !m.content.is_empty());
    }

    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    #[must_use]
    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// The pending input line
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChatInput {
    value: String,
}

impl ChatInput {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set text typed by the user
    ///
    /// Typed text may not contain the sound sentinel; such input is
    /// replaced with a plain description.
    pub fn set_typed(&mut self, text: &str) {
        self.value = if text.contains(SOUND_SENTINEL) {
            TYPED_SENTINEL_REPLACEMENT.to_string()
        } else {
            text.to_string()
        };
    }

    /// Set sound-token input from a finished recording
    ///
    /// Returns `true` since audio input is submitted right away.
    pub fn set_audio(&mut self, sound_input: String) -> bool {
        self.value = sound_input;
        self.is_audio()
    }

    #[must_use]
    pub fn is_audio(&self) -> bool {
        is_sound_input(&self.value)
    }

    /// Raw value sent to the assistant
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// What the input line shows
    #[must_use]
    pub fn masked(&self) -> &str {
        if self.is_audio() {
            AUDIO_INPUT_MASK
        } else {
            &self.value
        }
    }

    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.value.trim().is_empty()
    }

    /// Take the value for submission, leaving the input empty
    pub fn take(&mut self) -> String {
        std::mem::take(&mut self.value)
    }
}
