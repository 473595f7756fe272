//! The session log: an ordered message history.
//!
//! Messages are only ever appended at the end, replaced in place, or cut off
//! from some point onward. Nothing is inserted in the middle and no single
//! message is removed on its own, since later turns depend on earlier ones.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Scene-setting lines a fresh game opens with.
pub const PRELUDE: [&str; 3] = [
    "Chaos parts, and the spiritual energy of heaven and earth stirs once more...",
    "A splitting headache seizes you as you slowly open your eyes.",
    "Where... is this? Memories flood back like the tide.",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LogError {
    #[error("No message with id {0}")]
    NotFound(MessageId),

    #[error("Message {0} is not a narrator turn")]
    NotNarratorTurn(MessageId),
}

/// Unique, monotonically increasing message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sender {
    #[serde(rename = "SYSTEM")]
    Narrator,
    #[serde(rename = "PLAYER")]
    Player,
    #[serde(rename = "NPC")]
    Npc,
}

/// Presentation hint only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKind {
    #[default]
    Narrative,
    Dialogue,
    Action,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Complete,
    /// Placeholder for a turn still being generated.
    Pending,
    /// A generation that failed; the content is a short failure notice.
    Failed,
}

impl MessageStatus {
    fn is_complete(&self) -> bool {
        *self == MessageStatus::Complete
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender: Sender,
    /// Display name, always present for NPC turns.
    #[serde(rename = "senderName", default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "MessageStatus::is_complete")]
    pub status: MessageStatus,
}

impl Message {
    pub fn is_player(&self) -> bool {
        self.sender == Sender::Player
    }
}

/// Result of editing a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOutcome {
    /// Only the text changed.
    Updated,
    /// A player turn was edited. Everything after it is gone and a new
    /// response should be generated for `input`.
    Regenerate { input: String },
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Ordered message history for one session.
#[derive(Debug, Clone, Default)]
pub struct SessionLog {
    messages: Vec<Message>,
    next_id: u64,
}

impl SessionLog {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            next_id: 1,
        }
    }

    /// A log seeded with the opening scene-setting lines.
    pub fn with_prelude() -> Self {
        let mut log = Self::new();
        for line in PRELUDE {
            log.push(Sender::Narrator, None, line, MessageKind::Narrative);
        }
        log
    }

    /// Rebuild a log from stored messages.
    ///
    /// Ids must be strictly increasing; if they are not, the messages are
    /// renumbered in their stored order.
    pub fn from_messages(mut messages: Vec<Message>) -> Self {
        let ordered = messages.windows(2).all(|w| w[0].id < w[1].id);
        if !ordered {
            tracing::warn!("Stored message ids out of order, renumbering");
            for (i, message) in messages.iter_mut().enumerate() {
                message.id = MessageId(i as u64 + 1);
            }
        }

        let next_id = messages.last().map(|m| m.id.0 + 1).unwrap_or(1);
        Self { messages, next_id }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// The most recent `n` messages.
    pub fn tail(&self, n: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.position(id).map(|i| &self.messages[i])
    }

    pub fn position(&self, id: MessageId) -> Option<usize> {
        self.messages.binary_search_by_key(&id, |m| m.id).ok()
    }

    fn index_of(&self, id: MessageId) -> Result<usize, LogError> {
        self.position(id).ok_or(LogError::NotFound(id))
    }

    /// Append a message with a fresh id and the current time.
    pub fn push(
        &mut self,
        sender: Sender,
        sender_name: Option<String>,
        content: impl Into<String>,
        kind: MessageKind,
    ) -> MessageId {
        let id = MessageId(self.next_id.max(1));
        self.next_id = id.0 + 1;

        self.messages.push(Message {
            id,
            sender,
            sender_name,
            content: content.into(),
            kind,
            timestamp: now_millis(),
            status: MessageStatus::Complete,
        });
        id
    }

    pub fn push_player(&mut self, content: impl Into<String>) -> MessageId {
        self.push(Sender::Player, None, content, MessageKind::Action)
    }

    pub fn push_narrator(&mut self, content: impl Into<String>) -> MessageId {
        self.push(Sender::Narrator, None, content, MessageKind::Narrative)
    }

    pub fn push_npc(&mut self, name: impl Into<String>, content: impl Into<String>) -> MessageId {
        self.push(
            Sender::Npc,
            Some(name.into()),
            content,
            MessageKind::Dialogue,
        )
    }

    pub fn push_info(&mut self, content: impl Into<String>) -> MessageId {
        self.push(Sender::Narrator, None, content, MessageKind::Info)
    }

    /// Append an empty narrator placeholder marked pending.
    pub fn push_pending(&mut self) -> MessageId {
        let id = self.push_narrator("");
        if let Some(last) = self.messages.last_mut() {
            last.status = MessageStatus::Pending;
        }
        id
    }

    /// Replace a message's content and status in place.
    pub fn set_content(
        &mut self,
        id: MessageId,
        content: impl Into<String>,
        status: MessageStatus,
    ) -> Result<(), LogError> {
        let index = self.index_of(id)?;
        let message = &mut self.messages[index];
        message.content = content.into();
        message.status = status;
        Ok(())
    }

    /// Remove the message and everything after it. Returns how many were removed.
    pub fn delete(&mut self, id: MessageId) -> Result<usize, LogError> {
        let index = self.index_of(id)?;
        let removed = self.messages.len() - index;
        self.messages.truncate(index);
        tracing::debug!(%id, removed, "Truncated session log");
        Ok(removed)
    }

    /// Replace a message's text.
    ///
    /// Editing a player turn also drops every later message, and the caller
    /// is expected to generate a fresh response to the edited text.
    pub fn edit(&mut self, id: MessageId, text: impl Into<String>) -> Result<EditOutcome, LogError> {
        let index = self.index_of(id)?;
        let text = text.into();

        let message = &mut self.messages[index];
        message.content = text.clone();
        message.status = MessageStatus::Complete;

        if message.is_player() {
            self.messages.truncate(index + 1);
            Ok(EditOutcome::Regenerate { input: text })
        } else {
            Ok(EditOutcome::Updated)
        }
    }

    /// Index of a message that can be rerolled. Only narrator turns qualify.
    pub fn reroll_index(&self, id: MessageId) -> Result<usize, LogError> {
        let index = self.index_of(id)?;
        if self.messages[index].sender != Sender::Narrator {
            return Err(LogError::NotNarratorTurn(id));
        }
        Ok(index)
    }

    /// The most recent narrator turn, if any.
    pub fn last_narrator_id(&self) -> Option<MessageId> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.sender == Sender::Narrator)
            .map(|m| m.id)
    }
}
