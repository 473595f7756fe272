//! GameSession - the primary public API for play.
//!
//! A session pairs one character with one message log and drives every turn
//! through the narrator: append the player's turn and a pending placeholder,
//! stream the response, apply its state update, fill in the placeholder and
//! autosave.

use crate::character::{apply_state_update, Character};
use crate::log::{EditOutcome, LogError, MessageId, MessageStatus, SessionLog};
use crate::narrator::{Narrator, NarratorError, NarratorResponse, DEFAULT_MAX_TOKENS};
use crate::persist::{PersistError, Persistence, SaveRecord, SlotPreview};
use crate::protocol::StateUpdate;
use host::{Backend, Model, DEFAULT_READY_TIMEOUT};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Shown in place of a response that failed to generate.
pub const FAILURE_NOTICE: &str = "The heavenly secrets are clouded; the narration was interrupted. Edit, delete or try again.";

/// Shown in place of a response that was cancelled.
pub const CANCELLED_NOTICE: &str = "The narration was cancelled.";

/// Errors from GameSession operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Narrator error: {0}")]
    Narrator(#[from] NarratorError),

    #[error("Log error: {0}")]
    Log(#[from] LogError),

    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),

    #[error("Slot {0} is empty")]
    EmptySlot(u8),
}

/// Configuration for a game session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Model used for generation.
    pub model: Model,

    /// Token budget per response.
    pub max_tokens: u32,

    /// How long to wait for the host before falling back.
    pub ready_timeout: Duration,

    /// Save to the autosave slot after every successful turn.
    pub autosave: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: Model::default(),
            max_tokens: DEFAULT_MAX_TOKENS,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            autosave: true,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: Model) -> Self {
        self.model = model;
        self
    }

    pub fn with_max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = tokens;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_autosave(mut self, autosave: bool) -> Self {
        self.autosave = autosave;
        self
    }
}

/// A completed turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    /// The narrator message holding the response.
    pub message_id: MessageId,
    pub content: String,
    pub state_update: Option<StateUpdate>,
    pub malformed_block: bool,
}

/// A cultivation game session.
pub struct GameSession {
    narrator: Arc<Narrator>,
    persistence: Persistence,
    character: Character,
    log: SessionLog,
    /// Display text of the response currently streaming.
    streaming: String,
    config: SessionConfig,
}

impl GameSession {
    /// Start a fresh session. The log opens with the prelude lines.
    pub fn new(backend: Arc<Backend>, character: Character, config: SessionConfig) -> Self {
        Self::with_log(backend, character, SessionLog::with_prelude(), config)
    }

    /// Resume from a save record.
    pub fn from_record(backend: Arc<Backend>, record: SaveRecord, config: SessionConfig) -> Self {
        let log = SessionLog::from_messages(record.messages);
        Self::with_log(backend, record.character, log, config)
    }

    fn with_log(
        backend: Arc<Backend>,
        character: Character,
        log: SessionLog,
        config: SessionConfig,
    ) -> Self {
        let narrator = Narrator::new(backend.clone())
            .with_model(config.model)
            .with_max_tokens(config.max_tokens);

        Self {
            narrator: Arc::new(narrator),
            persistence: Persistence::new(backend),
            character,
            log,
            streaming: String::new(),
            config,
        }
    }

    /// Wait for the host, up to the configured timeout.
    pub async fn await_ready(&self) -> bool {
        self.narrator
            .backend()
            .await_ready(self.config.ready_timeout)
            .await
    }

    pub fn character(&self) -> &Character {
        &self.character
    }

    pub fn log(&self) -> &SessionLog {
        &self.log
    }

    /// Shared handle to the narrator, e.g. to cancel from another task.
    pub fn narrator(&self) -> &Arc<Narrator> {
        &self.narrator
    }

    pub fn persistence(&self) -> &Persistence {
        &self.persistence
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Display text of the response being streamed, empty when idle.
    pub fn streaming_text(&self) -> &str {
        &self.streaming
    }

    pub fn is_generating(&self) -> bool {
        self.narrator.is_generating()
    }

    pub fn set_model(&mut self, model: Model) {
        self.config.model = model;
        self.narrator.set_model(model);
    }

    /// Local-only cancel: frees the narrator, the host keeps generating.
    pub fn cancel(&self) {
        self.narrator.cancel();
    }

    /// Settle a turn whose future was dropped before it finished.
    ///
    /// Also frees the narrator like [`cancel`](Self::cancel). A response that was
    /// still pending is marked cancelled, and a narrator turn that was being
    /// rerolled keeps its previous text. Returns how many messages changed.
    pub fn abandon_turn(&mut self) -> usize {
        self.narrator.cancel();
        self.streaming.clear();

        let pending: Vec<(MessageId, String)> = self
            .log
            .messages()
            .iter()
            .filter(|m| m.status == MessageStatus::Pending)
            .map(|m| (m.id, m.content.clone()))
            .collect();

        for (id, content) in &pending {
            // Rerolled turns stay pending with their old text.
            let result = if content.is_empty() {
                self.log.set_content(*id, CANCELLED_NOTICE, MessageStatus::Failed)
            } else {
                self.log.set_content(*id, content.as_str(), MessageStatus::Complete)
            };
            if let Err(e) = result {
                tracing::warn!(error = %e, %id, "Could not settle abandoned turn");
            }
        }

        if !pending.is_empty() {
            tracing::info!(settled = pending.len(), "Abandoned turn settled");
        }
        pending.len()
    }

    fn ensure_idle(&self) -> Result<(), SessionError> {
        if self.narrator.is_generating() {
            return Err(NarratorError::AlreadyGenerating.into());
        }
        Ok(())
    }

    /// Generate the opening scene and apply it.
    pub async fn start<F>(&mut self, mut on_stream: F) -> Result<TurnOutcome, SessionError>
    where
        F: FnMut(&str, bool) + Send,
    {
        self.ensure_idle()?;
        let placeholder = self.log.push_pending();

        let streaming = &mut self.streaming;
        streaming.clear();
        let result = self
            .narrator
            .generate_opening(&self.character, |text, done| {
                streaming.clear();
                streaming.push_str(text);
                on_stream(text, done);
            })
            .await;

        self.finish(placeholder, result).await
    }

    /// Send player input and generate the response.
    pub async fn send<F>(&mut self, input: &str, on_stream: F) -> Result<TurnOutcome, SessionError>
    where
        F: FnMut(&str, bool) + Send,
    {
        self.ensure_idle()?;

        let history_end = self.log.len();
        self.log.push_player(input);
        let placeholder = self.log.push_pending();

        self.respond(history_end, input, placeholder, on_stream)
            .await
    }

    /// Edit a message. Editing a player turn drops everything after it and
    /// regenerates the response; editing anything else only changes text.
    pub async fn edit<F>(
        &mut self,
        id: MessageId,
        text: &str,
        on_stream: F,
    ) -> Result<Option<TurnOutcome>, SessionError>
    where
        F: FnMut(&str, bool) + Send,
    {
        self.ensure_idle()?;

        match self.log.edit(id, text)? {
            EditOutcome::Updated => Ok(None),
            EditOutcome::Regenerate { input } => {
                let history_end = self.log.len().saturating_sub(1);
                let placeholder = self.log.push_pending();
                self.respond(history_end, &input, placeholder, on_stream)
                    .await
                    .map(Some)
            }
        }
    }

    /// Delete a message and everything after it.
    pub fn delete(&mut self, id: MessageId) -> Result<usize, SessionError> {
        self.ensure_idle()?;
        Ok(self.log.delete(id)?)
    }

    /// Regenerate a narrator turn in place.
    ///
    /// The message keeps its old text until the new one is ready. If
    /// generation fails the old text is kept.
    pub async fn reroll<F>(&mut self, id: MessageId, mut on_stream: F) -> Result<TurnOutcome, SessionError>
    where
        F: FnMut(&str, bool) + Send,
    {
        self.ensure_idle()?;
        let index = self.log.reroll_index(id)?;
        let original = self.log.messages()[index].content.clone();
        self.log.set_content(id, original.clone(), MessageStatus::Pending)?;

        let streaming = &mut self.streaming;
        streaming.clear();
        let result = self
            .narrator
            .regenerate_from(&self.character, self.log.messages(), index, |text, done| {
                streaming.clear();
                streaming.push_str(text);
                on_stream(text, done);
            })
            .await;
        self.streaming.clear();

        match result {
            Ok(response) => self.apply(id, response).await,
            Err(e) => {
                tracing::error!(error = %e, %id, "Reroll failed, keeping previous text");
                self.log.set_content(id, original, MessageStatus::Complete)?;
                Err(e.into())
            }
        }
    }

    async fn respond<F>(
        &mut self,
        history_end: usize,
        input: &str,
        placeholder: MessageId,
        mut on_stream: F,
    ) -> Result<TurnOutcome, SessionError>
    where
        F: FnMut(&str, bool) + Send,
    {
        let streaming = &mut self.streaming;
        streaming.clear();
        let result = self
            .narrator
            .generate_response(
                &self.character,
                &self.log.messages()[..history_end],
                input,
                |text, done| {
                    streaming.clear();
                    streaming.push_str(text);
                    on_stream(text, done);
                },
            )
            .await;

        self.finish(placeholder, result).await
    }

    async fn finish(
        &mut self,
        placeholder: MessageId,
        result: Result<NarratorResponse, NarratorError>,
    ) -> Result<TurnOutcome, SessionError> {
        self.streaming.clear();

        match result {
            Ok(response) => self.apply(placeholder, response).await,
            Err(e) => {
                let notice = match e {
                    NarratorError::Cancelled => CANCELLED_NOTICE,
                    _ => FAILURE_NOTICE,
                };
                tracing::error!(error = %e, "Generation failed");
                self.log
                    .set_content(placeholder, notice, MessageStatus::Failed)?;
                Err(e.into())
            }
        }
    }

    async fn apply(
        &mut self,
        id: MessageId,
        response: NarratorResponse,
    ) -> Result<TurnOutcome, SessionError> {
        if let Some(update) = &response.state_update {
            self.character = apply_state_update(&self.character, update);
        }
        self.log
            .set_content(id, response.content.clone(), MessageStatus::Complete)?;

        self.auto_save().await;

        Ok(TurnOutcome {
            message_id: id,
            content: response.content,
            state_update: response.state_update,
            malformed_block: response.malformed_block,
        })
    }

    async fn auto_save(&self) {
        if !self.config.autosave {
            return;
        }
        if let Err(e) = self
            .persistence
            .auto_save(&self.character, self.log.messages())
            .await
        {
            tracing::warn!(error = %e, "Auto-save failed");
        }
    }

    /// Save to a numbered slot.
    pub async fn save(&self, slot: u8) -> Result<(), SessionError> {
        self.persistence
            .save(slot, &self.character, self.log.messages())
            .await?;
        Ok(())
    }

    /// Replace the current game with a numbered slot.
    pub async fn load(&mut self, slot: u8) -> Result<(), SessionError> {
        self.ensure_idle()?;
        let record = self
            .persistence
            .load(slot)
            .await?
            .ok_or(SessionError::EmptySlot(slot))?;
        self.replace(record);
        Ok(())
    }

    /// Replace the current game with the autosave, if there is one.
    pub async fn resume_auto_save(&mut self) -> Result<bool, SessionError> {
        self.ensure_idle()?;
        match self.persistence.load_auto_save().await? {
            Some(record) => {
                self.replace(record);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn delete_slot(&self, slot: u8) -> Result<(), SessionError> {
        Ok(self.persistence.delete_slot(slot).await?)
    }

    pub async fn slot_previews(&self) -> Vec<Option<SlotPreview>> {
        self.persistence.previews().await
    }

    fn replace(&mut self, record: SaveRecord) {
        tracing::info!(id = %record.id, summary = %record.summary, "Restoring session");
        self.character = record.character;
        self.log = SessionLog::from_messages(record.messages);
        self.streaming.clear();
    }
}
