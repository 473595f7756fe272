//! The narrator: one request/response cycle against the host.
//!
//! At most one generation runs per narrator. A second call while one is in
//! flight fails immediately with `AlreadyGenerating`; there is no queue.
//!
//! `cancel` is local only. It frees the narrator for the next call, stops
//! the abandoned call's stream callback and makes it return `Cancelled`, but
//! the host keeps generating until it finishes on its own.

use crate::character::Character;
use crate::log::Message;
use crate::prompt::{build_opening_turns, build_turns};
use crate::protocol::{parse_final, strip_for_display, StateUpdate};
use host::{Backend, Model, Turn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Token budget requested for every generation.
pub const DEFAULT_MAX_TOKENS: u32 = 2500;

#[derive(Debug, Error)]
pub enum NarratorError {
    #[error("A generation is already in progress")]
    AlreadyGenerating,

    #[error("Generation was cancelled")]
    Cancelled,

    #[error("No player turn before message {0} to regenerate from")]
    NoPlayerTurn(usize),

    #[error("Backend error: {0}")]
    Backend(#[from] host::Error),
}

/// A finished generation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NarratorResponse {
    /// Narrative text with any state block removed.
    pub content: String,
    pub state_update: Option<StateUpdate>,
    /// The response carried a state block that could not be read.
    pub malformed_block: bool,
}

pub struct Narrator {
    backend: Arc<Backend>,
    model: Mutex<Model>,
    max_tokens: u32,
    in_flight: Mutex<Option<u64>>,
    next_token: AtomicU64,
}

/// Marks a generation as in flight until dropped.
struct FlightGuard<'a> {
    slot: &'a Mutex<Option<u64>>,
    token: u64,
}

impl FlightGuard<'_> {
    fn is_current(&self) -> bool {
        *lock(self.slot) == Some(self.token)
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut slot = lock(self.slot);
        // A cancel may already have handed the slot to a newer call.
        if *slot == Some(self.token) {
            *slot = None;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Narrator {
    pub fn new(backend: Arc<Backend>) -> Self {
        Self {
            backend,
            model: Mutex::new(Model::default()),
            max_tokens: DEFAULT_MAX_TOKENS,
            in_flight: Mutex::new(None),
            next_token: AtomicU64::new(1),
        }
    }

    pub fn with_model(self, model: Model) -> Self {
        self.set_model(model);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn model(&self) -> Model {
        *lock(&self.model)
    }

    /// Takes effect from the next generation.
    pub fn set_model(&self, model: Model) {
        *lock(&self.model) = model;
        tracing::info!(model = model.id(), "Model changed");
    }

    pub fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    pub fn is_generating(&self) -> bool {
        lock(&self.in_flight).is_some()
    }

    /// Release the in-flight slot without stopping the host.
    pub fn cancel(&self) {
        if lock(&self.in_flight).take().is_some() {
            tracing::info!("Generation cancelled locally; the host may still be generating");
        }
    }

    fn begin(&self) -> Result<FlightGuard<'_>, NarratorError> {
        let mut slot = lock(&self.in_flight);
        if slot.is_some() {
            return Err(NarratorError::AlreadyGenerating);
        }
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        *slot = Some(token);

        Ok(FlightGuard {
            slot: &self.in_flight,
            token,
        })
    }

    /// Generate the opening scene. The character is not modified.
    ///
    /// Streamed text is stripped of state blocks, the same as for regular
    /// responses.
    pub async fn generate_opening<F>(
        &self,
        character: &Character,
        on_stream: F,
    ) -> Result<NarratorResponse, NarratorError>
    where
        F: FnMut(&str, bool) + Send,
    {
        let guard = self.begin()?;
        tracing::info!(character = %character.name, "Generating opening");
        self.run(&guard, build_opening_turns(character), on_stream)
            .await
    }

    /// Generate a response to `input`, given the history before it.
    pub async fn generate_response<F>(
        &self,
        character: &Character,
        history: &[Message],
        input: &str,
        on_stream: F,
    ) -> Result<NarratorResponse, NarratorError>
    where
        F: FnMut(&str, bool) + Send,
    {
        let guard = self.begin()?;
        tracing::info!(history = history.len(), "Generating response");
        self.run(&guard, build_turns(character, history, input), on_stream)
            .await
    }

    /// Regenerate the response for the nearest player turn before `index`.
    ///
    /// History from that player turn onward is left out of the prompt and
    /// the player turn's text is used as the input. `history` itself is not
    /// modified; splicing the result back is up to the caller.
    pub async fn regenerate_from<F>(
        &self,
        character: &Character,
        history: &[Message],
        index: usize,
        on_stream: F,
    ) -> Result<NarratorResponse, NarratorError>
    where
        F: FnMut(&str, bool) + Send,
    {
        let end = index.min(history.len());
        let player = history[..end]
            .iter()
            .rposition(Message::is_player)
            .ok_or(NarratorError::NoPlayerTurn(index))?;

        self.generate_response(
            character,
            &history[..player],
            &history[player].content,
            on_stream,
        )
        .await
    }

    async fn run<F>(
        &self,
        guard: &FlightGuard<'_>,
        turns: Vec<Turn>,
        mut on_stream: F,
    ) -> Result<NarratorResponse, NarratorError>
    where
        F: FnMut(&str, bool) + Send,
    {
        let final_text = self
            .backend
            .complete(self.model(), turns, self.max_tokens, |text, is_final| {
                // Once cancelled, the caller hears nothing more from this call.
                if guard.is_current() {
                    on_stream(&strip_for_display(text), is_final)
                }
            })
            .await?;

        if !guard.is_current() {
            tracing::info!("Discarding result of cancelled generation");
            return Err(NarratorError::Cancelled);
        }

        let parsed = parse_final(&final_text);
        Ok(NarratorResponse {
            content: parsed.narrative,
            state_update: parsed.state_update,
            malformed_block: parsed.malformed_block,
        })
    }
}
