//! Client for the narrative host.
//!
//! The host is the remote capability that runs text completions and keeps a
//! small key-value store. This crate provides:
//! - The `Host` trait, the seam between the game and whatever serves it
//! - `HttpHost`, which talks to a host over HTTP with streamed completions
//! - `Backend`, the adapter the game uses: readiness detection, request
//!   validation, and transparent fallback to a local store
//! - `MemoryStore` and `FileStore`, the local fallback stores

mod backend;
mod http;
mod store;

pub use backend::{Backend, ReadyNotifier, DEFAULT_READY_TIMEOUT};
pub use http::{HostConfig, HttpHost};
pub use store::{FileStore, LocalStore, MemoryStore};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Smallest `max_tokens` the host accepts.
pub const MIN_MAX_TOKENS: u32 = 200;
/// Largest `max_tokens` the host accepts.
pub const MAX_MAX_TOKENS: u32 = 3000;

/// Errors that can occur when talking to the host.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Host not ready; await readiness before requesting completions")]
    NotReady,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Host error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Host reported an error mid-stream: {0}")]
    Stream(String),

    #[error("Failed to parse host response: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Callback receiving the cumulative generated text and whether it is final.
pub type ChunkCallback<'a> = &'a mut (dyn FnMut(&str, bool) + Send);

/// The remote capability: streamed completions plus a key-value store.
///
/// Implementations report presence synchronously so readiness detection can
/// check for them without suspending.
#[async_trait]
pub trait Host: Send + Sync {
    /// Whether the capability is reachable right now.
    fn is_present(&self) -> bool;

    /// Run a completion, calling `on_chunk` with cumulative text.
    ///
    /// The turns have already been normalized by the caller.
    async fn completions(
        &self,
        request: &CompletionRequest,
        on_chunk: ChunkCallback<'_>,
    ) -> Result<(), Error>;

    async fn kv_put(&self, key: &str, value: &serde_json::Value) -> Result<(), Error>;

    async fn kv_get(&self, key: &str) -> Result<Option<serde_json::Value>, Error>;

    async fn kv_delete(&self, key: &str) -> Result<(), Error>;
}

// ============================================================================
// Public types
// ============================================================================

/// The role of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    /// Not accepted by the host. Turns with this role are dropped before dispatch.
    System,
}

/// One role-tagged block of text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    #[serde(rename = "content")]
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            text: text.into(),
        }
    }
}

/// A validated completion request, as handed to a `Host`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionRequest {
    pub model: Model,
    #[serde(rename = "messages")]
    pub turns: Vec<Turn>,
    #[serde(rename = "maxTokens")]
    pub max_tokens: u32,
}

/// Models offered by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Model {
    #[serde(rename = "nalang-turbo-0826")]
    Turbo,
    #[serde(rename = "nalang-medium-0826")]
    Medium,
    #[serde(rename = "nalang-max-0826")]
    Max,
    #[default]
    #[serde(rename = "nalang-xl-0826")]
    Xl,
    #[serde(rename = "nalang-max-0826-16k")]
    Max16k,
    #[serde(rename = "nalang-xl-0826-16k")]
    Xl16k,
}

impl Model {
    pub const ALL: [Model; 6] = [
        Model::Turbo,
        Model::Medium,
        Model::Max,
        Model::Xl,
        Model::Max16k,
        Model::Xl16k,
    ];

    /// Wire identifier sent to the host.
    pub fn id(&self) -> &'static str {
        match self {
            Model::Turbo => "nalang-turbo-0826",
            Model::Medium => "nalang-medium-0826",
            Model::Max => "nalang-max-0826",
            Model::Xl => "nalang-xl-0826",
            Model::Max16k => "nalang-max-0826-16k",
            Model::Xl16k => "nalang-xl-0826-16k",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Model::Turbo => "Turbo",
            Model::Medium => "Medium",
            Model::Max => "Max",
            Model::Xl => "XL",
            Model::Max16k => "Max 16K",
            Model::Xl16k => "XL 16K",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Model::Turbo => "Fastest responses",
            Model::Medium => "Balanced",
            Model::Max => "Stronger reasoning",
            Model::Xl => "Strongest comprehension",
            Model::Max16k => "Fast with a short context",
            Model::Xl16k => "Strongest with a short context",
        }
    }

    /// Look up a model by wire id or display name, ignoring case.
    pub fn from_id(s: &str) -> Option<Model> {
        Model::ALL
            .into_iter()
            .find(|m| m.id().eq_ignore_ascii_case(s) || m.name().eq_ignore_ascii_case(s))
    }
}

/// Clamp a token budget into the range the host accepts.
pub fn clamp_max_tokens(max_tokens: u32) -> u32 {
    max_tokens.clamp(MIN_MAX_TOKENS, MAX_MAX_TOKENS)
}

/// Drop turns the host does not accept (system turns and turns with only
/// whitespace) and merge adjacent same-role turns.
///
/// The host rejects two consecutive turns with the same role, so they are
/// joined with a blank line. Relative order is preserved.
pub fn normalize_turns(turns: Vec<Turn>) -> Vec<Turn> {
    let mut merged: Vec<Turn> = Vec::with_capacity(turns.len());

    for turn in turns
        .into_iter()
        .filter(|t| matches!(t.role, Role::User | Role::Assistant))
        .filter(|t| !t.text.trim().is_empty())
    {
        match merged.last_mut() {
            Some(last) if last.role == turn.role => {
                last.text.push_str("\n\n");
                last.text.push_str(&turn.text);
            }
            _ => merged.push(turn),
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_consecutive_user_turns() {
        let turns = vec![Turn::user("A"), Turn::user("B"), Turn::assistant("C")];
        let merged = normalize_turns(turns);
        assert_eq!(merged, vec![Turn::user("A\n\nB"), Turn::assistant("C")]);
    }

    #[test]
    fn test_system_turns_dropped_before_merge() {
        let turns = vec![
            Turn::user("A"),
            Turn::system("ignored"),
            Turn::user("B"),
            Turn::assistant("C"),
            Turn::assistant("D"),
            Turn::user("E"),
        ];
        let merged = normalize_turns(turns);
        assert_eq!(
            merged,
            vec![
                Turn::user("A\n\nB"),
                Turn::assistant("C\n\nD"),
                Turn::user("E"),
            ]
        );
    }

    #[test]
    fn test_empty_turns_dropped() {
        let turns = vec![
            Turn::user("A"),
            Turn::assistant(""),
            Turn::user("B"),
            Turn::assistant("  \n"),
            Turn::assistant("C"),
        ];
        assert_eq!(
            normalize_turns(turns),
            vec![Turn::user("A\n\nB"), Turn::assistant("C")]
        );
    }

    #[test]
    fn test_alternating_turns_untouched() {
        let turns = vec![Turn::user("1"), Turn::assistant("2"), Turn::user("3")];
        assert_eq!(normalize_turns(turns.clone()), turns);
        assert!(normalize_turns(Vec::new()).is_empty());
    }

    #[test]
    fn test_clamp_max_tokens() {
        assert_eq!(clamp_max_tokens(0), 200);
        assert_eq!(clamp_max_tokens(2500), 2500);
        assert_eq!(clamp_max_tokens(10_000), 3000);
    }

    #[test]
    fn test_model_ids() {
        assert_eq!(Model::default(), Model::Xl);
        assert_eq!(Model::from_id("nalang-turbo-0826"), Some(Model::Turbo));
        assert_eq!(Model::from_id("max 16k"), Some(Model::Max16k));
        assert_eq!(Model::from_id("gpt"), None);

        let json = serde_json::to_string(&Model::Xl16k).unwrap();
        assert_eq!(json, "\"nalang-xl-0826-16k\"");
    }

    #[test]
    fn test_request_wire_shape() {
        let request = CompletionRequest {
            model: Model::Medium,
            turns: vec![Turn::user("hi")],
            max_tokens: 500,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["model"], "nalang-medium-0826");
        assert_eq!(value["maxTokens"], 500);
        assert_eq!(value["messages"][0]["role"], "user");
        assert_eq!(value["messages"][0]["content"], "hi");
    }
}
