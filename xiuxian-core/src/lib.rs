//! Cultivation-world narrative engine.
//!
//! This crate provides:
//! - Prompt assembly for an AI narrator of a xianxia world
//! - The `###STATE` response protocol for character updates
//! - Single-flight narration with streaming display text
//! - An editable session log with delete, edit and reroll
//! - Six save slots plus autosave, with legacy import
//!
//! # Quick Start
//!
//! ```ignore
//! use host::{Backend, HostConfig, HttpHost, MemoryStore};
//! use std::sync::Arc;
//! use xiuxian_core::{CharacterBuilder, GameSession, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let host = Arc::new(HttpHost::new(HostConfig::from_env()?)?);
//!     let backend = Arc::new(Backend::new(host, Arc::new(MemoryStore::new())));
//!
//!     let character = CharacterBuilder::new("Lin Feng").path("Sword Dao").build();
//!     let mut session = GameSession::new(backend, character, SessionConfig::new());
//!     session.await_ready().await;
//!
//!     session.start(|text, _| println!("{text}")).await?;
//!     let turn = session.send("I look around", |_, _| {}).await?;
//!     println!("{}", turn.content);
//!
//!     session.save(1).await?;
//!     Ok(())
//! }
//! ```

pub mod character;
pub mod log;
pub mod narrator;
pub mod persist;
pub mod prompt;
pub mod protocol;
pub mod session;
pub mod testing;

// Primary public API
pub use character::{
    AttributeGrade, AttributeRoll, Character, CharacterBuilder, CharacterId, GameDate, Gender,
    VarValue, Variables,
};
pub use log::{EditOutcome, LogError, Message, MessageId, MessageStatus, Sender, SessionLog};
pub use narrator::{Narrator, NarratorError, NarratorResponse};
pub use persist::{MigrationOutcome, PersistError, Persistence, SaveRecord, SlotPreview};
pub use protocol::{parse_final, strip_for_display, ParsedResponse, StateUpdate};
pub use session::{GameSession, SessionConfig, SessionError, TurnOutcome};
pub use testing::{MockHost, MockReply};
