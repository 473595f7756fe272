//! Testing utilities.
//!
//! - `MockHost` for deterministic tests without a real host
//! - `sample_character` for a ready-made cultivator
//! - Assertion helpers for character state

use crate::character::{AttributeGrade, AttributeRoll, Character, CharacterBuilder, Gender, VarValue};
use async_trait::async_trait;
use host::{Backend, ChunkCallback, CompletionRequest, Error, Host, MemoryStore};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

/// A scripted completion.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Cumulative chunks, streamed in order. The last one is final.
    Chunks(Vec<String>),
    /// Fail with a network error.
    Fail(String),
}

impl MockReply {
    /// Stream `text` in three cumulative chunks.
    pub fn text(text: impl Into<String>) -> Self {
        let text = text.into();
        let chars: Vec<char> = text.chars().collect();
        let cuts = [chars.len() / 3, chars.len() * 2 / 3, chars.len()];

        let mut chunks: Vec<String> = cuts
            .iter()
            .map(|&n| chars[..n].iter().collect())
            .collect();
        chunks.dedup();
        MockReply::Chunks(chunks)
    }

    pub fn fail(message: impl Into<String>) -> Self {
        MockReply::Fail(message.into())
    }
}

/// Holds the next completion open until released.
#[derive(Debug, Clone)]
pub struct Gate {
    notify: Arc<Notify>,
}

impl Gate {
    pub fn release(&self) {
        self.notify.notify_one();
    }
}

/// A host that replays scripted replies and records what it was asked.
#[derive(Default)]
pub struct MockHost {
    present: AtomicBool,
    replies: Mutex<VecDeque<MockReply>>,
    requests: Mutex<Vec<CompletionRequest>>,
    kv: Mutex<HashMap<String, Value>>,
    kv_ops: AtomicUsize,
    fail_kv: AtomicBool,
    gate: Mutex<Option<Arc<Notify>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockHost {
    /// A present host with the given replies queued.
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            present: AtomicBool::new(true),
            replies: Mutex::new(replies.into()),
            ..Default::default()
        }
    }

    /// A host that never becomes present.
    pub fn absent() -> Self {
        Self::default()
    }

    pub fn set_present(&self, present: bool) {
        self.present.store(present, Ordering::SeqCst);
    }

    pub fn queue(&self, reply: MockReply) {
        lock(&self.replies).push_back(reply);
    }

    /// Make the next completion wait until the returned gate is released.
    pub fn hold(&self) -> Gate {
        let notify = Arc::new(Notify::new());
        *lock(&self.gate) = Some(notify.clone());
        Gate { notify }
    }

    /// Make every key-value call fail.
    pub fn fail_kv(&self, fail: bool) {
        self.fail_kv.store(fail, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        lock(&self.requests).clone()
    }

    pub fn completion_count(&self) -> usize {
        lock(&self.requests).len()
    }

    /// Number of key-value calls, failed ones included.
    pub fn kv_op_count(&self) -> usize {
        self.kv_ops.load(Ordering::SeqCst)
    }

    pub fn kv_value(&self, key: &str) -> Option<Value> {
        lock(&self.kv).get(key).cloned()
    }

    pub fn kv_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.kv).keys().cloned().collect();
        keys.sort();
        keys
    }

    fn kv_call(&self) -> Result<(), Error> {
        self.kv_ops.fetch_add(1, Ordering::SeqCst);
        if self.fail_kv.load(Ordering::SeqCst) {
            return Err(Error::Network("kv unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Host for MockHost {
    fn is_present(&self) -> bool {
        self.present.load(Ordering::SeqCst)
    }

    async fn completions(
        &self,
        request: &CompletionRequest,
        on_chunk: ChunkCallback<'_>,
    ) -> Result<(), Error> {
        lock(&self.requests).push(request.clone());
        let reply = lock(&self.replies)
            .pop_front()
            .unwrap_or_else(|| MockReply::text("The Dao is silent."));
        let gate = lock(&self.gate).take();

        if let Some(gate) = gate {
            gate.notified().await;
        }

        match reply {
            MockReply::Chunks(chunks) => {
                let last = chunks.len().saturating_sub(1);
                for (i, chunk) in chunks.iter().enumerate() {
                    on_chunk(chunk, i == last);
                }
                Ok(())
            }
            MockReply::Fail(message) => Err(Error::Network(message)),
        }
    }

    async fn kv_put(&self, key: &str, value: &Value) -> Result<(), Error> {
        self.kv_call()?;
        lock(&self.kv).insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<Value>, Error> {
        self.kv_call()?;
        Ok(lock(&self.kv).get(key).cloned())
    }

    async fn kv_delete(&self, key: &str) -> Result<(), Error> {
        self.kv_call()?;
        lock(&self.kv).remove(key);
        Ok(())
    }
}

/// A backend over `host` with an in-memory fallback, already marked ready.
pub async fn ready_backend(host: Arc<MockHost>) -> Arc<Backend> {
    let backend = Backend::new(host, Arc::new(MemoryStore::new()));
    backend.await_ready(host::DEFAULT_READY_TIMEOUT).await;
    Arc::new(backend)
}

/// A young cultivator with a few possessions.
pub fn sample_character() -> Character {
    CharacterBuilder::new("Lin Feng")
        .gender(Gender::Male)
        .race("Human")
        .path("Sword Dao")
        .appearance("Lean, with ink-black hair tied in a simple knot")
        .physique(AttributeRoll::new(
            "Blocked Meridians",
            AttributeGrade::Mortal,
            "Meridians clogged since birth; qi moves sluggishly.",
        ))
        .comprehension(
            AttributeRoll::new(
                "Photographic Memory",
                AttributeGrade::Spirit,
                "Remembers any technique after a single reading.",
            )
            .with_bonus("insight", "Learns techniques quickly"),
        )
        .relic(AttributeRoll::new(
            "Cracked Jade Pendant",
            AttributeGrade::Heaven,
            "An heirloom that hums faintly at night.",
        ))
        .location("Azure Cloud Town")
        .age(16)
        .item("Dry rations")
        .item("Rusty iron sword")
        .build()
}

// ============================================================================
// Assertion Helpers
// ============================================================================

/// Assert a variable holds the given value.
#[track_caller]
pub fn assert_variable(character: &Character, key: &str, expected: impl Into<VarValue>) {
    let expected = expected.into();
    assert_eq!(
        character.variables.get(key),
        Some(&expected),
        "Expected variable '{key}' to be {expected}"
    );
}

/// Assert the character has exactly the given variable keys.
#[track_caller]
pub fn assert_variable_keys(character: &Character, keys: &[&str]) {
    let mut actual: Vec<&str> = character.variables.keys().collect();
    let mut expected = keys.to_vec();
    actual.sort_unstable();
    expected.sort_unstable();
    assert_eq!(actual, expected, "Variable key set changed");
}
