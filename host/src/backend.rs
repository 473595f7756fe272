//! The adapter the game talks to.
//!
//! `Backend` wraps an optional `Host` together with a local fallback store.
//! Completions require a host that has been confirmed ready; key-value calls
//! silently go to the local store whenever it has not.

use crate::{
    clamp_max_tokens, normalize_turns, CompletionRequest, Error, Host, LocalStore, Model, Turn,
};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// How long `await_ready` waits by default.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle for announcing that the host has become available.
///
/// Whoever learns about the host asynchronously (a probe task, a handshake
/// with the embedding environment) calls `notify_ready` on a clone of this.
#[derive(Debug, Clone)]
pub struct ReadyNotifier {
    tx: Arc<watch::Sender<bool>>,
}

impl ReadyNotifier {
    pub fn notify_ready(&self) {
        self.tx.send_replace(true);
    }
}

/// Uniform access to completions and key-value storage.
pub struct Backend {
    host: Option<Arc<dyn Host>>,
    fallback: Arc<dyn LocalStore>,
    ready: AtomicBool,
    ready_tx: Arc<watch::Sender<bool>>,
}

impl Backend {
    /// Create a backend for a host, falling back to `fallback` until it is ready.
    pub fn new(host: Arc<dyn Host>, fallback: Arc<dyn LocalStore>) -> Self {
        Self::build(Some(host), fallback)
    }

    /// Create a backend with no host at all. Only key-value calls work.
    pub fn local_only(fallback: Arc<dyn LocalStore>) -> Self {
        Self::build(None, fallback)
    }

    fn build(host: Option<Arc<dyn Host>>, fallback: Arc<dyn LocalStore>) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            host,
            fallback,
            ready: AtomicBool::new(false),
            ready_tx: Arc::new(tx),
        }
    }

    pub fn notifier(&self) -> ReadyNotifier {
        ReadyNotifier {
            tx: Arc::clone(&self.ready_tx),
        }
    }

    /// Whether readiness has been confirmed.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Whether key-value calls currently reach the host rather than the local store.
    pub fn uses_remote_store(&self) -> bool {
        self.remote().is_some()
    }

    /// The local fallback store.
    pub fn local(&self) -> &dyn LocalStore {
        self.fallback.as_ref()
    }

    /// Wait until the host is confirmed present, or give up after `timeout`.
    ///
    /// Three paths race: an immediate presence check, a readiness
    /// notification, and a presence recheck when the timeout elapses.
    /// Returns `false` instead of failing so callers can carry on in
    /// fallback mode. A `false` result is not remembered; calling again
    /// re-runs detection.
    pub async fn await_ready(&self, timeout: Duration) -> bool {
        if self.is_ready() {
            return true;
        }

        let Some(host) = self.host.as_ref() else {
            tracing::warn!("No host configured, running in fallback mode");
            return false;
        };

        if host.is_present() {
            tracing::info!("Host already available");
            return self.mark_ready();
        }

        let mut rx = self.ready_tx.subscribe();
        tokio::select! {
            notified = async { rx.wait_for(|ready| *ready).await.is_ok() } => {
                if notified {
                    tracing::info!("Host ready via notification");
                    self.mark_ready()
                } else {
                    false
                }
            }
            _ = tokio::time::sleep(timeout) => {
                if host.is_present() {
                    tracing::info!("Host ready via timeout recheck");
                    self.mark_ready()
                } else {
                    tracing::warn!(
                        timeout_ms = timeout.as_millis() as u64,
                        "Host not available after timeout, running in fallback mode"
                    );
                    false
                }
            }
        }
    }

    fn mark_ready(&self) -> bool {
        self.ready.store(true, Ordering::SeqCst);
        self.ready_tx.send_replace(true);
        true
    }

    fn remote(&self) -> Option<&Arc<dyn Host>> {
        if self.is_ready() {
            self.host.as_ref()
        } else {
            None
        }
    }

    /// Stream a completion.
    ///
    /// `max_tokens` is clamped into the accepted range, turns other than
    /// user/assistant are dropped and same-role neighbours merged. `on_chunk`
    /// receives the cumulative text; its last call has `is_final = true` and
    /// carries the same text this returns. Transport failures are returned
    /// as they are, never retried.
    pub async fn complete<F>(
        &self,
        model: Model,
        turns: Vec<Turn>,
        max_tokens: u32,
        mut on_chunk: F,
    ) -> Result<String, Error>
    where
        F: FnMut(&str, bool) + Send,
    {
        let host = self.remote().ok_or(Error::NotReady)?;

        let request = CompletionRequest {
            model,
            turns: normalize_turns(turns),
            max_tokens: clamp_max_tokens(max_tokens),
        };

        tracing::debug!(
            model = model.id(),
            turns = request.turns.len(),
            max_tokens = request.max_tokens,
            "Dispatching completion"
        );

        let mut final_text = String::new();
        let mut saw_final = false;
        let mut forward = |text: &str, is_final: bool| {
            final_text.clear();
            final_text.push_str(text);
            saw_final |= is_final;
            on_chunk(text, is_final);
        };

        if let Err(e) = host.completions(&request, &mut forward).await {
            tracing::error!(error = %e, "Completion failed");
            return Err(e);
        }

        if !saw_final {
            on_chunk(&final_text, true);
        }

        tracing::debug!(chars = final_text.chars().count(), "Completion finished");
        Ok(final_text)
    }

    pub async fn kv_put(&self, key: &str, value: Value) -> Result<(), Error> {
        match self.remote() {
            Some(host) => host.kv_put(key, &value).await,
            None => {
                tracing::debug!(key, "Using local fallback for kv_put");
                self.fallback.put(key, value)
            }
        }
    }

    pub async fn kv_get(&self, key: &str) -> Result<Option<Value>, Error> {
        match self.remote() {
            Some(host) => host.kv_get(key).await,
            None => {
                tracing::debug!(key, "Using local fallback for kv_get");
                self.fallback.get(key)
            }
        }
    }

    pub async fn kv_delete(&self, key: &str) -> Result<(), Error> {
        match self.remote() {
            Some(host) => host.kv_delete(key).await,
            None => {
                tracing::debug!(key, "Using local fallback for kv_delete");
                self.fallback.remove(key)
            }
        }
    }
}
