//! Save slots.
//!
//! Six numbered slots plus one autosave, each stored under its own key in
//! the backend's key-value store. Keys carry the save format version, and a
//! record whose version differs from the current one reads as absent.

use crate::character::Character;
use crate::log::{now_millis, Message, MessageId, MessageKind, Sender};
use host::Backend;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Current save format version.
pub const SAVE_VERSION: u32 = 1;

/// Number of manual slots, numbered from 1.
pub const MAX_SLOTS: u8 = 6;

/// Only this many of the most recent messages are kept in a save.
pub const MAX_SAVED_MESSAGES: usize = 50;

/// Local-store key of the pre-versioned save list.
pub const LEGACY_KEY: &str = "rpg_saves";

const AUTO_SAVE_ID: &str = "auto";

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Invalid slot {0}: must be 1-{MAX_SLOTS}")]
    InvalidSlot(u8),

    #[error("Storage error: {0}")]
    Backend(#[from] host::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn slot_key(slot: u8) -> String {
    format!("xiuxian_save_slot_{slot}_v{SAVE_VERSION}")
}

pub fn auto_save_key() -> String {
    format!("xiuxian_autosave_v{SAVE_VERSION}")
}

fn check_slot(slot: u8) -> Result<(), PersistError> {
    if (1..=MAX_SLOTS).contains(&slot) {
        Ok(())
    } else {
        Err(PersistError::InvalidSlot(slot))
    }
}

/// A stored snapshot of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveRecord {
    /// Slot number as text, or `"auto"`.
    pub id: String,
    pub character: Character,
    pub messages: Vec<Message>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub summary: String,
    pub version: u32,
}

impl SaveRecord {
    /// Snapshot the character and the most recent messages.
    pub fn new(id: impl Into<String>, character: &Character, messages: &[Message]) -> Self {
        let start = messages.len().saturating_sub(MAX_SAVED_MESSAGES);
        Self {
            id: id.into(),
            character: character.clone(),
            messages: messages[start..].to_vec(),
            timestamp: now_millis(),
            summary: character.summary(),
            version: SAVE_VERSION,
        }
    }
}

/// What a slot holds, without the messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotPreview {
    pub id: String,
    pub character_name: String,
    pub summary: String,
    pub timestamp: i64,
    pub message_count: usize,
}

impl From<&SaveRecord> for SlotPreview {
    fn from(record: &SaveRecord) -> Self {
        Self {
            id: record.id.clone(),
            character_name: record.character.name.clone(),
            summary: record.summary.clone(),
            timestamp: record.timestamp,
            message_count: record.messages.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// Saves are kept locally anyway, so there is nothing to move.
    Skipped,
    NothingToMigrate,
    Migrated { imported: usize, ignored: usize },
}

/// Pre-versioned save entry. Message ids were arbitrary strings.
#[derive(Debug, Deserialize)]
struct LegacySave {
    id: String,
    character: Character,
    #[serde(default)]
    messages: Vec<LegacyMessage>,
}

#[derive(Debug, Deserialize)]
struct LegacyMessage {
    sender: Sender,
    #[serde(rename = "senderName", default)]
    sender_name: Option<String>,
    content: String,
    #[serde(rename = "type", default)]
    kind: MessageKind,
    #[serde(default)]
    timestamp: i64,
}

impl LegacyMessage {
    fn into_message(self, id: MessageId) -> Message {
        Message {
            id,
            sender: self.sender,
            sender_name: self.sender_name,
            content: self.content,
            kind: self.kind,
            timestamp: self.timestamp,
            status: Default::default(),
        }
    }
}

/// Slot-addressed save storage on top of a `Backend`.
#[derive(Clone)]
pub struct Persistence {
    backend: Arc<Backend>,
}

impl Persistence {
    pub fn new(backend: Arc<Backend>) -> Self {
        Self { backend }
    }

    /// Save to a numbered slot, replacing whatever was there.
    pub async fn save(
        &self,
        slot: u8,
        character: &Character,
        messages: &[Message],
    ) -> Result<(), PersistError> {
        check_slot(slot)?;
        let record = SaveRecord::new(slot.to_string(), character, messages);
        self.write(&slot_key(slot), &record).await?;
        tracing::info!(slot, summary = %record.summary, "Game saved");
        Ok(())
    }

    /// Load a numbered slot. Empty slots and old versions read as `None`.
    pub async fn load(&self, slot: u8) -> Result<Option<SaveRecord>, PersistError> {
        check_slot(slot)?;
        let record = self.read(&slot_key(slot)).await?;
        if record.is_some() {
            tracing::info!(slot, "Game loaded");
        }
        Ok(record)
    }

    pub async fn delete_slot(&self, slot: u8) -> Result<(), PersistError> {
        check_slot(slot)?;
        self.backend.kv_delete(&slot_key(slot)).await?;
        tracing::info!(slot, "Save deleted");
        Ok(())
    }

    pub async fn auto_save(
        &self,
        character: &Character,
        messages: &[Message],
    ) -> Result<(), PersistError> {
        let record = SaveRecord::new(AUTO_SAVE_ID, character, messages);
        self.write(&auto_save_key(), &record).await?;
        tracing::debug!("Auto-save completed");
        Ok(())
    }

    pub async fn load_auto_save(&self) -> Result<Option<SaveRecord>, PersistError> {
        self.read(&auto_save_key()).await
    }

    pub async fn clear_auto_save(&self) -> Result<(), PersistError> {
        self.backend.kv_delete(&auto_save_key()).await?;
        tracing::debug!("Auto-save cleared");
        Ok(())
    }

    pub async fn has_auto_save(&self) -> Result<bool, PersistError> {
        Ok(self.load_auto_save().await?.is_some())
    }

    /// Every numbered slot in order. Unreadable slots are `None`.
    pub async fn list_slots(&self) -> Vec<Option<SaveRecord>> {
        let mut slots = Vec::with_capacity(MAX_SLOTS as usize);
        for slot in 1..=MAX_SLOTS {
            match self.read(&slot_key(slot)).await {
                Ok(record) => slots.push(record),
                Err(e) => {
                    tracing::warn!(slot, error = %e, "Failed to read save slot");
                    slots.push(None);
                }
            }
        }
        slots
    }

    pub async fn previews(&self) -> Vec<Option<SlotPreview>> {
        self.list_slots()
            .await
            .iter()
            .map(|slot| slot.as_ref().map(SlotPreview::from))
            .collect()
    }

    /// Import saves from the pre-versioned local format.
    ///
    /// Only runs when saves go to the remote store. Entries whose id is not
    /// a valid slot number are ignored. The legacy record is removed only
    /// after every entry has been written, so a failed run can be retried.
    pub async fn migrate_legacy(&self) -> Result<MigrationOutcome, PersistError> {
        if !self.backend.uses_remote_store() {
            tracing::debug!("Saves are local, skipping legacy migration");
            return Ok(MigrationOutcome::Skipped);
        }

        let Some(raw) = self.backend.local().get(LEGACY_KEY)? else {
            tracing::debug!("No legacy saves to migrate");
            return Ok(MigrationOutcome::NothingToMigrate);
        };

        // Older clients stored the list as a JSON string.
        let entries: Vec<LegacySave> = match raw {
            Value::String(text) => serde_json::from_str(&text)?,
            other => serde_json::from_value(other)?,
        };

        let mut imported = 0;
        let mut ignored = 0;
        for entry in entries {
            let slot = match entry.id.trim().parse::<u8>() {
                Ok(slot) if check_slot(slot).is_ok() => slot,
                _ => {
                    tracing::warn!(id = %entry.id, "Ignoring legacy save with invalid slot");
                    ignored += 1;
                    continue;
                }
            };

            let messages: Vec<Message> = entry
                .messages
                .into_iter()
                .enumerate()
                .map(|(i, m)| m.into_message(MessageId(i as u64 + 1)))
                .collect();

            self.save(slot, &entry.character, &messages).await?;
            tracing::info!(slot, "Migrated legacy save");
            imported += 1;
        }

        self.backend.local().remove(LEGACY_KEY)?;
        tracing::info!(imported, ignored, "Legacy migration completed");
        Ok(MigrationOutcome::Migrated { imported, ignored })
    }

    async fn write(&self, key: &str, record: &SaveRecord) -> Result<(), PersistError> {
        let value = serde_json::to_value(record)?;
        self.backend.kv_put(key, value).await?;
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Option<SaveRecord>, PersistError> {
        let Some(value) = self.backend.kv_get(key).await? else {
            return Ok(None);
        };

        let version = value.get("version").and_then(Value::as_u64);
        if version != Some(u64::from(SAVE_VERSION)) {
            tracing::debug!(key, ?version, "Save version mismatch, treating as empty");
            return Ok(None);
        }

        Ok(Some(serde_json::from_value(value)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::SessionLog;
    use crate::testing::{ready_backend, sample_character, MockHost};
    use host::{LocalStore, MemoryStore};
    use serde_json::json;

    fn local_persistence() -> (Persistence, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(Backend::local_only(store.clone()));
        (Persistence::new(backend), store)
    }

    #[test]
    fn test_keys() {
        assert_eq!(slot_key(3), "xiuxian_save_slot_3_v1");
        assert_eq!(auto_save_key(), "xiuxian_autosave_v1");
    }

    #[test]
    fn test_record_trims_messages() {
        let mut log = SessionLog::new();
        for i in 0..60 {
            log.push_player(format!("turn {i}"));
        }
        let record = SaveRecord::new("1", &sample_character(), log.messages());

        assert_eq!(record.messages.len(), MAX_SAVED_MESSAGES);
        assert_eq!(record.messages[0].content, "turn 10");
        assert_eq!(record.summary, "Qi-Refining · Azure Cloud Town");
        assert_eq!(record.version, SAVE_VERSION);
    }

    #[tokio::test]
    async fn test_invalid_slots_rejected() {
        let (persistence, store) = local_persistence();
        let character = sample_character();

        for slot in [0, 7, 255] {
            assert!(matches!(
                persistence.save(slot, &character, &[]).await,
                Err(PersistError::InvalidSlot(s)) if s == slot
            ));
            assert!(matches!(
                persistence.load(slot).await,
                Err(PersistError::InvalidSlot(_))
            ));
            assert!(matches!(
                persistence.delete_slot(slot).await,
                Err(PersistError::InvalidSlot(_))
            ));
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_version_mismatch_reads_as_empty() {
        let (persistence, store) = local_persistence();
        let character = sample_character();
        persistence.save(2, &character, &[]).await.unwrap();

        let mut stored = store.get(&slot_key(2)).unwrap().unwrap();
        stored["version"] = json!(SAVE_VERSION + 1);
        store.put(&slot_key(2), stored).unwrap();

        assert!(persistence.load(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_autosave_cycle() {
        let (persistence, _) = local_persistence();
        let character = sample_character();
        assert!(!persistence.has_auto_save().await.unwrap());

        persistence.auto_save(&character, &[]).await.unwrap();
        let record = persistence.load_auto_save().await.unwrap().unwrap();
        assert_eq!(record.id, "auto");
        assert!(persistence.has_auto_save().await.unwrap());

        persistence.clear_auto_save().await.unwrap();
        assert!(!persistence.has_auto_save().await.unwrap());
    }

    #[tokio::test]
    async fn test_previews() {
        let (persistence, store) = local_persistence();
        let character = sample_character();
        let log = SessionLog::with_prelude();

        persistence.save(1, &character, log.messages()).await.unwrap();
        persistence.save(4, &character, &[]).await.unwrap();
        store.put(&slot_key(5), json!({"version": 1, "garbage": true})).unwrap();

        let previews = persistence.previews().await;
        assert_eq!(previews.len(), MAX_SLOTS as usize);
        assert_eq!(previews[0].as_ref().unwrap().message_count, 3);
        assert_eq!(previews[0].as_ref().unwrap().character_name, "Lin Feng");
        assert!(previews[1].is_none());
        assert_eq!(previews[3].as_ref().unwrap().id, "4");
        assert!(previews[4].is_none());
    }

    #[tokio::test]
    async fn test_migration_skipped_when_local() {
        let (persistence, store) = local_persistence();
        store.put(LEGACY_KEY, json!([])).unwrap();

        assert_eq!(
            persistence.migrate_legacy().await.unwrap(),
            MigrationOutcome::Skipped
        );
        assert!(store.get(LEGACY_KEY).unwrap().is_some());
    }

    fn legacy_entry(id: &str) -> Value {
        json!({
            "id": id,
            "character": serde_json::to_value(sample_character()).unwrap(),
            "messages": [
                {"id": "init-0", "sender": "SYSTEM", "content": "Chaos parts...",
                 "type": "NARRATIVE", "timestamp": 1},
                {"id": "1718000000000", "sender": "PLAYER", "content": "I rise.",
                 "type": "ACTION", "timestamp": 2}
            ],
            "timestamp": 3
        })
    }

    #[tokio::test]
    async fn test_migration_imports_and_removes_legacy() {
        let host = Arc::new(MockHost::new(vec![]));
        let backend = ready_backend(host.clone()).await;
        let persistence = Persistence::new(backend.clone());

        let legacy = json!([legacy_entry("2"), legacy_entry("9"), legacy_entry("x")]);
        backend
            .local()
            .put(LEGACY_KEY, Value::String(legacy.to_string()))
            .unwrap();

        let outcome = persistence.migrate_legacy().await.unwrap();
        assert_eq!(
            outcome,
            MigrationOutcome::Migrated {
                imported: 1,
                ignored: 2
            }
        );
        assert!(backend.local().get(LEGACY_KEY).unwrap().is_none());

        let record = persistence.load(2).await.unwrap().unwrap();
        let ids: Vec<u64> = record.messages.iter().map(|m| m.id.0).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(host.kv_keys(), vec![slot_key(2)]);

        assert_eq!(
            persistence.migrate_legacy().await.unwrap(),
            MigrationOutcome::NothingToMigrate
        );
    }

    #[tokio::test]
    async fn test_failed_migration_keeps_legacy() {
        let host = Arc::new(MockHost::new(vec![]));
        let backend = ready_backend(host.clone()).await;
        let persistence = Persistence::new(backend.clone());

        backend
            .local()
            .put(LEGACY_KEY, json!([legacy_entry("1")]))
            .unwrap();
        host.fail_kv(true);

        assert!(matches!(
            persistence.migrate_legacy().await,
            Err(PersistError::Backend(_))
        ));
        assert!(backend.local().get(LEGACY_KEY).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_migrated_save_summary_shows_legacy_realm() {
        let host = Arc::new(MockHost::new(vec![]));
        let backend = ready_backend(host.clone()).await;
        let persistence = Persistence::new(backend.clone());

        let mut entry = legacy_entry("4");
        entry["character"]["variables"] = json!({"境界": "筑基期", "灵石": 12});
        backend.local().put(LEGACY_KEY, json!([entry])).unwrap();

        persistence.migrate_legacy().await.unwrap();

        let previews = persistence.previews().await;
        assert_eq!(
            previews[3].as_ref().unwrap().summary,
            "筑基期 · Azure Cloud Town"
        );
    }
}
