use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, error, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::crypto::StorageCrypto;
use crate::events::Message;
use crate::now_ms;

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct RoomConfig {
    #[serde(default)]
    pub expiry_hours: Option<u32>,
}

/// The entire persisted state: one JSON document, encrypted at rest.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Document {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub rooms: HashMap<String, RoomConfig>,
}

/// Write-back cached message store. Reads always hit the in-memory
/// document; every mutation re-encrypts the whole document and writes it
/// back asynchronously, so the persisted copy may lag the cache.
pub struct ChatDb {
    path: PathBuf,
    crypto: Arc<StorageCrypto>,
    cache: RwLock<Document>,
}

impl ChatDb {
    pub async fn open(path: PathBuf, crypto: Arc<StorageCrypto>) -> Self {
        let doc = read_document(&path, &crypto).await;
        ChatDb { path, crypto, cache: RwLock::new(doc) }
    }

    /// Assigns the id and appends. The timestamp is the caller's; the
    /// session layer stamps it when the message comes off the wire.
    pub async fn add_message(&self, mut msg: Message) -> Message {
        msg.id = generate_id();
        let mut doc = self.cache.write().await;
        doc.messages.push(msg.clone());
        self.persist(&doc);
        msg
    }

    /// Removes the first message with this id and returns it so the caller
    /// can clean up any media it referenced. `None` when absent.
    pub async fn delete_message(&self, id: &str) -> Option<Message> {
        let mut doc = self.cache.write().await;
        let index = doc.messages.iter().position(|m| m.id == id)?;
        let removed = doc.messages.remove(index);
        self.persist(&doc);
        Some(removed)
    }

    pub async fn delete_messages_by_nickname(&self, room_id: &str, nickname: &str) -> bool {
        let mut doc = self.cache.write().await;
        let before = doc.messages.len();
        doc.messages
            .retain(|m| !(m.room_id == room_id && m.nickname == nickname));
        if doc.messages.len() == before {
            return false;
        }
        self.persist(&doc);
        true
    }

    pub async fn clear_room(&self, room_id: &str) -> bool {
        let mut doc = self.cache.write().await;
        let before = doc.messages.len();
        doc.messages.retain(|m| m.room_id != room_id);
        if doc.messages.len() == before {
            return false;
        }
        self.persist(&doc);
        true
    }

    /// Room history, oldest first; ties keep insertion order.
    pub async fn get_messages(&self, room_id: &str) -> Vec<Message> {
        let doc = self.cache.read().await;
        let mut messages: Vec<Message> = doc
            .messages
            .iter()
            .filter(|m| m.room_id == room_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.timestamp);
        messages
    }

    pub async fn set_room_expiry(&self, room_id: &str, hours: u32) {
        let mut doc = self.cache.write().await;
        doc.rooms.entry(room_id.to_string()).or_default().expiry_hours = Some(hours);
        self.persist(&doc);
    }

    pub async fn get_room_expiry(&self, room_id: &str) -> Option<u32> {
        let doc = self.cache.read().await;
        doc.rooms.get(room_id).and_then(|c| c.expiry_hours)
    }

    /// Drops every message older than its room's retention (room override if
    /// set, else `default_retention_ms`) and returns the discarded set so
    /// the caller can delete associated media. Persists only when something
    /// was actually removed.
    pub async fn cleanup(&self, default_retention_ms: u64) -> Vec<Message> {
        let now = now_ms();
        let mut doc = self.cache.write().await;
        let messages = std::mem::take(&mut doc.messages);
        let mut kept = Vec::with_capacity(messages.len());
        let mut discarded = Vec::new();

        for msg in messages {
            let retention = doc
                .rooms
                .get(&msg.room_id)
                .and_then(|c| c.expiry_hours)
                .map_or(default_retention_ms, |h| u64::from(h) * 3_600_000);
            if now.saturating_sub(msg.timestamp) < retention {
                kept.push(msg);
            } else {
                discarded.push(msg);
            }
        }

        doc.messages = kept;
        if !discarded.is_empty() {
            self.persist(&doc);
        }
        discarded
    }

    // Cache is updated synchronously by the caller; the encrypted write to
    // disk is fire-and-forget and its failure only costs durability.
    fn persist(&self, doc: &Document) {
        let payload = match serde_json::to_string_pretty(doc) {
            Ok(payload) => payload,
            Err(e) => {
                error!("failed to serialize document: {e}");
                return;
            }
        };
        let encrypted = self.crypto.encrypt_str(&payload);
        let path = self.path.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::fs::write(&path, encrypted).await {
                error!("document write failed: {e}");
            }
        });
    }
}

async fn read_document(path: &Path, crypto: &StorageCrypto) -> Document {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("no document at {}, starting empty", path.display());
            return Document::default();
        }
        Err(e) => {
            error!("cannot read document at {}: {e}", path.display());
            return Document::default();
        }
    };

    match crypto.decrypt_str(&raw) {
        Ok(plain) => match serde_json::from_str(&plain) {
            Ok(doc) => doc,
            Err(e) => {
                error!("stored document decrypted but did not parse ({e}); starting empty");
                Document::default()
            }
        },
        // Pre-encryption deployments stored the document as plaintext JSON.
        Err(_) => match serde_json::from_str(&raw) {
            Ok(doc) => {
                warn!("document at {} is legacy plaintext; it will be encrypted on next write", path.display());
                doc
            }
            Err(e) => {
                error!("document at {} is unreadable ({e}); starting empty", path.display());
                Document::default()
            }
        },
    }
}

fn generate_id() -> String {
    const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9).map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char).collect();
    format!("{}{}", now_ms(), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MessageKind;
    use std::time::Duration;

    fn draft(room: &str, nickname: &str, content: &str, timestamp: u64) -> Message {
        Message {
            id: String::new(),
            room_id: room.to_string(),
            nickname: nickname.to_string(),
            content: Some(content.to_string()),
            kind: MessageKind::Text,
            media_path: None,
            timestamp,
            reply_to: None,
        }
    }

    async fn open_db(dir: &tempfile::TempDir) -> ChatDb {
        let crypto = Arc::new(StorageCrypto::from_key([3u8; 32]));
        ChatDb::open(dir.path().join("chat_data.json"), crypto).await
    }

    #[tokio::test]
    async fn messages_come_back_sorted_by_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir).await;

        db.add_message(draft("lobby", "ada", "third", 3000)).await;
        db.add_message(draft("lobby", "ada", "first", 1000)).await;
        db.add_message(draft("other", "ada", "elsewhere", 1500)).await;
        db.add_message(draft("lobby", "ada", "second", 2000)).await;

        let history = db.get_messages("lobby").await;
        let contents: Vec<_> = history.iter().filter_map(|m| m.content.as_deref()).collect();
        assert_eq!(contents, ["first", "second", "third"]);
        assert!(history.iter().all(|m| !m.id.is_empty()));
    }

    #[tokio::test]
    async fn delete_message_returns_record_once() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir).await;

        let stored = db.add_message(draft("lobby", "ada", "bye", 1000)).await;
        let removed = db.delete_message(&stored.id).await;
        assert_eq!(removed.as_ref().map(|m| m.id.as_str()), Some(stored.id.as_str()));

        // second delete is a no-op
        assert!(db.delete_message(&stored.id).await.is_none());
        assert!(db.get_messages("lobby").await.is_empty());
    }

    #[tokio::test]
    async fn bulk_deletes_report_whether_anything_changed() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir).await;

        db.add_message(draft("lobby", "ada", "one", 1000)).await;
        db.add_message(draft("lobby", "grace", "two", 2000)).await;

        assert!(db.delete_messages_by_nickname("lobby", "ada").await);
        assert!(!db.delete_messages_by_nickname("lobby", "ada").await);
        assert_eq!(db.get_messages("lobby").await.len(), 1);

        assert!(db.clear_room("lobby").await);
        assert!(!db.clear_room("lobby").await);
    }

    #[tokio::test]
    async fn cleanup_respects_the_retention_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir).await;
        let ttl: u64 = 60_000;
        let now = now_ms();

        db.add_message(draft("lobby", "ada", "too old", now - ttl - 1)).await;
        db.add_message(draft("lobby", "ada", "fresh", now - ttl + 1)).await;

        let discarded = db.cleanup(ttl).await;
        assert_eq!(discarded.len(), 1);
        assert_eq!(discarded[0].content.as_deref(), Some("too old"));

        let remaining = db.get_messages("lobby").await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].content.as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn room_expiry_overrides_the_default() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir).await;
        let now = now_ms();
        let two_hours_ago = now - 2 * 3_600_000;

        db.set_room_expiry("lobby", 1).await;
        assert_eq!(db.get_room_expiry("lobby").await, Some(1));
        assert_eq!(db.get_room_expiry("other").await, None);

        db.add_message(draft("lobby", "ada", "short lived", two_hours_ago)).await;
        db.add_message(draft("other", "ada", "default ttl", two_hours_ago)).await;

        // default of 24h would have kept both; the 1h override purges lobby
        let discarded = db.cleanup(24 * 3_600_000).await;
        assert_eq!(discarded.len(), 1);
        assert_eq!(discarded[0].room_id, "lobby");
    }

    #[tokio::test]
    async fn corrupt_document_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat_data.json");
        tokio::fs::write(&path, "garbage that is neither encrypted nor json").await.unwrap();

        let crypto = Arc::new(StorageCrypto::from_key([3u8; 32]));
        let db = ChatDb::open(path, crypto).await;
        assert!(db.get_messages("lobby").await.is_empty());
    }

    #[tokio::test]
    async fn legacy_plaintext_document_is_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat_data.json");
        let legacy = serde_json::json!({
            "messages": [{
                "id": "legacy1",
                "room_id": "lobby",
                "nickname": "ada",
                "content": "from before encryption",
                "type": "text",
                "timestamp": 1000u64
            }]
        });
        tokio::fs::write(&path, legacy.to_string()).await.unwrap();

        let crypto = Arc::new(StorageCrypto::from_key([3u8; 32]));
        let db = ChatDb::open(path, crypto).await;
        let history = db.get_messages("lobby").await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, "legacy1");
    }

    #[tokio::test]
    async fn document_survives_a_reopen_encrypted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat_data.json");
        let crypto = Arc::new(StorageCrypto::from_key([3u8; 32]));

        let db = ChatDb::open(path.clone(), crypto.clone()).await;
        let stored = db.add_message(draft("lobby", "ada", "durable", 1000)).await;

        // the write is fire-and-forget; wait for it to land
        let mut persisted = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if let Ok(raw) = tokio::fs::read_to_string(&path).await {
                if crypto.decrypt_str(&raw).is_ok() {
                    persisted = true;
                    break;
                }
            }
        }
        assert!(persisted, "async document write never landed");

        // on-disk form is not plaintext
        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(!raw.contains("durable"));

        let reopened = ChatDb::open(path, crypto).await;
        let history = reopened.get_messages("lobby").await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, stored.id);
    }
}
