use std::sync::Arc;
use std::time::Duration;

use log::info;
use tokio::task::JoinHandle;

use crate::db::ChatDb;
use crate::media::MediaStore;

/// Periodic retention sweep: purge expired messages, then try to delete the
/// media they referenced. Runs on its own timer, independent of connections.
pub fn spawn(
    db: Arc<ChatDb>,
    media: Arc<MediaStore>,
    interval: Duration,
    default_retention_ms: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            run_once(&db, &media, default_retention_ms).await;
        }
    })
}

pub async fn run_once(db: &ChatDb, media: &MediaStore, default_retention_ms: u64) -> usize {
    let discarded = db.cleanup(default_retention_ms).await;
    if discarded.is_empty() {
        return 0;
    }
    info!("retention sweep discarded {} expired messages", discarded.len());
    for msg in &discarded {
        // the record is already gone; a failed file delete only leaks disk
        if let Some(path) = &msg.media_path {
            media.delete_by_url(path).await;
        }
    }
    discarded.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::StorageCrypto;
    use crate::events::{Message, MessageKind};
    use crate::media::URL_PREFIX;
    use crate::now_ms;

    #[tokio::test]
    async fn sweep_purges_expired_messages_and_their_media() {
        let dir = tempfile::tempdir().unwrap();
        let crypto = Arc::new(StorageCrypto::from_key([9u8; 32]));
        let db = ChatDb::open(dir.path().join("chat_data.json"), crypto.clone()).await;
        let media =
            MediaStore::new(dir.path().join("uploads"), crypto, 1024 * 1024).unwrap();

        let url = media.store("old.png", b"stale pixels").await.unwrap();
        let day_ms: u64 = 24 * 3_600_000;
        db.add_message(Message {
            id: String::new(),
            room_id: "x".to_string(),
            nickname: "ada".to_string(),
            content: None,
            kind: MessageKind::Image,
            media_path: Some(url.clone()),
            timestamp: now_ms() - 25 * 3_600_000,
            reply_to: None,
        })
        .await;
        db.add_message(Message {
            id: String::new(),
            room_id: "x".to_string(),
            nickname: "ada".to_string(),
            content: Some("recent".to_string()),
            kind: MessageKind::Text,
            media_path: None,
            timestamp: now_ms() - 3_600_000,
            reply_to: None,
        })
        .await;

        let swept = run_once(&db, &media, day_ms).await;
        assert_eq!(swept, 1);

        let remaining = db.get_messages("x").await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].content.as_deref(), Some("recent"));

        let name = url.strip_prefix(URL_PREFIX).unwrap();
        assert!(media.open(name).await.is_err(), "media should be gone after the sweep");

        // nothing left to do on a second pass
        assert_eq!(run_once(&db, &media, day_ms).await, 0);
    }
}
