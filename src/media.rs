use std::path::PathBuf;
use std::sync::Arc;

use bytes::BufMut;
use futures_util::TryStreamExt;
use log::{debug, error, warn};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use warp::http::{Response, StatusCode};
use warp::hyper::Body;
use warp::multipart::FormData;
use warp::Reply;

use crate::crypto::{CryptoError, StorageCrypto};
use crate::now_ms;

pub const URL_PREFIX: &str = "/api/file/";

const ALLOWED_EXTENSIONS: &[&str] =
    &["jpg", "jpeg", "png", "gif", "webp", "mp4", "webm", "mov", "mp3", "wav", "ogg"];

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("no file uploaded")]
    Missing,
    #[error("file exceeds the upload size limit")]
    TooLarge,
    #[error("file type not allowed")]
    ForbiddenType,
    #[error("file not found")]
    NotFound,
    #[error("stored file is corrupt")]
    Corrupt(#[from] CryptoError),
    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),
}

/// Encrypted media storage. Files land on disk as `iv || ciphertext` under
/// opaque names; the url handed back to clients is the retrieval handle.
pub struct MediaStore {
    dir: PathBuf,
    crypto: Arc<StorageCrypto>,
    max_bytes: usize,
}

impl MediaStore {
    pub fn new(dir: PathBuf, crypto: Arc<StorageCrypto>, max_bytes: usize) -> std::io::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(MediaStore { dir, crypto, max_bytes })
    }

    pub async fn store(&self, original_name: &str, bytes: &[u8]) -> Result<String, MediaError> {
        if bytes.len() > self.max_bytes {
            return Err(MediaError::TooLarge);
        }
        let ext = allowed_extension(original_name).ok_or(MediaError::ForbiddenType)?;

        let mut suffix = [0u8; 8];
        OsRng.fill_bytes(&mut suffix);
        let name = format!("{}-{}.{}.enc", now_ms(), hex::encode(suffix), ext);

        let encrypted = self.crypto.encrypt_bytes(bytes);
        tokio::fs::write(self.dir.join(&name), encrypted).await?;
        debug!("stored {} bytes of media as {name}", bytes.len());
        Ok(format!("{URL_PREFIX}{name}"))
    }

    pub async fn open(&self, name: &str) -> Result<(&'static str, Vec<u8>), MediaError> {
        if name.contains('/') || name.contains("..") {
            return Err(MediaError::NotFound);
        }
        let data = match tokio::fs::read(self.dir.join(name)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(MediaError::NotFound),
            Err(e) => return Err(MediaError::Io(e)),
        };
        let plain = self.crypto.decrypt_bytes(&data)?;
        Ok((content_type_for(name), plain))
    }

    /// Best-effort removal by retrieval handle. A file that is already gone
    /// counts as success; anything else is logged and forgotten, since the
    /// message record is the source of truth and the file a derived artifact.
    pub async fn delete_by_url(&self, url: &str) {
        let Some(name) = url.strip_prefix(URL_PREFIX) else {
            debug!("ignoring media path outside the store: {url}");
            return;
        };
        if name.contains('/') || name.contains("..") {
            warn!("refusing to delete suspicious media path: {url}");
            return;
        }
        match tokio::fs::remove_file(self.dir.join(name)).await {
            Ok(()) => debug!("deleted media {name}"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to delete media {name}: {e}"),
        }
    }
}

fn allowed_extension(filename: &str) -> Option<String> {
    let (_, ext) = filename.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    if ALLOWED_EXTENSIONS.contains(&ext.as_str()) && ext.chars().all(|c| c.is_ascii_alphanumeric())
    {
        Some(ext)
    } else {
        None
    }
}

// Content type from the extension preserved in the stored name,
// e.g. 1700000000-ab12.png.enc
fn content_type_for(stored_name: &str) -> &'static str {
    let original = stored_name.strip_suffix(".enc").unwrap_or(stored_name);
    match original.rsplit_once('.').map(|(_, ext)| ext) {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mov") => "video/quicktime",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("ogg") => "audio/ogg",
        _ => "application/octet-stream",
    }
}

fn parse_range(header: &str, len: u64) -> Option<(u64, u64)> {
    if len == 0 {
        return None;
    }
    let spec = header.strip_prefix("bytes=")?;
    let (start_raw, end_raw) = spec.split_once('-')?;
    let start: u64 = if start_raw.is_empty() { 0 } else { start_raw.parse().ok()? };
    let end: u64 = if end_raw.is_empty() { len - 1 } else { end_raw.parse().ok()? };
    let end = end.min(len - 1);
    if start > end {
        return None;
    }
    Some((start, end))
}

// --- HTTP layer for the upload/retrieval contract ---

pub async fn handle_upload(
    form: FormData,
    store: Arc<MediaStore>,
) -> Result<warp::reply::Response, warp::Rejection> {
    let (filename, bytes) = match read_file_part(form).await {
        Ok(part) => part,
        Err(e) => {
            return Ok(json_error(StatusCode::BAD_REQUEST, &e.to_string()));
        }
    };

    match store.store(&filename, &bytes).await {
        Ok(url) => Ok(warp::reply::json(&serde_json::json!({ "url": url })).into_response()),
        Err(e) => {
            error!("upload of {filename} failed: {e}");
            let status = match e {
                MediaError::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
                MediaError::ForbiddenType | MediaError::Missing => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            Ok(json_error(status, &e.to_string()))
        }
    }
}

pub async fn handle_fetch(
    name: String,
    range: Option<String>,
    store: Arc<MediaStore>,
) -> Result<warp::reply::Response, warp::Rejection> {
    let (mime, bytes) = match store.open(&name).await {
        Ok(file) => file,
        Err(MediaError::NotFound) => {
            return Ok(plain_status(StatusCode::NOT_FOUND, "File not found"));
        }
        Err(e) => {
            error!("cannot serve media {name}: {e}");
            return Ok(plain_status(StatusCode::INTERNAL_SERVER_ERROR, "Unreadable file"));
        }
    };

    let total = bytes.len() as u64;
    let response = match range.as_deref().and_then(|r| parse_range(r, total)) {
        Some((start, end)) => {
            let body = bytes[start as usize..=end as usize].to_vec();
            Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header("content-type", mime)
                .header("accept-ranges", "bytes")
                .header("content-range", format!("bytes {start}-{end}/{total}"))
                .header("cache-control", "public, max-age=31536000")
                .body(Body::from(body))
        }
        None => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", mime)
            .header("accept-ranges", "bytes")
            .header("cache-control", "public, max-age=31536000")
            .body(Body::from(bytes)),
    };

    Ok(response.unwrap_or_else(|_| {
        let mut fallback = Response::new(Body::empty());
        *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        fallback
    }))
}

async fn read_file_part(mut form: FormData) -> Result<(String, Vec<u8>), MediaError> {
    while let Ok(Some(part)) = form.try_next().await {
        if part.name() != "file" {
            continue;
        }
        let filename = part.filename().unwrap_or("upload.bin").to_string();
        let bytes = part
            .stream()
            .try_fold(Vec::new(), |mut acc, data| async move {
                acc.put(data);
                Ok(acc)
            })
            .await
            .map_err(|e| {
                error!("multipart read failed: {e}");
                MediaError::Missing
            })?;
        return Ok((filename, bytes));
    }
    Err(MediaError::Missing)
}

fn json_error(status: StatusCode, message: &str) -> warp::reply::Response {
    warp::reply::with_status(
        warp::reply::json(&serde_json::json!({ "error": message })),
        status,
    )
    .into_response()
}

fn plain_status(status: StatusCode, message: &'static str) -> warp::reply::Response {
    warp::reply::with_status(message, status).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store(dir: &tempfile::TempDir, max_bytes: usize) -> MediaStore {
        let crypto = Arc::new(StorageCrypto::from_key([5u8; 32]));
        MediaStore::new(dir.path().join("uploads"), crypto, max_bytes).unwrap()
    }

    #[tokio::test]
    async fn store_and_open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, 1024 * 1024);
        let payload = b"not really a png".to_vec();

        let url = store.store("Cat Photo.PNG", &payload).await.unwrap();
        assert!(url.starts_with(URL_PREFIX));
        assert!(url.ends_with(".png.enc"));

        let name = url.strip_prefix(URL_PREFIX).unwrap();
        let (mime, bytes) = store.open(name).await.unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(bytes, payload);

        // the on-disk copy is not the plaintext
        let raw = std::fs::read(dir.path().join("uploads").join(name)).unwrap();
        assert_ne!(raw, payload);
    }

    #[tokio::test]
    async fn whitelist_and_size_are_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, 16);

        assert!(matches!(
            store.store("evil.php", b"<?php").await,
            Err(MediaError::ForbiddenType)
        ));
        assert!(matches!(
            store.store("noextension", b"data").await,
            Err(MediaError::ForbiddenType)
        ));
        assert!(matches!(
            store.store("big.png", &[0u8; 17]).await,
            Err(MediaError::TooLarge)
        ));
    }

    #[tokio::test]
    async fn delete_by_url_tolerates_missing_and_foreign_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, 1024);

        let url = store.store("clip.mp3", b"audio bytes").await.unwrap();
        store.delete_by_url(&url).await;
        let name = url.strip_prefix(URL_PREFIX).unwrap();
        assert!(matches!(store.open(name).await, Err(MediaError::NotFound)));

        // already gone, legacy path, traversal attempt: all quiet no-ops
        store.delete_by_url(&url).await;
        store.delete_by_url("/uploads/legacy.png").await;
        store.delete_by_url("/api/file/../../etc/passwd").await;
    }

    #[tokio::test]
    async fn open_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, 1024);
        assert!(matches!(store.open("../secrets").await, Err(MediaError::NotFound)));
    }

    #[test]
    fn range_parsing_matches_the_serving_contract() {
        assert_eq!(parse_range("bytes=0-99", 1000), Some((0, 99)));
        assert_eq!(parse_range("bytes=500-", 1000), Some((500, 999)));
        assert_eq!(parse_range("bytes=-", 1000), Some((0, 999)));
        // end clamped to the file size
        assert_eq!(parse_range("bytes=10-5000", 100), Some((10, 99)));
        assert_eq!(parse_range("bytes=200-100", 1000), None);
        assert_eq!(parse_range("items=0-1", 1000), None);
        assert_eq!(parse_range("bytes=0-10", 0), None);
    }

    #[test]
    fn content_types_come_from_the_original_extension() {
        assert_eq!(content_type_for("123-ab.webm.enc"), "video/webm");
        assert_eq!(content_type_for("123-ab.jpeg.enc"), "image/jpeg");
        assert_eq!(content_type_for("123-ab.bin.enc"), "application/octet-stream");
    }
}
