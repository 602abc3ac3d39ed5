use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use thiserror::Error;
use tokio::sync::Mutex;

const CACHE_MAX_SIZE: usize = 500;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum TranslateError {
    #[error("translation request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("translation backend returned an unusable response")]
    BadResponse,
    #[error("translation timed out")]
    Timeout,
}

/// The outbound translation call, kept behind a trait so the chat path can
/// be tested without a network.
#[async_trait]
pub trait TranslationBackend: Send + Sync {
    async fn fetch(&self, text: &str, source: &str, target: &str)
        -> Result<String, TranslateError>;
}

/// MyMemory public translation API.
#[derive(Default)]
pub struct MyMemory {
    http: reqwest::Client,
}

impl MyMemory {
    pub fn new() -> Self {
        MyMemory { http: reqwest::Client::new() }
    }
}

#[async_trait]
impl TranslationBackend for MyMemory {
    async fn fetch(
        &self,
        text: &str,
        source: &str,
        target: &str,
    ) -> Result<String, TranslateError> {
        let langpair = format!("{source}|{target}");
        let response: serde_json::Value = self
            .http
            .get("https://api.mymemory.translated.net/get")
            .query(&[("q", text), ("langpair", langpair.as_str())])
            .send()
            .await?
            .json()
            .await?;

        if response["responseStatus"].as_i64() == Some(200) {
            if let Some(translated) = response["responseData"]["translatedText"].as_str() {
                return Ok(translated.to_string());
            }
        }
        debug!("translation backend rejected the request: {response}");
        Err(TranslateError::BadResponse)
    }
}

/// Caching, time-capped translation front. Chat must never block on the
/// third-party backend: a slow request loses the race against the timeout
/// and the caller falls back to the original text.
pub struct TranslationService {
    backend: Arc<dyn TranslationBackend>,
    cache: Mutex<TranslationCache>,
    timeout: Duration,
}

impl TranslationService {
    pub fn new(backend: Arc<dyn TranslationBackend>) -> Self {
        Self::with_timeout(backend, REQUEST_TIMEOUT)
    }

    pub fn with_timeout(backend: Arc<dyn TranslationBackend>, timeout: Duration) -> Self {
        TranslationService {
            backend,
            cache: Mutex::new(TranslationCache::new(CACHE_MAX_SIZE)),
            timeout,
        }
    }

    pub async fn translate(
        &self,
        text: &str,
        source: Option<&str>,
        target: &str,
    ) -> Result<String, TranslateError> {
        if text.is_empty() {
            return Ok(text.to_string());
        }

        let source = match source {
            None | Some("") | Some("auto") => "autodetect".to_string(),
            Some(code) => lang_code(code).to_string(),
        };
        let target = lang_code(target).to_string();

        if source == target && source != "autodetect" {
            return Ok(text.to_string());
        }

        let cache_key = format!("{text}|{source}|{target}");
        if let Some(hit) = self.cache.lock().await.get(&cache_key) {
            return Ok(hit);
        }

        let translated =
            match tokio::time::timeout(self.timeout, self.backend.fetch(text, &source, &target))
                .await
            {
                Ok(Ok(translated)) => translated,
                Ok(Err(e)) => {
                    warn!("translation failed: {e}");
                    return Err(e);
                }
                Err(_) => {
                    warn!("translation timed out after {:?}", self.timeout);
                    return Err(TranslateError::Timeout);
                }
            };

        // a translation identical to the input is not worth caching
        if translated.to_lowercase() != text.to_lowercase() {
            self.cache.lock().await.insert(cache_key, translated.clone());
        }
        Ok(translated)
    }
}

// MyMemory language codes; everything else passes through unchanged.
fn lang_code(code: &str) -> &str {
    match code {
        "ph" => "tl", // Filipino -> Tagalog
        "auto" => "autodetect",
        other => other,
    }
}

struct TranslationCache {
    entries: HashMap<String, String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl TranslationCache {
    fn new(capacity: usize) -> Self {
        TranslationCache { entries: HashMap::new(), order: VecDeque::new(), capacity }
    }

    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: String, value: String) {
        if self.entries.insert(key.clone(), value).is_some() {
            return;
        }
        self.order.push_back(key);
        while self.entries.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }
}
