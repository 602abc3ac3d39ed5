use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use log::warn;

/// Process configuration, read once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub data_dir: PathBuf,
    pub retention_hours: u32,
    pub grace_period: Duration,
    pub sweep_interval: Duration,
    pub max_upload_bytes: usize,
    pub tls_cert: PathBuf,
    pub tls_key: PathBuf,
}

impl Config {
    pub fn from_env() -> Self {
        Config {
            port: env_or("PORT", 3000),
            data_dir: PathBuf::from(
                env::var("TALKROOM_DATA_DIR").unwrap_or_else(|_| ".".to_string()),
            ),
            retention_hours: env_or("TALKROOM_RETENTION_HOURS", 24),
            grace_period: Duration::from_millis(env_or("TALKROOM_GRACE_MS", 5000)),
            sweep_interval: Duration::from_secs(env_or("TALKROOM_SWEEP_SECS", 3600)),
            max_upload_bytes: env_or::<usize>("TALKROOM_MAX_UPLOAD_MB", 200) * 1024 * 1024,
            tls_cert: PathBuf::from(
                env::var("TALKROOM_TLS_CERT")
                    .unwrap_or_else(|_| "ssl/room/certificate.pem".to_string()),
            ),
            tls_key: PathBuf::from(
                env::var("TALKROOM_TLS_KEY").unwrap_or_else(|_| "ssl/room/private.key".to_string()),
            ),
        }
    }

    pub fn secret_path(&self) -> PathBuf {
        self.data_dir.join(".secret")
    }

    pub fn document_path(&self) -> PathBuf {
        self.data_dir.join("chat_data.json")
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.data_dir.join("storage").join("uploads")
    }

    pub fn default_retention_ms(&self) -> u64 {
        u64::from(self.retention_hours) * 3_600_000
    }
}

fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr + Display,
{
    match env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("ignoring unparseable {key}={raw}, using default {default}");
                default
            }
        },
        Err(_) => default,
    }
}
