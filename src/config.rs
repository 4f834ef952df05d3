//! Runtime configuration.
//!
//! Loaded from environment variables at startup; a `.env` file is honoured for
//! local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use uuid::Uuid;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Bounds applied while ingesting an uploaded archive.
#[derive(Clone, Debug)]
pub struct IngestLimits {
    pub max_archive_bytes: u64,
    pub max_extracted_bytes: u64,
    pub timeout: Duration,
}

impl Default for IngestLimits {
    fn default() -> Self {
        Self {
            max_archive_bytes: 200 * 1024 * 1024,
            max_extracted_bytes: 1024 * 1024 * 1024,
            timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    /// `None` selects the in-memory repository.
    pub database_url: Option<String>,
    pub data_dir: PathBuf,
    pub ingest: IngestLimits,
    pub max_suspend_data_bytes: usize,
    pub launch_ttl: Duration,
    pub launch_signing_key: Vec<u8>,
    pub progress_webhook_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination.
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let port: u16 = parse_or(&lookup, "PORT", 8081)?;
        let bind_address = SocketAddr::from(([0, 0, 0, 0], port));

        let database_url = lookup("DATABASE_URL").filter(|v| !v.is_empty());
        let data_dir = lookup("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"));

        let defaults = IngestLimits::default();
        let ingest = IngestLimits {
            max_archive_bytes: parse_or(&lookup, "MAX_UPLOAD_BYTES", defaults.max_archive_bytes)?,
            max_extracted_bytes: parse_or(
                &lookup,
                "MAX_EXTRACTED_BYTES",
                defaults.max_extracted_bytes,
            )?,
            timeout: Duration::from_secs(parse_or(
                &lookup,
                "INGEST_TIMEOUT_SECS",
                defaults.timeout.as_secs(),
            )?),
        };

        let max_suspend_data_bytes = parse_or(&lookup, "MAX_SUSPEND_DATA_BYTES", 64_000)?;
        let launch_ttl = Duration::from_secs(parse_or(&lookup, "LAUNCH_TTL_SECS", 4 * 3600)?);

        let launch_signing_key = match lookup("LAUNCH_SIGNING_KEY").filter(|v| !v.is_empty()) {
            Some(k) if k.len() < 16 => {
                return Err(ConfigError::InvalidValue(
                    "LAUNCH_SIGNING_KEY".into(),
                    "must be at least 16 bytes".into(),
                ))
            }
            Some(k) => k.into_bytes(),
            None => {
                tracing::warn!("LAUNCH_SIGNING_KEY not set, using a per-process key");
                random_key()
            }
        };

        let progress_webhook_url = lookup("PROGRESS_WEBHOOK_URL").filter(|v| !v.is_empty());

        Ok(Self {
            bind_address,
            database_url,
            data_dir,
            ingest,
            max_suspend_data_bytes,
            launch_ttl,
            launch_signing_key,
            progress_webhook_url,
        })
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(key.to_string(), e.to_string())),
        None => Ok(default),
    }
}

fn random_key() -> Vec<u8> {
    let mut key = Uuid::new_v4().as_bytes().to_vec();
    key.extend_from_slice(Uuid::new_v4().as_bytes());
    key
}
