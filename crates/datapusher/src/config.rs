//! Worker configuration
//!
//! Built once per process (usually from `DATAPUSHER_*` environment variables)
//! and passed by reference into every pipeline stage.

use anyhow::Context;
use datapusher_common::checksum::ChecksumAlgorithm;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

const ENV_PREFIX: &str = "DATAPUSHER_";

/// Source download limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Whole-request timeout for the source download
    pub timeout_secs: u64,
    /// Largest body accepted, before and after gzip decompression
    pub max_content_length: u64,
    /// Redirect hops followed before giving up
    pub max_redirects: usize,
    pub hash_algorithm: ChecksumAlgorithm,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_content_length: 10 * 1024 * 1024,
            max_redirects: 5,
            hash_algorithm: ChecksumAlgorithm::Md5,
        }
    }
}

/// Structure detection and row validation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SniffConfig {
    /// Bytes inspected for binary content and delimiter guessing
    pub sample_bytes: usize,
    /// Data rows used for header and type inference
    pub sample_rows: usize,
    /// Fraction of malformed rows above which the job fails
    pub max_malformed_ratio: f64,
}

impl Default for SniffConfig {
    fn default() -> Self {
        Self {
            sample_bytes: 64 * 1024,
            sample_rows: 1000,
            max_malformed_ratio: 0.1,
        }
    }
}

/// Datastore delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Records per `datastore_create` call
    pub chunk_size: usize,
    /// Approximate serialized size cap per call
    pub chunk_max_bytes: usize,
    /// Retries for a chunk after a transport failure
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: 2000,
            chunk_max_bytes: 8 * 1024 * 1024,
            max_retries: 3,
            retry_backoff_ms: 500,
        }
    }
}

impl LoaderConfig {
    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}

/// Main worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PusherConfig {
    /// Timeout for each CKAN action call
    pub api_timeout_secs: u64,
    /// Overall job timeout; 0 disables it
    pub job_timeout_secs: u64,
    /// Verify TLS certificates on CKAN and source hosts
    pub ssl_verify: bool,
    pub fetch: FetchConfig,
    pub sniff: SniffConfig,
    pub loader: LoaderConfig,
}

impl Default for PusherConfig {
    fn default() -> Self {
        Self {
            api_timeout_secs: 60,
            job_timeout_secs: 0,
            ssl_verify: true,
            fetch: FetchConfig::default(),
            sniff: SniffConfig::default(),
            loader: LoaderConfig::default(),
        }
    }
}

impl PusherConfig {
    /// Load configuration from `DATAPUSHER_*` environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let config = Self {
            api_timeout_secs: env_or("API_TIMEOUT_SECS", defaults.api_timeout_secs)?,
            job_timeout_secs: env_or("JOB_TIMEOUT_SECS", defaults.job_timeout_secs)?,
            ssl_verify: env_or("SSL_VERIFY", defaults.ssl_verify)?,
            fetch: FetchConfig {
                timeout_secs: env_or("DOWNLOAD_TIMEOUT_SECS", defaults.fetch.timeout_secs)?,
                max_content_length: env_or(
                    "MAX_CONTENT_LENGTH",
                    defaults.fetch.max_content_length,
                )?,
                max_redirects: env_or("MAX_REDIRECTS", defaults.fetch.max_redirects)?,
                hash_algorithm: env_or("HASH_ALGORITHM", defaults.fetch.hash_algorithm)?,
            },
            sniff: SniffConfig {
                sample_bytes: env_or("SAMPLE_BYTES", defaults.sniff.sample_bytes)?,
                sample_rows: env_or("SAMPLE_ROWS", defaults.sniff.sample_rows)?,
                max_malformed_ratio: env_or(
                    "MAX_MALFORMED_RATIO",
                    defaults.sniff.max_malformed_ratio,
                )?,
            },
            loader: LoaderConfig {
                chunk_size: env_or("CHUNK_SIZE", defaults.loader.chunk_size)?,
                chunk_max_bytes: env_or("CHUNK_MAX_BYTES", defaults.loader.chunk_max_bytes)?,
                max_retries: env_or("MAX_RETRIES", defaults.loader.max_retries)?,
                retry_backoff_ms: env_or("RETRY_BACKOFF_MS", defaults.loader.retry_backoff_ms)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_timeout_secs == 0 {
            anyhow::bail!("DATAPUSHER_API_TIMEOUT_SECS must be greater than 0");
        }
        if self.fetch.timeout_secs == 0 {
            anyhow::bail!("DATAPUSHER_DOWNLOAD_TIMEOUT_SECS must be greater than 0");
        }
        if self.fetch.max_content_length == 0 {
            anyhow::bail!("DATAPUSHER_MAX_CONTENT_LENGTH must be greater than 0");
        }
        if self.sniff.sample_bytes == 0 || self.sniff.sample_rows == 0 {
            anyhow::bail!("DATAPUSHER_SAMPLE_BYTES and DATAPUSHER_SAMPLE_ROWS must be greater than 0");
        }
        if !(0.0..=1.0).contains(&self.sniff.max_malformed_ratio) {
            anyhow::bail!("DATAPUSHER_MAX_MALFORMED_RATIO must be between 0 and 1");
        }
        if self.loader.chunk_size == 0 || self.loader.chunk_max_bytes == 0 {
            anyhow::bail!("DATAPUSHER_CHUNK_SIZE and DATAPUSHER_CHUNK_MAX_BYTES must be greater than 0");
        }
        Ok(())
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    /// Overall job timeout, if enabled
    pub fn job_timeout(&self) -> Option<Duration> {
        (self.job_timeout_secs > 0).then(|| Duration::from_secs(self.job_timeout_secs))
    }
}

/// Read `DATAPUSHER_{key}`, falling back to `default` when unset
fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let name = format!("{}{}", ENV_PREFIX, key);
    match std::env::var(&name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| anyhow::anyhow!("{}", e))
            .with_context(|| format!("Invalid value for {}: '{}'", name, raw)),
        Err(_) => Ok(default),
    }
}
