//! Configuration management for Beacon context
//!
//! Precedence is environment, then the TOML file, then built-in defaults.

pub mod file;

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::context::CompactionConfig;
use crate::pricing::PriceTable;
use crate::{Error, Result};

use self::file::ContextConfigFile;

/// Default OpenAI-compatible endpoint
pub const DEFAULT_LLM_URL: &str = "https://api.openai.com/v1";

const DEFAULT_PROVIDER_TIMEOUT_SECS: u64 = 60;
const DEFAULT_COMPACT_TIMEOUT_SECS: u64 = 90;

/// Beacon context configuration
#[derive(Debug)]
pub struct Config {
    /// Path to data directory
    pub data_dir: PathBuf,

    /// Path to the `SQLite` database
    pub db_path: PathBuf,

    /// Summarization provider
    pub provider: ProviderConfig,

    /// Compaction behavior
    pub compaction: CompactionConfig,

    /// Model prices used by the usage ledger
    pub pricing: PriceTable,
}

/// Summarization provider configuration
#[derive(Debug)]
pub struct ProviderConfig {
    /// OpenAI-compatible base URL
    pub base_url: url::Url,

    /// Bearer token, if the endpoint needs one
    pub api_key: Option<SecretString>,

    /// HTTP request timeout
    pub timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables and the config file
    ///
    /// # Errors
    ///
    /// Returns error if a configured URL or number is invalid
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        let config = Self::resolve(fc, |key| std::env::var(key).ok())?;

        // Ensure data dir exists
        std::fs::create_dir_all(&config.data_dir).ok();

        Ok(config)
    }

    /// Overlay `env` on top of a parsed config file
    ///
    /// # Errors
    ///
    /// Returns error if a configured URL or number is invalid
    pub fn resolve(fc: ContextConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        // Data directory (~/.local/share/omni/beacon-context on Linux)
        let data_dir = env("BEACON_CONTEXT_DATA_DIR")
            .or(fc.storage.data_dir)
            .map_or_else(default_data_dir, PathBuf::from);

        let db_path = env("BEACON_CONTEXT_DB")
            .or(fc.storage.db_path)
            .map_or_else(|| data_dir.join("context.db"), PathBuf::from);

        let base_url = env("BEACON_LLM_URL")
            .or(fc.provider.base_url)
            .unwrap_or_else(|| DEFAULT_LLM_URL.to_string());
        let base_url = url::Url::parse(&base_url)
            .map_err(|e| Error::Config(format!("invalid provider URL `{base_url}`: {e}")))?;

        let api_key = env("BEACON_LLM_API_KEY")
            .or_else(|| env("OPENAI_API_KEY"))
            .or(fc.provider.api_key)
            .filter(|key| !key.is_empty())
            .map(SecretString::from);

        let provider_timeout = fc
            .provider
            .timeout_secs
            .unwrap_or(DEFAULT_PROVIDER_TIMEOUT_SECS);

        let compact_timeout = match env("BEACON_COMPACT_TIMEOUT_SECS") {
            Some(raw) => raw.trim().parse().map_err(|_| {
                Error::Config(format!(
                    "BEACON_COMPACT_TIMEOUT_SECS must be a number of seconds (got `{raw}`)"
                ))
            })?,
            None => fc
                .compaction
                .timeout_secs
                .unwrap_or(DEFAULT_COMPACT_TIMEOUT_SECS),
        };

        Ok(Self {
            data_dir,
            db_path,
            provider: ProviderConfig {
                base_url,
                api_key,
                timeout: Duration::from_secs(provider_timeout),
            },
            compaction: CompactionConfig {
                summarize_timeout: Duration::from_secs(compact_timeout),
            },
            pricing: PriceTable::with_overrides(fc.pricing),
        })
    }
}

fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".local/share/omni/beacon-context"),
        |d| d.data_dir().join("omni").join("beacon-context"),
    )
}
