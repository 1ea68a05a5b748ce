//! TOML configuration file loading
//!
//! Supports `~/.config/omni/beacon-context/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::pricing::ModelPrice;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct ContextConfigFile {
    /// Storage locations
    #[serde(default)]
    pub storage: StorageFileConfig,

    /// Summarization provider
    #[serde(default)]
    pub provider: ProviderFileConfig,

    /// Compaction behavior
    #[serde(default)]
    pub compaction: CompactionFileConfig,

    /// Model price overrides, keyed by model name
    #[serde(default)]
    pub pricing: HashMap<String, ModelPrice>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StorageFileConfig {
    pub data_dir: Option<String>,
    pub db_path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProviderFileConfig {
    /// OpenAI-compatible base URL, e.g. `https://api.openai.com/v1`
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    /// HTTP timeout in seconds
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CompactionFileConfig {
    /// Summarization timeout in seconds
    pub timeout_secs: Option<u64>,
}

/// Load the TOML config file from the standard path
///
/// Returns `ContextConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> ContextConfigFile {
    config_file_path().map_or_else(ContextConfigFile::default, |path| load_from(&path))
}

/// Load a config file from an explicit path, falling back to defaults
pub fn load_from(path: &Path) -> ContextConfigFile {
    if !path.exists() {
        return ContextConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                ContextConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            ContextConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/omni/beacon-context/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("omni")
            .join("beacon-context")
            .join("config.toml")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_file() {
        let file: ContextConfigFile = toml::from_str(
            r#"
            [storage]
            db_path = "/tmp/context.db"

            [provider]
            base_url = "https://openrouter.ai/api/v1"
            timeout_secs = 30

            [compaction]
            timeout_secs = 45

            [pricing."llama-3.1-8b"]
            input_per_million = 0.05
            output_per_million = 0.08
            "#,
        )
        .unwrap();

        assert_eq!(file.storage.db_path.as_deref(), Some("/tmp/context.db"));
        assert_eq!(file.provider.timeout_secs, Some(30));
        assert_eq!(file.compaction.timeout_secs, Some(45));
        assert_eq!(
            file.pricing["llama-3.1-8b"],
            ModelPrice::new(0.05, 0.08)
        );
    }

    #[test]
    fn test_empty_file_is_default() {
        let file: ContextConfigFile = toml::from_str("").unwrap();
        assert!(file.pricing.is_empty());
        assert!(file.provider.base_url.is_none());
    }

    #[test]
    fn test_unparsable_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[provider\nbase_url = ").unwrap();

        let file = load_from(&path);
        assert!(file.provider.base_url.is_none());
        assert!(load_from(&dir.path().join("missing.toml")).pricing.is_empty());
    }
}
