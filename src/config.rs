use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::assembler::DenyRule;
use crate::batch::DEFAULT_BATCH_SIZE;
use crate::cache::DEFAULT_SHARD_COUNT;
use crate::errors::{Error, Result};
use crate::remote::DEFAULT_API_URL;

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RemoteConfig {
    pub enabled: bool,
    pub base_url: String,
    pub timeout_secs: u64,
    /// Parallel node requests per resolve pass.
    pub workers: usize,
    pub user_agent: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        RemoteConfig {
            enabled: true,
            base_url: DEFAULT_API_URL.to_string(),
            timeout_secs: 30,
            workers: 1,
            user_agent: concat!("osm_geo_import/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ImportConfig {
    pub data_path: PathBuf,
    pub cache_dir: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default = "default_shard_count")]
    pub shard_count: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Skip elements the sink already holds, so a re-run inserts nothing twice.
    #[serde(default)]
    pub skip_existing: bool,
    /// Also insert tagged nodes as point records.
    #[serde(default)]
    pub import_points: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Appended to the built-in tag deny-list.
    #[serde(default)]
    pub deny_rules: Vec<DenyRule>,
    #[serde(default)]
    pub remote: RemoteConfig,
}

fn default_shard_count() -> u64 {
    DEFAULT_SHARD_COUNT
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ImportConfig {
    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 {
            return Err(Error::Config("shard_count must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".into()));
        }
        if self.remote.enabled && self.remote.base_url.is_empty() {
            return Err(Error::Config("remote.base_url is empty".into()));
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: ImportConfig = serde_json::from_str(json)
            .map_err(|err| Error::Config(format!("could not parse config: {err}")))?;
        config.validate()?;
        Ok(config)
    }
}

pub fn load_config(path: &Path) -> Result<ImportConfig> {
    let file = File::open(path)
        .map_err(|err| Error::Config(format!("could not open {}: {err}", path.display())))?;
    let config: ImportConfig = serde_json::from_reader(BufReader::new(file))
        .map_err(|err| Error::Config(format!("could not parse {}: {err}", path.display())))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config = ImportConfig::from_json(
            r#"{"data_path": "map.osm.xz", "cache_dir": "cache", "output_dir": "out"}"#,
        )
        .unwrap();
        assert_eq!(config.shard_count, 1000);
        assert_eq!(config.batch_size, 100);
        assert!(!config.skip_existing);
        assert!(config.deny_rules.is_empty());
        assert!(config.remote.enabled);
        assert_eq!(config.remote.base_url, DEFAULT_API_URL);
        assert_eq!(config.remote.workers, 1);
    }

    #[test]
    fn deny_rules_and_remote_section_parse() {
        let config = ImportConfig::from_json(
            r#"{
                "data_path": "map.osm",
                "cache_dir": "cache",
                "output_dir": "out",
                "batch_size": 5,
                "deny_rules": [
                    {"key": "noexit"},
                    {"key": "highway", "value": "crossing"}
                ],
                "remote": {"enabled": false, "workers": 4}
            }"#,
        )
        .unwrap();
        assert_eq!(config.batch_size, 5);
        assert_eq!(
            config.deny_rules,
            vec![
                DenyRule::DeleteKey { key: "noexit".into() },
                DenyRule::DeleteKeyIfValue {
                    key: "highway".into(),
                    value: "crossing".into()
                },
            ]
        );
        assert!(!config.remote.enabled);
        assert_eq!(config.remote.workers, 4);
        assert_eq!(config.remote.timeout_secs, 30);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let err = ImportConfig::from_json(
            r#"{"data_path": "a", "cache_dir": "b", "output_dir": "c", "batch_size": 0}"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
