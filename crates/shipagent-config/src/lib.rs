//! Configuration file handling for ShipAgent.
//!
//! Loads from `.shipagent.toml` with support for merging a loaded file over
//! compiled-in defaults. Secrets (carrier client id/secret, account number)
//! are deliberately absent from this type — they are resolved from the
//! environment only, by `shipagent-auth`, and never read from this file.
//!
//! # Example
//!
//! ```
//! use shipagent_config::{Config, load_config};
//! use std::path::Path;
//!
//! let config = load_config(Path::new(".")).expect("load config");
//! assert_eq!(config.batch_concurrency(), 5);
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default configuration file name.
pub const CONFIG_FILE: &str = ".shipagent.toml";

pub fn config_path(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE)
}

/// Complete ShipAgent process configuration. See §6 of the design for the
/// full option table this mirrors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub carrier: CarrierConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub rest: RestConfig,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_concurrency(&self) -> usize {
        self.batch.concurrency
    }

    pub fn preview_max_rows(&self) -> usize {
        self.batch.preview_max_rows
    }

    pub fn warning_rows_policy(&self) -> WarningRowsPolicy {
        self.batch.warning_rows_policy
    }

    pub fn labels_output_dir(&self) -> &Path {
        &self.batch.labels_output_dir
    }

    pub fn international_enabled_lanes(&self) -> &[String] {
        &self.batch.international_enabled_lanes
    }

    pub fn is_lane_enabled(&self, country: &str) -> bool {
        self.batch
            .international_enabled_lanes
            .iter()
            .any(|lane| lane == "*" || lane.eq_ignore_ascii_case(country))
    }

    /// Other's non-default fields win; unset fields fall back to self. Used
    /// to layer a parsed `.shipagent.toml` over compiled-in defaults.
    pub fn merge(&self, other: &Config) -> Config {
        Config {
            carrier: CarrierConfig {
                base_url: other
                    .carrier
                    .base_url
                    .as_ref()
                    .or(self.carrier.base_url.as_ref())
                    .cloned(),
            },
            batch: BatchConfig {
                concurrency: if other.batch.concurrency != default_concurrency() {
                    other.batch.concurrency
                } else {
                    self.batch.concurrency
                },
                preview_max_rows: if other.batch.preview_max_rows != default_preview_max_rows() {
                    other.batch.preview_max_rows
                } else {
                    self.batch.preview_max_rows
                },
                warning_rows_policy: other.batch.warning_rows_policy,
                labels_output_dir: if other.batch.labels_output_dir != default_labels_dir() {
                    other.batch.labels_output_dir.clone()
                } else {
                    self.batch.labels_output_dir.clone()
                },
                international_enabled_lanes: if !other.batch.international_enabled_lanes.is_empty()
                {
                    other.batch.international_enabled_lanes.clone()
                } else {
                    self.batch.international_enabled_lanes.clone()
                },
            },
            filter: FilterConfig {
                token_secret: other
                    .filter
                    .token_secret
                    .as_ref()
                    .or(self.filter.token_secret.as_ref())
                    .cloned(),
            },
            rest: RestConfig {
                api_key: other.rest.api_key.as_ref().or(self.rest.api_key.as_ref()).cloned(),
                allowed_origins: if !other.rest.allowed_origins.is_empty() {
                    other.rest.allowed_origins.clone()
                } else {
                    self.rest.allowed_origins.clone()
                },
            },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CarrierConfig {
    /// Test vs production carrier endpoint. `client_id`/`client_secret`/
    /// `account_number` are intentionally not here — see `shipagent-auth`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningRowsPolicy {
    Skip,
    Process,
    Ask,
}

impl Default for WarningRowsPolicy {
    fn default() -> Self {
        WarningRowsPolicy::Ask
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_preview_max_rows")]
    pub preview_max_rows: usize,
    #[serde(default)]
    pub warning_rows_policy: WarningRowsPolicy,
    #[serde(default = "default_labels_dir")]
    pub labels_output_dir: PathBuf,
    #[serde(default)]
    pub international_enabled_lanes: Vec<String>,
}

fn default_concurrency() -> usize {
    5
}
fn default_preview_max_rows() -> usize {
    50
}
fn default_labels_dir() -> PathBuf {
    PathBuf::from("./labels")
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            preview_max_rows: default_preview_max_rows(),
            warning_rows_policy: WarningRowsPolicy::default(),
            labels_output_dir: default_labels_dir(),
            international_enabled_lanes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    /// HMAC key for FilterSpec signatures. Must be at least 32 bytes; enforced
    /// by `shipagent-filter` at signing time, not here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_secret: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

/// Loads `.shipagent.toml` from `dir` if present and merges it over defaults.
/// Missing file is not an error; a malformed one is.
pub fn load_config(dir: &Path) -> Result<Config> {
    let path = config_path(dir);
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents =
        std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    let parsed: Config =
        toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Config::default().merge(&parsed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_design_table() {
        let config = Config::default();
        assert_eq!(config.batch_concurrency(), 5);
        assert_eq!(config.preview_max_rows(), 50);
    }

    #[test]
    fn wildcard_lane_enables_all_destinations() {
        let mut config = Config::default();
        config.batch.international_enabled_lanes = vec!["*".into()];
        assert!(config.is_lane_enabled("MX"));
        assert!(config.is_lane_enabled("DE"));
    }

    #[test]
    fn explicit_lane_list_is_case_insensitive() {
        let mut config = Config::default();
        config.batch.international_enabled_lanes = vec!["ca".into(), "MX".into()];
        assert!(config.is_lane_enabled("CA"));
        assert!(config.is_lane_enabled("mx"));
        assert!(!config.is_lane_enabled("DE"));
    }

    #[test]
    fn merge_prefers_non_default_fields_from_other() {
        let base = Config::default();
        let mut other = Config::default();
        other.batch.concurrency = 10;
        let merged = base.merge(&other);
        assert_eq!(merged.batch_concurrency(), 10);
        assert_eq!(merged.preview_max_rows(), 50);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(dir.path()).unwrap();
        assert_eq!(config.batch_concurrency(), 5);
    }

    #[test]
    fn loads_and_merges_a_real_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            config_path(dir.path()),
            "[batch]\nconcurrency = 8\n",
        )
        .unwrap();
        let config = load_config(dir.path()).unwrap();
        assert_eq!(config.batch_concurrency(), 8);
    }
}
