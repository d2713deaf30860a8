//! Merged configuration: built-in defaults < `~/.config/coi/config.toml` <
//! CLI flags, layered with the `config` crate.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::naming::{DEFAULT_MAX_SLOTS, DEFAULT_PREFIX};
use crate::network::DEFAULT_REFRESH_INTERVAL;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkModeName {
    Open,
    Restricted,
    Allowlist,
}

impl Default for NetworkModeName {
    fn default() -> Self {
        NetworkModeName::Open
    }
}

/// Raw, on-disk/CLI-facing shape. Boolean fields that have a meaningful
/// "unset" state are `Option<bool>` rather than `bool` — collapsing them to
/// a concrete default before the file layer has merged in risks a later,
/// lower-priority layer overwriting an explicit `false` with its own
/// default `true` (the lossy-boolean-merge pitfall the design notes call
/// out). `Config::resolve` is where `Option<bool>` becomes `bool`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawConfig {
    pub hypervisor_bin: Option<String>,
    pub container_prefix: Option<String>,
    pub max_slots: Option<u32>,
    pub image: Option<String>,
    pub base_dir: Option<PathBuf>,
    pub tool: Option<String>,
    pub network_mode: Option<NetworkModeName>,
    pub allowlist_domains: Option<Vec<String>>,
    pub allow_local_network_access: Option<bool>,
    pub persistent: Option<bool>,
    pub refresh_interval_secs: Option<u64>,
}

impl RawConfig {
    /// Merge `other` over `self`: any field `other` sets wins, `None` falls
    /// through to `self`'s value. Used to layer CLI flags (highest
    /// priority) over a loaded file over built-in defaults.
    pub fn merge(self, other: RawConfig) -> RawConfig {
        RawConfig {
            hypervisor_bin: other.hypervisor_bin.or(self.hypervisor_bin),
            container_prefix: other.container_prefix.or(self.container_prefix),
            max_slots: other.max_slots.or(self.max_slots),
            image: other.image.or(self.image),
            base_dir: other.base_dir.or(self.base_dir),
            tool: other.tool.or(self.tool),
            network_mode: other.network_mode.or(self.network_mode),
            allowlist_domains: other.allowlist_domains.or(self.allowlist_domains),
            allow_local_network_access: other.allow_local_network_access.or(self.allow_local_network_access),
            persistent: other.persistent.or(self.persistent),
            refresh_interval_secs: other.refresh_interval_secs.or(self.refresh_interval_secs),
        }
    }
}

/// Fully resolved configuration — every field has a concrete value.
#[derive(Debug, Clone)]
pub struct Config {
    pub hypervisor_bin: String,
    pub container_prefix: String,
    pub max_slots: u32,
    pub image: String,
    pub base_dir: PathBuf,
    pub tool: String,
    pub network_mode: NetworkModeName,
    pub allowlist_domains: Vec<String>,
    pub allow_local_network_access: bool,
    pub persistent: bool,
    pub refresh_interval: std::time::Duration,
}

const DEFAULT_IMAGE: &str = "images:debian/12";

impl Default for RawConfig {
    fn default() -> Self {
        RawConfig {
            hypervisor_bin: None,
            container_prefix: None,
            max_slots: None,
            image: None,
            base_dir: None,
            tool: None,
            network_mode: None,
            allowlist_domains: None,
            allow_local_network_access: None,
            persistent: None,
            refresh_interval_secs: None,
        }
    }
}

fn built_in_defaults() -> RawConfig {
    RawConfig {
        hypervisor_bin: Some("incus".to_string()),
        container_prefix: Some(DEFAULT_PREFIX.to_string()),
        max_slots: Some(DEFAULT_MAX_SLOTS),
        image: Some(DEFAULT_IMAGE.to_string()),
        base_dir: default_base_dir(),
        tool: Some("claude".to_string()),
        network_mode: Some(NetworkModeName::Open),
        allowlist_domains: Some(Vec::new()),
        allow_local_network_access: Some(false),
        persistent: Some(false),
        refresh_interval_secs: Some(DEFAULT_REFRESH_INTERVAL.as_secs()),
    }
}

fn default_base_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "coi", "coi").map(|d| d.data_dir().to_path_buf())
}

/// Load `~/.config/coi/config.toml` (if present) via the `config` crate,
/// layered over built-in defaults. `file_path` lets tests and the `--config`
/// flag point at an arbitrary location instead.
pub fn load_file(file_path: Option<&Path>) -> Result<RawConfig> {
    let default_path = directories::ProjectDirs::from("dev", "coi", "coi")
        .map(|d| d.config_dir().join("config.toml"));
    let path = file_path.map(|p| p.to_path_buf()).or(default_path);

    let Some(path) = path else {
        return Ok(RawConfig::default());
    };
    if !path.is_file() {
        return Ok(RawConfig::default());
    }

    let source = config::File::from(path.clone()).required(false);
    let built = config::Config::builder()
        .add_source(source)
        .build()
        .with_context(|| format!("loading config file {}", path.display()))?;

    built
        .try_deserialize()
        .with_context(|| format!("parsing config file {}", path.display()))
}

/// Collapse a layered `RawConfig` (defaults < file < CLI) into a fully
/// resolved `Config`.
pub fn resolve(layered: RawConfig) -> Config {
    let merged = built_in_defaults().merge(layered);
    Config {
        hypervisor_bin: merged.hypervisor_bin.unwrap_or_else(|| "incus".to_string()),
        container_prefix: merged.container_prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
        max_slots: merged.max_slots.unwrap_or(DEFAULT_MAX_SLOTS),
        image: merged.image.unwrap_or_else(|| DEFAULT_IMAGE.to_string()),
        base_dir: merged.base_dir.unwrap_or_else(|| PathBuf::from(".coi")),
        tool: merged.tool.unwrap_or_else(|| "claude".to_string()),
        network_mode: merged.network_mode.unwrap_or_default(),
        allowlist_domains: merged.allowlist_domains.unwrap_or_default(),
        allow_local_network_access: merged.allow_local_network_access.unwrap_or(false),
        persistent: merged.persistent.unwrap_or(false),
        refresh_interval: std::time::Duration::from_secs(
            merged.refresh_interval_secs.unwrap_or(DEFAULT_REFRESH_INTERVAL.as_secs()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_prefers_higher_priority_when_set() {
        let base = RawConfig {
            persistent: Some(false),
            ..Default::default()
        };
        let override_ = RawConfig {
            persistent: Some(true),
            ..Default::default()
        };
        let merged = base.merge(override_);
        assert_eq!(merged.persistent, Some(true));
    }

    #[test]
    fn merge_falls_through_to_base_when_unset() {
        let base = RawConfig {
            persistent: Some(true),
            ..Default::default()
        };
        let override_ = RawConfig::default();
        let merged = base.merge(override_);
        assert_eq!(merged.persistent, Some(true));
    }

    #[test]
    fn explicit_false_is_not_overwritten_by_a_default_true() {
        // Regression for the lossy-boolean pitfall: an explicit `false` set
        // by a higher-priority layer must survive merging with a layer that
        // left the field unset, not get treated as "unset" itself.
        let low_priority_default = RawConfig {
            persistent: Some(true),
            ..Default::default()
        };
        let explicit_false_from_cli = RawConfig {
            persistent: Some(false),
            ..Default::default()
        };
        let merged = low_priority_default.merge(explicit_false_from_cli);
        assert_eq!(merged.persistent, Some(false));
    }

    #[test]
    fn resolve_fills_every_field_from_built_in_defaults() {
        let resolved = resolve(RawConfig::default());
        assert_eq!(resolved.hypervisor_bin, "incus");
        assert_eq!(resolved.max_slots, DEFAULT_MAX_SLOTS);
        assert!(!resolved.persistent);
    }

    #[test]
    fn missing_config_file_yields_defaults_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist.toml");
        let raw = load_file(Some(&missing)).unwrap();
        assert!(raw.hypervisor_bin.is_none());
    }
}
