//! Optional YAML config file, merged with command-line flags.
//!
//! ```yaml
//! store: s3://eu-west-1
//! encryption_policy: require_uniform
//! staging_dir: /mnt/scratch
//! limits:
//!   max_entry_bytes: 536870912
//!   max_entries: 20000
//! ```
//!
//! Flags (and `ARTIFACT_MERGE_STORE`) take precedence over the file.

use anyhow::Context;
use artifact_merge::{EncryptionPolicy, MergeLimits, MergeLimitsOverrides, StagingArea};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::args::Cli;

pub const DEFAULT_STORE: &str = "s3://";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub store: Option<String>,
    pub encryption_policy: Option<EncryptionPolicy>,
    pub staging_dir: Option<PathBuf>,
    #[serde(default)]
    pub limits: MergeLimitsOverrides,
}

/// Effective settings for one invocation.
#[derive(Debug)]
pub struct Settings {
    pub store: String,
    pub policy: EncryptionPolicy,
    pub limits: MergeLimits,
    pub staging: StagingArea,
}

pub fn load_file(path: &Path) -> anyhow::Result<FileConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(FileConfig::default());
    }
    serde_yaml::from_str(&raw).with_context(|| format!("failed to parse YAML in {}", path.display()))
}

pub fn resolve(cli: &Cli, file: FileConfig) -> Settings {
    let store = cli
        .store
        .clone()
        .or(file.store)
        .unwrap_or_else(|| DEFAULT_STORE.to_string());
    let policy = cli
        .encryption_policy
        .or(file.encryption_policy)
        .unwrap_or_default();
    let staging = match cli.staging_dir.clone().or(file.staging_dir) {
        Some(dir) => StagingArea::in_dir(dir),
        None => StagingArea::system(),
    };

    Settings {
        store,
        policy,
        limits: MergeLimits::default().apply(file.limits),
        staging,
    }
}
