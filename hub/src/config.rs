// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hub configuration

use camino::{Utf8Path, Utf8PathBuf};
use dropshot::ConfigLogging;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use upgrade_agent_client::UpgradeMode;

/// Where one installation of the database lives, and which catalog it
/// writes.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Installation {
    /// Directory holding the installation's executables (pg_upgrade etc.).
    pub bin_dir: Utf8PathBuf,
    /// Major version of the installation.
    pub major_version: u32,
    /// Catalog version, as it appears in tablespace directory names.
    pub catalog_version: String,
}

/// Inclusive range of ports handed out to the target cluster.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl Default for PortRange {
    fn default() -> Self {
        PortRange { start: 50432, end: 65535 }
    }
}

fn default_disk_free_ratio() -> f64 {
    0.6
}

fn default_agent_port() -> u16 {
    upgrade_common::AGENT_PORT
}

fn default_agent_startup_timeout_secs() -> u64 {
    30
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Configuration for the hub's logger.
    pub log: ConfigLogging,
    /// Directory holding the upgrade and step ledgers.
    pub state_dir: Utf8PathBuf,
    /// TOML file describing the segments of the source cluster.
    pub cluster_file: Utf8PathBuf,
    pub source: Installation,
    pub target: Installation,
    /// Whether pg_upgrade copies the data files or hard-links them.
    pub mode: UpgradeMode,
    /// Fraction of every filesystem holding a data directory that must be
    /// free before the upgrade starts.
    #[serde(default = "default_disk_free_ratio")]
    pub disk_free_ratio: f64,
    /// Address segments by hostname rather than IP address when one host
    /// reaches another.
    #[serde(default)]
    pub use_hba_hostnames: bool,
    /// Port the source coordinator listens on.
    pub source_coordinator_port: u16,
    #[serde(default)]
    pub temp_port_range: PortRange,
    /// Port every agent listens on.
    #[serde(default = "default_agent_port")]
    pub agent_port: u16,
    /// How long to wait for agents to become reachable.
    #[serde(default = "default_agent_startup_timeout_secs")]
    pub agent_startup_timeout_secs: u64,
}

impl Config {
    pub fn agent_startup_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_startup_timeout_secs)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config from {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("Failed to parse config from {path}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
    #[error("Invalid config in {path}: {message}")]
    Invalid { path: Utf8PathBuf, message: String },
}

impl Config {
    /// Load a `Config` from the given TOML file
    pub fn from_file(path: &Utf8Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io { path: path.into(), err })?;
        let config: Config = toml::from_str(&contents)
            .map_err(|err| ConfigError::Parse { path: path.into(), err })?;
        config
            .validate()
            .map_err(|message| ConfigError::Invalid { path: path.into(), message })?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.disk_free_ratio) {
            return Err(format!(
                "disk_free_ratio {} is not between 0 and 1",
                self.disk_free_ratio
            ));
        }
        if self.temp_port_range.start > self.temp_port_range.end {
            return Err(format!(
                "temp_port_range starts at {} but ends at {}",
                self.temp_port_range.start, self.temp_port_range.end
            ));
        }
        Ok(())
    }
}
