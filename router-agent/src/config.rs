// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for parsing the router agent's configuration file

use camino::Utf8Path;
use camino::Utf8PathBuf;
use dropshot::ConfigLogging;
use router_agent_types::Versions;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Name of the peer relation used to coordinate upgrades.
pub const DEFAULT_PEER_RELATION: &str = "upgrade-version-a";

/// Configuration for the router agent
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Config {
    /// Directory for state that must survive between invocations (currently
    /// just deferred signals).
    pub state_dir: Utf8PathBuf,
    /// Agent-wide logging configuration.
    pub log: ConfigLogging,
    pub upgrade: UpgradeConfig,
    pub probe: ProbeConfig,
    pub router: RouterConfig,
}

impl Config {
    /// Load a `Config` from the given TOML file
    pub fn from_file(path: &Utf8Path) -> Result<Config, LoadError> {
        let file_contents = std::fs::read_to_string(path)
            .map_err(|err| LoadError::Io { path: path.into(), err })?;
        let config_parsed: Config = toml::from_str(&file_contents)
            .map_err(|err| LoadError::Parse { path: path.into(), err })?;
        Ok(config_parsed)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct UpgradeConfig {
    #[serde(default = "default_peer_relation")]
    pub peer_relation: String,
    /// Binary revision shipped with this build of the agent. Any unit whose
    /// recorded revision differs is outdated.
    pub target_revision: String,
    /// File holding this build's charm version.
    pub charm_version_file: Utf8PathBuf,
    /// File holding the workload version this build installs.
    pub workload_version_file: Utf8PathBuf,
    #[serde(default = "default_post_upgrade_retry_interval_secs")]
    pub post_upgrade_retry_interval_secs: u64,
}

impl UpgradeConfig {
    pub fn post_upgrade_retry_interval(&self) -> Duration {
        Duration::from_secs(self.post_upgrade_retry_interval_secs)
    }

    /// Read the charm and workload versions this build is running.
    pub fn current_versions(&self) -> Result<Versions, LoadError> {
        let read = |path: &Utf8Path| {
            std::fs::read_to_string(path)
                .map(|contents| contents.trim().to_string())
                .map_err(|err| LoadError::Io { path: path.into(), err })
        };
        let charm = read(&self.charm_version_file)?;
        let workload = read(&self.workload_version_file)?;
        Ok(Versions::new(charm, workload))
    }
}

fn default_peer_relation() -> String {
    DEFAULT_PEER_RELATION.to_string()
}

fn default_post_upgrade_retry_interval_secs() -> u64 {
    30
}

/// Settings for the functional read/write health probe.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ProbeConfig {
    /// Application database in which temporary probe collections are
    /// created. The router's user must be able to write here.
    pub database: String,
    #[serde(default = "default_probe_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_probe_retry_interval_secs")]
    pub retry_interval_secs: u64,
}

impl ProbeConfig {
    /// Probe settings for `database` with the default retry policy.
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            max_attempts: default_probe_max_attempts(),
            retry_interval_secs: default_probe_retry_interval_secs(),
        }
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

fn default_probe_max_attempts() -> usize {
    10
}

fn default_probe_retry_interval_secs() -> u64 {
    1
}

/// How to manage and reach the router process on this machine.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RouterConfig {
    pub snap_name: String,
    pub snap_channel: String,
    /// Service name within the snap, e.g. `mongos`.
    pub service: String,
    /// Path to the `mongosh` shell used for probe and admin commands.
    pub mongosh: Utf8PathBuf,
    /// Connection string for the local router.
    pub uri: String,
    /// File holding the upstream config-server connection string. The
    /// router has no upstream cluster until this exists and is non-empty.
    pub config_server_db_file: Utf8PathBuf,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("error reading \"{path}\"")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("error parsing \"{path}\"")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
}
