//! Configuration management for the CLI

use anyhow::{Context, Result};
use kprof_lib::{AnalysisTool, ProfileLauncher, TunnelSettings};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// CLI configuration, read once at startup
///
/// Every field is optional; command-line flags win over the file and the
/// file wins over built-in defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CliConfig {
    /// Namespace used when `-n` is not given
    pub default_namespace: Option<String>,
    /// Viewer command line, e.g. `["go", "tool", "pprof"]`
    pub pprof_command: Option<Vec<String>>,
    /// Address the local tunnel listens on
    pub bind_address: Option<IpAddr>,
    /// Seconds in-flight connections get to finish on shutdown
    pub shutdown_grace_secs: Option<u64>,
    /// Host name the viewer uses to reach the tunnel
    pub target_host: Option<String>,
}

impl CliConfig {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load configuration from a file; a missing file means defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Get the configuration file path
    fn config_path() -> Option<PathBuf> {
        dirs_next::home_dir().map(|home| home.join(".config").join("kprof").join("config.json"))
    }

    /// Namespace from the flag, else from the file
    pub fn namespace(&self, flag: Option<&str>) -> Option<String> {
        flag.filter(|ns| !ns.is_empty())
            .map(str::to_string)
            .or_else(|| self.default_namespace.clone())
    }

    pub fn tunnel_settings(&self) -> TunnelSettings {
        let defaults = TunnelSettings::default();
        TunnelSettings {
            bind_address: self.bind_address.unwrap_or(defaults.bind_address),
            grace: self
                .shutdown_grace_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.grace),
        }
    }

    pub fn launcher(&self) -> Result<ProfileLauncher> {
        let tool = match &self.pprof_command {
            Some(argv) => AnalysisTool::from_argv(argv).context("Invalid pprof_command")?,
            None => AnalysisTool::default(),
        };

        let launcher = ProfileLauncher::new(tool);
        Ok(match &self.target_host {
            Some(host) => launcher.with_target_host(host.clone()),
            None => launcher,
        })
    }
}
