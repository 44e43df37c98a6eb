//! Daemon configuration: TOML file + CLI overrides.

use crate::policy::ForwardPolicy;
use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub daemon: DaemonSection,
    #[serde(default)]
    pub policy: ForwardPolicy,
}

/// `[daemon]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonSection {
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
        }
    }
}

fn default_socket_path() -> String {
    "~/.tether/control.sock".to_string()
}

/// Resolved daemon configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub socket_path: PathBuf,
    pub policy: ForwardPolicy,
}

impl HostConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli_socket: Option<&str>) -> anyhow::Result<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)
                    .with_context(|| format!("reading {}", expanded.display()))?;
                toml::from_str::<ConfigFile>(&content)
                    .with_context(|| format!("parsing {}", expanded.display()))?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        let socket_str = cli_socket
            .map(|s| s.to_string())
            .unwrap_or(file_config.daemon.socket_path);

        Ok(Self {
            socket_path: expand_tilde_str(&socket_str),
            policy: file_config.policy,
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if s.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(&s[2..]);
        }
    }
    PathBuf::from(s)
}
