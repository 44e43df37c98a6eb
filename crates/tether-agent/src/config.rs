//! Agent configuration: TOML file + CLI overrides.

use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tether_core::ForwardSpec;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub stall: StallSection,
    #[serde(default, rename = "forward")]
    pub forwards: Vec<ForwardSpec>,
}

/// `[agent]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
    #[serde(default = "default_identity")]
    pub identity: String,
    /// Helper IPC socket; absent disables the helper listener.
    #[serde(default)]
    pub ipc_path: Option<String>,
    #[serde(default = "default_worktree_root")]
    pub worktree_root: String,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            identity: default_identity(),
            ipc_path: None,
            worktree_root: default_worktree_root(),
        }
    }
}

/// `[stall]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct StallSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds of no buffer change before a session counts as stalled.
    #[serde(default = "default_stall_threshold")]
    pub threshold: u64,
    /// Seconds between stall checks.
    #[serde(default = "default_stall_interval")]
    pub check_interval: u64,
}

impl Default for StallSection {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: default_stall_threshold(),
            check_interval: default_stall_interval(),
        }
    }
}

fn default_socket_path() -> String {
    "~/.tether/control.sock".to_string()
}
fn default_identity() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "sandbox".to_string())
}
fn default_worktree_root() -> String {
    "~".to_string()
}
fn default_stall_threshold() -> u64 {
    30
}
fn default_stall_interval() -> u64 {
    5
}
fn default_true() -> bool {
    true
}

/// Resolved agent configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub socket_path: PathBuf,
    pub identity: String,
    pub ipc_path: Option<PathBuf>,
    pub worktree_root: PathBuf,
    pub stall_enabled: bool,
    pub stall_threshold: Duration,
    pub stall_check_interval: Duration,
    pub forwards: Vec<ForwardSpec>,
}

impl AgentConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_socket: Option<&str>,
        cli_identity: Option<&str>,
    ) -> anyhow::Result<Self> {
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
            .unwrap_or(file_config.agent.socket_path);
        let identity = cli_identity
            .map(|s| s.to_string())
            .unwrap_or(file_config.agent.identity);

        Ok(Self {
            socket_path: expand_tilde_str(&socket_str),
            identity,
            ipc_path: file_config.agent.ipc_path.as_deref().map(expand_tilde_str),
            worktree_root: expand_tilde_str(&file_config.agent.worktree_root),
            stall_enabled: file_config.stall.enabled,
            stall_threshold: Duration::from_secs(file_config.stall.threshold),
            stall_check_interval: Duration::from_secs(file_config.stall.check_interval),
            forwards: file_config.forwards,
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if s == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    if s.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(&s[2..]);
        }
    }
    PathBuf::from(s)
}
