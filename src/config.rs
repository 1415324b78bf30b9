// ABOUTME: Configuration from crossbar.toml with environment overrides.
// ABOUTME: Every optional field has a serde default so a bare file still works.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub bus: BusSettings,
    #[serde(default)]
    pub workspace: WorkspaceSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Backend type to instantiate per session ("acp", "cli", "mock").
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Agent binary for process-backed backends.
    #[serde(default = "default_binary")]
    pub binary: String,
    /// Per-prompt timeout enforced by the backend.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Extra arguments for the agent binary.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Seconds a warm session may sit idle before the sweep removes it.
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Seconds between stale-session sweeps.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Session names warmed at startup so the first real message skips
    /// backend start-up latency.
    #[serde(default)]
    pub pre_warm: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSettings {
    /// Broadcast buffer size per stream; slow subscribers past this lag.
    #[serde(default = "default_bus_capacity")]
    pub capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceSettings {
    /// Root directory holding per-session workspaces and the database.
    #[serde(default = "default_workspace_root")]
    pub root: String,
}

fn default_backend() -> String {
    "acp".to_string()
}

fn default_binary() -> String {
    "claude-code-acp".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_keep_alive_secs() -> u64 {
    3600
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_bus_capacity() -> usize {
    256
}

fn default_workspace_root() -> String {
    "./workspace".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            binary: default_binary(),
            timeout_secs: default_timeout_secs(),
            extra_args: Vec::new(),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            keep_alive_secs: default_keep_alive_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            pre_warm: Vec::new(),
        }
    }
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            capacity: default_bus_capacity(),
        }
    }
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
        }
    }
}

impl Config {
    /// Load `crossbar.toml` when present, then apply env overrides.
    pub fn load() -> Result<Self> {
        Self::load_from("crossbar.toml")
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str::<Config>(&content)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            Config::default()
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(backend) = std::env::var("CROSSBAR_BACKEND") {
            self.agent.backend = backend;
        }
        if let Ok(binary) = std::env::var("CROSSBAR_AGENT_BINARY") {
            self.agent.binary = binary;
        }
        if let Ok(root) = std::env::var("CROSSBAR_WORKSPACE") {
            self.workspace.root = root;
        }
        if let Ok(secs) = std::env::var("CROSSBAR_KEEP_ALIVE_SECS") {
            if let Ok(secs) = secs.parse() {
                self.pool.keep_alive_secs = secs;
            }
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.pool.keep_alive_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.pool.sweep_interval_secs)
    }

    /// Backend settings template handed to the pool; the pool injects the
    /// per-session working directory.
    pub fn backend_settings(&self) -> serde_json::Value {
        serde_json::json!({
            "binary": self.agent.binary,
            "timeout_secs": self.agent.timeout_secs,
            "extra_args": self.agent.extra_args,
        })
    }
}
