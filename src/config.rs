//! Configuration for the mesh runtime.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (AGENT_MESH_*)
//! 2. Config file (.agent-mesh/config.yaml)
//! 3. Defaults
//!
//! Config file discovery:
//! - Searches current directory and parents for .agent-mesh/config.yaml
//! - Falls back to ~/.agent-mesh/config.yaml

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::orchestrator::OrchestratorSettings;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<MeshConfig, String>> = OnceLock::new();

/// Directory holding the config file
pub const CONFIG_DIR: &str = ".agent-mesh";

/// Prefix of every environment override
pub const ENV_PREFIX: &str = "AGENT_MESH_";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    pub version: Option<String>,
    pub history_limit: Option<usize>,
    pub max_concurrency: Option<usize>,
    pub default_step_timeout_ms: Option<u64>,
    pub default_workflow_timeout_ms: Option<u64>,
    pub context_ttl_ms: Option<u64>,
    pub context_sweep_interval_ms: Option<u64>,
    pub validation_cache_capacity: Option<usize>,
}

/// Resolved configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MeshConfig {
    /// Events and traces kept in memory
    pub history_limit: usize,
    /// Steps of one workflow running at the same time
    pub max_concurrency: usize,
    pub default_step_timeout_ms: u64,
    pub default_workflow_timeout_ms: u64,
    /// Lifetime of context slices created without a TTL
    pub context_ttl_ms: u64,
    /// Period of the expired-slice sweeper
    pub context_sweep_interval_ms: u64,
    pub validation_cache_capacity: usize,
    /// Path to config file (if found)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            history_limit: 1000,
            max_concurrency: 8,
            default_step_timeout_ms: 30_000,
            default_workflow_timeout_ms: 300_000,
            context_ttl_ms: 30_000,
            context_sweep_interval_ms: 1000,
            validation_cache_capacity: 1024,
            config_file: None,
        }
    }
}

impl MeshConfig {
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            max_concurrency: self.max_concurrency,
            default_step_timeout: Duration::from_millis(self.default_step_timeout_ms),
            default_workflow_timeout: Duration::from_millis(self.default_workflow_timeout_ms),
        }
    }

    pub fn context_ttl(&self) -> Duration {
        Duration::from_millis(self.context_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.context_sweep_interval_ms)
    }

    /// Overlay values present in a config file
    fn apply_file(&mut self, file: ConfigFile) {
        if let Some(v) = file.history_limit {
            self.history_limit = v;
        }
        if let Some(v) = file.max_concurrency {
            self.max_concurrency = v;
        }
        if let Some(v) = file.default_step_timeout_ms {
            self.default_step_timeout_ms = v;
        }
        if let Some(v) = file.default_workflow_timeout_ms {
            self.default_workflow_timeout_ms = v;
        }
        if let Some(v) = file.context_ttl_ms {
            self.context_ttl_ms = v;
        }
        if let Some(v) = file.context_sweep_interval_ms {
            self.context_sweep_interval_ms = v;
        }
        if let Some(v) = file.validation_cache_capacity {
            self.validation_cache_capacity = v;
        }
    }

    /// Overlay environment overrides read through `lookup`
    fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        env_override(&lookup, "HISTORY_LIMIT", &mut self.history_limit)?;
        env_override(&lookup, "MAX_CONCURRENCY", &mut self.max_concurrency)?;
        env_override(&lookup, "DEFAULT_STEP_TIMEOUT_MS", &mut self.default_step_timeout_ms)?;
        env_override(
            &lookup,
            "DEFAULT_WORKFLOW_TIMEOUT_MS",
            &mut self.default_workflow_timeout_ms,
        )?;
        env_override(&lookup, "CONTEXT_TTL_MS", &mut self.context_ttl_ms)?;
        env_override(
            &lookup,
            "CONTEXT_SWEEP_INTERVAL_MS",
            &mut self.context_sweep_interval_ms,
        )?;
        env_override(
            &lookup,
            "VALIDATION_CACHE_CAPACITY",
            &mut self.validation_cache_capacity,
        )?;
        Ok(())
    }
}

fn env_override<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let name = format!("{}{}", ENV_PREFIX, key);
    if let Some(raw) = lookup(&name) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: '{}' ({})", name, raw, e))?;
    }
    Ok(())
}

/// Find config file by searching `start` and its parents, then the home directory
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    dirs::home_dir()
        .map(|home| home.join(CONFIG_DIR).join("config.yaml"))
        .filter(|path| path.exists())
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Load configuration discovered from `start`, with overrides from `lookup`
fn load_config_from<F>(start: &Path, lookup: F) -> Result<MeshConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = MeshConfig::default();

    if let Some(path) = find_config_file(start) {
        let file = load_config_file(&path)?;
        config.apply_file(file);
        config.config_file = Some(path);
    }

    config.apply_env(lookup)?;
    Ok(config)
}

/// Load configuration from all sources
fn load_config() -> Result<MeshConfig> {
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    load_config_from(&cwd, |key| std::env::var(key).ok())
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static MeshConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<MeshConfig> {
    load_config()
}
