//! Configuration for filament.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (FILAMENT_HOME)
//! 2. Config file (.filament/config.yaml)
//! 3. Defaults (~/.filament)
//!
//! Config file discovery searches the current directory and its parents for
//! `.filament/config.yaml`. Paths in the config file are relative to the
//! `.filament` directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::retry::RetryPolicy;
use crate::core::supervisor::{OrphanPolicy, SupervisorConfig};
use crate::protocol::PollPolicy;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,

    #[serde(default)]
    pub paths: PathsConfig,

    /// Executor identity → JSON-RPC endpoint URL
    #[serde(default)]
    pub executors: HashMap<String, String>,

    #[serde(default)]
    pub retry: Option<RetryPolicy>,

    #[serde(default)]
    pub poll: Option<PollPolicy>,

    #[serde(default)]
    pub limits: Option<LimitsConfig>,

    #[serde(default)]
    pub recovery: Option<RecoveryConfig>,

    #[serde(default)]
    pub approvals: Option<ApprovalsConfig>,

    /// Path to a stage graph YAML (built-in filing graph if unset)
    #[serde(default)]
    pub pipeline: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to the .filament directory)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    pub max_concurrent_runs: Option<usize>,
    pub stage_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecoveryConfig {
    pub orphan_policy: Option<OrphanPolicy>,
    pub liveness_threshold_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApprovalsConfig {
    pub ttl_seconds: Option<u64>,
}

/// Resolved configuration with absolute paths and defaults applied
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to the state directory
    pub home: PathBuf,

    /// Executor identity → endpoint URL
    pub executors: HashMap<String, String>,

    /// Shared stage retry policy
    pub retry: RetryPolicy,

    /// Executor poll policy
    pub poll: PollPolicy,

    /// Default per-stage timeout
    pub stage_timeout: Duration,

    /// Supervisor settings
    pub supervisor: SupervisorConfig,

    /// Stage graph YAML path, if configured
    pub pipeline: Option<PathBuf>,

    /// Path to the config file (if found)
    pub config_file: Option<PathBuf>,
}

fn default_stage_timeout() -> Duration {
    Duration::from_secs(300)
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".filament").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse a config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to a base directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path_str)
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".filament");

    let config_path = find_config_file();
    let file = match &config_path {
        Some(path) => Some(load_config_file(path)?),
        None => None,
    };

    let home = if let Ok(env_home) = std::env::var("FILAMENT_HOME") {
        PathBuf::from(env_home)
    } else if let Some(home_path) = file.as_ref().and_then(|f| f.paths.home.as_ref()) {
        let filament_dir = config_path
            .as_ref()
            .and_then(|p| p.parent())
            .unwrap_or(Path::new("."));
        resolve_path(filament_dir, home_path)
    } else {
        default_home
    };

    let limits = file.as_ref().and_then(|f| f.limits.clone());
    let recovery = file.as_ref().and_then(|f| f.recovery.clone());
    let approvals = file.as_ref().and_then(|f| f.approvals.clone());

    let supervisor = SupervisorConfig {
        max_concurrent_runs: limits
            .as_ref()
            .and_then(|l| l.max_concurrent_runs)
            .unwrap_or(8),
        orphan_policy: recovery
            .as_ref()
            .and_then(|r| r.orphan_policy)
            .unwrap_or_default(),
        liveness_threshold: Duration::from_secs(
            recovery
                .as_ref()
                .and_then(|r| r.liveness_threshold_seconds)
                .unwrap_or(600),
        ),
        approval_ttl: approvals
            .as_ref()
            .and_then(|a| a.ttl_seconds)
            .map(Duration::from_secs),
    };

    let pipeline = file.as_ref().and_then(|f| f.pipeline.as_ref()).map(|p| {
        let base = config_path
            .as_ref()
            .and_then(|c| c.parent())
            .unwrap_or(Path::new("."));
        resolve_path(base, p)
    });

    Ok(ResolvedConfig {
        home,
        executors: file.as_ref().map(|f| f.executors.clone()).unwrap_or_default(),
        retry: file
            .as_ref()
            .and_then(|f| f.retry.clone())
            .unwrap_or_default(),
        poll: file
            .as_ref()
            .and_then(|f| f.poll.clone())
            .unwrap_or_default(),
        stage_timeout: limits
            .as_ref()
            .and_then(|l| l.stage_timeout_seconds)
            .map(Duration::from_secs)
            .unwrap_or_else(default_stage_timeout),
        supervisor,
        pipeline,
        config_file: config_path,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

// ============================================================================
// Convenience accessors
// ============================================================================

/// State directory (engine state)
pub fn state_dir() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Runs directory ($FILAMENT_HOME/runs)
pub fn runs_dir() -> Result<PathBuf> {
    Ok(config()?.home.join("runs"))
}

/// Ledger log path ($FILAMENT_HOME/ledger.jsonl)
pub fn ledger_path() -> Result<PathBuf> {
    Ok(config()?.home.join("ledger.jsonl"))
}

/// Ticket log path ($FILAMENT_HOME/tickets.jsonl)
pub fn tickets_path() -> Result<PathBuf> {
    Ok(config()?.home.join("tickets.jsonl"))
}

/// Advisory lock path guarding the state directory
pub fn lock_path() -> Result<PathBuf> {
    Ok(config()?.home.join("state.lock"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let filament_dir = temp.path().join(".filament");
        std::fs::create_dir_all(&filament_dir).unwrap();

        let config_path = filament_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1.0"
paths:
  home: ./state
executors:
  scraper: http://localhost:8001/rpc
  analyzer: http://localhost:8002/rpc
retry:
  max_attempts: 4
  base_delay_ms: 250
limits:
  max_concurrent_runs: 4
  stage_timeout_seconds: 120
recovery:
  orphan_policy: fail
  liveness_threshold_seconds: 300
approvals:
  ttl_seconds: 86400
"#
        )
        .unwrap();

        let config = load_config_file(&config_path).unwrap();
        assert_eq!(config.version, "1.0");
        assert_eq!(config.paths.home, Some("./state".to_string()));
        assert_eq!(
            config.executors.get("scraper"),
            Some(&"http://localhost:8001/rpc".to_string())
        );
        assert_eq!(config.retry.unwrap().max_attempts, 4);
        assert_eq!(config.limits.unwrap().max_concurrent_runs, Some(4));
        assert_eq!(
            config.recovery.unwrap().orphan_policy,
            Some(OrphanPolicy::Fail)
        );
        assert_eq!(config.approvals.unwrap().ttl_seconds, Some(86400));
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project/.filament");

        assert_eq!(
            resolve_path(&base, "./state"),
            PathBuf::from("/home/user/project/.filament/./state")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/state"),
            PathBuf::from("/absolute/state")
        );
    }

    #[test]
    fn test_minimal_config_defaults() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("config.yaml");
        std::fs::write(&config_path, "version: \"1.0\"\n").unwrap();

        let config = load_config_file(&config_path).unwrap();
        assert!(config.executors.is_empty());
        assert!(config.retry.is_none());
        assert!(config.pipeline.is_none());
    }
}
