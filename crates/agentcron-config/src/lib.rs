use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use agentcron_types::ExecutorConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON5 parse error: {0}")]
    Json5(#[from] json5::Error),
    #[error("Config directory not found")]
    NoDirFound,
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// HTTP gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bearer token for authentication (optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

fn default_port() -> u16 {
    3000
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            auth_token: None,
        }
    }
}

/// Scheduler loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Upper bound on the time between two due-task checks, in seconds.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Global scheduler switch applied at startup and on reload.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_tick_secs() -> u64 {
    15
}

fn default_true() -> bool {
    true
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            enabled: true,
        }
    }
}

/// Executor pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSettings {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    /// How long a stopped execution may take to acknowledge cancellation.
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    /// Longest error message kept on an execution record, in characters.
    #[serde(default = "default_error_message_limit")]
    pub error_message_limit: usize,
}

fn default_max_concurrent() -> u32 {
    3
}

fn default_stop_grace_secs() -> u64 {
    10
}

fn default_error_message_limit() -> usize {
    512
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            stop_grace_secs: default_stop_grace_secs(),
            error_message_limit: default_error_message_limit(),
        }
    }
}

/// Execution history retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Finished executions kept per task; older ones are pruned.
    #[serde(default = "default_max_records_per_task")]
    pub max_records_per_task: usize,
}

fn default_max_records_per_task() -> usize {
    200
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_records_per_task: default_max_records_per_task(),
        }
    }
}

/// How agents are invoked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvokerConfig {
    /// Spawn a local process per execution.
    ///
    /// `args` may contain `{agent_id}`, `{project_path}`, `{task_id}` and
    /// `{execution_id}` placeholders.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
    /// POST the invocation to an agent service.
    Http {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth_token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self::Command {
            program: "agent".to_string(),
            args: vec![
                "run".to_string(),
                "--agent".to_string(),
                "{agent_id}".to_string(),
            ],
            timeout_secs: None,
        }
    }
}

/// Storage location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path; defaults to `~/.agentcron/agentcron.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
}

/// Top-level agentcron configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentCronConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub executor: ExecutorSettings,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub invoker: InvokerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl AgentCronConfig {
    /// Reject values the runtime cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ExecutorConfig {
            max_concurrent: self.executor.max_concurrent,
        }
        .validate()
        .map_err(ConfigError::Invalid)?;

        if self.scheduler.tick_secs == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.tick_secs must be at least 1".to_string(),
            ));
        }
        if self.history.max_records_per_task == 0 {
            return Err(ConfigError::Invalid(
                "history.max_records_per_task must be at least 1".to_string(),
            ));
        }
        match &self.invoker {
            InvokerConfig::Command { program, .. } if program.trim().is_empty() => Err(
                ConfigError::Invalid("invoker.program must not be empty".to_string()),
            ),
            InvokerConfig::Http { url, .. } if url.trim().is_empty() => Err(
                ConfigError::Invalid("invoker.url must not be empty".to_string()),
            ),
            _ => Ok(()),
        }
    }

    /// Database path, falling back to the config directory.
    pub fn db_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.storage.db_path {
            Some(path) => Ok(path.clone()),
            None => Ok(ensure_config_dir()?.join("agentcron.db")),
        }
    }
}

/// Resolve the agentcron config directory (~/.agentcron/).
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|h| h.join(".agentcron"))
        .ok_or(ConfigError::NoDirFound)
}

/// Resolve the config file path (~/.agentcron/config.json5).
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.json5"))
}

/// Load configuration from the default path, falling back to defaults.
pub fn load_config() -> Result<AgentCronConfig, ConfigError> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let path = config_file_path()?;
    load_config_from(&path)
}

/// Load configuration from a specific path, falling back to defaults if not found.
pub fn load_config_from(path: &Path) -> Result<AgentCronConfig, ConfigError> {
    let config = read_config_from(path)?;
    config.validate()?;
    Ok(config)
}

/// Parse a config file without validating it.
pub fn read_config_from(path: &Path) -> Result<AgentCronConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!("Config file not found at {}, using defaults", path.display());
        return Ok(AgentCronConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    Ok(json5::from_str(&content)?)
}

/// Ensure the config directory exists.
pub fn ensure_config_dir() -> Result<PathBuf, ConfigError> {
    let dir = config_dir()?;
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(dir)
}

/// Save configuration to the given path.
pub fn save_config_to(config: &AgentCronConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| ConfigError::Io(std::io::Error::other(e)))?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Save configuration to the default path.
pub fn save_config(config: &AgentCronConfig) -> Result<(), ConfigError> {
    let dir = ensure_config_dir()?;
    save_config_to(config, &dir.join("config.json5"))
}
