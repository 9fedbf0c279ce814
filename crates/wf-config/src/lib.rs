//! Workflow Configuration
//!
//! Typed configuration for the workflow engine and its binaries.
//!
//! Values are resolved in three layers:
//! - built-in defaults
//! - an optional TOML file
//! - `WF_*` environment variables
//!
//! ## Environment Variables
//!
//! | Variable | Description |
//! |----------|-------------|
//! | `WF_DATABASE_KIND` | `memory`, `sqlite`, `postgres` or `mongo` |
//! | `WF_DATABASE_URL` | Connection URL for non-memory backends |
//! | `WF_DATABASE_MAX_CONNECTIONS` | Pool size for SQL backends |
//! | `WF_MONGO_DATABASE` | MongoDB database name |
//! | `WF_MAX_ATTEMPTS` | Transition attempts before a conflict is surfaced |
//! | `WF_IMPLICIT_CREATE` | Create missing instances on first transition |
//! | `WF_GUARD_ATTRIBUTES` | Comma separated actor attributes enforced by the guard |
//! | `WF_ESCALATION_ENABLED` | Run the escalation scheduler |
//! | `WF_ESCALATION_INTERVAL_SECS` | Seconds between escalation sweeps |
//! | `WF_LOG_LEVEL` | Default log level |
//! | `WF_LOG_JSON` | Emit JSON logs |

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid { message: message.into() }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub engine: EngineConfig,
    pub guard: GuardConfig,
    pub escalation: EscalationConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

/// Transition engine behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Attempts per transition before a version conflict is returned to the caller
    pub max_attempts: u32,
    /// Create the instance at the start state when a transition targets a missing one
    pub implicit_create: bool,
    /// Accept definitions containing states with no incoming action (logged instead of rejected)
    pub allow_unreachable_states: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            implicit_create: true,
            allow_unreachable_states: false,
        }
    }
}

/// Guard configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Actor attributes checked against an action's required attributes (e.g. "jurisdiction")
    pub attribute_checks: Vec<String>,
}

/// A process swept by the escalation scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationTarget {
    pub tenant_id: String,
    pub process_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Identity recorded in history for automatic escalations
    pub actor_id: String,
    pub actor_roles: Vec<String>,
    pub targets: Vec<EscalationTarget>,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 300,
            actor_id: "system".to_string(),
            actor_roles: Vec::new(),
            targets: Vec::new(),
        }
    }
}

impl EscalationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    Memory,
    Sqlite,
    Postgres,
    Mongo,
}

impl Default for DatabaseKind {
    fn default() -> Self {
        Self::Memory
    }
}

impl FromStr for DatabaseKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "mongo" | "mongodb" => Ok(Self::Mongo),
            other => Err(ConfigError::invalid(format!(
                "unknown database kind '{}'. Use memory, sqlite, postgres or mongo",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub kind: DatabaseKind,
    pub url: Option<String>,
    pub max_connections: u32,
    pub mongo_database: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            kind: DatabaseKind::Memory,
            url: None,
            max_connections: 10,
            mongo_database: "workflow".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl WorkflowConfig {
    /// Load from a TOML file, falling back to defaults when the file does not exist.
    /// Environment overrides are applied and the result validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let contents = std::fs::read_to_string(p)?;
                let config: WorkflowConfig = toml::from_str(&contents)?;
                debug!(path = %p.display(), "Loaded workflow config");
                config
            }
            _ => WorkflowConfig::default(),
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(kind) = lookup("WF_DATABASE_KIND") {
            self.database.kind = kind.parse()?;
        }
        if let Some(url) = lookup("WF_DATABASE_URL") {
            self.database.url = Some(url);
        }
        if let Some(v) = lookup("WF_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_value("WF_DATABASE_MAX_CONNECTIONS", &v)?;
        }
        if let Some(db) = lookup("WF_MONGO_DATABASE") {
            self.database.mongo_database = db;
        }
        if let Some(v) = lookup("WF_MAX_ATTEMPTS") {
            self.engine.max_attempts = parse_value("WF_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("WF_IMPLICIT_CREATE") {
            self.engine.implicit_create = parse_value("WF_IMPLICIT_CREATE", &v)?;
        }
        if let Some(v) = lookup("WF_GUARD_ATTRIBUTES") {
            self.guard.attribute_checks = v
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = lookup("WF_ESCALATION_ENABLED") {
            self.escalation.enabled = parse_value("WF_ESCALATION_ENABLED", &v)?;
        }
        if let Some(v) = lookup("WF_ESCALATION_INTERVAL_SECS") {
            self.escalation.interval_secs = parse_value("WF_ESCALATION_INTERVAL_SECS", &v)?;
        }
        if let Some(level) = lookup("WF_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(v) = lookup("WF_LOG_JSON") {
            self.logging.json = parse_value("WF_LOG_JSON", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.max_attempts == 0 {
            return Err(ConfigError::invalid("engine.max_attempts must be at least 1"));
        }
        if self.escalation.enabled && self.escalation.interval_secs == 0 {
            return Err(ConfigError::invalid("escalation.interval_secs must be positive"));
        }
        if self.database.kind != DatabaseKind::Memory
            && self.database.url.as_deref().map_or(true, |u| u.trim().is_empty())
        {
            return Err(ConfigError::invalid(format!(
                "database.url is required for {:?} backend",
                self.database.kind
            )));
        }
        Ok(())
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid(format!("{} has invalid value '{}'", key, value)))
}
