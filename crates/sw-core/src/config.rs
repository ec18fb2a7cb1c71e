use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration loaded from `~/.agent-swarm/config.toml`.
///
/// Every section falls back to defaults, so a partial file (or no file at
/// all) yields a working configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SwarmConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub navigation: NavigationConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
}

impl SwarmConfig {
    /// Load config from `~/.agent-swarm/config.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = SwarmConfig::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&text)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: SwarmConfig = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatcher.ttl_secs == 0 {
            return Err(ConfigError::Validation(
                "dispatcher.ttl_secs must be greater than zero".into(),
            ));
        }
        if self.dispatcher.gc_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "dispatcher.gc_interval_secs must be greater than zero".into(),
            ));
        }
        if self.session.inactivity_check_secs == 0 {
            return Err(ConfigError::Validation(
                "session.inactivity_check_secs must be greater than zero".into(),
            ));
        }
        if self.history.keep_messages == 0 {
            return Err(ConfigError::Validation(
                "history.keep_messages must be greater than zero".into(),
            ));
        }
        if self.connection.scheduled_delay_ms == 0 || self.connection.rate_delay_ms == 0 {
            return Err(ConfigError::Validation(
                "connection delays must be greater than zero".into(),
            ));
        }
        if self.completion.empty_output_placeholders.is_empty() {
            return Err(ConfigError::Validation(
                "completion.empty_output_placeholders must not be empty".into(),
            ));
        }
        Ok(())
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".agent-swarm")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Identifies this runtime instance in execution contexts.
    #[serde(default = "default_process_id")]
    pub process_id: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            process_id: default_process_id(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_process_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Idle lifetime of a per-(client, swarm) dispatcher queue.
    #[serde(default = "default_dispatcher_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_dispatcher_ttl(),
            gc_interval_secs: default_gc_interval(),
        }
    }
}

impl DispatcherConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }
}

fn default_dispatcher_ttl() -> u64 {
    15 * 60
}
fn default_gc_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Idle time after which an auto-disposed connection is torn down.
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,
    #[serde(default = "default_inactivity_check")]
    pub inactivity_check_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: default_inactivity_timeout(),
            inactivity_check_secs: default_inactivity_check(),
        }
    }
}

impl SessionConfig {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn inactivity_check(&self) -> Duration {
        Duration::from_secs(self.inactivity_check_secs)
    }
}

fn default_inactivity_timeout() -> u64 {
    15 * 60
}
fn default_inactivity_check() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Number of trailing conversation messages an agent sees per completion.
    #[serde(default = "default_keep_messages")]
    pub keep_messages: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            keep_messages: default_keep_messages(),
        }
    }
}

fn default_keep_messages() -> usize {
    15
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_scheduled_delay")]
    pub scheduled_delay_ms: u64,
    #[serde(default = "default_rate_delay")]
    pub rate_delay_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            scheduled_delay_ms: default_scheduled_delay(),
            rate_delay_ms: default_rate_delay(),
        }
    }
}

impl ConnectionConfig {
    pub fn scheduled_delay(&self) -> Duration {
        Duration::from_millis(self.scheduled_delay_ms)
    }

    pub fn rate_delay(&self) -> Duration {
        Duration::from_millis(self.rate_delay_ms)
    }
}

fn default_scheduled_delay() -> u64 {
    1_000
}
fn default_rate_delay() -> u64 {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NavigationConfig {
    /// Turn a navigation revisit into an error instead of a `false` result.
    #[serde(default)]
    pub throw_on_recursion: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    /// Replies substituted when an agent produces an empty output.
    #[serde(default = "default_empty_output_placeholders")]
    pub empty_output_placeholders: Vec<String>,
    /// User message sent to recover after a failed tool call.
    #[serde(default = "default_tool_call_exception_prompt")]
    pub tool_call_exception_prompt: String,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            empty_output_placeholders: default_empty_output_placeholders(),
            tool_call_exception_prompt: default_tool_call_exception_prompt(),
        }
    }
}

impl CompletionConfig {
    /// Pick a placeholder reply for an empty output.
    pub fn placeholder(&self) -> String {
        let len = self.empty_output_placeholders.len();
        if len == 0 {
            return String::new();
        }
        let idx = (uuid::Uuid::new_v4().as_u128() % len as u128) as usize;
        self.empty_output_placeholders[idx].clone()
    }
}

fn default_empty_output_placeholders() -> Vec<String> {
    vec![
        "Sorry, I missed that. Could you say it again?".into(),
        "I couldn't catch that. Would you mind repeating?".into(),
        "I didn't quite hear you. Can you repeat that, please?".into(),
        "Pardon me, I didn't hear that clearly. Could you repeat it?".into(),
        "Could you say that once more? I didn't catch it.".into(),
    ]
}
fn default_tool_call_exception_prompt() -> String {
    "Start the conversation".into()
}
