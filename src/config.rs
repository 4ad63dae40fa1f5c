//! Layered configuration for kiln.
//!
//! Settings are read from `kiln.toml`, then overridden by environment
//! variables, then by CLI arguments.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3142
//! max_sessions = 4
//! session_timeout_secs = 900
//!
//! [limits]
//! min_source_chars = 20
//! max_source_chars = 200000
//!
//! [pipeline]
//! max_attempts = 3
//!
//! [oracle]
//! claude_cmd = "claude"
//! model = "sonnet"
//!
//! [validator]
//! command = "compactc"
//! args = ["--check"]
//! extension = "compact"
//!
//! [audit]
//! enabled = true
//! dir = ".kiln/audit"
//!
//! [logging]
//! format = "pretty"
//! dir = ".kiln/logs"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Name of the config file looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "kiln.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Ceiling on concurrently running sessions; requests beyond it are rejected.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Wall-clock budget for one whole session.
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3142
}

fn default_max_sessions() -> usize {
    4
}

fn default_session_timeout_secs() -> u64 {
    900
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_sessions: default_max_sessions(),
            session_timeout_secs: default_session_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsSection {
    #[serde(default = "default_min_source_chars")]
    pub min_source_chars: usize,
    #[serde(default = "default_max_source_chars")]
    pub max_source_chars: usize,
}

fn default_min_source_chars() -> usize {
    20
}

fn default_max_source_chars() -> usize {
    200_000
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            min_source_chars: default_min_source_chars(),
            max_source_chars: default_max_source_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Maximum generation attempts (first generation plus repairs).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

/// Completion oracle settings (Claude CLI).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleSection {
    #[serde(default = "default_claude_cmd")]
    pub claude_cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

fn default_claude_cmd() -> String {
    "claude".to_string()
}

impl Default for OracleSection {
    fn default() -> Self {
        Self {
            claude_cmd: default_claude_cmd(),
            model: None,
        }
    }
}

/// Validation oracle settings: an external compiler run once per artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorSection {
    #[serde(default = "default_validator_cmd")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// File extension used for the temporary source file handed to the compiler.
    #[serde(default = "default_extension")]
    pub extension: String,
}

fn default_validator_cmd() -> String {
    "compactc".to_string()
}

fn default_extension() -> String {
    "compact".to_string()
}

impl Default for ValidatorSection {
    fn default() -> Self {
        Self {
            command: default_validator_cmd(),
            args: Vec::new(),
            extension: default_extension(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSection {
    #[serde(default = "default_audit_enabled")]
    pub enabled: bool,
    #[serde(default = "default_audit_dir")]
    pub dir: PathBuf,
}

fn default_audit_enabled() -> bool {
    true
}

fn default_audit_dir() -> PathBuf {
    PathBuf::from(".kiln/audit")
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            enabled: default_audit_enabled(),
            dir: default_audit_dir(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub format: LogFormat,
    /// Directory for daily-rolling log files; stderr only when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

/// The complete kiln.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KilnConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub oracle: OracleSection,
    #[serde(default)]
    pub validator: ValidatorSection,
    #[serde(default)]
    pub audit: AuditSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl KilnConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse kiln.toml")
    }

    /// Load from `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// File, then process environment.
    pub fn resolve(path: &Path) -> Result<Self> {
        let mut config = Self::load_or_default(path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize kiln.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides through `lookup`, so tests can inject values
    /// without touching the process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("KILN_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("KILN_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid KILN_PORT '{}'", port))?;
        }
        if let Some(max) = lookup("KILN_MAX_SESSIONS") {
            self.server.max_sessions = max
                .parse()
                .with_context(|| format!("Invalid KILN_MAX_SESSIONS '{}'", max))?;
        }
        if let Some(max) = lookup("KILN_MAX_ATTEMPTS") {
            self.pipeline.max_attempts = max
                .parse()
                .with_context(|| format!("Invalid KILN_MAX_ATTEMPTS '{}'", max))?;
        }
        if let Some(cmd) = lookup("CLAUDE_CMD") {
            self.oracle.claude_cmd = cmd;
        }
        if let Some(cmd) = lookup("KILN_VALIDATOR_CMD") {
            self.validator.command = cmd;
        }
        if let Some(dir) = lookup("KILN_AUDIT_DIR") {
            self.audit.dir = PathBuf::from(dir);
        }
        if let Some(format) = lookup("KILN_LOG_FORMAT") {
            self.logging.format = format.parse()?;
        }
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.server.session_timeout_secs)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Return human-readable warnings for settings that will misbehave.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.pipeline.max_attempts == 0 {
            warnings.push(
                "pipeline.max_attempts is 0: treated as a single attempt with no repair".to_string(),
            );
        }
        if self.server.max_sessions == 0 {
            warnings.push("server.max_sessions is 0: every request will be rejected".to_string());
        }
        if self.limits.min_source_chars > self.limits.max_source_chars {
            warnings.push(format!(
                "limits.min_source_chars ({}) exceeds limits.max_source_chars ({})",
                self.limits.min_source_chars, self.limits.max_source_chars
            ));
        }
        if self.server.session_timeout_secs == 0 {
            warnings.push("server.session_timeout_secs is 0: sessions time out immediately".to_string());
        }
        if self.validator.command.trim().is_empty() {
            warnings.push("validator.command is empty".to_string());
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = KilnConfig::default();
        assert_eq!(config.server.port, 3142);
        assert_eq!(config.server.max_sessions, 4);
        assert_eq!(config.pipeline.max_attempts, 3);
        assert_eq!(config.oracle.claude_cmd, "claude");
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(config.audit.enabled);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_parse_partial_file_keeps_other_defaults() {
        let content = r#"
[pipeline]
max_attempts = 5

[validator]
command = "solc"
args = ["--bin"]
extension = "sol"
"#;
        let config = KilnConfig::parse(content).unwrap();
        assert_eq!(config.pipeline.max_attempts, 5);
        assert_eq!(config.validator.command, "solc");
        assert_eq!(config.validator.args, vec!["--bin".to_string()]);
        assert_eq!(config.server.port, 3142);
        assert_eq!(config.limits.max_source_chars, 200_000);
    }

    #[test]
    fn test_parse_invalid_toml_fails() {
        assert!(KilnConfig::parse("[server\nport = ").is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = KilnConfig::parse("[server]\nport = 9000\n").unwrap();
        config
            .apply_env(env(&[
                ("KILN_PORT", "9100"),
                ("KILN_MAX_ATTEMPTS", "7"),
                ("CLAUDE_CMD", "/opt/claude"),
                ("KILN_LOG_FORMAT", "json"),
            ]))
            .unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.pipeline.max_attempts, 7);
        assert_eq!(config.oracle.claude_cmd, "/opt/claude");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = KilnConfig::default();
        let result = config.apply_env(env(&[("KILN_MAX_SESSIONS", "many")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_flags_inverted_limits_and_zero_attempts() {
        let mut config = KilnConfig::default();
        config.limits.min_source_chars = 500;
        config.limits.max_source_chars = 100;
        config.pipeline.max_attempts = 0;
        let warnings = config.validate();
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().any(|w| w.contains("max_attempts")));
        assert!(warnings.iter().any(|w| w.contains("min_source_chars")));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let mut config = KilnConfig::default();
        config.server.max_sessions = 9;
        config.logging.dir = Some(PathBuf::from("/var/log/kiln"));
        config.save(&path).unwrap();

        let loaded = KilnConfig::load(&path).unwrap();
        assert_eq!(loaded.server.max_sessions, 9);
        assert_eq!(loaded.logging.dir, Some(PathBuf::from("/var/log/kiln")));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = TempDir::new().unwrap();
        let config = KilnConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.port, 3142);
    }

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
