//! Configuration types for plotpipe sessions.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::Error;

/// Session configuration loaded from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SessionConfig {
    /// Engine process settings
    pub engine: EngineSettings,
    /// Timeouts and polling
    pub timing: TimingSettings,
    /// Command framing settings
    pub framing: FramingSettings,
    /// Logging settings
    pub logging: LogSettings,
}

impl SessionConfig {
    /// Configuration for a specific engine executable, defaults elsewhere.
    pub fn for_program(program: impl Into<String>) -> Self {
        Self {
            engine: EngineSettings {
                program: program.into(),
                ..EngineSettings::default()
            },
            ..Self::default()
        }
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string.
    pub fn from_yaml(yaml: &str) -> crate::Result<Self> {
        let config: SessionConfig =
            serde_yaml::from_str(yaml).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> crate::Result<()> {
        if self.engine.program.trim().is_empty() {
            return Err(Error::Config("engine.program cannot be empty".to_string()));
        }

        if self.timing.poll_interval_ms == 0 {
            return Err(Error::Config("timing.poll_interval_ms must be > 0".to_string()));
        }

        // The marker is matched as a whole line, so it must stay a single token
        let prefix = &self.framing.marker_prefix;
        if prefix.is_empty() || prefix.chars().any(|c| c.is_whitespace() || c == '"') {
            return Err(Error::Config(format!(
                "framing.marker_prefix '{prefix}' must be non-empty without whitespace or quotes"
            )));
        }

        if let Some(terminal) = &self.engine.terminal {
            if terminal.trim().is_empty() || terminal.contains('\n') {
                return Err(Error::Config(
                    "engine.terminal must be a single non-empty line".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Engine process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Executable to launch (looked up on PATH, no shell)
    pub program: String,
    /// Extra command-line arguments
    pub args: Vec<String>,
    /// Working directory for the engine
    pub working_directory: Option<String>,
    /// Additional environment variables
    pub env: Vec<(String, String)>,
    /// Terminal to select after start-up (None = keep the engine default)
    pub terminal: Option<String>,
    /// Instruction that makes the engine exit
    pub exit_command: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            program: "gnuplot".to_string(),
            args: vec![],
            working_directory: None,
            env: vec![],
            terminal: None,
            exit_command: "exit".to_string(),
        }
    }
}

/// Timeouts and polling intervals, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    /// Upper bound for a blocking send (0 = wait as long as the engine lives)
    pub send_timeout_ms: u64,
    /// Default wait for the first line in `read`
    pub read_timeout_ms: u64,
    /// Interval at which blocked waits re-check engine liveness
    pub poll_interval_ms: u64,
    /// Upper bound for the start-up handshake
    pub startup_timeout_ms: u64,
}

impl TimingSettings {
    /// Blocking send bound, `None` when unbounded.
    pub fn send_timeout(&self) -> Option<Duration> {
        (self.send_timeout_ms > 0).then(|| Duration::from_millis(self.send_timeout_ms))
    }

    /// Default read timeout.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Liveness re-check interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Handshake bound.
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            send_timeout_ms: 60_000,
            read_timeout_ms: 50,
            poll_interval_ms: 20,
            startup_timeout_ms: 10_000,
        }
    }
}

/// Command framing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FramingSettings {
    /// Reserved prefix of sentinel marker lines
    pub marker_prefix: String,
    /// Also emit the sentinel on stderr so error windows are complete
    pub stderr_sentinel: bool,
    /// Ask the engine for its terminal when none is configured
    pub query_terminal: bool,
}

impl Default for FramingSettings {
    fn default() -> Self {
        Self {
            marker_prefix: "COMMAND_SEQUENCE_ENDED".to_string(),
            stderr_sentinel: true,
            query_terminal: true,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.engine.program, "gnuplot");
        assert_eq!(config.engine.exit_command, "exit");
        assert_eq!(config.timing.read_timeout_ms, 50);
        assert_eq!(config.framing.marker_prefix, "COMMAND_SEQUENCE_ENDED");
        assert!(config.framing.stderr_sentinel);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_validation() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_for_program() {
        let config = SessionConfig::for_program("/usr/local/bin/gnuplot");
        assert_eq!(config.engine.program, "/usr/local/bin/gnuplot");
        assert_eq!(config.timing.poll_interval_ms, 20);
    }

    #[test]
    fn test_empty_program() {
        let config = SessionConfig::for_program("  ");
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_poll_interval() {
        let mut config = SessionConfig::default();
        config.timing.poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_marker_prefix() {
        let mut config = SessionConfig::default();
        config.framing.marker_prefix = "END OF".to_string();
        assert!(config.validate().is_err());

        config.framing.marker_prefix = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_terminal() {
        let mut config = SessionConfig::default();
        config.engine.terminal = Some("svg\nplot x".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_send_timeout_unbounded() {
        let mut timing = TimingSettings::default();
        assert_eq!(timing.send_timeout(), Some(Duration::from_secs(60)));
        timing.send_timeout_ms = 0;
        assert_eq!(timing.send_timeout(), None);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
engine:
  program: /opt/gnuplot/bin/gnuplot
  args: ["-persist"]
  terminal: dumb
  env:
    - ["GNUTERM", "dumb"]

timing:
  send_timeout_ms: 5000
  read_timeout_ms: 100
  poll_interval_ms: 10

framing:
  stderr_sentinel: false

logging:
  level: debug
  json: true
"#;

        let config = SessionConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.engine.program, "/opt/gnuplot/bin/gnuplot");
        assert_eq!(config.engine.args, vec!["-persist".to_string()]);
        assert_eq!(config.engine.terminal.as_deref(), Some("dumb"));
        assert_eq!(config.engine.env.len(), 1);
        assert_eq!(config.engine.exit_command, "exit");
        assert_eq!(config.timing.send_timeout_ms, 5000);
        assert_eq!(config.timing.startup_timeout_ms, 10_000);
        assert!(!config.framing.stderr_sentinel);
        assert_eq!(config.framing.marker_prefix, "COMMAND_SEQUENCE_ENDED");
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let result = SessionConfig::from_yaml("engine: [not, a, map");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_from_missing_file() {
        let result = SessionConfig::from_file("/nonexistent/plotpipe.yaml");
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
