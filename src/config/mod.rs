use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::paths::{Paths, expand_path};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Resolved paths (not serialized)
    #[serde(skip, default = "default_paths")]
    pub paths: Paths,

    #[serde(default)]
    pub enforcement: EnforcementConfig,

    #[serde(default)]
    pub display: DisplayConfig,

    #[serde(default)]
    pub lockdown: LockdownConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcementConfig {
    /// Process-table poll interval for the respawn and new-process watches
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// A loop iteration taking longer than this is skipped
    #[serde(default = "default_iteration_timeout")]
    pub iteration_timeout: String,

    /// Extra process names that are never terminated
    #[serde(default)]
    pub protected_processes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    /// How often the pinned window reclaims the foreground
    #[serde(default = "default_focus_interval")]
    pub focus_interval: String,

    /// How often the stay-awake signal is re-issued
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: String,

    /// How often the display count is re-checked during a session
    #[serde(default = "default_monitor_poll_interval")]
    pub monitor_poll_interval: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockdownConfig {
    /// Pause after teardown before the session returns to idle
    #[serde(default = "default_reset_grace")]
    pub reset_grace: String,

    /// Policy used when none is given on the command line
    #[serde(default)]
    pub policy_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Override for the audit log location (default: state_dir/examguard.audit.jsonl)
    #[serde(default)]
    pub file: Option<String>,
}

fn default_paths() -> Paths {
    Paths::resolve().unwrap_or_else(|_| {
        let home = etcetera::home_dir().unwrap_or_else(|_| PathBuf::from("."));
        Paths {
            config_dir: home.join(".config").join("examguard"),
            state_dir: home.join(".local").join("state").join("examguard"),
            runtime_dir: None,
        }
    })
}

fn default_poll_interval() -> String {
    "1500ms".to_string()
}
fn default_iteration_timeout() -> String {
    "5s".to_string()
}
fn default_focus_interval() -> String {
    "500ms".to_string()
}
fn default_keepalive_interval() -> String {
    "30s".to_string()
}
fn default_monitor_poll_interval() -> String {
    "2s".to_string()
}
fn default_reset_grace() -> String {
    "500ms".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            paths: default_paths(),
            enforcement: EnforcementConfig::default(),
            display: DisplayConfig::default(),
            lockdown: LockdownConfig::default(),
            logging: LoggingConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            iteration_timeout: default_iteration_timeout(),
            protected_processes: Vec::new(),
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            focus_interval: default_focus_interval(),
            keepalive_interval: default_keepalive_interval(),
            monitor_poll_interval: default_monitor_poll_interval(),
        }
    }
}

impl Default for LockdownConfig {
    fn default() -> Self {
        Self {
            reset_grace: default_reset_grace(),
            policy_file: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            file: None,
        }
    }
}

/// Interval and timeout settings, parsed once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub poll_interval: Duration,
    pub iteration_timeout: Duration,
    pub focus_interval: Duration,
    pub keepalive_interval: Duration,
    pub monitor_poll_interval: Duration,
    pub reset_grace: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1500),
            iteration_timeout: Duration::from_secs(5),
            focus_interval: Duration::from_millis(500),
            keepalive_interval: Duration::from_secs(30),
            monitor_poll_interval: Duration::from_secs(2),
            reset_grace: Duration::from_millis(500),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let paths = Paths::resolve()?;
        paths.ensure_dirs()?;
        let path = paths.config_file();

        if !path.exists() {
            // Create default config file on first run
            let config = Config {
                paths,
                ..Config::default()
            };
            config.save_with_template()?;
            return Ok(config);
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.paths = paths;
        config.timings()?;

        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = self.paths.config_file();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;
        Ok(())
    }

    /// Save config with a helpful template (for first-time setup)
    pub fn save_with_template(&self) -> Result<()> {
        let path = self.paths.config_file();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, DEFAULT_CONFIG_TEMPLATE)?;
        eprintln!("Created default config at {}", path.display());
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let paths = Paths::resolve()?;
        Ok(paths.config_file())
    }

    pub fn timings(&self) -> Result<Timings> {
        Ok(Timings {
            poll_interval: parse_duration(&self.enforcement.poll_interval)
                .context("enforcement.poll_interval")?,
            iteration_timeout: parse_duration(&self.enforcement.iteration_timeout)
                .context("enforcement.iteration_timeout")?,
            focus_interval: parse_duration(&self.display.focus_interval)
                .context("display.focus_interval")?,
            keepalive_interval: parse_duration(&self.display.keepalive_interval)
                .context("display.keepalive_interval")?,
            monitor_poll_interval: parse_duration(&self.display.monitor_poll_interval)
                .context("display.monitor_poll_interval")?,
            reset_grace: parse_duration(&self.lockdown.reset_grace)
                .context("lockdown.reset_grace")?,
        })
    }

    /// Audit log location, or None when auditing to file is disabled.
    pub fn audit_log_path(&self) -> Option<PathBuf> {
        if !self.audit.enabled {
            return None;
        }
        Some(match &self.audit.file {
            Some(file) => expand_path(file),
            None => self.paths.audit_log(),
        })
    }

    pub fn policy_path(&self) -> Option<PathBuf> {
        self.lockdown.policy_file.as_deref().map(expand_path)
    }

    pub fn get_value(&self, key: &str) -> Result<String> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["enforcement", "poll_interval"] => Ok(self.enforcement.poll_interval.clone()),
            ["enforcement", "iteration_timeout"] => Ok(self.enforcement.iteration_timeout.clone()),
            ["enforcement", "protected_processes"] => {
                Ok(self.enforcement.protected_processes.join(","))
            }
            ["display", "focus_interval"] => Ok(self.display.focus_interval.clone()),
            ["display", "keepalive_interval"] => Ok(self.display.keepalive_interval.clone()),
            ["display", "monitor_poll_interval"] => Ok(self.display.monitor_poll_interval.clone()),
            ["lockdown", "reset_grace"] => Ok(self.lockdown.reset_grace.clone()),
            ["lockdown", "policy_file"] => Ok(self.lockdown.policy_file.clone().unwrap_or_default()),
            ["logging", "level"] => Ok(self.logging.level.clone()),
            ["audit", "enabled"] => Ok(self.audit.enabled.to_string()),
            ["audit", "file"] => Ok(self.audit.file.clone().unwrap_or_default()),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
    }

    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let parts: Vec<&str> = key.split('.').collect();
        let duration = |v: &str| -> Result<String> {
            parse_duration(v)?;
            Ok(v.to_string())
        };
        let optional = |v: &str| (!v.is_empty()).then(|| v.to_string());

        match parts.as_slice() {
            ["enforcement", "poll_interval"] => self.enforcement.poll_interval = duration(value)?,
            ["enforcement", "iteration_timeout"] => {
                self.enforcement.iteration_timeout = duration(value)?
            }
            ["enforcement", "protected_processes"] => {
                self.enforcement.protected_processes = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            }
            ["display", "focus_interval"] => self.display.focus_interval = duration(value)?,
            ["display", "keepalive_interval"] => self.display.keepalive_interval = duration(value)?,
            ["display", "monitor_poll_interval"] => {
                self.display.monitor_poll_interval = duration(value)?
            }
            ["lockdown", "reset_grace"] => self.lockdown.reset_grace = duration(value)?,
            ["lockdown", "policy_file"] => self.lockdown.policy_file = optional(value),
            ["logging", "level"] => self.logging.level = value.to_string(),
            ["audit", "enabled"] => self.audit.enabled = value.parse()?,
            ["audit", "file"] => self.audit.file = optional(value),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }

        Ok(())
    }
}

/// Parse a human duration: `500ms`, `2s`, `5m`, `1h`. A bare number is seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    if number.is_empty() {
        anyhow::bail!("Invalid duration '{}': missing number", s);
    }
    let value: f64 = number
        .parse()
        .with_context(|| format!("Invalid duration '{}'", s))?;
    let seconds = match unit.trim() {
        "ms" => value / 1000.0,
        "" | "s" | "sec" | "secs" => value,
        "m" | "min" | "mins" => value * 60.0,
        "h" | "hr" | "hrs" => value * 3600.0,
        other => anyhow::bail!("Invalid duration '{}': unknown unit '{}'", s, other),
    };
    Ok(Duration::from_secs_f64(seconds))
}

/// Default config template with helpful comments (used for first-time setup)
const DEFAULT_CONFIG_TEMPLATE: &str = r#"# Examguard Configuration
# Auto-created on first run. Edit as needed.

[enforcement]
# How often the process table is polled for respawned or unapproved processes
poll_interval = "1500ms"
# A poll that takes longer than this is abandoned and retried on the next tick
iteration_timeout = "5s"
# Extra processes that must never be terminated
# protected_processes = ["examclient", "obs-virtualcam"]

[display]
focus_interval = "500ms"
keepalive_interval = "30s"
monitor_poll_interval = "2s"

[lockdown]
# Pause after teardown before the session is reported idle
reset_grace = "500ms"
# Default policy for `examguard session` and `examguard check`
# policy_file = "~/exam/policy.toml"

[logging]
level = "info"

[audit]
enabled = true
# Default: XDG state dir (~/.local/state/examguard/examguard.audit.jsonl)
# file = "~/exam/audit.jsonl"
"#;
