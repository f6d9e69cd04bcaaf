//! Configuration loader and validator for the dispenser dashboard backend.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::allocator::{ChamberPool, DEFAULT_CHAMBER_COUNT};
use crate::notify::Permission;
use crate::schedule::MatchPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub dispenser: Dispenser,
    #[serde(default)]
    pub schedule: Schedule,
    #[serde(default)]
    pub notifications: Notifications,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// How often the monitor re-checks dose times without a store change.
    pub tick_interval_ms: u64,
    /// How often subscriptions poll for writes made by other processes.
    #[serde(default = "default_watch_poll_ms")]
    pub watch_poll_ms: u64,
}

fn default_watch_poll_ms() -> u64 {
    500
}

/// Expand a leading `~/` using `HOME`. Other paths are returned unchanged.
pub fn expand_home(path: &str) -> String {
    match path.strip_prefix("~/") {
        Some(rest) => match std::env::var("HOME") {
            Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
            Err(_) => path.to_string(),
        },
        None => path.to_string(),
    }
}

/// Physical dispenser layout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dispenser {
    pub chamber_count: u8,
}

impl Default for Dispenser {
    fn default() -> Self {
        Self {
            chamber_count: DEFAULT_CHAMBER_COUNT,
        }
    }
}

/// Dose matching. `grace_minutes: 0` matches the exact minute only.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Schedule {
    pub grace_minutes: u32,
}

/// Platform alert settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notifications {
    pub permission: Permission,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

impl Default for Notifications {
    fn default() -> Self {
        Self {
            permission: Permission::Default,
            icon: Some("/favicon.ico".to_string()),
            webhook_url: None,
        }
    }
}

impl App {
    /// `data_dir` with a leading `~/` expanded.
    pub fn resolved_data_dir(&self) -> String {
        expand_home(&self.data_dir)
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    pub fn chamber_pool(&self) -> ChamberPool {
        ChamberPool::new(self.dispenser.chamber_count)
    }

    pub fn watch_poll_interval(&self) -> Duration {
        Duration::from_millis(self.app.watch_poll_ms)
    }

    pub fn match_policy(&self) -> MatchPolicy {
        MatchPolicy::from_grace_minutes(self.schedule.grace_minutes)
    }

    /// `DATABASE_URL` if set, else a SQLite file under the data dir.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/dosebuddy.db", self.app.resolved_data_dir()))
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.tick_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.tick_interval_ms must be > 0"));
    }
    if cfg.app.watch_poll_ms == 0 {
        return Err(ConfigError::Invalid("app.watch_poll_ms must be > 0"));
    }
    if cfg.dispenser.chamber_count == 0 {
        return Err(ConfigError::Invalid("dispenser.chamber_count must be > 0"));
    }
    // A dose cannot stay due into the next day's trigger.
    if cfg.schedule.grace_minutes >= 24 * 60 {
        return Err(ConfigError::Invalid(
            "schedule.grace_minutes must be less than a day",
        ));
    }
    if let Some(url) = cfg.notifications.webhook_url.as_deref() {
        if !url.trim().is_empty() && reqwest::Url::parse(url).is_err() {
            return Err(ConfigError::Invalid(
                "notifications.webhook_url must be a valid URL",
            ));
        }
    }
    Ok(())
}

/// Returns the example YAML content.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  tick_interval_ms: 1000
  watch_poll_ms: 500

dispenser:
  chamber_count: 4

schedule:
  grace_minutes: 0

notifications:
  permission: "granted"
  icon: "/favicon.ico"
  webhook_url: ""
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.chamber_pool().size(), 4);
        assert_eq!(cfg.match_policy(), MatchPolicy::ExactMinute);
        assert_eq!(cfg.notifications.permission, Permission::Granted);
    }

    #[test]
    fn optional_sections_default() {
        let cfg: Config = serde_yaml::from_str(
            "app:\n  data_dir: \"./data\"\n  tick_interval_ms: 500\n",
        )
        .unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.dispenser.chamber_count, 4);
        assert_eq!(cfg.app.watch_poll_ms, 500);
        assert_eq!(cfg.schedule.grace_minutes, 0);
        assert_eq!(cfg.notifications.permission, Permission::Default);
        assert_eq!(cfg.notifications.icon.as_deref(), Some("/favicon.ico"));
    }

    #[test]
    fn invalid_app_settings() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = "  ".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("app.data_dir")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.tick_interval_ms = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(msg)) if msg.contains("tick_interval_ms")));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.watch_poll_ms = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(msg)) if msg.contains("watch_poll_ms")));
    }

    #[test]
    fn expand_home_only_touches_tilde_paths() {
        assert_eq!(expand_home("./data"), "./data");
        assert_eq!(expand_home("/var/lib/dose"), "/var/lib/dose");
        if let Ok(home) = std::env::var("HOME") {
            assert_eq!(
                expand_home("~/dose/db.sqlite"),
                format!("{}/dose/db.sqlite", home.trim_end_matches('/'))
            );
        }
    }

    #[test]
    fn invalid_dispenser_and_schedule() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.dispenser.chamber_count = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(msg)) if msg.contains("chamber_count")));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.schedule.grace_minutes = 24 * 60;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(msg)) if msg.contains("grace_minutes")));

        cfg.schedule.grace_minutes = 5;
        validate(&cfg).unwrap();
        assert_eq!(cfg.match_policy(), MatchPolicy::Grace { minutes: 5 });
    }

    #[test]
    fn invalid_webhook_url() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.notifications.webhook_url = Some("not a url".into());
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(msg)) if msg.contains("webhook_url")));

        cfg.notifications.webhook_url = Some("https://ntfy.example/dose".into());
        validate(&cfg).unwrap();
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.app.tick_interval_ms, 1000);
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let td = tempdir().unwrap();
        let err = load(Some(&td.path().join("nope.yaml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
