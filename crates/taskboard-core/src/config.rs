use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::model::CollectionName;

/// Default staleness window: five minutes.
pub const DEFAULT_STALE_WINDOW_SECS: u64 = 5 * 60;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub realtime: RealtimeConfig,
}

/// How a delta write stamps the persisted cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampPolicy {
    /// Every delta write restamps the entry with the current time, which
    /// also resets the staleness window.
    #[default]
    RestampOnDelta,
    /// Delta writes keep the timestamp of the last successful fetch.
    FetchOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_stale_window_secs")]
    pub stale_window_secs: u64,
    #[serde(default)]
    pub timestamp_policy: TimestampPolicy,
    /// Cache database location; relative paths resolve against the project root.
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_window_secs: default_stale_window_secs(),
            timestamp_policy: TimestampPolicy::default(),
            path: default_cache_path(),
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub const fn stale_window(&self) -> Duration {
        Duration::from_secs(self.stale_window_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    #[serde(default = "default_watched_collections")]
    pub collections: Vec<CollectionName>,
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            collections: default_watched_collections(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

impl RealtimeConfig {
    #[must_use]
    pub const fn reconnect_initial_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    #[must_use]
    pub const fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    Dark,
    #[default]
    System,
}

/// Per-user presentation settings, passed explicitly to components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub theme: Theme,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            language: default_language(),
            theme: Theme::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub sync: SyncConfig,
    pub settings: Settings,
}

pub fn load_sync_config(project_root: &Path) -> Result<SyncConfig> {
    let path = project_root.join(".taskboard/config.toml");
    if !path.exists() {
        return Ok(SyncConfig::default());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<SyncConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

pub fn load_settings() -> Result<Settings> {
    let Some(config_dir) = dirs::config_dir() else {
        return Ok(Settings::default());
    };
    load_settings_from(&config_dir.join("taskboard/config.toml"))
}

fn load_settings_from(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<Settings>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Load project and user configuration and apply environment overrides.
pub fn resolve_config(project_root: &Path) -> Result<EffectiveConfig> {
    let mut sync = load_sync_config(project_root)?;
    let settings = load_settings()?;

    let env_window = env::var("TASKBOARD_STALE_WINDOW_SECS").ok();
    sync.cache.stale_window_secs =
        resolve_stale_window(sync.cache.stale_window_secs, env_window.as_deref())?;
    if sync.cache.path.is_relative() {
        sync.cache.path = project_root.join(&sync.cache.path);
    }
    validate(&sync)?;

    Ok(EffectiveConfig { sync, settings })
}

fn resolve_stale_window(configured: u64, env_value: Option<&str>) -> Result<u64> {
    match env_value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(configured),
        Some(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("TASKBOARD_STALE_WINDOW_SECS is not a number: '{raw}'")),
    }
}

fn validate(config: &SyncConfig) -> Result<()> {
    if config.realtime.reconnect_initial_ms == 0 {
        bail!("realtime.reconnect_initial_ms must be positive");
    }
    if config.realtime.reconnect_max_ms < config.realtime.reconnect_initial_ms {
        bail!("realtime.reconnect_max_ms must be >= realtime.reconnect_initial_ms");
    }
    Ok(())
}

const fn default_stale_window_secs() -> u64 {
    DEFAULT_STALE_WINDOW_SECS
}

fn default_cache_path() -> PathBuf {
    PathBuf::from(".taskboard/cache.sqlite3")
}

fn default_watched_collections() -> Vec<CollectionName> {
    vec![CollectionName::Tasks, CollectionName::Notifications]
}

const fn default_reconnect_initial_ms() -> u64 {
    500
}

const fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_language() -> String {
    "en".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn make_temp_dir(label: &str) -> std::path::PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!("taskboard-config-test-{label}-{id}"));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).expect("temp dir must be created");
        dir
    }

    #[test]
    fn missing_project_config_uses_defaults() {
        let root = make_temp_dir("project-default");
        let cfg = load_sync_config(&root).expect("load should succeed");
        assert_eq!(cfg.cache.stale_window(), Duration::from_secs(300));
        assert_eq!(cfg.cache.timestamp_policy, TimestampPolicy::RestampOnDelta);
        assert_eq!(
            cfg.realtime.collections,
            vec![CollectionName::Tasks, CollectionName::Notifications]
        );
        assert_eq!(cfg.realtime.reconnect_initial_delay(), Duration::from_millis(500));
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn project_config_overrides_fields() {
        let root = make_temp_dir("project-override");
        std::fs::create_dir_all(root.join(".taskboard")).expect("create .taskboard");
        std::fs::write(
            root.join(".taskboard/config.toml"),
            r#"
[cache]
stale_window_secs = 60
timestamp_policy = "fetch_only"

[realtime]
collections = ["tasks"]
reconnect_max_ms = 2000
"#,
        )
        .expect("write config");

        let cfg = load_sync_config(&root).expect("load");
        assert_eq!(cfg.cache.stale_window_secs, 60);
        assert_eq!(cfg.cache.timestamp_policy, TimestampPolicy::FetchOnly);
        assert_eq!(cfg.realtime.collections, vec![CollectionName::Tasks]);
        assert_eq!(cfg.realtime.reconnect_initial_ms, 500);
        assert_eq!(cfg.realtime.reconnect_max_ms, 2000);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn malformed_config_reports_path() {
        let root = make_temp_dir("project-bad");
        std::fs::create_dir_all(root.join(".taskboard")).expect("create .taskboard");
        std::fs::write(root.join(".taskboard/config.toml"), "[cache\nnope").expect("write");

        let err = load_sync_config(&root).expect_err("parse must fail");
        assert!(err.to_string().contains("Failed to parse"));
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn env_window_overrides_config() {
        assert_eq!(resolve_stale_window(300, None).expect("none"), 300);
        assert_eq!(resolve_stale_window(300, Some(" ")).expect("blank"), 300);
        assert_eq!(resolve_stale_window(300, Some("45")).expect("env"), 45);
        assert!(resolve_stale_window(300, Some("soon")).is_err());
    }

    #[test]
    fn settings_parse_with_defaults() {
        let root = make_temp_dir("settings");
        let path = root.join("settings.toml");
        assert_eq!(load_settings_from(&path).expect("missing"), Settings::default());

        std::fs::write(&path, "theme = \"dark\"\n").expect("write");
        let settings = load_settings_from(&path).expect("load");
        assert_eq!(settings.theme, Theme::Dark);
        assert_eq!(settings.language, "en");
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn validate_rejects_inverted_backoff() {
        let mut cfg = SyncConfig::default();
        cfg.realtime.reconnect_max_ms = 10;
        assert!(validate(&cfg).is_err());
        cfg.realtime.reconnect_max_ms = 30_000;
        cfg.realtime.reconnect_initial_ms = 0;
        assert!(validate(&cfg).is_err());
    }
}
