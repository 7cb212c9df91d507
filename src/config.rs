//! Configuration loading and defaults for coder-bridge.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_MODEL: &str = "deepseek/deepseek-chat";
pub const DEFAULT_MAX_REFLECTIONS: u32 = 10;
pub const MAX_REFLECTIONS_LIMIT: u32 = 100;
pub const DEFAULT_MAX_SESSIONS: usize = 64;

// === Types ===

/// Raw retry configuration loaded from config files.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    pub enabled: Option<bool>,
    pub max_retries: Option<u32>,
    pub initial_delay: Option<f64>,
    pub max_delay: Option<f64>,
    pub exponential_base: Option<f64>,
}

/// Resolved retry policy with defaults applied.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_retries: u32,
    pub initial_delay: f64,
    pub max_delay: f64,
    pub exponential_base: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            initial_delay: 1.0,
            max_delay: 60.0,
            exponential_base: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Compute the backoff delay for a retry attempt.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.initial_delay * self.exponential_base.powi(exponent);
        let delay = delay.min(self.max_delay);
        // Clamp to a sane range to guard against NaN/negative from misconfigured values
        let delay = delay.clamp(0.0, 300.0);
        Duration::from_secs_f64(delay)
    }
}

/// Confirmation handshake settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfirmConfig {
    /// Forward confirmation questions to the client instead of answering them
    /// with the built-in policy.
    pub interactive: Option<bool>,
    /// Give up waiting for a reply after this many seconds.
    pub timeout_secs: Option<u64>,
}

/// Resolved server configuration, including defaults and environment overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub default_model: Option<String>,
    pub max_reflections: Option<u32>,
    pub max_sessions: Option<usize>,
    pub workspace: Option<String>,
    pub confirm: Option<ConfirmConfig>,
    pub retry: Option<RetryConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct ConfigFile {
    #[serde(flatten)]
    base: Config,
    profiles: Option<HashMap<String, Config>>,
}

// === Config Loading ===

impl Config {
    /// Load configuration from disk and merge with environment overrides.
    pub fn load(path: Option<PathBuf>, profile: Option<&str>) -> Result<Self> {
        let path = resolve_load_config_path(path);
        let mut config = match path.as_ref() {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file: {}", path.display()))?;
                let parsed: ConfigFile = toml::from_str(&contents)
                    .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
                apply_profile(parsed, profile)?
            }
            _ => Config::default(),
        };

        apply_env_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Validate ranges and non-empty fields.
    pub fn validate(&self) -> Result<()> {
        if let Some(host) = self.host.as_deref()
            && host.trim().is_empty()
        {
            anyhow::bail!("host cannot be empty string");
        }
        if self.port == Some(0) {
            anyhow::bail!("port must be > 0");
        }
        if let Some(model) = self.default_model.as_deref()
            && model.trim().is_empty()
        {
            anyhow::bail!("default_model cannot be empty string");
        }
        if let Some(max) = self.max_reflections
            && max > MAX_REFLECTIONS_LIMIT
        {
            anyhow::bail!(
                "Invalid max_reflections {max}: expected a value between 0 and {MAX_REFLECTIONS_LIMIT}."
            );
        }
        if self.max_sessions == Some(0) {
            anyhow::bail!("max_sessions must be > 0");
        }
        Ok(())
    }

    #[must_use]
    pub fn host(&self) -> String {
        self.host
            .clone()
            .unwrap_or_else(|| DEFAULT_HOST.to_string())
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    #[must_use]
    pub fn default_model(&self) -> String {
        self.default_model
            .clone()
            .unwrap_or_else(|| DEFAULT_MODEL.to_string())
    }

    #[must_use]
    pub fn max_reflections(&self) -> u32 {
        self.max_reflections.unwrap_or(DEFAULT_MAX_REFLECTIONS)
    }

    /// Live sessions kept before the least recently used idle one is evicted.
    #[must_use]
    pub fn max_sessions(&self) -> usize {
        self.max_sessions.unwrap_or(DEFAULT_MAX_SESSIONS)
    }

    /// Workspace root used to resolve relative reference paths.
    #[must_use]
    pub fn workspace(&self) -> Option<PathBuf> {
        self.workspace.as_deref().map(expand_path)
    }

    #[must_use]
    pub fn confirm_interactive(&self) -> bool {
        self.confirm
            .as_ref()
            .and_then(|c| c.interactive)
            .unwrap_or(false)
    }

    #[must_use]
    pub fn confirm_timeout(&self) -> Option<Duration> {
        self.confirm
            .as_ref()
            .and_then(|c| c.timeout_secs)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Resolve the effective retry policy with defaults applied.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        let Some(cfg) = &self.retry else {
            return defaults;
        };

        RetryPolicy {
            enabled: cfg.enabled.unwrap_or(defaults.enabled),
            max_retries: cfg.max_retries.unwrap_or(defaults.max_retries),
            initial_delay: cfg.initial_delay.unwrap_or(defaults.initial_delay),
            max_delay: cfg.max_delay.unwrap_or(defaults.max_delay),
            exponential_base: cfg.exponential_base.unwrap_or(defaults.exponential_base),
        }
    }
}

// === Defaults ===

fn home_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".coder-bridge").join("config.toml"))
}

fn env_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CODER_BRIDGE_CONFIG_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return Some(expand_path(trimmed));
        }
    }
    None
}

fn expand_pathbuf(path: PathBuf) -> PathBuf {
    if let Some(raw) = path.to_str() {
        return expand_path(raw);
    }
    path
}

fn resolve_load_config_path(path: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = path {
        return Some(expand_pathbuf(path));
    }

    if let Some(path) = env_config_path() {
        if path.exists() {
            return Some(path);
        }
        if let Some(home_path) = home_config_path()
            && home_path.exists()
        {
            return Some(home_path);
        }
        return Some(path);
    }

    home_config_path()
}

fn expand_path(path: &str) -> PathBuf {
    let expanded = shellexpand::tilde(path);
    PathBuf::from(expanded.as_ref())
}

// === Environment Overrides ===

fn apply_env_overrides(config: &mut Config) {
    if let Ok(value) = std::env::var("CODER_BRIDGE_HOST") {
        config.host = Some(value);
    }
    if let Ok(value) = std::env::var("CODER_BRIDGE_PORT")
        && let Ok(parsed) = value.trim().parse::<u16>()
    {
        config.port = Some(parsed);
    }
    if let Ok(value) = std::env::var("CODER_BRIDGE_MODEL") {
        config.default_model = Some(value);
    }
    if let Ok(value) = std::env::var("CODER_BRIDGE_MAX_REFLECTIONS")
        && let Ok(parsed) = value.trim().parse::<u32>()
    {
        config.max_reflections = Some(parsed);
    }
    if let Ok(value) = std::env::var("CODER_BRIDGE_MAX_SESSIONS")
        && let Ok(parsed) = value.trim().parse::<usize>()
    {
        config.max_sessions = Some(parsed);
    }
    if let Ok(value) = std::env::var("CODER_BRIDGE_WORKSPACE") {
        config.workspace = Some(value);
    }
    if let Ok(value) = std::env::var("CODER_BRIDGE_INTERACTIVE_CONFIRM") {
        let confirm = config.confirm.get_or_insert_with(ConfirmConfig::default);
        confirm.interactive = Some(value == "1" || value.eq_ignore_ascii_case("true"));
    }
}

fn apply_profile(config: ConfigFile, profile: Option<&str>) -> Result<Config> {
    let Some(profile_name) = profile else {
        return Ok(config.base);
    };
    let profiles = config.profiles.as_ref();
    match profiles.and_then(|profiles| profiles.get(profile_name)) {
        Some(override_cfg) => Ok(merge_config(config.base, override_cfg.clone())),
        None => {
            let available = profiles
                .map(|profiles| {
                    let mut keys = profiles.keys().cloned().collect::<Vec<_>>();
                    keys.sort();
                    if keys.is_empty() {
                        "none".to_string()
                    } else {
                        keys.join(", ")
                    }
                })
                .unwrap_or_else(|| "none".to_string());
            anyhow::bail!(
                "Profile '{}' not found. Available profiles: {}",
                profile_name,
                available
            )
        }
    }
}

fn merge_config(base: Config, override_cfg: Config) -> Config {
    Config {
        host: override_cfg.host.or(base.host),
        port: override_cfg.port.or(base.port),
        default_model: override_cfg.default_model.or(base.default_model),
        max_reflections: override_cfg.max_reflections.or(base.max_reflections),
        max_sessions: override_cfg.max_sessions.or(base.max_sessions),
        workspace: override_cfg.workspace.or(base.workspace),
        confirm: override_cfg.confirm.or(base.confirm),
        retry: override_cfg.retry.or(base.retry),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::lock_test_env;
    use std::env;
    use std::ffi::OsString;

    struct EnvGuard {
        saved: Vec<(&'static str, Option<OsString>)>,
    }

    impl EnvGuard {
        fn set(vars: &[(&'static str, &str)]) -> Self {
            let mut saved = Vec::new();
            for (key, value) in vars {
                saved.push((*key, env::var_os(key)));
                // Safety: test-only environment mutation guarded by a global mutex.
                unsafe {
                    env::set_var(key, value);
                }
            }
            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.saved.drain(..) {
                // Safety: test-only environment mutation guarded by a global mutex.
                unsafe {
                    match value {
                        Some(value) => env::set_var(key, value),
                        None => env::remove_var(key),
                    }
                }
            }
        }
    }

    #[test]
    fn defaults_apply_without_config_file() {
        let config = Config::default();
        assert_eq!(config.host(), DEFAULT_HOST);
        assert_eq!(config.port(), DEFAULT_PORT);
        assert_eq!(config.max_reflections(), DEFAULT_MAX_REFLECTIONS);
        assert_eq!(config.max_sessions(), DEFAULT_MAX_SESSIONS);
        assert!(!config.confirm_interactive());
        assert!(config.confirm_timeout().is_none());
    }

    #[test]
    fn load_reads_file_and_profile() -> Result<()> {
        let _lock = lock_test_env();
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
port = 6100
max_reflections = 4
max_sessions = 8

[confirm]
interactive = true
timeout_secs = 30

[profiles.work]
port = 6200
"#,
        )?;

        let config = Config::load(Some(path.clone()), None)?;
        assert_eq!(config.port(), 6100);
        assert_eq!(config.max_reflections(), 4);
        assert_eq!(config.max_sessions(), 8);
        assert!(config.confirm_interactive());
        assert_eq!(config.confirm_timeout(), Some(Duration::from_secs(30)));

        let config = Config::load(Some(path), Some("work"))?;
        assert_eq!(config.port(), 6200);
        assert_eq!(config.max_reflections(), 4);
        Ok(())
    }

    #[test]
    fn env_overrides_win_over_file() -> Result<()> {
        let _lock = lock_test_env();
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.toml");
        fs::write(&path, "port = 6100\n")?;
        let _guard = EnvGuard::set(&[
            ("CODER_BRIDGE_PORT", "7100"),
            ("CODER_BRIDGE_INTERACTIVE_CONFIRM", "true"),
        ]);

        let config = Config::load(Some(path), None)?;
        assert_eq!(config.port(), 7100);
        assert!(config.confirm_interactive());
        Ok(())
    }

    #[test]
    fn test_nonexistent_profile_error() {
        let mut profiles = HashMap::new();
        profiles.insert("work".to_string(), Config::default());
        let config = ConfigFile {
            base: Config::default(),
            profiles: Some(profiles),
        };

        let err = apply_profile(config, Some("nonexistent")).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Profile 'nonexistent' not found"));
        assert!(message.contains("work"));
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        let config = Config {
            max_reflections: Some(MAX_REFLECTIONS_LIMIT + 1),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            port: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            max_sessions: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn retry_delay_is_clamped() {
        let policy = RetryPolicy {
            max_delay: 5.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
    }
}
