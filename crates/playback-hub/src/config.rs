//! Configuration loading and defaults.
//!
//! `HubConfigFile` mirrors the optional TOML schema; `HubConfig` is the resolved
//! form the hub components consume.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Default wait bound for a query dispatched to the executor.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
/// Default wait bound for `get_or_create` while construction is in flight.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);
/// Minimum spacing between accepted inbound syncs (max ~3 per second).
pub const DEFAULT_SYNC_THROTTLE: Duration = Duration::from_millis(330);
/// Default seek forward/backward step.
pub const DEFAULT_SEEK_INCREMENT_MS: u64 = 10_000;
/// Default executor thread name.
pub const DEFAULT_EXECUTOR_NAME: &str = "playback-affinity";

/// Consumer id fragments that identify external takeover integrations.
pub const DEFAULT_TAKEOVER_PATTERNS: [&str; 4] = ["auto.", "android.auto", "car.", "automotive"];

/// Resolved hub settings.
#[derive(Clone, Debug)]
pub struct HubConfig {
    /// Name given to the executor thread.
    pub executor_name: String,
    /// Query wait bound.
    pub call_timeout: Duration,
    /// Construction wait bound.
    pub ready_timeout: Duration,
    /// Inbound sync throttle window.
    pub sync_throttle: Duration,
    /// Seek forward/backward increment.
    pub seek_increment_ms: u64,
    /// Takeover denylist, matched as substrings of consumer ids.
    pub takeover_patterns: Vec<String>,
    /// Log every dispatched command at trace level.
    pub trace_calls: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            executor_name: DEFAULT_EXECUTOR_NAME.to_string(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            sync_throttle: DEFAULT_SYNC_THROTTLE,
            seek_increment_ms: DEFAULT_SEEK_INCREMENT_MS,
            takeover_patterns: DEFAULT_TAKEOVER_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            trace_calls: false,
        }
    }
}

impl HubConfig {
    /// Load a TOML file and fill the gaps with defaults.
    pub fn load(path: &Path) -> Result<Self> {
        Ok(HubConfigFile::load(path)?.resolve())
    }
}

/// Hub configuration as written in TOML. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HubConfigFile {
    /// Executor thread name.
    pub executor_name: Option<String>,
    /// Query wait bound in milliseconds.
    pub call_timeout_ms: Option<u64>,
    /// Construction wait bound in milliseconds.
    pub ready_timeout_ms: Option<u64>,
    /// Inbound sync throttle window in milliseconds.
    pub sync_throttle_ms: Option<u64>,
    /// Seek forward/backward increment in milliseconds.
    pub seek_increment_ms: Option<u64>,
    /// Replacement takeover denylist.
    pub takeover_patterns: Option<Vec<String>>,
    /// Trace every dispatched command.
    pub trace_calls: Option<bool>,
}

impl HubConfigFile {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        Self::parse(&raw).with_context(|| format!("parse config {:?}", path))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str::<HubConfigFile>(raw)?)
    }

    /// Resolve against defaults.
    pub fn resolve(self) -> HubConfig {
        let defaults = HubConfig::default();
        let takeover_patterns = self
            .takeover_patterns
            .map(normalize_patterns)
            .unwrap_or(defaults.takeover_patterns);
        HubConfig {
            executor_name: self
                .executor_name
                .and_then(|name| {
                    let trimmed = name.trim();
                    if trimmed.is_empty() {
                        None
                    } else {
                        Some(trimmed.to_string())
                    }
                })
                .unwrap_or(defaults.executor_name),
            call_timeout: self
                .call_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.call_timeout),
            ready_timeout: self
                .ready_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.ready_timeout),
            sync_throttle: self
                .sync_throttle_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.sync_throttle),
            seek_increment_ms: self.seek_increment_ms.unwrap_or(defaults.seek_increment_ms),
            takeover_patterns,
            trace_calls: self.trace_calls.unwrap_or(defaults.trace_calls),
        }
    }
}

fn normalize_patterns(patterns: Vec<String>) -> Vec<String> {
    patterns
        .into_iter()
        .map(|p| p.trim().to_ascii_lowercase())
        .filter(|p| !p.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_resolves_to_defaults() {
        let cfg = HubConfigFile::parse("").unwrap().resolve();
        assert_eq!(cfg.call_timeout, DEFAULT_CALL_TIMEOUT);
        assert_eq!(cfg.sync_throttle, DEFAULT_SYNC_THROTTLE);
        assert_eq!(cfg.executor_name, DEFAULT_EXECUTOR_NAME);
        assert_eq!(cfg.takeover_patterns.len(), DEFAULT_TAKEOVER_PATTERNS.len());
        assert!(!cfg.trace_calls);
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = HubConfigFile::parse(
            r#"
            call_timeout_ms = 250
            sync_throttle_ms = 1000
            executor_name = "  main  "
            takeover_patterns = [" Car. ", "", "tv."]
            trace_calls = true
            "#,
        )
        .unwrap()
        .resolve();
        assert_eq!(cfg.call_timeout, Duration::from_millis(250));
        assert_eq!(cfg.sync_throttle, Duration::from_secs(1));
        assert_eq!(cfg.executor_name, "main");
        assert_eq!(cfg.takeover_patterns, vec!["car.".to_string(), "tv.".to_string()]);
        assert!(cfg.trace_calls);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(HubConfigFile::parse("bogus = 1").is_err());
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.toml");
        std::fs::write(&path, "seek_increment_ms = 5000\n").unwrap();
        let cfg = HubConfig::load(&path).unwrap();
        assert_eq!(cfg.seek_increment_ms, 5_000);
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = HubConfigFile::load(&dir.path().join("missing.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("read config"));
    }
}
