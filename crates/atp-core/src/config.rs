use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

pub const CONFIG_DIR: &str = ".atp";
pub const DEFAULT_SETTLE_SECONDS: u64 = 5;
pub const DEFAULT_LOCK_STALE_SECONDS: u64 = 60;
pub const DEFAULT_RING_BUFFER_SIZE: usize = 50;

/// Every file the pipeline touches, resolved once at process start and passed
/// into component constructors. No component derives paths from ambient
/// global state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditPaths {
    pub project_root: PathBuf,
    pub event_log: PathBuf,
    pub marker: PathBuf,
    pub processor_lock: PathBuf,
    pub recommendations: PathBuf,
    pub stats_db: PathBuf,
    pub findings_db: PathBuf,
    pub directives: PathBuf,
    pub config: PathBuf,
}

impl AuditPaths {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        let project_root = project_root.into();
        let dir = project_root.join(CONFIG_DIR);
        Self {
            event_log: dir.join("events.jsonl"),
            marker: dir.join("last_event"),
            processor_lock: dir.join("processor.lock"),
            recommendations: dir.join("recommendations.json"),
            stats_db: dir.join("stats.sqlite3"),
            findings_db: dir.join("findings.sqlite3"),
            directives: dir.join("directives.json"),
            config: dir.join("config.json"),
            project_root,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditLevel {
    Minimal,
    Standard,
    Verbose,
}

impl Default for AuditLevel {
    fn default() -> Self {
        Self::Standard
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TierModels {
    pub triage: String,
    pub analysis: String,
    pub deep_dive: String,
}

impl Default for TierModels {
    fn default() -> Self {
        Self {
            triage: "haiku".to_string(),
            analysis: "sonnet".to_string(),
            deep_dive: "opus".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Thresholds {
    pub governance_block_rate: f64,
    pub reinforcement_skip_rate: f64,
    pub event_rate_spike_multiplier: f64,
    pub idle_block_count: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            governance_block_rate: 0.5,
            reinforcement_skip_rate: 0.7,
            event_rate_spike_multiplier: 3.0,
            idle_block_count: 3,
        }
    }
}

/// Duration strings like `"30d"`, `"12h"`, `"90m"`, `"45s"`. Unparseable
/// values mean "no cutoff" rather than an error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionConfig {
    pub events: String,
    pub recommendations: String,
    pub statistics: String,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            events: "30d".to_string(),
            recommendations: "90d".to_string(),
            statistics: "30d".to_string(),
        }
    }
}

impl RetentionConfig {
    pub fn events_max_age(&self) -> Option<Duration> {
        parse_duration(&self.events)
    }

    pub fn recommendations_max_age(&self) -> Option<Duration> {
        parse_duration(&self.recommendations)
    }

    pub fn statistics_max_age(&self) -> Option<Duration> {
        parse_duration(&self.statistics)
    }
}

pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.len() < 2 {
        return None;
    }
    let (digits, unit) = raw.split_at(raw.len() - 1);
    let amount: i64 = digits.parse().ok()?;
    if amount < 0 {
        return None;
    }
    match unit {
        "d" => Some(Duration::days(amount)),
        "h" => Some(Duration::hours(amount)),
        "m" => Some(Duration::minutes(amount)),
        "s" => Some(Duration::seconds(amount)),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditConfig {
    pub enabled: bool,
    #[serde(default)]
    pub level: AuditLevel,
    pub settle_seconds: u64,
    /// A lock younger than this is a live processor; at or past it the lock
    /// is treated as abandoned and removed. A slow-but-alive processor can
    /// lose its lock at this boundary; reprocessing is idempotent.
    pub lock_stale_seconds: u64,
    /// How many trailing raw events escalation requests may embed.
    pub ring_buffer_size: usize,
    pub anomaly_flush: bool,
    pub llm_analysis_enabled: bool,
    #[serde(default)]
    pub models: TierModels,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub retention: RetentionConfig,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: AuditLevel::Standard,
            settle_seconds: DEFAULT_SETTLE_SECONDS,
            lock_stale_seconds: DEFAULT_LOCK_STALE_SECONDS,
            ring_buffer_size: DEFAULT_RING_BUFFER_SIZE,
            anomaly_flush: true,
            llm_analysis_enabled: false,
            models: TierModels::default(),
            thresholds: Thresholds::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl AuditConfig {
    /// Built-in defaults deep-merged with the project settings file. A
    /// missing or malformed file degrades to defaults; it never fails the
    /// caller.
    pub fn load(paths: &AuditPaths) -> Self {
        let Ok(raw) = std::fs::read_to_string(&paths.config) else {
            return Self::default();
        };
        let Ok(overrides) = serde_json::from_str::<Value>(&raw) else {
            return Self::default();
        };
        Self::from_overrides(&overrides)
    }

    pub fn from_overrides(overrides: &Value) -> Self {
        let mut base = match serde_json::to_value(Self::default()) {
            Ok(value) => value,
            Err(_) => return Self::default(),
        };
        deep_merge(&mut base, overrides);
        serde_json::from_value(base).unwrap_or_default()
    }

    /// How many raw events escalation context may carry at the configured
    /// level.
    pub fn event_window(&self) -> usize {
        match self.level {
            AuditLevel::Minimal => 0,
            AuditLevel::Standard => self.ring_buffer_size,
            AuditLevel::Verbose => self.ring_buffer_size * 2,
        }
    }
}

/// Nested maps merge recursively, scalar overrides replace, `null` override
/// values never replace a default.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                if overlay_value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(base_value) if base_value.is_object() && overlay_value.is_object() => {
                        deep_merge(base_value, overlay_value);
                    }
                    _ => {
                        base_map.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
        }
        (base_slot, overlay_value) => {
            if !overlay_value.is_null() {
                *base_slot = overlay_value.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn built_in_defaults_are_stable() {
        let config = AuditConfig::default();
        assert!(config.enabled);
        assert_eq!(config.settle_seconds, 5);
        assert_eq!(config.lock_stale_seconds, 60);
        assert_eq!(config.thresholds.governance_block_rate, 0.5);
        assert_eq!(config.thresholds.reinforcement_skip_rate, 0.7);
        assert_eq!(config.thresholds.event_rate_spike_multiplier, 3.0);
        assert_eq!(config.thresholds.idle_block_count, 3);
    }

    #[test]
    fn overrides_merge_nested_maps_recursively() {
        let config = AuditConfig::from_overrides(&json!({
            "settle_seconds": 10,
            "thresholds": {"governance_block_rate": 0.8},
            "models": {"triage": "haiku-next"}
        }));
        assert_eq!(config.settle_seconds, 10);
        assert_eq!(config.thresholds.governance_block_rate, 0.8);
        // Untouched siblings keep their defaults.
        assert_eq!(config.thresholds.idle_block_count, 3);
        assert_eq!(config.models.triage, "haiku-next");
        assert_eq!(config.models.deep_dive, "opus");
    }

    #[test]
    fn null_overrides_keep_defaults() {
        let config = AuditConfig::from_overrides(&json!({
            "settle_seconds": null,
            "thresholds": {"idle_block_count": null}
        }));
        assert_eq!(config.settle_seconds, 5);
        assert_eq!(config.thresholds.idle_block_count, 3);
    }

    #[test]
    fn malformed_config_file_degrades_to_defaults() {
        let dir = std::env::temp_dir().join(format!(
            "atp-config-{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        let paths = AuditPaths::new(&dir);
        std::fs::create_dir_all(paths.config.parent().expect("parent")).expect("mkdir");
        std::fs::write(&paths.config, "{not json").expect("write");
        assert_eq!(AuditConfig::load(&paths), AuditConfig::default());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn duration_strings_parse_by_unit() {
        assert_eq!(parse_duration("30d"), Some(Duration::days(30)));
        assert_eq!(parse_duration("12h"), Some(Duration::hours(12)));
        assert_eq!(parse_duration("90m"), Some(Duration::minutes(90)));
        assert_eq!(parse_duration("bogus"), None);
        assert_eq!(parse_duration("7w"), None);
    }

    #[test]
    fn event_window_follows_level() {
        let mut config = AuditConfig::default();
        config.ring_buffer_size = 40;
        config.level = AuditLevel::Minimal;
        assert_eq!(config.event_window(), 0);
        config.level = AuditLevel::Verbose;
        assert_eq!(config.event_window(), 80);
    }
}
