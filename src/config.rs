use crate::broker::FillMode;
use crate::error::ConfigError;
use chrono::Duration as ChronoDuration;
use serde_json::Value;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Every key the executor reads. Each may be overridden by an environment variable of the same name.
pub const SETTING_KEYS: &[&str] = &[
    "SIGNAL_FEED_PATH",
    "SYMBOLS_PATH",
    "STATE_PATH",
    "JOURNAL_PATH",
    "BRIDGE_URL",
    "BRIDGE_TOKEN",
    "ENTRY_POLL_SECS",
    "MONITOR_POLL_SECS",
    "RELOAD_SECS",
    "PERSIST_INTERVAL_SECS",
    "BROKER_TIMEOUT_SECS",
    "STATUS_EVERY_CYCLES",
    "MAX_OPEN_POSITIONS",
    "DEFAULT_LOT",
    "DAILY_LOSS_LIMIT_PCT",
    "STARTING_BALANCE",
    "LOSS_COOLDOWN_MINUTES",
    "BREAKEVEN_TRIGGER_RATIO",
    "BREAKEVEN_OFFSET_PIPS",
    "TRAILING_STOP_PIPS",
    "PRIMARY_FILL_MODE",
    "FALLBACK_FILL_MODE",
    "DEVIATION_POINTS",
    "PENDING_GRACE_SECS",
    "SEEN_CAPACITY",
    "CLOSED_HISTORY_LIMIT",
];

#[derive(Debug, Clone, PartialEq)]
pub struct RiskSettings {
    pub max_open_positions: usize,
    pub daily_loss_limit_pct: f64,
    pub loss_cooldown: ChronoDuration,
    pub starting_balance: Option<f64>,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            max_open_positions: 43,
            daily_loss_limit_pct: 5.0,
            loss_cooldown: ChronoDuration::minutes(240),
            starting_balance: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PositionSettings {
    pub breakeven_trigger_ratio: f64,
    pub breakeven_offset_pips: f64,
    /// Zero disables trailing.
    pub trailing_stop_pips: f64,
    pub pending_grace: ChronoDuration,
    pub closed_history_limit: usize,
}

impl Default for PositionSettings {
    fn default() -> Self {
        Self {
            breakeven_trigger_ratio: 0.5,
            breakeven_offset_pips: 0.0,
            trailing_stop_pips: 0.0,
            pending_grace: ChronoDuration::seconds(60),
            closed_history_limit: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewaySettings {
    pub primary_fill_mode: FillMode,
    pub fallback_fill_mode: Option<FillMode>,
    pub deviation_points: u32,
    pub broker_timeout: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            primary_fill_mode: FillMode::Ioc,
            fallback_fill_mode: Some(FillMode::Fok),
            deviation_points: 20,
            broker_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub signal_feed_path: PathBuf,
    pub symbols_path: PathBuf,
    pub state_path: PathBuf,
    pub journal_path: PathBuf,
    pub bridge_url: String,
    pub bridge_token: Option<String>,
    pub entry_poll: Duration,
    pub monitor_poll: Duration,
    pub reload_interval: Duration,
    pub persist_interval: Duration,
    pub status_every_cycles: u64,
    pub default_lot: f64,
    pub seen_capacity: usize,
    pub risk: RiskSettings,
    pub positions: PositionSettings,
    pub gateway: GatewaySettings,
}

impl ExecutorSettings {
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let signal_feed_path = PathBuf::from(require_setting(settings, "SIGNAL_FEED_PATH")?);
        let symbols_path = PathBuf::from(require_setting(settings, "SYMBOLS_PATH")?);
        let state_path = PathBuf::from(require_setting(settings, "STATE_PATH")?);
        let journal_path = PathBuf::from(require_setting(settings, "JOURNAL_PATH")?);
        let bridge_url = require_setting(settings, "BRIDGE_URL")?
            .trim_end_matches('/')
            .to_string();
        let bridge_token = optional_setting(settings, "BRIDGE_TOKEN").map(str::to_string);

        let entry_poll_secs = setting_f64_or(settings, "ENTRY_POLL_SECS", 1.0, Some(0.05), None)?;
        let monitor_poll_secs =
            setting_f64_or(settings, "MONITOR_POLL_SECS", 10.0, Some(0.05), None)?;
        let reload_secs = setting_f64_or(settings, "RELOAD_SECS", 300.0, Some(1.0), None)?;
        let persist_secs =
            setting_f64_or(settings, "PERSIST_INTERVAL_SECS", 60.0, Some(0.0), None)?;
        let broker_timeout_secs =
            setting_f64_or(settings, "BROKER_TIMEOUT_SECS", 5.0, Some(0.1), Some(120.0))?;
        let status_every_cycles = setting_usize_or(settings, "STATUS_EVERY_CYCLES", 60, 0)? as u64;

        let max_open_positions = setting_usize_or(settings, "MAX_OPEN_POSITIONS", 43, 1)?;
        let default_lot = setting_f64_or(settings, "DEFAULT_LOT", 0.01, Some(0.0001), None)?;
        let daily_loss_limit_pct =
            setting_f64_or(settings, "DAILY_LOSS_LIMIT_PCT", 5.0, Some(0.0), Some(100.0))?;
        let starting_balance = match optional_setting(settings, "STARTING_BALANCE") {
            Some(_) => Some(require_setting_f64(
                settings,
                "STARTING_BALANCE",
                Some(0.0),
                None,
            )?),
            None => None,
        };
        let loss_cooldown_minutes =
            setting_usize_or(settings, "LOSS_COOLDOWN_MINUTES", 240, 0)? as i64;

        let breakeven_trigger_ratio =
            setting_f64_or(settings, "BREAKEVEN_TRIGGER_RATIO", 0.5, Some(0.0), None)?;
        let breakeven_offset_pips =
            setting_f64_or(settings, "BREAKEVEN_OFFSET_PIPS", 0.0, Some(0.0), None)?;
        let trailing_stop_pips =
            setting_f64_or(settings, "TRAILING_STOP_PIPS", 0.0, Some(0.0), None)?;
        let pending_grace_secs = setting_usize_or(settings, "PENDING_GRACE_SECS", 60, 0)? as i64;
        let closed_history_limit = setting_usize_or(settings, "CLOSED_HISTORY_LIMIT", 500, 0)?;
        let seen_capacity = setting_usize_or(settings, "SEEN_CAPACITY", 10_000, 1)?;

        let primary_fill_mode = match optional_setting(settings, "PRIMARY_FILL_MODE") {
            Some(raw) => parse_fill_mode("PRIMARY_FILL_MODE", raw)?,
            None => FillMode::Ioc,
        };
        let fallback_fill_mode = match optional_setting(settings, "FALLBACK_FILL_MODE") {
            Some(raw) if raw.eq_ignore_ascii_case("none") => None,
            Some(raw) => Some(parse_fill_mode("FALLBACK_FILL_MODE", raw)?),
            None => Some(FillMode::Fok),
        };
        if fallback_fill_mode == Some(primary_fill_mode) {
            return Err(ConfigError::Invalid {
                key: "FALLBACK_FILL_MODE".to_string(),
                reason: format!(
                    "must differ from PRIMARY_FILL_MODE (both {})",
                    primary_fill_mode.as_str()
                ),
            });
        }
        let deviation_points = setting_usize_or(settings, "DEVIATION_POINTS", 20, 0)? as u32;

        Ok(Self {
            signal_feed_path,
            symbols_path,
            state_path,
            journal_path,
            bridge_url,
            bridge_token,
            entry_poll: Duration::from_secs_f64(entry_poll_secs),
            monitor_poll: Duration::from_secs_f64(monitor_poll_secs),
            reload_interval: Duration::from_secs_f64(reload_secs),
            persist_interval: Duration::from_secs_f64(persist_secs),
            status_every_cycles,
            default_lot,
            seen_capacity,
            risk: RiskSettings {
                max_open_positions,
                daily_loss_limit_pct,
                loss_cooldown: ChronoDuration::minutes(loss_cooldown_minutes),
                starting_balance,
            },
            positions: PositionSettings {
                breakeven_trigger_ratio,
                breakeven_offset_pips,
                trailing_stop_pips,
                pending_grace: ChronoDuration::seconds(pending_grace_secs),
                closed_history_limit,
            },
            gateway: GatewaySettings {
                primary_fill_mode,
                fallback_fill_mode,
                deviation_points,
                broker_timeout: Duration::from_secs_f64(broker_timeout_secs),
            },
        })
    }
}

/// Reads a flat JSON object of settings and applies environment overrides.
pub fn load_settings_map<P: AsRef<Path>>(path: P) -> Result<HashMap<String, String>, ConfigError> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut settings = parse_settings_json(&raw, path)?;
    apply_env_overrides(&mut settings, |key| env::var(key).ok());
    Ok(settings)
}

pub fn parse_settings_json(raw: &str, path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let object: serde_json::Map<String, Value> =
        serde_json::from_str(raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    let mut settings = HashMap::new();
    for (key, value) in object {
        let text = match value {
            Value::Null => continue,
            Value::String(text) => text,
            Value::Number(number) => number.to_string(),
            Value::Bool(flag) => flag.to_string(),
            other => {
                return Err(ConfigError::Invalid {
                    key,
                    reason: format!("must be a string or number (value: {})", other),
                })
            }
        };
        settings.insert(key, text);
    }
    Ok(settings)
}

pub fn apply_env_overrides<F>(settings: &mut HashMap<String, String>, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    for key in SETTING_KEYS {
        if let Some(value) = lookup(key).filter(|value| !value.trim().is_empty()) {
            settings.insert((*key).to_string(), value);
        }
    }
}

fn parse_fill_mode(key: &str, raw: &str) -> Result<FillMode, ConfigError> {
    FillMode::parse(raw).ok_or_else(|| ConfigError::Invalid {
        key: key.to_string(),
        reason: format!("must be one of ioc, fok, return (value: {})", raw),
    })
}

fn optional_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn require_setting<'a>(
    settings: &'a HashMap<String, String>,
    key: &str,
) -> Result<&'a str, ConfigError> {
    optional_setting(settings, key).ok_or_else(|| ConfigError::Missing {
        key: key.to_string(),
    })
}

fn invalid(key: &str, reason: String) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        reason,
    }
}

fn require_setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<f64, ConfigError> {
    let raw = require_setting(settings, key)?;
    let value = raw
        .parse::<f64>()
        .map_err(|_| invalid(key, format!("must be a number (value: {})", raw)))?;
    if !value.is_finite() {
        return Err(invalid(key, format!("must be finite (value: {})", raw)));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(invalid(
                key,
                format!("must be >= {} (value: {})", min_value, raw),
            ));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(invalid(
                key,
                format!("must be <= {} (value: {})", max_value, raw),
            ));
        }
    }
    Ok(value)
}

fn setting_f64_or(
    settings: &HashMap<String, String>,
    key: &str,
    default: f64,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<f64, ConfigError> {
    if optional_setting(settings, key).is_none() {
        return Ok(default);
    }
    require_setting_f64(settings, key, min, max)
}

fn require_setting_usize(
    settings: &HashMap<String, String>,
    key: &str,
    min: usize,
) -> Result<usize, ConfigError> {
    let raw = require_setting(settings, key)?;
    let value = raw
        .parse::<f64>()
        .map_err(|_| invalid(key, format!("must be a number (value: {})", raw)))?;
    if !value.is_finite() {
        return Err(invalid(key, format!("must be finite (value: {})", raw)));
    }
    if value.fract() != 0.0 {
        return Err(invalid(key, format!("must be an integer (value: {})", raw)));
    }
    if value < min as f64 {
        return Err(invalid(key, format!("must be >= {} (value: {})", min, raw)));
    }
    Ok(value as usize)
}

fn setting_usize_or(
    settings: &HashMap<String, String>,
    key: &str,
    default: usize,
    min: usize,
) -> Result<usize, ConfigError> {
    if optional_setting(settings, key).is_none() {
        return Ok(default);
    }
    require_setting_usize(settings, key, min)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_settings() -> HashMap<String, String> {
        [
            ("SIGNAL_FEED_PATH", "data/active_tracks.json"),
            ("SYMBOLS_PATH", "config/symbols.json"),
            ("STATE_PATH", "data/executor_state.json"),
            ("JOURNAL_PATH", "data/journal.jsonl"),
            ("BRIDGE_URL", "http://127.0.0.1:8710/"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn defaults_apply_when_optional_keys_missing() {
        let settings = ExecutorSettings::from_settings_map(&base_settings()).unwrap();
        assert_eq!(settings.bridge_url, "http://127.0.0.1:8710");
        assert_eq!(settings.entry_poll, Duration::from_secs(1));
        assert_eq!(settings.monitor_poll, Duration::from_secs(10));
        assert_eq!(settings.risk, RiskSettings::default());
        assert_eq!(settings.positions, PositionSettings::default());
        assert_eq!(settings.gateway, GatewaySettings::default());
        assert_eq!(settings.default_lot, 0.01);
        assert_eq!(settings.seen_capacity, 10_000);
        assert!(settings.bridge_token.is_none());
    }

    #[test]
    fn missing_required_key_is_reported_by_name() {
        let mut map = base_settings();
        map.remove("BRIDGE_URL");
        let err = ExecutorSettings::from_settings_map(&map).unwrap_err();
        assert_eq!(err.to_string(), "missing required setting BRIDGE_URL");
    }

    #[test]
    fn range_violations_are_rejected() {
        let mut map = base_settings();
        map.insert("DAILY_LOSS_LIMIT_PCT".to_string(), "150".to_string());
        let err = ExecutorSettings::from_settings_map(&map).unwrap_err();
        assert!(err.to_string().contains("must be <= 100"));

        let mut map = base_settings();
        map.insert("MAX_OPEN_POSITIONS".to_string(), "2.5".to_string());
        let err = ExecutorSettings::from_settings_map(&map).unwrap_err();
        assert!(err.to_string().contains("must be an integer"));
    }

    #[test]
    fn fill_modes_parse_and_must_differ() {
        let mut map = base_settings();
        map.insert("PRIMARY_FILL_MODE".to_string(), "FOK".to_string());
        map.insert("FALLBACK_FILL_MODE".to_string(), "return".to_string());
        let settings = ExecutorSettings::from_settings_map(&map).unwrap();
        assert_eq!(settings.gateway.primary_fill_mode, FillMode::Fok);
        assert_eq!(settings.gateway.fallback_fill_mode, Some(FillMode::Return));

        map.insert("FALLBACK_FILL_MODE".to_string(), "none".to_string());
        let settings = ExecutorSettings::from_settings_map(&map).unwrap();
        assert_eq!(settings.gateway.fallback_fill_mode, None);

        map.insert("FALLBACK_FILL_MODE".to_string(), "fok".to_string());
        assert!(ExecutorSettings::from_settings_map(&map).is_err());
    }

    #[test]
    fn json_values_and_env_overrides() {
        let raw = r#"{"MAX_OPEN_POSITIONS": 10, "DEFAULT_LOT": "0.02", "BRIDGE_TOKEN": null}"#;
        let mut map = parse_settings_json(raw, Path::new("executor.json")).unwrap();
        assert_eq!(map.get("MAX_OPEN_POSITIONS").map(String::as_str), Some("10"));
        assert!(!map.contains_key("BRIDGE_TOKEN"));

        apply_env_overrides(&mut map, |key| match key {
            "MAX_OPEN_POSITIONS" => Some("12".to_string()),
            "DEFAULT_LOT" => Some("  ".to_string()),
            _ => None,
        });
        assert_eq!(map.get("MAX_OPEN_POSITIONS").map(String::as_str), Some("12"));
        assert_eq!(map.get("DEFAULT_LOT").map(String::as_str), Some("0.02"));
    }

    #[test]
    fn nested_values_are_invalid() {
        let err = parse_settings_json(r#"{"SYMBOLS": {"a": 1}}"#, Path::new("x.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }
}
