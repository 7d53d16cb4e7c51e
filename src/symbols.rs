use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Static per-instrument configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolConfig {
    pub symbol: String,
    /// Instrument name as the terminal knows it (e.g. `XAUUSD+`).
    pub broker_symbol: String,
    pub pip_size: f64,
    /// Broker minimum stop distance, in pips.
    pub stop_level: u32,
    pub digits: u32,
    pub magic: u64,
    pub whitelist_path: Option<PathBuf>,
}

impl SymbolConfig {
    pub fn min_stop_distance(&self) -> f64 {
        self.stop_level as f64 * self.pip_size
    }

    pub fn pips_to_price(&self, pips: f64) -> f64 {
        pips * self.pip_size
    }

    pub fn round_price(&self, price: f64) -> f64 {
        round_to_digits(price, self.digits)
    }
}

pub fn round_to_digits(value: f64, digits: u32) -> f64 {
    let factor = 10f64.powi(digits as i32);
    (value * factor).round() / factor
}

#[derive(Debug, Deserialize)]
struct SymbolFile {
    symbols: BTreeMap<String, RawSymbol>,
}

#[derive(Debug, Deserialize)]
struct RawSymbol {
    #[serde(default)]
    broker: Option<String>,
    pip_size: f64,
    #[serde(default)]
    stop_level: u32,
    digits: u32,
    magic: u64,
    #[serde(default)]
    whitelist: Option<String>,
}

/// Read-only lookup table, replaced as a whole on reload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SymbolRegistry {
    symbols: BTreeMap<String, SymbolConfig>,
}

impl SymbolRegistry {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&raw, path, base_dir)
    }

    /// Parses a symbol table; relative whitelist paths resolve against `base_dir`.
    pub fn parse(raw: &str, path: &Path, base_dir: &Path) -> Result<Self, ConfigError> {
        let file: SymbolFile = serde_json::from_str(raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if file.symbols.is_empty() {
            return Err(ConfigError::Invalid {
                key: path.display().to_string(),
                reason: "no symbols configured".to_string(),
            });
        }

        let mut symbols = BTreeMap::new();
        let mut magics: BTreeMap<u64, String> = BTreeMap::new();
        for (name, entry) in file.symbols {
            let symbol = name.trim().to_uppercase();
            let config = validate_symbol(&symbol, entry, base_dir)?;
            if let Some(existing) = magics.insert(config.magic, symbol.clone()) {
                return Err(ConfigError::Symbol {
                    symbol,
                    reason: format!("magic {} already used by {}", config.magic, existing),
                });
            }
            symbols.insert(symbol, config);
        }

        Ok(Self { symbols })
    }

    pub fn from_configs<I: IntoIterator<Item = SymbolConfig>>(configs: I) -> Self {
        Self {
            symbols: configs
                .into_iter()
                .map(|config| (config.symbol.clone(), config))
                .collect(),
        }
    }

    pub fn get(&self, symbol: &str) -> Option<&SymbolConfig> {
        self.symbols.get(symbol)
    }

    pub fn by_broker_symbol(&self, broker_symbol: &str) -> Option<&SymbolConfig> {
        self.symbols
            .values()
            .find(|config| config.broker_symbol == broker_symbol)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SymbolConfig> {
        self.symbols.values()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

fn validate_symbol(
    symbol: &str,
    entry: RawSymbol,
    base_dir: &Path,
) -> Result<SymbolConfig, ConfigError> {
    let invalid = |reason: String| ConfigError::Symbol {
        symbol: symbol.to_string(),
        reason,
    };

    if symbol.is_empty() {
        return Err(invalid("empty symbol name".to_string()));
    }
    if !entry.pip_size.is_finite() || entry.pip_size <= 0.0 {
        return Err(invalid(format!(
            "pip_size must be > 0 (value: {})",
            entry.pip_size
        )));
    }
    if entry.digits > 10 {
        return Err(invalid(format!(
            "digits must be <= 10 (value: {})",
            entry.digits
        )));
    }

    let broker_symbol = entry
        .broker
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| symbol.to_string());
    let whitelist_path = entry
        .whitelist
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(|value| {
            let candidate = PathBuf::from(value);
            if candidate.is_absolute() {
                candidate
            } else {
                base_dir.join(candidate)
            }
        });

    Ok(SymbolConfig {
        symbol: symbol.to_string(),
        broker_symbol,
        pip_size: entry.pip_size,
        stop_level: entry.stop_level,
        digits: entry.digits,
        magic: entry.magic,
        whitelist_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = r#"{
        "symbols": {
            "XAUUSD": { "broker": "XAUUSD+", "pip_size": 0.1, "stop_level": 20, "digits": 2, "magic": 202602, "whitelist": "whitelists/xauusd.json" },
            "btcusd": { "pip_size": 1.0, "stop_level": 0, "digits": 2, "magic": 202603 },
            "EURUSD": { "broker": "EURUSD+", "pip_size": 0.0001, "stop_level": 20, "digits": 5, "magic": 202605 }
        }
    }"#;

    fn registry() -> SymbolRegistry {
        SymbolRegistry::parse(TABLE, Path::new("symbols.json"), Path::new("/etc/executor"))
            .unwrap()
    }

    #[test]
    fn parses_table_and_normalizes_names() {
        let registry = registry();
        assert_eq!(registry.len(), 3);
        let btc = registry.get("BTCUSD").unwrap();
        assert_eq!(btc.broker_symbol, "BTCUSD");
        assert!(btc.whitelist_path.is_none());

        let xau = registry.get("XAUUSD").unwrap();
        assert_eq!(
            xau.whitelist_path.as_deref(),
            Some(Path::new("/etc/executor/whitelists/xauusd.json"))
        );
        assert_eq!(
            registry.by_broker_symbol("XAUUSD+").map(|c| c.symbol.as_str()),
            Some("XAUUSD")
        );
    }

    #[test]
    fn min_distance_is_stop_level_in_pips() {
        let registry = registry();
        assert!((registry.get("XAUUSD").unwrap().min_stop_distance() - 2.0).abs() < 1e-9);
        assert!((registry.get("EURUSD").unwrap().min_stop_distance() - 0.002).abs() < 1e-12);
        assert_eq!(registry.get("BTCUSD").unwrap().min_stop_distance(), 0.0);
    }

    #[test]
    fn rounds_to_instrument_precision() {
        let registry = registry();
        assert_eq!(registry.get("XAUUSD").unwrap().round_price(2001.23456), 2001.23);
        let eur = registry.get("EURUSD").unwrap().round_price(1.0850049);
        assert!((eur - 1.085).abs() < 1e-12);
    }

    #[test]
    fn rejects_bad_pip_size_and_duplicate_magic() {
        let bad_pip = r#"{"symbols": {"X": {"pip_size": 0, "digits": 2, "magic": 1}}}"#;
        let err = SymbolRegistry::parse(bad_pip, Path::new("s.json"), Path::new(".")).unwrap_err();
        assert!(matches!(err, ConfigError::Symbol { .. }));

        let dup = r#"{"symbols": {
            "A": {"pip_size": 1, "digits": 2, "magic": 7},
            "B": {"pip_size": 1, "digits": 2, "magic": 7}
        }}"#;
        let err = SymbolRegistry::parse(dup, Path::new("s.json"), Path::new(".")).unwrap_err();
        assert!(err.to_string().contains("magic 7"));
    }

    #[test]
    fn empty_table_is_a_config_error() {
        let err = SymbolRegistry::parse(r#"{"symbols": {}}"#, Path::new("s.json"), Path::new("."))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }
}
