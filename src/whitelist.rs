use crate::error::ConfigError;
use crate::symbols::SymbolRegistry;
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub struct WhitelistEntry {
    pub strategy_id: String,
    pub symbol: String,
    pub lot_size: f64,
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
struct WhitelistFile {
    #[serde(default)]
    strategies: Vec<RawEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawEntry {
    Id(String),
    Detailed {
        strategy_id: String,
        #[serde(default)]
        lot_size: Option<f64>,
        #[serde(default)]
        enabled: Option<bool>,
    },
}

/// Approved (strategy, symbol) pairs. Never mutated by the engine; reloads replace it whole.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Whitelist {
    entries: HashMap<(String, String), WhitelistEntry>,
}

impl Whitelist {
    /// Loads every whitelist file referenced by the registry.
    pub fn load(registry: &SymbolRegistry, default_lot: f64) -> Result<Self, ConfigError> {
        let mut whitelist = Whitelist::default();
        for config in registry.iter() {
            let Some(path) = config.whitelist_path.as_deref() else {
                warn!(
                    "Symbol {} has no whitelist configured; no strategies approved",
                    config.symbol
                );
                continue;
            };
            let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            whitelist.extend_from_str(&config.symbol, &raw, path, default_lot)?;
        }

        if whitelist.enabled_count() == 0 {
            return Err(ConfigError::EmptyWhitelist);
        }
        Ok(whitelist)
    }

    pub fn extend_from_str(
        &mut self,
        symbol: &str,
        raw: &str,
        path: &Path,
        default_lot: f64,
    ) -> Result<(), ConfigError> {
        let file: WhitelistFile = serde_json::from_str(raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        for raw_entry in file.strategies {
            let (strategy_id, lot_size, enabled) = match raw_entry {
                RawEntry::Id(id) => (id, None, None),
                RawEntry::Detailed {
                    strategy_id,
                    lot_size,
                    enabled,
                } => (strategy_id, lot_size, enabled),
            };
            let strategy_id = strategy_id.trim().to_string();
            if strategy_id.is_empty() {
                continue;
            }
            let lot_size = lot_size.unwrap_or(default_lot);
            if !lot_size.is_finite() || lot_size <= 0.0 {
                return Err(ConfigError::Invalid {
                    key: path.display().to_string(),
                    reason: format!(
                        "lot_size for {} must be > 0 (value: {})",
                        strategy_id, lot_size
                    ),
                });
            }
            self.insert(WhitelistEntry {
                strategy_id,
                symbol: symbol.to_string(),
                lot_size,
                enabled: enabled.unwrap_or(true),
            });
        }
        Ok(())
    }

    pub fn insert(&mut self, entry: WhitelistEntry) {
        self.entries
            .insert((entry.symbol.clone(), entry.strategy_id.clone()), entry);
    }

    /// Enabled approval for the pair, if any.
    pub fn approval(&self, strategy_id: &str, symbol: &str) -> Option<&WhitelistEntry> {
        self.entries
            .get(&(symbol.to_string(), strategy_id.to_string()))
            .filter(|entry| entry.enabled)
    }

    pub fn enabled_count(&self) -> usize {
        self.entries.values().filter(|entry| entry.enabled).count()
    }

    pub fn count_for_symbol(&self, symbol: &str) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.enabled && entry.symbol == symbol)
            .count()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WhitelistCriteria {
    pub min_win_rate: f64,
    pub min_trades: u32,
    pub min_profit_factor: f64,
    pub max_drawdown: f64,
    #[serde(skip)]
    pub top_n: usize,
}

impl Default for WhitelistCriteria {
    fn default() -> Self {
        Self {
            min_win_rate: 55.0,
            min_trades: 20,
            min_profit_factor: 1.5,
            max_drawdown: 15.0,
            top_n: 43,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Ranking {
    #[serde(default)]
    pub strategies: Vec<RankedStrategy>,
}

#[derive(Debug, Deserialize)]
pub struct RankedStrategy {
    #[serde(default)]
    pub strategy_id: String,
    #[serde(default)]
    pub strategy_name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub win_rate: f64,
    #[serde(default)]
    pub total_trades: u32,
    #[serde(default)]
    pub profit_factor: f64,
    #[serde(default = "default_drawdown")]
    pub max_drawdown_pct: f64,
    #[serde(default)]
    pub total_pnl_pips: Option<f64>,
    #[serde(default)]
    pub net_pnl: Option<f64>,
}

fn default_drawdown() -> f64 {
    100.0
}

impl RankedStrategy {
    fn pnl(&self) -> f64 {
        self.total_pnl_pips.or(self.net_pnl).unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ApprovedStrategy {
    pub strategy_id: String,
    pub strategy_name: String,
    pub category: String,
    pub win_rate: f64,
    pub total_trades: u32,
    pub profit_factor: f64,
    pub net_pnl: f64,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GeneratedWhitelist {
    pub updated: DateTime<Utc>,
    pub criteria: WhitelistCriteria,
    pub total_ranked: usize,
    pub total_approved: usize,
    pub strategies: Vec<ApprovedStrategy>,
}

pub fn generate_from_ranking(
    ranking: &Ranking,
    criteria: &WhitelistCriteria,
    updated: DateTime<Utc>,
) -> GeneratedWhitelist {
    let mut approved: Vec<ApprovedStrategy> = ranking
        .strategies
        .iter()
        .filter(|entry| !entry.strategy_id.trim().is_empty())
        .filter(|entry| {
            entry.win_rate >= criteria.min_win_rate
                && entry.total_trades >= criteria.min_trades
                && entry.profit_factor >= criteria.min_profit_factor
                && entry.max_drawdown_pct < criteria.max_drawdown
                && entry.pnl() > 0.0
        })
        .map(|entry| {
            let net_pnl = entry.pnl();
            ApprovedStrategy {
                strategy_id: entry.strategy_id.trim().to_string(),
                strategy_name: entry.strategy_name.clone(),
                category: entry.category.clone(),
                win_rate: entry.win_rate,
                total_trades: entry.total_trades,
                profit_factor: entry.profit_factor,
                net_pnl,
                score: round2(entry.win_rate * net_pnl / 100.0),
            }
        })
        .collect();

    approved.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    approved.truncate(criteria.top_n);

    GeneratedWhitelist {
        updated,
        criteria: criteria.clone(),
        total_ranked: ranking.strategies.len(),
        total_approved: approved.len(),
        strategies: approved,
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
