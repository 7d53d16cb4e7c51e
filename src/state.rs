use crate::eligibility::SeenSignals;
use crate::ledger::PositionLedger;
use crate::models::ActiveTrade;
use crate::risk::RiskState;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutorStats {
    #[serde(default)]
    pub total_opened: u64,
    #[serde(default)]
    pub total_closed: u64,
    #[serde(default)]
    pub orders_failed: u64,
    #[serde(default)]
    pub cycles: u64,
}

/// Everything needed to resume after a restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutorState {
    #[serde(default)]
    pub opened: BTreeMap<String, ActiveTrade>,
    #[serde(default)]
    pub closed: Vec<ActiveTrade>,
    #[serde(default)]
    pub stats: ExecutorStats,
    #[serde(flatten)]
    pub risk: RiskState,
    #[serde(default)]
    pub seen: Vec<String>,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
}

impl ExecutorState {
    pub fn capture(
        ledger: &PositionLedger,
        risk: &RiskState,
        stats: &ExecutorStats,
        seen: &SeenSignals,
        saved_at: DateTime<Utc>,
    ) -> Self {
        Self {
            opened: ledger.opened().clone(),
            closed: ledger.closed().iter().cloned().collect(),
            stats: stats.clone(),
            risk: risk.clone(),
            seen: seen.ids().cloned().collect(),
            saved_at: Some(saved_at),
        }
    }

    pub fn into_parts(
        self,
        history_limit: usize,
        seen_capacity: usize,
    ) -> (PositionLedger, RiskState, ExecutorStats, SeenSignals) {
        (
            PositionLedger::from_parts(self.opened, self.closed, history_limit),
            self.risk,
            self.stats,
            SeenSignals::from_ids(self.seen, seen_capacity),
        )
    }
}

/// Reads and atomically rewrites the state file. Never mutates state itself.
pub struct StatePersister {
    path: PathBuf,
}

impl StatePersister {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file means a fresh start. A file that exists but cannot be
    /// parsed is an error: starting empty would forget live positions.
    pub async fn load(&self) -> Result<ExecutorState> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "No state file at {}; starting from empty state",
                    self.path.display()
                );
                return Ok(ExecutorState::default());
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to read state file {}", self.path.display()))
            }
        };
        let state: ExecutorState = serde_json::from_str(&raw)
            .with_context(|| format!("State file {} is not valid JSON", self.path.display()))?;
        info!(
            "Loaded state from {}: {} open, {} closed in history, {} seen",
            self.path.display(),
            state.opened.len(),
            state.closed.len(),
            state.seen.len()
        );
        Ok(state)
    }

    /// Writes to a sibling temp file and renames it over the target.
    pub async fn save(&self, state: &ExecutorState) -> Result<()> {
        let payload =
            serde_json::to_vec_pretty(state).context("Failed to serialize executor state")?;

        let parent = self
            .path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;

        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state.json".to_string());
        let temp_path = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

        let write_result = async {
            let mut file = tokio::fs::File::create(&temp_path).await?;
            file.write_all(&payload).await?;
            file.sync_all().await?;
            tokio::fs::rename(&temp_path, &self.path).await
        }
        .await;

        if let Err(err) = write_result {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(err)
                .with_context(|| format!("Failed to write state file {}", self.path.display()));
        }
        debug!("Saved state to {} ({} bytes)", self.path.display(), payload.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, TradeState};
    use chrono::TimeZone;

    fn trade(trade_id: &str, state: TradeState) -> ActiveTrade {
        ActiveTrade {
            trade_id: trade_id.to_string(),
            ticket: Some(5),
            strategy_id: "ADX_06_XAU".to_string(),
            strategy_name: "ADX".to_string(),
            symbol: "XAUUSD".to_string(),
            broker_symbol: "XAUUSD+".to_string(),
            direction: Direction::Buy,
            entry_price: 2000.0,
            stop_loss: Some(1990.0),
            take_profit: Some(2020.0),
            initial_stop_loss: Some(1990.0),
            lot_size: 0.01,
            comment: "ADX_06_XAU|BUY".to_string(),
            magic: 202602,
            opened_at: Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
            state,
            last_price: None,
            last_profit: None,
            closed_at: None,
            close_price: None,
            outcome: None,
            pnl: None,
            needs_review: false,
            note: None,
            changes: Vec::new(),
        }
    }

    #[tokio::test]
    async fn missing_file_is_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let persister = StatePersister::new(dir.path().join("state.json"));
        assert_eq!(persister.load().await.unwrap(), ExecutorState::default());
    }

    #[tokio::test]
    async fn saved_state_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let persister = StatePersister::new(dir.path().join("nested").join("state.json"));

        let mut ledger = PositionLedger::new(10);
        ledger.record(trade("sig-1", TradeState::BreakevenArmed));
        let risk = RiskState {
            daily_loss_usd: 30.0,
            balance_start: Some(1000.0),
            ..RiskState::default()
        };
        let stats = ExecutorStats {
            total_opened: 3,
            ..ExecutorStats::default()
        };
        let seen = SeenSignals::from_ids(vec!["sig-1".to_string(), "sig-0".to_string()], 10);
        let saved_at = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let state = ExecutorState::capture(&ledger, &risk, &stats, &seen, saved_at);
        persister.save(&state).await.unwrap();

        let loaded = persister.load().await.unwrap();
        assert_eq!(loaded, state);
        let (ledger, risk, stats, seen) = loaded.into_parts(10, 10);
        assert!(ledger.has_open("ADX_06_XAU", "XAUUSD"));
        assert_eq!(risk.daily_loss_usd, 30.0);
        assert_eq!(stats.total_opened, 3);
        assert!(seen.contains("sig-0"));

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn risk_fields_sit_at_top_level() {
        let state = ExecutorState {
            risk: RiskState {
                daily_loss_usd: 12.0,
                ..RiskState::default()
            },
            ..ExecutorState::default()
        };
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["daily_loss_usd"], serde_json::json!(12.0));
        assert!(value.get("cooldowns").is_some());
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(StatePersister::new(path).load().await.is_err());
    }
}
