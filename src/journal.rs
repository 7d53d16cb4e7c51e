use crate::models::{ActiveTrade, TradeOutcome, TradeState};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JournalRecord {
    pub recorded_at: DateTime<Utc>,
    pub trade: ActiveTrade,
}

/// Append-only JSON-lines track record of finished trades.
pub struct TradeJournal {
    path: PathBuf,
}

impl TradeJournal {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, trade: &ActiveTrade, recorded_at: DateTime<Utc>) -> Result<()> {
        let mut line = serde_json::to_string(&JournalRecord {
            recorded_at,
            trade: trade.clone(),
        })
        .context("Failed to serialize journal record")?;
        line.push('\n');

        if let Some(parent) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open journal {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("Failed to append to journal {}", self.path.display()))?;
        file.flush().await?;
        Ok(())
    }

    /// Reads every record; unreadable lines are skipped.
    pub async fn read_all(&self) -> Result<Vec<JournalRecord>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to read journal {}", self.path.display()))
            }
        };
        let mut records = Vec::new();
        for (index, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalRecord>(line) {
                Ok(record) => records.push(record),
                Err(err) => log::warn!(
                    "Skipping journal line {} in {}: {}",
                    index + 1,
                    self.path.display(),
                    err
                ),
            }
        }
        Ok(records)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JournalSummary {
    pub closed: usize,
    pub rejected: usize,
    pub wins: usize,
    pub losses: usize,
    pub unknown: usize,
    pub net_pnl: f64,
}

impl JournalSummary {
    pub fn from_records(records: &[JournalRecord]) -> Self {
        let mut summary = JournalSummary::default();
        for record in records {
            let trade = &record.trade;
            if trade.state == TradeState::Rejected {
                summary.rejected += 1;
                continue;
            }
            summary.closed += 1;
            match trade.outcome {
                Some(TradeOutcome::Win) => summary.wins += 1,
                Some(TradeOutcome::Loss) => summary.losses += 1,
                Some(TradeOutcome::Unknown) | None => summary.unknown += 1,
                Some(TradeOutcome::Breakeven) => {}
            }
            summary.net_pnl += trade.pnl.unwrap_or(0.0);
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Direction;
    use chrono::TimeZone;

    fn finished(trade_id: &str, state: TradeState, pnl: Option<f64>) -> ActiveTrade {
        ActiveTrade {
            trade_id: trade_id.to_string(),
            ticket: None,
            strategy_id: "S".to_string(),
            strategy_name: "S".to_string(),
            symbol: "EURUSD".to_string(),
            broker_symbol: "EURUSD".to_string(),
            direction: Direction::Sell,
            entry_price: 1.1,
            stop_loss: Some(1.11),
            take_profit: None,
            initial_stop_loss: Some(1.11),
            lot_size: 0.01,
            comment: "S|SELL".to_string(),
            magic: 1,
            opened_at: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            state,
            last_price: None,
            last_profit: None,
            closed_at: None,
            close_price: None,
            outcome: pnl.map(TradeOutcome::from_pnl),
            pnl,
            needs_review: false,
            note: None,
            changes: Vec::new(),
        }
    }

    #[tokio::test]
    async fn appends_and_summarises() {
        let dir = tempfile::tempdir().unwrap();
        let journal = TradeJournal::new(dir.path().join("logs").join("trades.jsonl"));
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        journal
            .append(&finished("a", TradeState::Closed, Some(12.5)), at)
            .await
            .unwrap();
        journal
            .append(&finished("b", TradeState::Closed, Some(-4.0)), at)
            .await
            .unwrap();
        journal
            .append(&finished("c", TradeState::Rejected, None), at)
            .await
            .unwrap();

        let records = journal.read_all().await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].trade.trade_id, "a");

        let summary = JournalSummary::from_records(&records);
        assert_eq!(summary.closed, 2);
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.wins, 1);
        assert_eq!(summary.losses, 1);
        assert!((summary.net_pnl - 8.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn missing_journal_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let journal = TradeJournal::new(dir.path().join("none.jsonl"));
        assert!(journal.read_all().await.unwrap().is_empty());
    }
}
