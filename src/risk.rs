use crate::config::RiskSettings;
use crate::models::{ActiveTrade, PNL_EPSILON};
use chrono::{DateTime, NaiveTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Risk counters persisted alongside the ledger.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RiskState {
    /// Strategy id to the time of its last losing close.
    #[serde(default)]
    pub cooldowns: BTreeMap<String, DateTime<Utc>>,
    #[serde(default)]
    pub daily_loss_usd: f64,
    #[serde(default)]
    pub daily_loss_reset_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub balance_start: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HaltReason {
    DailyLossLimit { loss: f64, limit: f64 },
    MaxOpenPositions { open: usize, cap: usize },
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaltReason::DailyLossLimit { loss, limit } => write!(
                f,
                "daily loss {:.2} reached limit {:.2}",
                loss, limit
            ),
            HaltReason::MaxOpenPositions { open, cap } => {
                write!(f, "{} open positions at cap {}", open, cap)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PortfolioCheck {
    Allow,
    Halt(HaltReason),
}

/// Submission gate. Never closes positions.
pub struct RiskGuard {
    settings: RiskSettings,
}

impl RiskGuard {
    pub fn new(settings: RiskSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &RiskSettings {
        &self.settings
    }

    /// Loss amount at which new submissions halt, when the day's starting balance is known.
    pub fn daily_loss_limit(&self, state: &RiskState) -> Option<f64> {
        if self.settings.daily_loss_limit_pct <= 0.0 {
            return None;
        }
        state
            .balance_start
            .filter(|balance| balance.is_finite() && *balance > 0.0)
            .map(|balance| balance * self.settings.daily_loss_limit_pct / 100.0)
    }

    pub fn check_portfolio(&self, state: &RiskState, open_count: usize) -> PortfolioCheck {
        if let Some(limit) = self.daily_loss_limit(state) {
            if state.daily_loss_usd + PNL_EPSILON >= limit {
                return PortfolioCheck::Halt(HaltReason::DailyLossLimit {
                    loss: state.daily_loss_usd,
                    limit,
                });
            }
        }
        if open_count >= self.settings.max_open_positions {
            return PortfolioCheck::Halt(HaltReason::MaxOpenPositions {
                open: open_count,
                cap: self.settings.max_open_positions,
            });
        }
        PortfolioCheck::Allow
    }

    /// Accounts a closed trade. Returns true when a cooldown was started.
    pub fn record_close(&self, state: &mut RiskState, trade: &ActiveTrade) -> bool {
        let Some(pnl) = trade.pnl else {
            warn!(
                "Closed trade {} ({}) has unknown pnl; daily loss and cooldown not updated",
                trade.trade_id, trade.strategy_id
            );
            return false;
        };
        if pnl >= -PNL_EPSILON {
            return false;
        }

        let closed_at = trade.closed_at.unwrap_or_else(Utc::now);
        state.daily_loss_usd += -pnl;
        state.cooldowns.insert(trade.strategy_id.clone(), closed_at);
        info!(
            "Loss {:.2} on {} {}: daily loss {:.2}, cooldown until {}",
            pnl,
            trade.strategy_id,
            trade.symbol,
            state.daily_loss_usd,
            (closed_at + self.settings.loss_cooldown).to_rfc3339()
        );
        true
    }

    /// Cooling down during `[T, T + duration)` after a losing close at `T`.
    pub fn is_cooling_down(&self, state: &RiskState, strategy_id: &str, now: DateTime<Utc>) -> bool {
        state
            .cooldowns
            .get(strategy_id)
            .map(|started| now >= *started && now < *started + self.settings.loss_cooldown)
            .unwrap_or(false)
    }

    pub fn prune_cooldowns(&self, state: &mut RiskState, now: DateTime<Utc>) -> usize {
        let before = state.cooldowns.len();
        let cooldown = self.settings.loss_cooldown;
        state
            .cooldowns
            .retain(|_, started| now < *started + cooldown);
        before - state.cooldowns.len()
    }

    pub fn needs_rollover(&self, state: &RiskState, now: DateTime<Utc>) -> bool {
        match state.daily_loss_reset_at {
            None => true,
            Some(reset_at) => now.date_naive() > reset_at.date_naive(),
        }
    }

    /// Starts a new accounting day at UTC midnight of `now`.
    pub fn roll_day(&self, state: &mut RiskState, now: DateTime<Utc>, balance: Option<f64>) {
        let previous_loss = state.daily_loss_usd;
        let balance_start = balance
            .filter(|value| value.is_finite() && *value > 0.0)
            .or(self.settings.starting_balance)
            .or(state.balance_start);
        state.daily_loss_usd = 0.0;
        state.daily_loss_reset_at = Some(now.date_naive().and_time(NaiveTime::MIN).and_utc());
        state.balance_start = balance_start;
        info!(
            "Daily risk reset for {} (previous loss {:.2}, start balance {})",
            now.date_naive(),
            previous_loss,
            balance_start
                .map(|value| format!("{:.2}", value))
                .unwrap_or_else(|| "unknown".to_string())
        );
    }
}
