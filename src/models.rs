use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

pub const PNL_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Buy => "BUY",
            Direction::Sell => "SELL",
        }
    }

    /// +1 for long exposure, -1 for short.
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Buy => 1.0,
            Direction::Sell => -1.0,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "BUY" | "LONG" => Ok(Direction::Buy),
            "SELL" | "SHORT" => Ok(Direction::Sell),
            other => Err(anyhow!("Unknown direction '{}'", other)),
        }
    }
}

/// A candidate produced by the strategy layer. Immutable once read from the feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Signal {
    pub id: String,
    pub strategy_id: String,
    pub strategy_name: String,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quote {
    pub bid: f64,
    pub ask: f64,
}

impl Quote {
    /// Price a market order in `direction` would be filled at.
    pub fn entry_price(&self, direction: Direction) -> f64 {
        match direction {
            Direction::Buy => self.ask,
            Direction::Sell => self.bid,
        }
    }

    /// Price an existing position in `direction` would be closed at.
    pub fn exit_price(&self, direction: Direction) -> f64 {
        match direction {
            Direction::Buy => self.bid,
            Direction::Sell => self.ask,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.bid.is_finite() && self.ask.is_finite() && self.bid > 0.0 && self.ask > 0.0
    }
}

/// A live position as the broker reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerPosition {
    pub ticket: u64,
    pub broker_symbol: String,
    pub direction: Direction,
    pub volume: f64,
    pub open_price: f64,
    pub current_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub profit: Option<f64>,
    pub magic: u64,
    pub comment: String,
}

/// Realised result of a position the broker has closed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClosingDeal {
    pub price: f64,
    pub profit: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeState {
    PendingSubmit,
    Open,
    BreakevenArmed,
    Closed,
    Rejected,
}

impl TradeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeState::PendingSubmit => "pending_submit",
            TradeState::Open => "open",
            TradeState::BreakevenArmed => "breakeven_armed",
            TradeState::Closed => "closed",
            TradeState::Rejected => "rejected",
        }
    }

    /// Occupies a (strategy, symbol) slot and counts toward the portfolio cap.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            TradeState::PendingSubmit | TradeState::Open | TradeState::BreakevenArmed
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TradeState::Closed | TradeState::Rejected)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TradeOutcome {
    Win,
    Loss,
    Breakeven,
    Unknown,
}

impl TradeOutcome {
    pub fn from_pnl(pnl: f64) -> Self {
        if pnl > PNL_EPSILON {
            TradeOutcome::Win
        } else if pnl < -PNL_EPSILON {
            TradeOutcome::Loss
        } else {
            TradeOutcome::Breakeven
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeOutcome::Win => "win",
            TradeOutcome::Loss => "loss",
            TradeOutcome::Breakeven => "breakeven",
            TradeOutcome::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TradeChange {
    pub field: String,
    pub old_value: Value,
    pub new_value: Value,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActiveTrade {
    /// Id of the signal that produced this trade.
    pub trade_id: String,
    pub ticket: Option<u64>,
    pub strategy_id: String,
    pub strategy_name: String,
    pub symbol: String,
    pub broker_symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    /// Stop at submission time; breakeven distance is measured against it.
    #[serde(default)]
    pub initial_stop_loss: Option<f64>,
    pub lot_size: f64,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub magic: u64,
    pub opened_at: DateTime<Utc>,
    pub state: TradeState,
    #[serde(default)]
    pub last_price: Option<f64>,
    #[serde(default)]
    pub last_profit: Option<f64>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub close_price: Option<f64>,
    #[serde(default)]
    pub outcome: Option<TradeOutcome>,
    #[serde(default)]
    pub pnl: Option<f64>,
    #[serde(default)]
    pub needs_review: bool,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub changes: Vec<TradeChange>,
}

impl ActiveTrade {
    pub fn record_change<V>(
        &mut self,
        field: &str,
        old_value: &V,
        new_value: &V,
        changed_at: DateTime<Utc>,
    ) where
        V: Serialize,
    {
        if let (Ok(old_json), Ok(new_json)) = (
            serde_json::to_value(old_value),
            serde_json::to_value(new_value),
        ) {
            if old_json == new_json {
                return;
            }

            self.changes.push(TradeChange {
                field: field.to_string(),
                old_value: old_json,
                new_value: new_json,
                changed_at,
            });
        }
    }

    pub fn set_state(&mut self, state: TradeState, changed_at: DateTime<Utc>) {
        let old = self.state;
        self.record_change("state", &old, &state, changed_at);
        self.state = state;
    }

    pub fn set_ticket(&mut self, value: Option<u64>, changed_at: DateTime<Utc>) {
        let old = self.ticket;
        self.record_change("ticket", &old, &value, changed_at);
        self.ticket = value;
    }

    pub fn set_entry_price(&mut self, value: f64, changed_at: DateTime<Utc>) {
        let old = self.entry_price;
        self.record_change("entryPrice", &old, &value, changed_at);
        self.entry_price = value;
    }

    pub fn set_stop_loss(&mut self, value: Option<f64>, changed_at: DateTime<Utc>) {
        let old = self.stop_loss;
        self.record_change("stopLoss", &old, &value, changed_at);
        self.stop_loss = value;
    }

    pub fn set_close_price(&mut self, value: Option<f64>, changed_at: DateTime<Utc>) {
        let old = self.close_price;
        self.record_change("closePrice", &old, &value, changed_at);
        self.close_price = value;
    }

    pub fn set_outcome(&mut self, value: Option<TradeOutcome>, changed_at: DateTime<Utc>) {
        let old = self.outcome;
        self.record_change("outcome", &old, &value, changed_at);
        self.outcome = value;
    }

    pub fn set_pnl(&mut self, value: Option<f64>, changed_at: DateTime<Utc>) {
        let old = self.pnl;
        self.record_change("pnl", &old, &value, changed_at);
        self.pnl = value;
    }

    pub fn is_live(&self) -> bool {
        self.state.is_live()
    }

    pub fn occupies(&self, strategy_id: &str, symbol: &str) -> bool {
        self.is_live() && self.strategy_id == strategy_id && self.symbol == symbol
    }

    /// Distance between entry and the stop the trade was opened with, in price units.
    pub fn initial_stop_distance(&self) -> Option<f64> {
        self.initial_stop_loss
            .map(|stop| (self.entry_price - stop).abs())
            .filter(|distance| distance.is_finite() && *distance > 0.0)
    }
}
