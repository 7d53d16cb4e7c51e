use crate::ledger::PositionLedger;
use crate::models::Signal;
use crate::risk::{RiskGuard, RiskState};
use crate::symbols::{SymbolConfig, SymbolRegistry};
use crate::whitelist::Whitelist;
use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    UnknownSymbol,
    NotWhitelisted,
    AlreadyOpen,
    CoolingDown,
    PortfolioFull { open: usize, cap: usize },
    Malformed,
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::UnknownSymbol => "symbol not configured",
            Rejection::NotWhitelisted => "not whitelisted",
            Rejection::AlreadyOpen => "already open",
            Rejection::CoolingDown => "cooling down",
            Rejection::PortfolioFull { .. } => "portfolio full",
            Rejection::Malformed => "malformed",
        }
    }

    /// Rejections that can never turn into an acceptance for the same signal.
    pub fn is_final(&self) -> bool {
        matches!(self, Rejection::Malformed)
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::PortfolioFull { open, cap } => {
                write!(f, "{} ({}/{})", self.as_str(), open, cap)
            }
            other => f.write_str(other.as_str()),
        }
    }
}

/// License to submit: the symbol to trade and the approved lot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Approval<'a> {
    pub symbol: &'a SymbolConfig,
    pub lot_size: f64,
}

/// Read-only gate in front of order submission. Accepting has no side effects.
pub struct EligibilityFilter<'a> {
    registry: &'a SymbolRegistry,
    whitelist: &'a Whitelist,
    guard: &'a RiskGuard,
}

impl<'a> EligibilityFilter<'a> {
    pub fn new(registry: &'a SymbolRegistry, whitelist: &'a Whitelist, guard: &'a RiskGuard) -> Self {
        Self {
            registry,
            whitelist,
            guard,
        }
    }

    /// Checks run in a fixed order and the first failing one decides.
    pub fn evaluate(
        &self,
        signal: &Signal,
        ledger: &PositionLedger,
        risk: &RiskState,
        now: DateTime<Utc>,
    ) -> Result<Approval<'a>, Rejection> {
        let symbol = self
            .registry
            .get(&signal.symbol)
            .ok_or(Rejection::UnknownSymbol)?;
        let entry = self
            .whitelist
            .approval(&signal.strategy_id, &signal.symbol)
            .ok_or(Rejection::NotWhitelisted)?;
        if ledger.has_open(&signal.strategy_id, &signal.symbol) {
            return Err(Rejection::AlreadyOpen);
        }
        if self.guard.is_cooling_down(risk, &signal.strategy_id, now) {
            return Err(Rejection::CoolingDown);
        }
        let open = ledger.count_open();
        let cap = self.guard.settings().max_open_positions;
        if open >= cap {
            return Err(Rejection::PortfolioFull { open, cap });
        }
        if signal.stop_loss.is_none() && signal.take_profit.is_none() {
            return Err(Rejection::Malformed);
        }

        Ok(Approval {
            symbol,
            lot_size: entry.lot_size,
        })
    }
}

/// Bounded set of processed signal ids; the oldest id is evicted first.
#[derive(Debug, Clone)]
pub struct SeenSignals {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl SeenSignals {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn from_ids<I: IntoIterator<Item = String>>(ids: I, capacity: usize) -> Self {
        let mut seen = Self::new(capacity);
        for id in ids {
            seen.insert(id);
        }
        seen
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Returns false when the id was already present.
    pub fn insert(&mut self, id: String) -> bool {
        if self.ids.contains(&id) {
            return false;
        }
        self.ids.insert(id.clone());
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Ids oldest first.
    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.order.iter()
    }
}
