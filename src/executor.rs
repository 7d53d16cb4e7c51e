use crate::broker::Broker;
use crate::config::ExecutorSettings;
use crate::eligibility::{EligibilityFilter, SeenSignals};
use crate::error::{ConfigError, FailureKind};
use crate::feed::SignalFeed;
use crate::gateway::{Fill, OrderGateway, OrderIntent, PreparedOrder};
use crate::journal::TradeJournal;
use crate::ledger::{PositionLedger, PositionSnapshot, ReconcileContext, ReconcileReport};
use crate::models::{ActiveTrade, Signal, TradeState};
use crate::risk::{HaltReason, PortfolioCheck, RiskGuard, RiskState};
use crate::state::{ExecutorState, ExecutorStats, StatePersister};
use crate::status::ExecutorStatus;
use crate::symbols::{SymbolConfig, SymbolRegistry};
use crate::whitelist::Whitelist;
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, error, info, warn};
use std::collections::BTreeSet;
use std::future::Future;
use tokio::time::{interval, MissedTickBehavior};

/// Symbol table plus whitelists. Replaced as a whole on reload.
#[derive(Debug, Clone)]
pub struct TradingConfig {
    pub registry: SymbolRegistry,
    pub whitelist: Whitelist,
}

impl TradingConfig {
    pub fn load(settings: &ExecutorSettings) -> Result<Self, ConfigError> {
        let registry = SymbolRegistry::load(&settings.symbols_path)?;
        let whitelist = Whitelist::load(&registry, settings.default_lot)?;
        Ok(Self {
            registry,
            whitelist,
        })
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct EntryCycleReport {
    pub candidates: usize,
    pub submitted: usize,
    pub pending: usize,
    pub failed: usize,
    pub rejected: usize,
    pub halted: Option<HaltReason>,
    pub feed_error: bool,
}

enum SubmitOutcome {
    Filled,
    Pending,
    Failed,
    /// Nothing reached the broker; the rest of the cycle is skipped.
    BrokerUnavailable,
}

/// Owns all mutable executor state. Cycles run one at a time on the caller's task.
pub struct ExecutionLoop<B, F> {
    broker: B,
    feed: F,
    settings: ExecutorSettings,
    registry: SymbolRegistry,
    whitelist: Whitelist,
    gateway: OrderGateway,
    guard: RiskGuard,
    ledger: PositionLedger,
    risk: RiskState,
    stats: ExecutorStats,
    seen: SeenSignals,
    persister: StatePersister,
    journal: TradeJournal,
    status: ExecutorStatus,
    dirty: bool,
    last_persist_at: Option<DateTime<Utc>>,
}

impl<B: Broker, F: SignalFeed> ExecutionLoop<B, F> {
    pub fn new(
        settings: ExecutorSettings,
        config: TradingConfig,
        broker: B,
        feed: F,
        state: ExecutorState,
    ) -> Self {
        let (ledger, risk, stats, seen) = state.into_parts(
            settings.positions.closed_history_limit,
            settings.seen_capacity,
        );
        Self {
            broker,
            feed,
            registry: config.registry,
            whitelist: config.whitelist,
            gateway: OrderGateway::new(settings.gateway.clone()),
            guard: RiskGuard::new(settings.risk.clone()),
            ledger,
            risk,
            stats,
            seen,
            persister: StatePersister::new(settings.state_path.clone()),
            journal: TradeJournal::new(settings.journal_path.clone()),
            status: ExecutorStatus::new(),
            dirty: false,
            last_persist_at: None,
            settings,
        }
    }

    pub fn ledger(&self) -> &PositionLedger {
        &self.ledger
    }

    pub fn risk_state(&self) -> &RiskState {
        &self.risk
    }

    pub fn stats(&self) -> &ExecutorStats {
        &self.stats
    }

    pub fn seen(&self) -> &SeenSignals {
        &self.seen
    }

    pub fn status(&self) -> ExecutorStatus {
        self.status.clone()
    }

    pub fn registry(&self) -> &SymbolRegistry {
        &self.registry
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    pub fn capture_state(&self, now: DateTime<Utc>) -> ExecutorState {
        ExecutorState::capture(&self.ledger, &self.risk, &self.stats, &self.seen, now)
    }

    /// Runs entry and monitor cycles on their own cadences until `shutdown`
    /// resolves. A cycle in progress always finishes before the state is saved.
    pub async fn run<S>(&mut self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        let mut entry_ticks = interval(self.settings.entry_poll);
        entry_ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut monitor_ticks = interval(self.settings.monitor_poll);
        monitor_ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reload_ticks = interval(self.settings.reload_interval);
        reload_ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        reload_ticks.tick().await;

        tokio::pin!(shutdown);
        self.status.set_phase("Running");
        info!(
            "Execution loop started: {} symbols, {} approved strategies, {} live trades",
            self.registry.len(),
            self.whitelist.enabled_count(),
            self.ledger.count_open()
        );

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                _ = monitor_ticks.tick() => {
                    self.run_monitor_cycle(Utc::now()).await;
                }
                _ = entry_ticks.tick() => {
                    self.run_entry_cycle(Utc::now()).await;
                }
                _ = reload_ticks.tick() => {
                    self.reload();
                }
            }
        }

        self.status.set_phase("Stopping");
        self.persist(Utc::now()).await?;
        info!(
            "Execution loop stopped: {} live trades saved to {}",
            self.ledger.count_open(),
            self.persister.path().display()
        );
        Ok(())
    }

    /// Re-reads the symbol table and whitelists. A broken file keeps the previous config.
    pub fn reload(&mut self) -> bool {
        match TradingConfig::load(&self.settings) {
            Ok(config) => {
                self.registry = config.registry;
                self.whitelist = config.whitelist;
                info!(
                    "Reloaded config: {} symbols, {} approved strategies",
                    self.registry.len(),
                    self.whitelist.enabled_count()
                );
                true
            }
            Err(err) => {
                warn!("Config reload failed, keeping previous config: {}", err);
                false
            }
        }
    }

    pub async fn run_entry_cycle(&mut self, now: DateTime<Utc>) -> EntryCycleReport {
        let mut report = EntryCycleReport::default();
        self.roll_day_if_needed(now).await;

        let signals = match self.feed.next().await {
            Ok(signals) => signals,
            Err(err) => {
                warn!("Feed read failed, skipping cycle: {}", err);
                report.feed_error = true;
                self.finish_entry_cycle(now, &report).await;
                return report;
            }
        };
        report.candidates = signals.len();

        match self.guard.check_portfolio(&self.risk, self.ledger.count_open()) {
            PortfolioCheck::Halt(reason) => {
                if self.status.set_halt_reason(Some(reason.to_string())) {
                    warn!("Submissions halted: {}", reason);
                }
                report.halted = Some(reason);
                self.finish_entry_cycle(now, &report).await;
                return report;
            }
            PortfolioCheck::Allow => {
                if self.status.set_halt_reason(None) {
                    info!("Submissions resumed");
                }
            }
        }

        for signal in &signals {
            if self.seen.contains(&signal.id) {
                continue;
            }

            let verdict = {
                let filter = EligibilityFilter::new(&self.registry, &self.whitelist, &self.guard);
                filter
                    .evaluate(signal, &self.ledger, &self.risk, now)
                    .map(|approval| (approval.symbol.clone(), approval.lot_size))
            };
            let (symbol, lot_size) = match verdict {
                Ok(approved) => approved,
                Err(rejection) => {
                    debug!(
                        "Signal rejected id={} strategy={} symbol={} reason={}",
                        signal.id, signal.strategy_id, signal.symbol, rejection
                    );
                    report.rejected += 1;
                    if rejection.is_final() {
                        self.mark_seen(&signal.id);
                    }
                    continue;
                }
            };

            match self.submit_candidate(signal, &symbol, lot_size, now).await {
                SubmitOutcome::Filled => report.submitted += 1,
                SubmitOutcome::Pending => report.pending += 1,
                SubmitOutcome::Failed => report.failed += 1,
                SubmitOutcome::BrokerUnavailable => {
                    report.failed += 1;
                    break;
                }
            }
        }

        self.finish_entry_cycle(now, &report).await;
        report
    }

    async fn submit_candidate(
        &mut self,
        signal: &Signal,
        symbol: &SymbolConfig,
        lot_size: f64,
        now: DateTime<Utc>,
    ) -> SubmitOutcome {
        let intent = OrderIntent {
            symbol,
            direction: signal.direction,
            lot_size,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
            strategy_id: &signal.strategy_id,
        };
        info!(
            "Submitting id={} strategy={} symbol={} direction={} lot={} sl={:?} tp={:?}",
            signal.id,
            signal.strategy_id,
            symbol.symbol,
            signal.direction,
            lot_size,
            signal.stop_loss,
            signal.take_profit
        );

        let order = match self.gateway.prepare(&self.broker, &intent).await {
            Ok(order) => order,
            Err(failure) => {
                warn!(
                    "Submission skipped id={} symbol={}: {}; broker unavailable, retrying next cycle",
                    signal.id, symbol.symbol, failure
                );
                return SubmitOutcome::BrokerUnavailable;
            }
        };

        match self.gateway.send(&self.broker, &order).await {
            Ok(fill) => {
                let trade = open_trade(signal, symbol, &order, Some(&fill), now);
                info!(
                    "Order filled id={} ticket={} strategy={} symbol={} direction={} price={} sl={:?} tp={:?} fill_mode={}",
                    signal.id,
                    fill.ticket,
                    signal.strategy_id,
                    symbol.symbol,
                    signal.direction,
                    fill.price,
                    trade.stop_loss,
                    trade.take_profit,
                    fill.fill_mode.as_str()
                );
                self.ledger.record(trade);
                self.mark_seen(&signal.id);
                self.stats.total_opened += 1;
                self.status.order_sent();
                SubmitOutcome::Filled
            }
            Err(failure) => match failure.kind {
                FailureKind::Timeout => {
                    warn!(
                        "Order outcome unknown id={} strategy={} symbol={}: {}; holding slot until reconciled",
                        signal.id, signal.strategy_id, symbol.symbol, failure.detail
                    );
                    self.ledger
                        .record(open_trade(signal, symbol, &order, None, now));
                    self.mark_seen(&signal.id);
                    self.status.order_sent();
                    SubmitOutcome::Pending
                }
                FailureKind::Unavailable(_) => {
                    warn!(
                        "Order not sent id={} symbol={}: {}; retrying next cycle",
                        signal.id, symbol.symbol, failure.detail
                    );
                    SubmitOutcome::BrokerUnavailable
                }
                FailureKind::Rejected { code, .. } | FailureKind::FillModeUnsupported { code, .. } => {
                    error!(
                        "Order rejected id={} strategy={} symbol={} retcode={} reason={}",
                        signal.id, signal.strategy_id, symbol.symbol, code, failure.detail
                    );
                    let mut trade = open_trade(signal, symbol, &order, None, now);
                    trade.set_state(TradeState::Rejected, now);
                    trade.closed_at = Some(now);
                    trade.note = Some(failure.detail.clone());
                    self.archive(trade, now).await;
                    self.mark_seen(&signal.id);
                    self.stats.orders_failed += 1;
                    self.status.order_failed();
                    SubmitOutcome::Failed
                }
            },
        }
    }

    /// Rolls the accounting day, reconciles live trades with the broker, accounts new closes and saves.
    pub async fn run_monitor_cycle(&mut self, now: DateTime<Utc>) -> ReconcileReport {
        self.roll_day_if_needed(now).await;

        let magics: BTreeSet<u64> = self
            .registry
            .iter()
            .map(|symbol| symbol.magic)
            .chain(self.ledger.magics())
            .collect();
        let snapshot = PositionSnapshot::fetch(&self.broker, &self.gateway, magics).await;

        let ctx = ReconcileContext {
            broker: &self.broker,
            gateway: &self.gateway,
            registry: &self.registry,
            settings: &self.settings.positions,
        };
        let report = self.ledger.reconcile(&snapshot, &ctx, now).await;

        for trade in &report.closed {
            self.guard.record_close(&mut self.risk, trade);
            self.stats.total_closed += 1;
            self.append_journal(trade, now).await;
        }
        for trade in &report.rejected {
            self.stats.orders_failed += 1;
            self.append_journal(trade, now).await;
        }
        self.stats.total_opened += report.adopted as u64;
        if report.changed() {
            self.dirty = true;
            info!(
                "Reconciled closed={} expired={} adopted={} stop_moves={} stop_failures={} untracked={}",
                report.closed.len(),
                report.rejected.len(),
                report.adopted,
                report.stop_moves,
                report.stop_move_failures,
                report.untracked.len()
            );
        }
        if !snapshot.failed_magics().is_empty() {
            warn!(
                "Broker positions unavailable for magics {:?}; their trades are left as they were",
                snapshot.failed_magics()
            );
        }

        self.status.monitor_cycle_finished(now);
        if report.changed() {
            if let Err(err) = self.persist(now).await {
                error!("Failed to save state: {:#}", err);
            }
        } else {
            self.maybe_persist(now).await;
        }
        report
    }

    async fn roll_day_if_needed(&mut self, now: DateTime<Utc>) {
        if !self.guard.needs_rollover(&self.risk, now) {
            return;
        }
        let balance = match self.gateway.account_balance(&self.broker).await {
            Ok(balance) => Some(balance),
            Err(err) => {
                warn!("Account balance unavailable at day rollover: {}", err);
                None
            }
        };
        self.guard.roll_day(&mut self.risk, now, balance);
        let expired = self.guard.prune_cooldowns(&mut self.risk, now);
        if expired > 0 {
            debug!("Pruned {} expired cooldowns", expired);
        }
        self.dirty = true;
    }

    async fn finish_entry_cycle(&mut self, now: DateTime<Utc>, report: &EntryCycleReport) {
        self.stats.cycles += 1;
        let cycles = self.status.entry_cycle_finished(now);
        if report.submitted + report.pending + report.failed > 0 {
            info!(
                "Entry cycle candidates={} submitted={} pending={} failed={} rejected={}",
                report.candidates, report.submitted, report.pending, report.failed, report.rejected
            );
        }
        if self.settings.status_every_cycles > 0 && cycles % self.settings.status_every_cycles == 0 {
            self.log_status();
        }
        self.maybe_persist(now).await;
    }

    fn log_status(&self) {
        let snapshot = self.status.snapshot();
        let per_symbol = self
            .ledger
            .count_by_symbol()
            .iter()
            .map(|(symbol, count)| format!("{}:{}", symbol, count))
            .collect::<Vec<_>>()
            .join(",");
        info!(
            "STATUS cycles={} open={} [{}] seen={} sent={} failed={} daily_loss={:.2} halted={}",
            snapshot.entry_cycles,
            self.ledger.count_open(),
            per_symbol,
            self.seen.len(),
            snapshot.orders_sent,
            snapshot.orders_failed,
            self.risk.daily_loss_usd,
            snapshot.halt_reason.as_deref().unwrap_or("no")
        );
    }

    fn mark_seen(&mut self, signal_id: &str) {
        if self.seen.insert(signal_id.to_string()) {
            self.dirty = true;
        }
    }

    async fn archive(&mut self, trade: ActiveTrade, now: DateTime<Utc>) {
        self.append_journal(&trade, now).await;
        self.ledger.archive(trade);
        self.dirty = true;
    }

    async fn append_journal(&self, trade: &ActiveTrade, now: DateTime<Utc>) {
        if let Err(err) = self.journal.append(trade, now).await {
            warn!(
                "Failed to journal trade {} to {}: {:#}",
                trade.trade_id,
                self.journal.path().display(),
                err
            );
        }
    }

    async fn maybe_persist(&mut self, now: DateTime<Utc>) {
        if !self.dirty {
            return;
        }
        let interval = ChronoDuration::from_std(self.settings.persist_interval)
            .unwrap_or_else(|_| ChronoDuration::zero());
        let due = self
            .last_persist_at
            .map(|last| now - last >= interval)
            .unwrap_or(true);
        if !due {
            return;
        }
        if let Err(err) = self.persist(now).await {
            error!("Failed to save state: {:#}", err);
        }
    }

    pub async fn persist(&mut self, now: DateTime<Utc>) -> Result<()> {
        let state = self.capture_state(now);
        self.persister.save(&state).await?;
        self.dirty = false;
        self.last_persist_at = Some(now);
        debug!(
            "State saved: {} live, {} seen",
            state.opened.len(),
            state.seen.len()
        );
        Ok(())
    }
}

/// Builds the ledger entry for a submitted order. Without a fill the trade
/// waits in `PENDING_SUBMIT` for reconciliation.
fn open_trade(
    signal: &Signal,
    symbol: &SymbolConfig,
    order: &PreparedOrder,
    fill: Option<&Fill>,
    now: DateTime<Utc>,
) -> ActiveTrade {
    let request = &order.request;
    ActiveTrade {
        trade_id: signal.id.clone(),
        ticket: fill.map(|fill| fill.ticket),
        strategy_id: signal.strategy_id.clone(),
        strategy_name: signal.strategy_name.clone(),
        symbol: symbol.symbol.clone(),
        broker_symbol: symbol.broker_symbol.clone(),
        direction: signal.direction,
        entry_price: fill.map(|fill| fill.price).unwrap_or(request.price),
        stop_loss: request.stop_loss,
        take_profit: request.take_profit,
        initial_stop_loss: request.stop_loss,
        lot_size: request.volume,
        comment: request.comment.clone(),
        magic: request.magic,
        opened_at: now,
        state: if fill.is_some() {
            TradeState::Open
        } else {
            TradeState::PendingSubmit
        },
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
