use crate::broker::Broker;
use crate::config::PositionSettings;
use crate::gateway::OrderGateway;
use crate::models::{ActiveTrade, BrokerPosition, ClosingDeal, TradeOutcome, TradeState};
use crate::symbols::SymbolRegistry;
use crate::trading_rules::{compute_stop_move, StopMove, StopMoveParams};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

/// Broker positions per magic for one monitoring pass. A magic whose query
/// failed is absent, and trades under it are left untouched.
#[derive(Debug, Clone, Default)]
pub struct PositionSnapshot {
    by_magic: BTreeMap<u64, Vec<BrokerPosition>>,
    failed: BTreeSet<u64>,
}

impl PositionSnapshot {
    pub async fn fetch<B, I>(broker: &B, gateway: &OrderGateway, magics: I) -> Self
    where
        B: Broker,
        I: IntoIterator<Item = u64>,
    {
        let mut snapshot = PositionSnapshot::default();
        let magics: BTreeSet<u64> = magics.into_iter().collect();
        for magic in magics {
            match gateway.open_positions(broker, magic).await {
                Ok(positions) => {
                    snapshot.by_magic.insert(magic, positions);
                }
                Err(err) => {
                    warn!("Positions query failed magic={} error={}", magic, err);
                    snapshot.failed.insert(magic);
                }
            }
        }
        snapshot
    }

    /// Snapshot with every listed magic answered; positions are grouped by their own magic.
    pub fn from_positions<I>(magics: I, positions: Vec<BrokerPosition>) -> Self
    where
        I: IntoIterator<Item = u64>,
    {
        let mut by_magic: BTreeMap<u64, Vec<BrokerPosition>> =
            magics.into_iter().map(|magic| (magic, Vec::new())).collect();
        for position in positions {
            by_magic.entry(position.magic).or_default().push(position);
        }
        Self {
            by_magic,
            failed: BTreeSet::new(),
        }
    }

    pub fn covers(&self, magic: u64) -> bool {
        self.by_magic.contains_key(&magic)
    }

    pub fn failed_magics(&self) -> &BTreeSet<u64> {
        &self.failed
    }

    pub fn find(&self, magic: u64, ticket: u64) -> Option<&BrokerPosition> {
        self.by_magic
            .get(&magic)
            .and_then(|positions| positions.iter().find(|position| position.ticket == ticket))
    }

    pub fn positions(&self) -> impl Iterator<Item = &BrokerPosition> {
        self.by_magic.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.by_magic.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct ReconcileContext<'a, B> {
    pub broker: &'a B,
    pub gateway: &'a OrderGateway,
    pub registry: &'a SymbolRegistry,
    pub settings: &'a PositionSettings,
}

#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Trades that left the broker during this pass.
    pub closed: Vec<ActiveTrade>,
    /// Pending submissions that never showed up at the broker.
    pub rejected: Vec<ActiveTrade>,
    pub adopted: usize,
    pub stop_moves: usize,
    pub stop_move_failures: usize,
    pub untracked: Vec<u64>,
    pub skipped: usize,
}

impl ReconcileReport {
    pub fn changed(&self) -> bool {
        !self.closed.is_empty() || !self.rejected.is_empty() || self.adopted > 0 || self.stop_moves > 0
    }
}

/// Live trades keyed by trade id plus a bounded tail of finished ones.
#[derive(Debug, Clone)]
pub struct PositionLedger {
    opened: BTreeMap<String, ActiveTrade>,
    closed: VecDeque<ActiveTrade>,
    history_limit: usize,
    reported_untracked: HashSet<u64>,
}

impl PositionLedger {
    pub fn new(history_limit: usize) -> Self {
        Self {
            opened: BTreeMap::new(),
            closed: VecDeque::new(),
            history_limit,
            reported_untracked: HashSet::new(),
        }
    }

    /// Rebuilds the ledger from persisted parts. Terminal trades found among
    /// the opened ones are moved to history.
    pub fn from_parts(
        opened: BTreeMap<String, ActiveTrade>,
        closed: Vec<ActiveTrade>,
        history_limit: usize,
    ) -> Self {
        let mut ledger = Self::new(history_limit);
        for trade in closed {
            ledger.push_history(trade);
        }
        for (trade_id, trade) in opened {
            if trade.state.is_terminal() {
                ledger.push_history(trade);
            } else {
                ledger.opened.insert(trade_id, trade);
            }
        }
        ledger
    }

    pub fn record(&mut self, trade: ActiveTrade) {
        if let Some(previous) = self.opened.insert(trade.trade_id.clone(), trade) {
            warn!(
                "Replaced ledger entry trade_id={} state={}",
                previous.trade_id,
                previous.state.as_str()
            );
        }
    }

    /// Files a trade that never went live straight into history.
    pub fn archive(&mut self, trade: ActiveTrade) {
        self.push_history(trade);
    }

    pub fn has_open(&self, strategy_id: &str, symbol: &str) -> bool {
        self.opened
            .values()
            .any(|trade| trade.occupies(strategy_id, symbol))
    }

    /// Live trades, pending submissions included.
    pub fn count_open(&self) -> usize {
        self.opened.values().filter(|trade| trade.is_live()).count()
    }

    pub fn count_by_symbol(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for trade in self.opened.values().filter(|trade| trade.is_live()) {
            *counts.entry(trade.symbol.clone()).or_insert(0) += 1;
        }
        counts
    }

    pub fn get(&self, trade_id: &str) -> Option<&ActiveTrade> {
        self.opened.get(trade_id)
    }

    pub fn trades(&self) -> impl Iterator<Item = &ActiveTrade> {
        self.opened.values()
    }

    pub fn opened(&self) -> &BTreeMap<String, ActiveTrade> {
        &self.opened
    }

    pub fn closed(&self) -> &VecDeque<ActiveTrade> {
        &self.closed
    }

    /// Every magic a live trade was opened under.
    pub fn magics(&self) -> BTreeSet<u64> {
        self.opened
            .values()
            .filter(|trade| trade.is_live())
            .map(|trade| trade.magic)
            .collect()
    }

    fn push_history(&mut self, trade: ActiveTrade) {
        self.closed.push_back(trade);
        while self.closed.len() > self.history_limit {
            self.closed.pop_front();
        }
    }

    fn owned_tickets(&self) -> HashSet<u64> {
        self.opened
            .values()
            .filter(|trade| trade.is_live())
            .filter_map(|trade| trade.ticket)
            .collect()
    }

    /// Aligns local trades with the broker snapshot: adopts or expires pending
    /// submissions, closes trades whose ticket vanished, and applies
    /// breakeven/trailing stop moves. Each trade is closed at most once.
    pub async fn reconcile<B: Broker>(
        &mut self,
        snapshot: &PositionSnapshot,
        ctx: &ReconcileContext<'_, B>,
        now: DateTime<Utc>,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut owned = self.owned_tickets();

        self.resolve_pending(snapshot, ctx.settings, now, &mut owned, &mut report);

        let trade_ids: Vec<String> = self
            .opened
            .iter()
            .filter(|(_, trade)| {
                matches!(trade.state, TradeState::Open | TradeState::BreakevenArmed)
            })
            .map(|(trade_id, _)| trade_id.clone())
            .collect();

        for trade_id in trade_ids {
            let Some((magic, ticket)) = self
                .opened
                .get(&trade_id)
                .map(|trade| (trade.magic, trade.ticket))
            else {
                continue;
            };
            if !snapshot.covers(magic) {
                report.skipped += 1;
                continue;
            }
            let Some(ticket) = ticket else {
                warn!("Trade {} is open without a ticket; flagging for review", trade_id);
                if let Some(trade) = self.opened.get_mut(&trade_id) {
                    trade.needs_review = true;
                }
                continue;
            };

            match snapshot.find(magic, ticket) {
                Some(position) => {
                    self.refresh_open_trade(&trade_id, position, ctx, now, &mut report)
                        .await;
                }
                None => {
                    let deal = match ctx.gateway.closing_deal(ctx.broker, ticket).await {
                        Ok(deal) => deal,
                        Err(err) => {
                            warn!("Closing deal lookup failed ticket={} error={}", ticket, err);
                            None
                        }
                    };
                    if let Some(mut trade) = self.opened.remove(&trade_id) {
                        close_trade(&mut trade, deal, now);
                        self.push_history(trade.clone());
                        report.closed.push(trade);
                    }
                }
            }
        }

        for position in snapshot.positions() {
            if owned.contains(&position.ticket) {
                continue;
            }
            report.untracked.push(position.ticket);
            if self.reported_untracked.insert(position.ticket) {
                warn!(
                    "Untracked position ticket={} symbol={} direction={} magic={} comment={}",
                    position.ticket,
                    position.broker_symbol,
                    position.direction,
                    position.magic,
                    position.comment
                );
            }
        }

        report
    }

    fn resolve_pending(
        &mut self,
        snapshot: &PositionSnapshot,
        settings: &PositionSettings,
        now: DateTime<Utc>,
        owned: &mut HashSet<u64>,
        report: &mut ReconcileReport,
    ) {
        let pending_ids: Vec<String> = self
            .opened
            .iter()
            .filter(|(_, trade)| trade.state == TradeState::PendingSubmit)
            .map(|(trade_id, _)| trade_id.clone())
            .collect();

        for trade_id in pending_ids {
            let Some(trade) = self.opened.get_mut(&trade_id) else {
                continue;
            };
            if !snapshot.covers(trade.magic) {
                report.skipped += 1;
                continue;
            }

            let candidate = snapshot.positions().find(|position| {
                !owned.contains(&position.ticket)
                    && position.magic == trade.magic
                    && position.broker_symbol == trade.broker_symbol
                    && position.direction == trade.direction
                    && position.comment == trade.comment
            });

            if let Some(position) = candidate {
                owned.insert(position.ticket);
                trade.set_ticket(Some(position.ticket), now);
                trade.set_entry_price(position.open_price, now);
                if position.stop_loss.is_some() {
                    trade.set_stop_loss(position.stop_loss, now);
                }
                trade.take_profit = position.take_profit.or(trade.take_profit);
                trade.last_price = position.current_price;
                trade.last_profit = position.profit;
                trade.set_state(TradeState::Open, now);
                report.adopted += 1;
                info!(
                    "Adopted pending trade trade_id={} ticket={} symbol={} entry={}",
                    trade.trade_id, position.ticket, trade.symbol, position.open_price
                );
                continue;
            }

            if now - trade.opened_at < settings.pending_grace {
                debug!("Pending trade {} still unmatched", trade.trade_id);
                continue;
            }

            if let Some(mut trade) = self.opened.remove(&trade_id) {
                trade.set_state(TradeState::Rejected, now);
                trade.closed_at = Some(now);
                trade.note = Some("no broker position matched the submission".to_string());
                warn!(
                    "Pending trade expired trade_id={} strategy={} symbol={}",
                    trade.trade_id, trade.strategy_id, trade.symbol
                );
                self.push_history(trade.clone());
                report.rejected.push(trade);
            }
        }
    }

    async fn refresh_open_trade<B: Broker>(
        &mut self,
        trade_id: &str,
        position: &BrokerPosition,
        ctx: &ReconcileContext<'_, B>,
        now: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) {
        let Some(trade) = self.opened.get_mut(trade_id) else {
            return;
        };
        trade.last_price = position.current_price.or(trade.last_price);
        trade.last_profit = position.profit.or(trade.last_profit);
        if position.stop_loss.is_some() && position.stop_loss != trade.stop_loss {
            trade.set_stop_loss(position.stop_loss, now);
        }

        let Some(symbol) = ctx.registry.get(&trade.symbol) else {
            debug!("No symbol config for {}; stop management skipped", trade.symbol);
            return;
        };
        let Some(current_price) = position.current_price else {
            return;
        };

        let stop_move = compute_stop_move(StopMoveParams {
            direction: trade.direction,
            entry_price: trade.entry_price,
            initial_stop_distance: trade.initial_stop_distance(),
            current_stop: trade.stop_loss,
            current_price,
            breakeven_armed: trade.state == TradeState::BreakevenArmed,
            trigger_ratio: ctx.settings.breakeven_trigger_ratio,
            breakeven_offset: symbol.pips_to_price(ctx.settings.breakeven_offset_pips),
            trailing_distance: symbol.pips_to_price(ctx.settings.trailing_stop_pips),
            min_distance: symbol.min_stop_distance(),
            digits: symbol.digits,
        });
        let Some(stop_move) = stop_move else {
            return;
        };

        if let StopMove::Breakeven {
            needs_modify: false,
            ..
        } = stop_move
        {
            trade.set_state(TradeState::BreakevenArmed, now);
            info!(
                "Breakeven armed trade_id={} ticket={:?} stop already at {:?}",
                trade.trade_id, trade.ticket, trade.stop_loss
            );
            report.stop_moves += 1;
            return;
        }

        let Some(ticket) = trade.ticket else {
            return;
        };
        let level = stop_move.value();
        match ctx
            .gateway
            .modify_stop(ctx.broker, ticket, level, trade.take_profit)
            .await
        {
            Ok(()) => {
                let previous = trade.stop_loss;
                trade.set_stop_loss(Some(level), now);
                if matches!(stop_move, StopMove::Breakeven { .. }) {
                    trade.set_state(TradeState::BreakevenArmed, now);
                }
                report.stop_moves += 1;
                info!(
                    "Stop moved reason={} trade_id={} ticket={} sl={:?}->{} price={}",
                    stop_move.reason(),
                    trade.trade_id,
                    ticket,
                    previous,
                    level,
                    current_price
                );
            }
            Err(err) => {
                report.stop_move_failures += 1;
                warn!(
                    "Stop move failed reason={} trade_id={} ticket={} sl={} error={}; retrying next cycle",
                    stop_move.reason(),
                    trade.trade_id,
                    ticket,
                    level,
                    err
                );
            }
        }
    }
}

fn close_trade(trade: &mut ActiveTrade, deal: Option<ClosingDeal>, now: DateTime<Utc>) {
    let (close_price, pnl) = match deal {
        Some(deal) => (Some(deal.price), Some(deal.profit)),
        None => (trade.last_price, trade.last_profit),
    };
    let outcome = pnl.map(TradeOutcome::from_pnl).unwrap_or(TradeOutcome::Unknown);

    trade.set_close_price(close_price, now);
    trade.set_pnl(pnl, now);
    trade.set_outcome(Some(outcome), now);
    trade.closed_at = Some(now);
    trade.set_state(TradeState::Closed, now);

    if outcome == TradeOutcome::Unknown {
        trade.needs_review = true;
        trade.note = Some("closed without deal history or last profit".to_string());
        warn!(
            "Trade closed with unknown outcome trade_id={} ticket={:?} strategy={} symbol={}; needs manual review",
            trade.trade_id, trade.ticket, trade.strategy_id, trade.symbol
        );
    } else {
        info!(
            "Trade closed trade_id={} ticket={:?} strategy={} symbol={} outcome={} pnl={:.2} source={}",
            trade.trade_id,
            trade.ticket,
            trade.strategy_id,
            trade.symbol,
            outcome.as_str(),
            pnl.unwrap_or_default(),
            if deal.is_some() { "deal" } else { "last_profit" }
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{FillMode, OrderReply, OrderRequest, RETCODE_DONE};
    use crate::config::GatewaySettings;
    use crate::error::BrokerError;
    use crate::models::Direction;
    use crate::paper::PaperBroker;
    use crate::symbols::SymbolConfig;
    use chrono::{Duration, TimeZone};

    const MAGIC: u64 = 202605;

    fn registry() -> SymbolRegistry {
        SymbolRegistry::from_configs(vec![SymbolConfig {
            symbol: "EURUSD".to_string(),
            broker_symbol: "EURUSD+".to_string(),
            pip_size: 0.0001,
            stop_level: 5,
            digits: 5,
            magic: MAGIC,
            whitelist_path: None,
        }])
    }

    fn opened_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn trade(trade_id: &str, strategy_id: &str, ticket: Option<u64>, state: TradeState) -> ActiveTrade {
        ActiveTrade {
            trade_id: trade_id.to_string(),
            ticket,
            strategy_id: strategy_id.to_string(),
            strategy_name: strategy_id.to_string(),
            symbol: "EURUSD".to_string(),
            broker_symbol: "EURUSD+".to_string(),
            direction: Direction::Buy,
            entry_price: 1.08500,
            stop_loss: Some(1.08200),
            take_profit: Some(1.09100),
            initial_stop_loss: Some(1.08200),
            lot_size: 0.01,
            comment: format!("{}|BUY", strategy_id),
            magic: MAGIC,
            opened_at: opened_at(),
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

    fn position(ticket: u64, comment: &str, price: f64, profit: f64) -> BrokerPosition {
        BrokerPosition {
            ticket,
            broker_symbol: "EURUSD+".to_string(),
            direction: Direction::Buy,
            volume: 0.01,
            open_price: 1.08510,
            current_price: Some(price),
            stop_loss: Some(1.08200),
            take_profit: Some(1.09100),
            profit: Some(profit),
            magic: MAGIC,
            comment: comment.to_string(),
        }
    }

    struct Fixture {
        broker: PaperBroker,
        gateway: OrderGateway,
        registry: SymbolRegistry,
        settings: PositionSettings,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                broker: PaperBroker::new(),
                gateway: OrderGateway::new(GatewaySettings {
                    broker_timeout: std::time::Duration::from_millis(200),
                    ..GatewaySettings::default()
                }),
                registry: registry(),
                settings: PositionSettings::default(),
            }
        }

        fn ctx(&self) -> ReconcileContext<'_, PaperBroker> {
            ReconcileContext {
                broker: &self.broker,
                gateway: &self.gateway,
                registry: &self.registry,
                settings: &self.settings,
            }
        }
    }

    #[test]
    fn slot_and_count_follow_live_states() {
        let mut ledger = PositionLedger::new(10);
        ledger.record(trade("a", "S1", Some(1), TradeState::Open));
        ledger.record(trade("b", "S2", None, TradeState::PendingSubmit));
        assert!(ledger.has_open("S1", "EURUSD"));
        assert!(ledger.has_open("S2", "EURUSD"));
        assert!(!ledger.has_open("S3", "EURUSD"));
        assert_eq!(ledger.count_open(), 2);
        assert_eq!(ledger.count_by_symbol().get("EURUSD"), Some(&2));
    }

    /// Opens a paper position under a fixed ticket.
    async fn place(broker: &PaperBroker, ticket: u64, comment: &str) {
        broker.push_order_reply(Ok(OrderReply {
            retcode: RETCODE_DONE,
            ticket: Some(ticket),
            price: Some(1.08500),
            comment: String::new(),
        }));
        let order = OrderRequest {
            broker_symbol: "EURUSD+".to_string(),
            direction: Direction::Buy,
            volume: 0.01,
            price: 1.08500,
            stop_loss: Some(1.08200),
            take_profit: Some(1.09100),
            deviation: 20,
            magic: MAGIC,
            comment: comment.to_string(),
            fill_mode: FillMode::Ioc,
        };
        broker.submit_order(&order).await.unwrap();
    }

    #[tokio::test]
    async fn vanished_ticket_closes_exactly_once() {
        let fixture = Fixture::new();
        let mut ledger = PositionLedger::new(10);
        ledger.record(trade("a", "S1", Some(7), TradeState::Open));

        let snapshot = PositionSnapshot::from_positions([MAGIC], Vec::new());
        let now = opened_at() + Duration::hours(1);
        let report = ledger.reconcile(&snapshot, &fixture.ctx(), now).await;
        assert_eq!(report.closed.len(), 1);
        assert_eq!(report.closed[0].outcome, Some(TradeOutcome::Unknown));
        assert!(report.closed[0].needs_review);
        assert!(!ledger.has_open("S1", "EURUSD"));
        assert_eq!(ledger.closed().len(), 1);

        let again = ledger.reconcile(&snapshot, &fixture.ctx(), now).await;
        assert!(again.closed.is_empty());
        assert_eq!(ledger.closed().len(), 1);
    }

    #[tokio::test]
    async fn closing_deal_beats_last_profit() {
        let fixture = Fixture::new();
        place(&fixture.broker, 7, "S1|BUY").await;
        fixture.broker.close_position(7, 1.08200, -3.0);

        let mut tracked = trade("a", "S1", Some(7), TradeState::Open);
        tracked.last_profit = Some(4.0);
        let mut ledger = PositionLedger::new(10);
        ledger.record(tracked);

        let snapshot = PositionSnapshot::from_positions([MAGIC], Vec::new());
        let report = ledger
            .reconcile(&snapshot, &fixture.ctx(), opened_at() + Duration::hours(2))
            .await;
        let closed = &report.closed[0];
        assert_eq!(closed.pnl, Some(-3.0));
        assert_eq!(closed.close_price, Some(1.08200));
        assert_eq!(closed.outcome, Some(TradeOutcome::Loss));
        assert!(!closed.needs_review);
    }

    #[tokio::test]
    async fn last_profit_is_fallback() {
        let fixture = Fixture::new();
        let mut tracked = trade("a", "S1", Some(9), TradeState::Open);
        tracked.last_profit = Some(6.5);
        tracked.last_price = Some(1.0910);
        let mut ledger = PositionLedger::new(10);
        ledger.record(tracked);

        let snapshot = PositionSnapshot::from_positions([MAGIC], Vec::new());
        let report = ledger
            .reconcile(&snapshot, &fixture.ctx(), opened_at() + Duration::hours(2))
            .await;
        assert_eq!(report.closed[0].outcome, Some(TradeOutcome::Win));
        assert_eq!(report.closed[0].pnl, Some(6.5));
        assert_eq!(report.closed[0].close_price, Some(1.0910));
    }

    #[tokio::test]
    async fn failed_magic_leaves_trades_untouched() {
        let fixture = Fixture::new();
        let mut ledger = PositionLedger::new(10);
        ledger.record(trade("a", "S1", Some(7), TradeState::Open));

        let snapshot = PositionSnapshot::default();
        let report = ledger
            .reconcile(&snapshot, &fixture.ctx(), opened_at() + Duration::hours(1))
            .await;
        assert!(report.closed.is_empty());
        assert_eq!(report.skipped, 1);
        assert!(ledger.has_open("S1", "EURUSD"));
    }

    #[tokio::test]
    async fn pending_trade_adopts_matching_position() {
        let fixture = Fixture::new();
        let mut ledger = PositionLedger::new(10);
        ledger.record(trade("a", "S1", None, TradeState::PendingSubmit));
        ledger.record(trade("b", "S2", Some(40), TradeState::Open));

        let snapshot = PositionSnapshot::from_positions(
            [MAGIC],
            vec![
                position(40, "S2|BUY", 1.0852, 0.2),
                position(41, "S1|BUY", 1.0852, 0.1),
            ],
        );
        let report = ledger
            .reconcile(&snapshot, &fixture.ctx(), opened_at() + Duration::seconds(10))
            .await;
        assert_eq!(report.adopted, 1);
        let adopted = ledger.get("a").unwrap();
        assert_eq!(adopted.ticket, Some(41));
        assert_eq!(adopted.state, TradeState::Open);
        assert_eq!(adopted.entry_price, 1.08510);
        assert!(report.untracked.is_empty());
    }

    #[tokio::test]
    async fn pending_trade_expires_after_grace() {
        let fixture = Fixture::new();
        let mut ledger = PositionLedger::new(10);
        ledger.record(trade("a", "S1", None, TradeState::PendingSubmit));
        let snapshot = PositionSnapshot::from_positions(
            [MAGIC],
            vec![position(50, "OTHER|BUY", 1.0852, 0.0)],
        );

        let early = ledger
            .reconcile(&snapshot, &fixture.ctx(), opened_at() + Duration::seconds(30))
            .await;
        assert!(early.rejected.is_empty());
        assert!(ledger.has_open("S1", "EURUSD"));
        assert_eq!(early.untracked, vec![50]);

        let late = ledger
            .reconcile(&snapshot, &fixture.ctx(), opened_at() + Duration::seconds(61))
            .await;
        assert_eq!(late.rejected.len(), 1);
        assert_eq!(late.rejected[0].state, TradeState::Rejected);
        assert!(!ledger.has_open("S1", "EURUSD"));
    }

    #[tokio::test]
    async fn breakeven_moves_stop_once() {
        let fixture = Fixture::new();
        place(&fixture.broker, 7, "S1|BUY").await;
        let mut ledger = PositionLedger::new(10);
        ledger.record(trade("a", "S1", Some(7), TradeState::Open));
        // 30 pip initial stop, 16 pips in profit: past the 0.5 trigger.
        let snapshot =
            PositionSnapshot::from_positions([MAGIC], vec![position(7, "S1|BUY", 1.08660, 1.6)]);

        let now = opened_at() + Duration::minutes(30);
        let report = ledger.reconcile(&snapshot, &fixture.ctx(), now).await;
        assert_eq!(report.stop_moves, 1);
        let armed = ledger.get("a").unwrap();
        assert_eq!(armed.state, TradeState::BreakevenArmed);
        assert_eq!(armed.stop_loss, Some(1.08500));
        assert_eq!(fixture.broker.modifications(), vec![(7, 1.08500)]);

        let armed_snapshot = PositionSnapshot::from_positions(
            [MAGIC],
            vec![BrokerPosition {
                stop_loss: Some(1.08500),
                ..position(7, "S1|BUY", 1.08700, 2.0)
            }],
        );
        let again = ledger.reconcile(&armed_snapshot, &fixture.ctx(), now).await;
        assert_eq!(again.stop_moves, 0);
        assert_eq!(fixture.broker.modifications().len(), 1);
    }

    #[tokio::test]
    async fn failed_breakeven_retries_next_cycle() {
        let fixture = Fixture::new();
        place(&fixture.broker, 7, "S1|BUY").await;
        fixture
            .broker
            .fail_next_modify(BrokerError::Unavailable("bridge down".to_string()));
        let mut ledger = PositionLedger::new(10);
        ledger.record(trade("a", "S1", Some(7), TradeState::Open));
        let snapshot =
            PositionSnapshot::from_positions([MAGIC], vec![position(7, "S1|BUY", 1.08660, 1.6)]);

        let now = opened_at() + Duration::minutes(30);
        let first = ledger.reconcile(&snapshot, &fixture.ctx(), now).await;
        assert_eq!(first.stop_move_failures, 1);
        assert_eq!(ledger.get("a").unwrap().state, TradeState::Open);

        let second = ledger.reconcile(&snapshot, &fixture.ctx(), now).await;
        assert_eq!(second.stop_moves, 1);
        assert_eq!(ledger.get("a").unwrap().state, TradeState::BreakevenArmed);
    }

    #[test]
    fn history_is_bounded() {
        let mut closed = Vec::new();
        for index in 0..5 {
            closed.push(trade(&format!("c{}", index), "S", Some(index), TradeState::Closed));
        }
        let mut opened = BTreeMap::new();
        opened.insert("r".to_string(), trade("r", "S", None, TradeState::Rejected));
        let ledger = PositionLedger::from_parts(opened, closed, 3);
        assert_eq!(ledger.closed().len(), 3);
        assert_eq!(ledger.count_open(), 0);
        assert_eq!(ledger.closed().back().map(|t| t.trade_id.as_str()), Some("r"));
    }
}
