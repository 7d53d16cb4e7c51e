use crate::broker::{Broker, OrderReply, OrderRequest, RETCODE_DONE};
use crate::error::BrokerError;
use crate::models::{BrokerPosition, ClosingDeal, Quote};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const FIRST_TICKET: u64 = 1000;

enum ScriptedReply {
    Reply(Result<OrderReply, BrokerError>),
    /// The order fills but the caller sees a timeout.
    LostFill,
}

struct PaperState {
    quotes: HashMap<String, Quote>,
    positions: BTreeMap<u64, BrokerPosition>,
    deals: HashMap<u64, ClosingDeal>,
    replies: VecDeque<ScriptedReply>,
    modify_failures: VecDeque<BrokerError>,
    submitted: Vec<OrderRequest>,
    modifications: Vec<(u64, f64)>,
    positions_down: HashSet<u64>,
    balance: Result<f64, BrokerError>,
    next_ticket: u64,
}

/// In-memory terminal. Cloning shares state, so a test can keep a handle
/// while the execution loop owns another.
#[derive(Clone)]
pub struct PaperBroker {
    inner: Arc<Mutex<PaperState>>,
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(PaperState {
                quotes: HashMap::new(),
                positions: BTreeMap::new(),
                deals: HashMap::new(),
                replies: VecDeque::new(),
                modify_failures: VecDeque::new(),
                submitted: Vec::new(),
                modifications: Vec::new(),
                positions_down: HashSet::new(),
                balance: Ok(10_000.0),
                next_ticket: FIRST_TICKET,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, PaperState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_quote(&self, broker_symbol: &str, bid: f64, ask: f64) {
        let mut state = self.state();
        state
            .quotes
            .insert(broker_symbol.to_string(), Quote { bid, ask });
        for position in state.positions.values_mut() {
            if position.broker_symbol == broker_symbol {
                position.current_price = Some(Quote { bid, ask }.exit_price(position.direction));
            }
        }
    }

    pub fn clear_quote(&self, broker_symbol: &str) {
        self.state().quotes.remove(broker_symbol);
    }

    pub fn set_balance(&self, balance: Result<f64, BrokerError>) {
        self.state().balance = balance;
    }

    pub fn push_order_reply(&self, reply: Result<OrderReply, BrokerError>) {
        self.state().replies.push_back(ScriptedReply::Reply(reply));
    }

    pub fn push_lost_fill(&self) {
        self.state().replies.push_back(ScriptedReply::LostFill);
    }

    pub fn fail_next_modify(&self, err: BrokerError) {
        self.state().modify_failures.push_back(err);
    }

    /// Makes position queries for `magic` fail until restored.
    pub fn set_positions_unavailable(&self, magic: u64, unavailable: bool) {
        let mut state = self.state();
        if unavailable {
            state.positions_down.insert(magic);
        } else {
            state.positions_down.remove(&magic);
        }
    }

    pub fn set_position_profit(&self, ticket: u64, profit: f64) {
        if let Some(position) = self.state().positions.get_mut(&ticket) {
            position.profit = Some(profit);
        }
    }

    /// Closes a position and records its closing deal.
    pub fn close_position(&self, ticket: u64, price: f64, profit: f64) {
        let mut state = self.state();
        if state.positions.remove(&ticket).is_some() {
            state.deals.insert(ticket, ClosingDeal { price, profit });
        }
    }

    /// Closes a position without leaving any deal history.
    pub fn drop_position(&self, ticket: u64) {
        self.state().positions.remove(&ticket);
    }

    pub fn positions(&self) -> Vec<BrokerPosition> {
        self.state().positions.values().cloned().collect()
    }

    pub fn submitted_orders(&self) -> Vec<OrderRequest> {
        self.state().submitted.clone()
    }

    pub fn modifications(&self) -> Vec<(u64, f64)> {
        self.state().modifications.clone()
    }

    fn open_from_request(state: &mut PaperState, request: &OrderRequest) -> u64 {
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        Self::insert_position(state, ticket, request);
        ticket
    }

    fn insert_position(state: &mut PaperState, ticket: u64, request: &OrderRequest) {
        state.positions.insert(
            ticket,
            BrokerPosition {
                ticket,
                broker_symbol: request.broker_symbol.clone(),
                direction: request.direction,
                volume: request.volume,
                open_price: request.price,
                current_price: Some(request.price),
                stop_loss: request.stop_loss,
                take_profit: request.take_profit,
                profit: Some(0.0),
                magic: request.magic,
                comment: request.comment.clone(),
            },
        );
    }
}

impl Broker for PaperBroker {
    async fn quote(&self, broker_symbol: &str) -> Result<Quote, BrokerError> {
        self.state()
            .quotes
            .get(broker_symbol)
            .copied()
            .ok_or_else(|| BrokerError::Unavailable(format!("no tick for {}", broker_symbol)))
    }

    async fn open_positions(&self, magic: u64) -> Result<Vec<BrokerPosition>, BrokerError> {
        let state = self.state();
        if state.positions_down.contains(&magic) {
            return Err(BrokerError::Unavailable(format!(
                "positions for magic {} unavailable",
                magic
            )));
        }
        Ok(state
            .positions
            .values()
            .filter(|position| position.magic == magic)
            .cloned()
            .collect())
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderReply, BrokerError> {
        let mut state = self.state();
        state.submitted.push(request.clone());
        match state.replies.pop_front() {
            Some(ScriptedReply::Reply(reply)) => {
                if let Ok(OrderReply {
                    retcode: RETCODE_DONE,
                    ticket: Some(ticket),
                    price,
                    ..
                }) = &reply
                {
                    let mut filled = request.clone();
                    if let Some(price) = price {
                        filled.price = *price;
                    }
                    Self::insert_position(&mut state, *ticket, &filled);
                    state.next_ticket = state.next_ticket.max(*ticket + 1);
                }
                reply
            }
            Some(ScriptedReply::LostFill) => {
                Self::open_from_request(&mut state, request);
                Err(BrokerError::Timeout {
                    operation: "order_send",
                    after: Duration::from_secs(5),
                })
            }
            None => {
                let ticket = Self::open_from_request(&mut state, request);
                Ok(OrderReply {
                    retcode: RETCODE_DONE,
                    ticket: Some(ticket),
                    price: Some(request.price),
                    comment: "Request executed".to_string(),
                })
            }
        }
    }

    async fn modify_stop_loss(
        &self,
        ticket: u64,
        stop_loss: f64,
        take_profit: Option<f64>,
    ) -> Result<(), BrokerError> {
        let mut state = self.state();
        if let Some(err) = state.modify_failures.pop_front() {
            return Err(err);
        }
        let Some(position) = state.positions.get_mut(&ticket) else {
            return Err(BrokerError::Rejected {
                code: 10036,
                message: format!("position {} not found", ticket),
            });
        };
        position.stop_loss = Some(stop_loss);
        if take_profit.is_some() {
            position.take_profit = take_profit;
        }
        state.modifications.push((ticket, stop_loss));
        Ok(())
    }

    async fn account_balance(&self) -> Result<f64, BrokerError> {
        self.state().balance.clone()
    }

    async fn closing_deal(&self, ticket: u64) -> Result<Option<ClosingDeal>, BrokerError> {
        Ok(self.state().deals.get(&ticket).copied())
    }
}
