use crate::error::BrokerError;
use crate::models::{BrokerPosition, ClosingDeal, Direction, Quote};
use serde::Serialize;

pub const RETCODE_DONE: i64 = 10009;
pub const RETCODE_INVALID_FILL: i64 = 10030;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FillMode {
    Ioc,
    Fok,
    Return,
}

impl FillMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ioc" => Some(FillMode::Ioc),
            "fok" => Some(FillMode::Fok),
            "return" => Some(FillMode::Return),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FillMode::Ioc => "ioc",
            FillMode::Fok => "fok",
            FillMode::Return => "return",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub broker_symbol: String,
    pub direction: Direction,
    pub volume: f64,
    pub price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub deviation: u32,
    pub magic: u64,
    pub comment: String,
    pub fill_mode: FillMode,
}

/// Raw answer to an order submission. `retcode` decides success.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderReply {
    pub retcode: i64,
    pub ticket: Option<u64>,
    pub price: Option<f64>,
    pub comment: String,
}

impl OrderReply {
    pub fn is_done(&self) -> bool {
        self.retcode == RETCODE_DONE
    }
}

/// Narrow contract the engine needs from a brokerage terminal.
#[allow(async_fn_in_trait)]
pub trait Broker {
    async fn quote(&self, broker_symbol: &str) -> Result<Quote, BrokerError>;

    /// Every open position tagged with `magic`. An `Err` means the snapshot is unknown, not empty.
    async fn open_positions(&self, magic: u64) -> Result<Vec<BrokerPosition>, BrokerError>;

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderReply, BrokerError>;

    async fn modify_stop_loss(
        &self,
        ticket: u64,
        stop_loss: f64,
        take_profit: Option<f64>,
    ) -> Result<(), BrokerError>;

    async fn account_balance(&self) -> Result<f64, BrokerError>;

    /// Realised result of a closed position; `Ok(None)` when the terminal has no record.
    async fn closing_deal(&self, ticket: u64) -> Result<Option<ClosingDeal>, BrokerError>;
}

/// Bounds a broker call. An elapsed deadline is reported as an unknown outcome.
pub async fn bounded<T, F>(
    operation: &'static str,
    after: std::time::Duration,
    call: F,
) -> Result<T, BrokerError>
where
    F: std::future::Future<Output = Result<T, BrokerError>>,
{
    match tokio::time::timeout(after, call).await {
        Ok(result) => result,
        Err(_) => Err(BrokerError::Timeout { operation, after }),
    }
}
