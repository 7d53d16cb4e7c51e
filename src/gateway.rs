use crate::broker::{bounded, Broker, FillMode, OrderRequest, RETCODE_INVALID_FILL};
use crate::config::GatewaySettings;
use crate::error::{BrokerError, FailureKind, SubmitFailure};
use crate::models::{BrokerPosition, ClosingDeal, Direction, Quote};
use crate::symbols::SymbolConfig;
use crate::trading_rules::{clamp_stops, ClampedStops};
use log::{info, warn};

/// Broker comment field limit.
pub const COMMENT_MAX_LEN: usize = 31;

/// Deterministic order comment, e.g. `ADX_06_XAU|BUY`.
pub fn make_comment(strategy_id: &str, direction: Direction) -> String {
    let parts: Vec<&str> = strategy_id.split('_').collect();
    let tag: String = if parts.len() >= 3 {
        let third: String = parts[2].chars().take(3).collect();
        format!("{}_{}_{}", parts[0], parts[1], third)
    } else {
        strategy_id.chars().take(15).collect()
    };
    format!("{}|{}", tag, direction.as_str())
        .chars()
        .take(COMMENT_MAX_LEN)
        .collect()
}

/// What the caller wants opened; prices come from the quote fetched at submission.
#[derive(Debug, Clone, Copy)]
pub struct OrderIntent<'a> {
    pub symbol: &'a SymbolConfig,
    pub direction: Direction,
    pub lot_size: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub strategy_id: &'a str,
}

/// An order priced against a fresh quote with broker-legal stops, ready to send.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedOrder {
    pub request: OrderRequest,
    pub quote: Quote,
    pub stops: ClampedStops,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub ticket: u64,
    pub price: f64,
    pub fill_mode: FillMode,
}

pub struct OrderGateway {
    settings: GatewaySettings,
}

impl OrderGateway {
    pub fn new(settings: GatewaySettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub async fn quote<B: Broker>(
        &self,
        broker: &B,
        symbol: &SymbolConfig,
    ) -> Result<Quote, BrokerError> {
        let quote = bounded(
            "quote",
            self.settings.broker_timeout,
            broker.quote(&symbol.broker_symbol),
        )
        .await?;
        if !quote.is_valid() {
            return Err(BrokerError::Unavailable(format!(
                "invalid quote for {} (bid {}, ask {})",
                symbol.broker_symbol, quote.bid, quote.ask
            )));
        }
        Ok(quote)
    }

    /// Fetches a fresh quote and builds the order with clamped stops.
    /// Nothing reaches the broker's order book here.
    pub async fn prepare<B: Broker>(
        &self,
        broker: &B,
        intent: &OrderIntent<'_>,
    ) -> Result<PreparedOrder, SubmitFailure> {
        let OrderIntent {
            symbol,
            direction,
            lot_size,
            stop_loss: proposed_sl,
            take_profit: proposed_tp,
            strategy_id,
        } = *intent;
        let quote = self
            .quote(broker, symbol)
            .await
            .map_err(|err| SubmitFailure::new(FailureKind::Unavailable(err.to_string())))?;
        let price = quote.entry_price(direction);
        let stops = clamp_stops(
            direction,
            price,
            proposed_sl,
            proposed_tp,
            symbol.min_stop_distance(),
            symbol.digits,
        );
        if stops.stop_loss_adjusted || stops.take_profit_adjusted {
            info!(
                "Adjusted stops for {} {} to broker minimum distance {}: sl={:?}->{:?} tp={:?}->{:?}",
                direction,
                symbol.broker_symbol,
                symbol.min_stop_distance(),
                proposed_sl,
                stops.stop_loss,
                proposed_tp,
                stops.take_profit
            );
        }

        Ok(PreparedOrder {
            request: OrderRequest {
                broker_symbol: symbol.broker_symbol.clone(),
                direction,
                volume: lot_size,
                price,
                stop_loss: stops.stop_loss,
                take_profit: stops.take_profit,
                deviation: self.settings.deviation_points,
                magic: symbol.magic,
                comment: make_comment(strategy_id, direction),
                fill_mode: self.settings.primary_fill_mode,
            },
            quote,
            stops,
        })
    }

    /// Sends a prepared order, falling back to the alternate fill mode at most once.
    pub async fn send<B: Broker>(
        &self,
        broker: &B,
        order: &PreparedOrder,
    ) -> Result<Fill, SubmitFailure> {
        let mut modes = vec![self.settings.primary_fill_mode];
        if let Some(fallback) = self.settings.fallback_fill_mode {
            modes.push(fallback);
        }

        let mut request = order.request.clone();
        let mut last_failure = None;
        for (attempt, mode) in modes.iter().copied().enumerate() {
            request.fill_mode = mode;
            let failure = match self.attempt(broker, &request).await {
                Ok(fill) => return Ok(fill),
                Err(failure) => failure,
            };

            let can_retry = failure.kind.is_retryable() && attempt + 1 < modes.len();
            if !can_retry {
                return Err(failure);
            }
            warn!(
                "Fill mode {} unsupported for {} {} ({}); retrying once with {}",
                mode.as_str(),
                request.direction,
                request.broker_symbol,
                failure.detail,
                modes[attempt + 1].as_str()
            );
            last_failure = Some(failure);
        }

        Err(last_failure.unwrap_or_else(|| {
            SubmitFailure::new(FailureKind::Unavailable("no fill modes configured".to_string()))
        }))
    }

    pub async fn submit<B: Broker>(
        &self,
        broker: &B,
        intent: &OrderIntent<'_>,
    ) -> Result<(PreparedOrder, Fill), SubmitFailure> {
        let order = self.prepare(broker, intent).await?;
        let fill = self.send(broker, &order).await?;
        Ok((order, fill))
    }

    async fn attempt<B: Broker>(
        &self,
        broker: &B,
        request: &OrderRequest,
    ) -> Result<Fill, SubmitFailure> {
        let reply = bounded(
            "order_send",
            self.settings.broker_timeout,
            broker.submit_order(request),
        )
        .await
        .map_err(|err| SubmitFailure::new(classify_broker_error(err)))?;

        if reply.is_done() {
            return match reply.ticket {
                Some(ticket) => Ok(Fill {
                    ticket,
                    price: reply.price.unwrap_or(request.price),
                    fill_mode: request.fill_mode,
                }),
                // Accepted but unidentifiable; reconciliation has to find it.
                None => Err(SubmitFailure::new(FailureKind::Timeout)),
            };
        }

        let kind = if reply.retcode == RETCODE_INVALID_FILL {
            FailureKind::FillModeUnsupported {
                code: reply.retcode,
                message: reply.comment,
            }
        } else {
            FailureKind::Rejected {
                code: reply.retcode,
                message: reply.comment,
            }
        };
        Err(SubmitFailure::new(kind))
    }

    pub async fn modify_stop<B: Broker>(
        &self,
        broker: &B,
        ticket: u64,
        stop_loss: f64,
        take_profit: Option<f64>,
    ) -> Result<(), BrokerError> {
        bounded(
            "modify_sltp",
            self.settings.broker_timeout,
            broker.modify_stop_loss(ticket, stop_loss, take_profit),
        )
        .await
    }

    pub async fn open_positions<B: Broker>(
        &self,
        broker: &B,
        magic: u64,
    ) -> Result<Vec<BrokerPosition>, BrokerError> {
        bounded(
            "positions_get",
            self.settings.broker_timeout,
            broker.open_positions(magic),
        )
        .await
    }

    pub async fn closing_deal<B: Broker>(
        &self,
        broker: &B,
        ticket: u64,
    ) -> Result<Option<ClosingDeal>, BrokerError> {
        bounded(
            "history_deals_get",
            self.settings.broker_timeout,
            broker.closing_deal(ticket),
        )
        .await
    }

    pub async fn account_balance<B: Broker>(&self, broker: &B) -> Result<f64, BrokerError> {
        let balance = bounded(
            "account_info",
            self.settings.broker_timeout,
            broker.account_balance(),
        )
        .await?;
        if !balance.is_finite() || balance <= 0.0 {
            return Err(BrokerError::MalformedReply(format!(
                "account balance {}",
                balance
            )));
        }
        Ok(balance)
    }
}

fn classify_broker_error(err: BrokerError) -> FailureKind {
    if err.is_unknown_outcome() {
        return FailureKind::Timeout;
    }
    match err {
        BrokerError::Rejected { code, message } if code == RETCODE_INVALID_FILL => {
            FailureKind::FillModeUnsupported { code, message }
        }
        BrokerError::Rejected { code, message } => FailureKind::Rejected { code, message },
        other => FailureKind::Unavailable(other.to_string()),
    }
}
