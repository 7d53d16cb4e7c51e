use crate::broker::{Broker, OrderReply, OrderRequest, RETCODE_DONE};
use crate::error::BrokerError;
use crate::models::{BrokerPosition, ClosingDeal, Direction, Quote};
use anyhow::{Context, Result};
use log::{debug, warn};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::{self, DeserializeOwned, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// HTTP client for the terminal bridge.
pub struct BridgeClient {
    http: Client,
    base_url: String,
    headers: HeaderMap,
    timeout: Duration,
}

impl BridgeClient {
    pub fn new(base_url: &str, token: Option<&str>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to construct HTTP client")?;

        let mut headers = HeaderMap::new();
        if let Some(token) = token.map(str::trim).filter(|token| !token.is_empty()) {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", token))
                    .context("invalid bridge token")?,
            );
        }

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            headers,
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        path: &str,
    ) -> Result<T, BrokerError> {
        let url = format!("{}{}", self.base_url, path);
        let request = self.http.get(url).headers(self.headers.clone());
        self.send(operation, path, request, false).await
    }

    async fn get_optional<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        path: &str,
    ) -> Result<Option<T>, BrokerError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(url)
            .headers(self.headers.clone())
            .send()
            .await
            .map_err(|err| self.transport_error(operation, path, err, false))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let payload = Self::read_json(operation, path, response).await?;
        Ok(Some(payload))
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        operation: &'static str,
        path: &str,
        body: &B,
    ) -> Result<T, BrokerError> {
        let url = format!("{}{}", self.base_url, path);
        let request = self.http.post(url).headers(self.headers.clone()).json(body);
        self.send(operation, path, request, true).await
    }

    async fn send<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        path: &str,
        request: RequestBuilder,
        mutating: bool,
    ) -> Result<T, BrokerError> {
        let response = request
            .send()
            .await
            .map_err(|err| self.transport_error(operation, path, err, mutating))?;
        Self::read_json(operation, path, response).await
    }

    async fn read_json<T: DeserializeOwned>(
        operation: &'static str,
        path: &str,
        response: reqwest::Response,
    ) -> Result<T, BrokerError> {
        let status = response.status();
        if status.is_server_error() {
            return Err(BrokerError::Unavailable(format!(
                "{} {} returned {}",
                operation, path, status
            )));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(BrokerError::Rejected {
                code: status.as_u16() as i64,
                message: format!("{} {}: {}", operation, path, message.trim()),
            });
        }
        response.json::<T>().await.map_err(|err| {
            BrokerError::MalformedReply(format!(
                "failed to parse bridge response for {}: {}",
                operation, err
            ))
        })
    }

    /// A mutating request that failed after the connection was made may
    /// already have been executed by the terminal, so its outcome is unknown.
    fn transport_error(
        &self,
        operation: &'static str,
        path: &str,
        err: reqwest::Error,
        mutating: bool,
    ) -> BrokerError {
        if err.is_timeout() {
            BrokerError::Timeout {
                operation,
                after: self.timeout,
            }
        } else if !mutating || err.is_connect() || err.is_builder() {
            BrokerError::Unavailable(format!("{} {} failed: {}", operation, path, err))
        } else {
            BrokerError::MalformedReply(format!(
                "{} {} interrupted after sending: {}",
                operation, path, err
            ))
        }
    }
}

impl Broker for BridgeClient {
    async fn quote(&self, broker_symbol: &str) -> Result<Quote, BrokerError> {
        let path = format!("/tick/{}", broker_symbol);
        let tick: BridgeTick = self.get("quote", &path).await?;
        match (tick.bid, tick.ask) {
            (Some(bid), Some(ask)) => Ok(Quote { bid, ask }),
            _ => Err(BrokerError::Unavailable(format!(
                "no tick for {}",
                broker_symbol
            ))),
        }
    }

    async fn open_positions(&self, magic: u64) -> Result<Vec<BrokerPosition>, BrokerError> {
        let path = format!("/positions?magic={}", magic);
        let entries: Vec<BridgePosition> = self.get("positions", &path).await?;
        let mut positions = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(ticket) = entry.ticket else {
                warn!("Ignoring position entry without ticket from bridge");
                continue;
            };
            let position = entry.into_position(magic).ok_or_else(|| {
                BrokerError::MalformedReply(format!(
                    "position {} for magic {} is missing symbol, type or open price",
                    ticket, magic
                ))
            })?;
            if position.magic == magic {
                positions.push(position);
            } else {
                debug!(
                    "Ignoring position {} with magic {} (requested {})",
                    position.ticket, position.magic, magic
                );
            }
        }
        Ok(positions)
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderReply, BrokerError> {
        let body = BridgeOrderBody {
            symbol: &request.broker_symbol,
            volume: request.volume,
            order_type: request.direction.as_str(),
            price: request.price,
            sl: request.stop_loss.unwrap_or(0.0),
            tp: request.take_profit.unwrap_or(0.0),
            deviation: request.deviation,
            magic: request.magic,
            comment: &request.comment,
            type_filling: request.fill_mode.as_str(),
        };
        let reply: BridgeOrderReply = self.post("order_send", "/orders", &body).await?;
        let retcode = reply.retcode.ok_or_else(|| {
            BrokerError::MalformedReply("order reply without retcode".to_string())
        })?;
        Ok(OrderReply {
            retcode,
            ticket: reply.order.filter(|ticket| *ticket > 0),
            price: reply.price.filter(|price| *price > 0.0),
            comment: reply.comment.unwrap_or_default(),
        })
    }

    async fn modify_stop_loss(
        &self,
        ticket: u64,
        stop_loss: f64,
        take_profit: Option<f64>,
    ) -> Result<(), BrokerError> {
        let path = format!("/positions/{}/sltp", ticket);
        let body = BridgeSltpBody {
            sl: stop_loss,
            tp: take_profit.unwrap_or(0.0),
        };
        let reply: BridgeOrderReply = self.post("modify_sltp", &path, &body).await?;
        match reply.retcode {
            Some(RETCODE_DONE) | None => Ok(()),
            Some(code) => Err(BrokerError::Rejected {
                code,
                message: reply.comment.unwrap_or_default(),
            }),
        }
    }

    async fn account_balance(&self) -> Result<f64, BrokerError> {
        let account: BridgeAccount = self.get("account", "/account").await?;
        account
            .balance
            .filter(|balance| balance.is_finite())
            .ok_or_else(|| BrokerError::Unavailable("account reply without balance".to_string()))
    }

    async fn closing_deal(&self, ticket: u64) -> Result<Option<ClosingDeal>, BrokerError> {
        let path = format!("/deals/{}", ticket);
        let deal: Option<BridgeDeal> = self.get_optional("closing_deal", &path).await?;
        Ok(deal.and_then(|deal| match (deal.price, deal.profit) {
            (Some(price), Some(profit)) => Some(ClosingDeal { price, profit }),
            _ => None,
        }))
    }
}

#[derive(Debug, Serialize)]
struct BridgeOrderBody<'a> {
    symbol: &'a str,
    volume: f64,
    #[serde(rename = "type")]
    order_type: &'a str,
    price: f64,
    sl: f64,
    tp: f64,
    deviation: u32,
    magic: u64,
    comment: &'a str,
    type_filling: &'a str,
}

#[derive(Debug, Serialize)]
struct BridgeSltpBody {
    sl: f64,
    tp: f64,
}

#[derive(Debug, Deserialize)]
struct BridgeTick {
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    bid: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    ask: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct BridgeAccount {
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    balance: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct BridgeDeal {
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    price: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    profit: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct BridgeOrderReply {
    #[serde(default, deserialize_with = "deserialize_i64_opt")]
    retcode: Option<i64>,
    #[serde(default, deserialize_with = "deserialize_u64_opt")]
    order: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    price: Option<f64>,
    #[serde(default)]
    comment: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BridgePosition {
    #[serde(default, deserialize_with = "deserialize_u64_opt")]
    ticket: Option<u64>,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(rename = "type", default)]
    position_type: Option<Value>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    volume: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    price_open: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    price_current: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    sl: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    tp: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    profit: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_u64_opt")]
    magic: Option<u64>,
    #[serde(default)]
    comment: Option<String>,
}

impl BridgePosition {
    /// A missing magic is taken to be the one that was queried.
    fn into_position(self, queried_magic: u64) -> Option<BrokerPosition> {
        let ticket = self.ticket?;
        let broker_symbol = self
            .symbol
            .map(|symbol| symbol.trim().to_string())
            .filter(|symbol| !symbol.is_empty())?;
        let direction = parse_position_type(self.position_type.as_ref())?;
        Some(BrokerPosition {
            ticket,
            broker_symbol,
            direction,
            volume: self.volume.unwrap_or(0.0),
            open_price: self.price_open?,
            current_price: positive(self.price_current),
            stop_loss: positive(self.sl),
            take_profit: positive(self.tp),
            profit: self.profit,
            magic: self.magic.unwrap_or(queried_magic),
            comment: self.comment.unwrap_or_default(),
        })
    }
}

/// Terminal position type: 0/1 or BUY/SELL.
fn parse_position_type(value: Option<&Value>) -> Option<Direction> {
    match value? {
        Value::Number(number) => match number.as_i64()? {
            0 => Some(Direction::Buy),
            1 => Some(Direction::Sell),
            _ => None,
        },
        Value::String(text) => text.parse().ok(),
        _ => None,
    }
}

/// Terminals report an unset stop as 0.
fn positive(value: Option<f64>) -> Option<f64> {
    value.filter(|price| price.is_finite() && *price > 0.0)
}

pub(crate) fn deserialize_f64_opt<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    struct F64OptVisitor;

    impl<'de> Visitor<'de> for F64OptVisitor {
        type Value = Option<f64>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a number or string")
        }

        fn visit_none<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }

        fn visit_f64<E>(self, value: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(value))
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(value as f64))
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(value as f64))
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value.trim().parse::<f64>().ok())
        }
    }

    deserializer.deserialize_any(F64OptVisitor)
}

fn deserialize_u64_opt<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    struct U64OptVisitor;

    impl<'de> Visitor<'de> for U64OptVisitor {
        type Value = Option<u64>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("an unsigned integer or string")
        }

        fn visit_none<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(value))
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(u64::try_from(value).ok())
        }

        fn visit_f64<E>(self, value: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if value.is_finite() && value >= 0.0 && value.fract() == 0.0 {
                Ok(Some(value as u64))
            } else {
                Ok(None)
            }
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value.trim().parse::<u64>().ok())
        }
    }

    deserializer.deserialize_any(U64OptVisitor)
}

fn deserialize_i64_opt<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(deserialize_f64_opt(deserializer)?
        .filter(|value| value.fract() == 0.0)
        .map(|value| value as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn position_parses_lenient_numbers() {
        let entry: BridgePosition = serde_json::from_value(json!({
            "ticket": "123456",
            "symbol": "XAUUSD+",
            "type": 1,
            "volume": "0.01",
            "price_open": 2000.5,
            "price_current": "1998.25",
            "sl": 0,
            "tp": 1980.0,
            "profit": -1.2,
            "magic": 202602,
            "comment": "ADX_06_XAU|SELL",
            "time": 1709280000
        }))
        .unwrap();
        let position = entry.into_position(202605).unwrap();
        assert_eq!(position.ticket, 123456);
        assert_eq!(position.direction, Direction::Sell);
        assert_eq!(position.volume, 0.01);
        assert_eq!(position.current_price, Some(1998.25));
        assert_eq!(position.stop_loss, None);
        assert_eq!(position.take_profit, Some(1980.0));
        assert_eq!(position.magic, 202602);
    }

    #[test]
    fn position_without_ticket_or_type_is_not_parsed() {
        let entry: BridgePosition =
            serde_json::from_value(json!({"symbol": "X", "type": 0, "price_open": 1.0})).unwrap();
        assert!(entry.into_position(7).is_none());

        let entry: BridgePosition = serde_json::from_value(
            json!({"ticket": 1, "symbol": "X", "type": "hedge", "price_open": 1.0}),
        )
        .unwrap();
        assert!(entry.into_position(7).is_none());
    }

    #[test]
    fn position_without_magic_takes_the_queried_one() {
        let entry: BridgePosition = serde_json::from_value(
            json!({"ticket": 9, "symbol": "X", "type": "BUY", "price_open": 1.0}),
        )
        .unwrap();
        assert_eq!(entry.into_position(202605).unwrap().magic, 202605);
    }

    #[test]
    fn order_reply_accepts_string_fields() {
        let reply: BridgeOrderReply = serde_json::from_value(json!({
            "retcode": "10009",
            "order": 77,
            "price": "2001.10",
            "comment": "Request executed"
        }))
        .unwrap();
        assert_eq!(reply.retcode, Some(10009));
        assert_eq!(reply.order, Some(77));
        assert_eq!(reply.price, Some(2001.10));
    }

    #[test]
    fn client_trims_base_url_and_rejects_bad_token() {
        let client =
            BridgeClient::new("http://127.0.0.1:9/", None, Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.1:9");
        assert!(BridgeClient::new("http://x", Some("bad\ntoken"), Duration::from_secs(1)).is_err());
    }
}
