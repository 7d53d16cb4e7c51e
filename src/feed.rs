use crate::bridge::deserialize_f64_opt;
use crate::error::FeedError;
use crate::models::{Direction, Signal};
use crate::retry::retry_io_operation;
use chrono::{DateTime, NaiveDateTime, Utc};
use log::{debug, warn};
use serde::Deserialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

/// Pull-based source of the currently open candidate signals, in feed order.
#[allow(async_fn_in_trait)]
pub trait SignalFeed {
    async fn next(&mut self) -> Result<Vec<Signal>, FeedError>;
}

/// Reads the JSON file the strategy layer rewrites each cycle.
pub struct FileSignalFeed {
    path: PathBuf,
}

impl FileSignalFeed {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_once(&self) -> Result<Vec<Signal>, FeedError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("Signal feed {} not written yet", self.path.display());
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(FeedError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        parse_feed(&raw, &self.path)
    }
}

impl SignalFeed for FileSignalFeed {
    async fn next(&mut self) -> Result<Vec<Signal>, FeedError> {
        retry_io_operation!(
            format!("signal feed {}", self.path.display()),
            self.read_once()
        )
    }
}

/// Scripted batches for tests and dry runs. Once drained it keeps returning the last batch.
#[derive(Default)]
pub struct MemorySignalFeed {
    batches: VecDeque<Result<Vec<Signal>, FeedError>>,
    last: Vec<Signal>,
}

impl MemorySignalFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, signals: Vec<Signal>) {
        self.batches.push_back(Ok(signals));
    }

    pub fn push_error(&mut self, err: FeedError) {
        self.batches.push_back(Err(err));
    }
}

impl SignalFeed for MemorySignalFeed {
    async fn next(&mut self) -> Result<Vec<Signal>, FeedError> {
        match self.batches.pop_front() {
            Some(Ok(signals)) => {
                self.last = signals.clone();
                Ok(signals)
            }
            Some(Err(err)) => Err(err),
            None => Ok(self.last.clone()),
        }
    }
}

#[derive(Deserialize)]
struct RawFeed {
    #[serde(default)]
    active: Vec<Value>,
}

#[derive(Deserialize)]
struct RawSignal {
    id: Value,
    symbol: String,
    strategy_id: String,
    #[serde(default)]
    strategy_name: Option<String>,
    direction: String,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    entry_price: Option<f64>,
    #[serde(default, alias = "stop_loss", deserialize_with = "deserialize_f64_opt")]
    sl_price: Option<f64>,
    #[serde(default, alias = "take_profit", deserialize_with = "deserialize_f64_opt")]
    tp_price: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    tp1_price: Option<f64>,
    #[serde(default, alias = "created_at")]
    opened_at: Option<String>,
}

/// Parses the feed document. Entries that cannot be read are skipped with a
/// warning; only an unreadable document fails the whole read.
pub fn parse_feed(raw: &str, path: &Path) -> Result<Vec<Signal>, FeedError> {
    let feed: RawFeed = serde_json::from_str(raw).map_err(|source| FeedError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let mut signals = Vec::with_capacity(feed.active.len());
    for (index, entry) in feed.active.into_iter().enumerate() {
        let raw_signal: RawSignal = match serde_json::from_value(entry) {
            Ok(value) => value,
            Err(err) => {
                warn!("Skipping feed entry #{}: {}", index, err);
                continue;
            }
        };
        match to_signal(raw_signal) {
            Some(signal) => signals.push(signal),
            None => warn!("Skipping feed entry #{}: unusable id or direction", index),
        }
    }
    Ok(signals)
}

fn to_signal(raw: RawSignal) -> Option<Signal> {
    let id = match raw.id {
        Value::String(id) if !id.trim().is_empty() => id.trim().to_string(),
        Value::Number(id) => id.to_string(),
        _ => return None,
    };
    let direction: Direction = raw.direction.parse().ok()?;
    let strategy_id = raw.strategy_id.trim().to_string();
    if strategy_id.is_empty() {
        return None;
    }

    Some(Signal {
        id,
        strategy_name: raw
            .strategy_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| strategy_id.clone()),
        strategy_id,
        symbol: raw.symbol.trim().to_uppercase(),
        direction,
        entry_price: price_level(raw.entry_price),
        stop_loss: price_level(raw.sl_price),
        take_profit: price_level(raw.tp_price).or_else(|| price_level(raw.tp1_price)),
        created_at: raw.opened_at.as_deref().and_then(parse_timestamp),
    })
}

/// Zero means "not set" in the feed.
fn price_level(value: Option<f64>) -> Option<f64> {
    value.filter(|price| price.is_finite() && *price > 0.0)
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_entries_leniently() {
        let raw = r#"{
            "active": [
                {"id": "s1", "symbol": "xauusd", "strategy_id": "ADX_06_XAU",
                 "strategy_name": "ADX", "direction": "BUY", "entry_price": "2000.5",
                 "sl_price": 1990.0, "tp_price": 0, "tp1_price": 2020.0,
                 "opened_at": "2024-03-01 10:00:00"},
                {"id": 17, "symbol": "EURUSD", "strategy_id": "MACD_01_EUR",
                 "direction": "sell", "sl_price": 1.09, "tp_price": 1.08},
                {"id": "bad", "symbol": "EURUSD", "strategy_id": "X", "direction": "HOLD"},
                {"symbol": "EURUSD"}
            ]
        }"#;
        let signals = parse_feed(raw, Path::new("signals.json")).unwrap();
        assert_eq!(signals.len(), 2);

        let gold = &signals[0];
        assert_eq!(gold.symbol, "XAUUSD");
        assert_eq!(gold.entry_price, Some(2000.5));
        assert_eq!(gold.take_profit, Some(2020.0));
        assert!(gold.created_at.is_some());

        let euro = &signals[1];
        assert_eq!(euro.id, "17");
        assert_eq!(euro.direction, Direction::Sell);
        assert_eq!(euro.strategy_name, "MACD_01_EUR");
        assert_eq!(euro.created_at, None);
    }

    #[test]
    fn broken_document_is_a_feed_error() {
        let err = parse_feed("{\"active\": [", Path::new("signals.json")).unwrap_err();
        assert!(matches!(err, FeedError::Parse { .. }));
    }

    #[tokio::test]
    async fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut feed = FileSignalFeed::new(dir.path().join("absent.json"));
        assert!(feed.next().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reads_file_feed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"active": [{{"id": "a", "symbol": "EURUSD", "strategy_id": "S", "direction": "BUY", "sl_price": 1.08}}]}}"#
        )
        .unwrap();
        let mut feed = FileSignalFeed::new(file.path());
        let signals = feed.next().await.unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].stop_loss, Some(1.08));
        assert_eq!(signals[0].take_profit, None);
    }

    #[tokio::test]
    async fn memory_feed_repeats_last_batch() {
        let mut feed = MemorySignalFeed::new();
        feed.push(Vec::new());
        assert!(feed.next().await.unwrap().is_empty());
        assert!(feed.next().await.unwrap().is_empty());
    }
}
