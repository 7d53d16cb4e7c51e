#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use executor::config::ExecutorSettings;
use executor::executor::{ExecutionLoop, TradingConfig};
use executor::feed::MemorySignalFeed;
use executor::models::{Direction, Signal};
use executor::paper::PaperBroker;
use executor::state::ExecutorState;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Once;
use tempfile::TempDir;

pub const XAU_MAGIC: u64 = 202602;
pub const EUR_MAGIC: u64 = 202605;

pub fn ensure_test_env() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Temporary config directory with a two-symbol table and one whitelist per symbol.
pub struct TestWorkspace {
    pub dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        let workspace = Self {
            dir: tempfile::tempdir().expect("failed to create temp dir"),
        };
        workspace.write_symbols();
        workspace.write_whitelist("xauusd.json", &["ADX_06_XAU", "RSI_02_XAU", "MACD_03_XAU"]);
        workspace.write_whitelist("eurusd.json", &["MACD_01_EUR"]);
        workspace
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn state_path(&self) -> PathBuf {
        self.path().join("state").join("executor_state.json")
    }

    pub fn journal_path(&self) -> PathBuf {
        self.path().join("state").join("journal.jsonl")
    }

    pub fn symbols_path(&self) -> PathBuf {
        self.path().join("symbols.json")
    }

    pub fn write_symbols(&self) {
        let table = serde_json::json!({
            "symbols": {
                "XAUUSD": {
                    "broker": "XAUUSD+",
                    "pip_size": 0.1,
                    "stop_level": 20,
                    "digits": 2,
                    "magic": XAU_MAGIC,
                    "whitelist": "whitelists/xauusd.json"
                },
                "EURUSD": {
                    "broker": "EURUSD+",
                    "pip_size": 0.0001,
                    "stop_level": 20,
                    "digits": 5,
                    "magic": EUR_MAGIC,
                    "whitelist": "whitelists/eurusd.json"
                }
            }
        });
        fs::write(self.symbols_path(), table.to_string()).expect("failed to write symbols");
    }

    pub fn write_whitelist(&self, file_name: &str, strategies: &[&str]) {
        let dir = self.path().join("whitelists");
        fs::create_dir_all(&dir).expect("failed to create whitelist dir");
        let body = serde_json::json!({ "strategies": strategies });
        fs::write(dir.join(file_name), body.to_string()).expect("failed to write whitelist");
    }

    pub fn settings_map(&self) -> HashMap<String, String> {
        let mut settings = HashMap::new();
        let path = |value: PathBuf| value.to_string_lossy().into_owned();
        settings.insert(
            "SIGNAL_FEED_PATH".to_string(),
            path(self.path().join("signals.json")),
        );
        settings.insert("SYMBOLS_PATH".to_string(), path(self.symbols_path()));
        settings.insert("STATE_PATH".to_string(), path(self.state_path()));
        settings.insert("JOURNAL_PATH".to_string(), path(self.journal_path()));
        settings.insert("BRIDGE_URL".to_string(), "http://127.0.0.1:9".to_string());
        settings.insert("ENTRY_POLL_SECS".to_string(), "0.05".to_string());
        settings.insert("MONITOR_POLL_SECS".to_string(), "0.05".to_string());
        settings.insert("PERSIST_INTERVAL_SECS".to_string(), "0".to_string());
        settings.insert("STATUS_EVERY_CYCLES".to_string(), "0".to_string());
        settings.insert("MAX_OPEN_POSITIONS".to_string(), "3".to_string());
        settings.insert("DEFAULT_LOT".to_string(), "0.02".to_string());
        settings.insert("DAILY_LOSS_LIMIT_PCT".to_string(), "5".to_string());
        settings.insert("LOSS_COOLDOWN_MINUTES".to_string(), "240".to_string());
        settings.insert("PENDING_GRACE_SECS".to_string(), "60".to_string());
        settings
    }

    pub fn settings(&self) -> ExecutorSettings {
        ExecutorSettings::from_settings_map(&self.settings_map()).expect("invalid test settings")
    }
}

/// Paper terminal with a balance of 1000 and quotes for both symbols.
pub fn paper_broker() -> PaperBroker {
    let broker = PaperBroker::new();
    broker.set_balance(Ok(1_000.0));
    broker.set_quote("XAUUSD+", 1999.80, 2000.00);
    broker.set_quote("EURUSD+", 1.08480, 1.08500);
    broker
}

pub fn execution_loop(
    workspace: &TestWorkspace,
    broker: PaperBroker,
    feed: MemorySignalFeed,
    state: ExecutorState,
) -> ExecutionLoop<PaperBroker, MemorySignalFeed> {
    let settings = workspace.settings();
    let config = TradingConfig::load(&settings).expect("failed to load trading config");
    ExecutionLoop::new(settings, config, broker, feed, state)
}

pub fn gold_signal(id: &str, strategy_id: &str) -> Signal {
    Signal {
        id: id.to_string(),
        strategy_id: strategy_id.to_string(),
        strategy_name: strategy_id.to_string(),
        symbol: "XAUUSD".to_string(),
        direction: Direction::Buy,
        entry_price: Some(2000.0),
        stop_loss: Some(1990.0),
        take_profit: Some(2020.0),
        created_at: None,
    }
}

pub fn euro_signal(id: &str, strategy_id: &str) -> Signal {
    Signal {
        id: id.to_string(),
        strategy_id: strategy_id.to_string(),
        strategy_name: strategy_id.to_string(),
        symbol: "EURUSD".to_string(),
        direction: Direction::Sell,
        entry_price: Some(1.0848),
        stop_loss: Some(1.0880),
        take_profit: Some(1.0800),
        created_at: None,
    }
}

pub fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, hour, minute, 0).unwrap()
}
