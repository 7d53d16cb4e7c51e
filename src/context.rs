use crate::bridge::BridgeClient;
use crate::config::{load_settings_map, ExecutorSettings};
use crate::executor::TradingConfig;
use crate::journal::TradeJournal;
use crate::state::StatePersister;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Settings resolved once at startup and shared by every command.
#[derive(Clone)]
pub struct AppContext {
    config_path: PathBuf,
    settings: ExecutorSettings,
}

impl AppContext {
    pub fn initialize<P: Into<PathBuf>>(config_path: P) -> Result<Self> {
        let config_path = config_path.into();
        let settings_map = load_settings_map(&config_path)?;
        let settings = ExecutorSettings::from_settings_map(&settings_map)
            .with_context(|| format!("Invalid settings in {}", config_path.display()))?;
        Ok(Self {
            config_path,
            settings,
        })
    }

    pub fn from_settings<P: Into<PathBuf>>(config_path: P, settings: ExecutorSettings) -> Self {
        Self {
            config_path: config_path.into(),
            settings,
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    pub fn trading_config(&self) -> Result<TradingConfig> {
        TradingConfig::load(&self.settings).with_context(|| {
            format!(
                "Failed to load symbols and whitelists from {}",
                self.settings.symbols_path.display()
            )
        })
    }

    pub fn bridge(&self) -> Result<BridgeClient> {
        BridgeClient::new(
            &self.settings.bridge_url,
            self.settings.bridge_token.as_deref(),
            self.settings.gateway.broker_timeout,
        )
    }

    pub fn persister(&self) -> StatePersister {
        StatePersister::new(self.settings.state_path.clone())
    }

    pub fn journal(&self) -> TradeJournal {
        TradeJournal::new(self.settings.journal_path.clone())
    }
}
