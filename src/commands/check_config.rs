use crate::context::AppContext;
use anyhow::Result;
use log::{info, warn};

/// Loads every configuration file the executor needs; any error fails the command.
pub fn run(app: &AppContext) -> Result<()> {
    let settings = app.settings();
    let config = app.trading_config()?;

    info!("Settings from {} are valid", app.config_path().display());
    info!(
        "Bridge {} | entry poll {:?} | monitor poll {:?} | fill modes {}{}",
        settings.bridge_url,
        settings.entry_poll,
        settings.monitor_poll,
        settings.gateway.primary_fill_mode.as_str(),
        settings
            .gateway
            .fallback_fill_mode
            .map(|mode| format!(" -> {}", mode.as_str()))
            .unwrap_or_default()
    );
    for symbol in config.registry.iter() {
        let approved = config.whitelist.count_for_symbol(&symbol.symbol);
        if approved == 0 {
            warn!("{} has no approved strategies", symbol.symbol);
        }
        info!(
            "{} broker={} pip={} stop_level={} digits={} magic={} approved={}",
            symbol.symbol,
            symbol.broker_symbol,
            symbol.pip_size,
            symbol.stop_level,
            symbol.digits,
            symbol.magic,
            approved
        );
    }
    info!(
        "{} symbols, {} approved strategies",
        config.registry.len(),
        config.whitelist.enabled_count()
    );
    Ok(())
}
