use crate::context::AppContext;
use crate::executor::ExecutionLoop;
use crate::feed::FileSignalFeed;
use anyhow::Result;
use log::{info, warn};

pub async fn run(app: &AppContext) -> Result<()> {
    let settings = app.settings().clone();
    let config = app.trading_config()?;
    let bridge = app.bridge()?;
    let state = app.persister().load().await?;

    info!(
        "Bridge {} | feed {} | state {} | max open {} | daily loss limit {}%",
        bridge.base_url(),
        settings.signal_feed_path.display(),
        settings.state_path.display(),
        settings.risk.max_open_positions,
        settings.risk.daily_loss_limit_pct
    );
    for symbol in config.registry.iter() {
        info!(
            "  {} -> {} magic={} min_stop={} strategies={}",
            symbol.symbol,
            symbol.broker_symbol,
            symbol.magic,
            symbol.min_stop_distance(),
            config.whitelist.count_for_symbol(&symbol.symbol)
        );
    }

    let feed = FileSignalFeed::new(settings.signal_feed_path.clone());
    let mut execution = ExecutionLoop::new(settings, config, bridge, feed, state);
    execution.run(shutdown_signal()).await
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(err) = result {
                            warn!("Ctrl-C handler failed: {}", err);
                        }
                    }
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(err) => warn!("SIGTERM handler unavailable: {}", err),
        }
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("Ctrl-C handler failed: {}; running until killed", err);
        std::future::pending::<()>().await;
    }
}
