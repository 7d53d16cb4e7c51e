use crate::context::AppContext;
use crate::executor::ExecutionLoop;
use crate::feed::FileSignalFeed;
use anyhow::Result;
use chrono::Utc;
use log::info;

/// One monitoring pass against the broker, then save.
pub async fn run(app: &AppContext) -> Result<()> {
    let settings = app.settings().clone();
    let config = app.trading_config()?;
    let bridge = app.bridge()?;
    let state = app.persister().load().await?;
    if state.opened.is_empty() {
        info!("No live trades require reconciliation");
    }

    let feed = FileSignalFeed::new(settings.signal_feed_path.clone());
    let mut execution = ExecutionLoop::new(settings, config, bridge, feed, state);
    let now = Utc::now();
    let report = execution.run_monitor_cycle(now).await;
    execution.persist(now).await?;

    let reconciled = report.closed.len() + report.rejected.len() + report.adopted;
    info!(
        "Reconciled {} trade{} ({} skipped, {} untracked position{})",
        reconciled,
        if reconciled == 1 { "" } else { "s" },
        report.skipped,
        report.untracked.len(),
        if report.untracked.len() == 1 { "" } else { "s" }
    );
    Ok(())
}
