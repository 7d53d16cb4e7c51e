use crate::context::AppContext;
use crate::journal::JournalSummary;
use anyhow::Result;
use chrono::Utc;
use log::info;
use std::collections::BTreeMap;

pub async fn run(app: &AppContext) -> Result<()> {
    let persister = app.persister();
    let state = persister.load().await?;
    let now = Utc::now();

    info!(
        "State {} saved {}",
        persister.path().display(),
        state
            .saved_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    );
    info!(
        "Totals: opened={} closed={} failed={} cycles={} seen={}",
        state.stats.total_opened,
        state.stats.total_closed,
        state.stats.orders_failed,
        state.stats.cycles,
        state.seen.len()
    );

    let mut per_symbol: BTreeMap<&str, usize> = BTreeMap::new();
    for trade in state.opened.values().filter(|trade| trade.is_live()) {
        *per_symbol.entry(trade.symbol.as_str()).or_insert(0) += 1;
    }
    info!(
        "Live trades: {} {:?}",
        per_symbol.values().sum::<usize>(),
        per_symbol
    );
    for trade in state.opened.values() {
        info!(
            "  {} {} {} {} ticket={:?} entry={} sl={:?} tp={:?} state={}{}",
            trade.trade_id,
            trade.strategy_id,
            trade.symbol,
            trade.direction,
            trade.ticket,
            trade.entry_price,
            trade.stop_loss,
            trade.take_profit,
            trade.state.as_str(),
            if trade.needs_review { " NEEDS REVIEW" } else { "" }
        );
    }

    let cooldown = app.settings().risk.loss_cooldown;
    for (strategy_id, started) in &state.risk.cooldowns {
        let until = *started + cooldown;
        if until > now {
            info!("Cooldown {} until {}", strategy_id, until.to_rfc3339());
        }
    }
    info!(
        "Daily loss {:.2} since {} (start balance {})",
        state.risk.daily_loss_usd,
        state
            .risk
            .daily_loss_reset_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "-".to_string()),
        state
            .risk
            .balance_start
            .map(|balance| format!("{:.2}", balance))
            .unwrap_or_else(|| "unknown".to_string())
    );

    let records = app.journal().read_all().await?;
    let summary = JournalSummary::from_records(&records);
    info!(
        "Journal: closed={} (win {} / loss {} / unknown {}) rejected={} net pnl {:.2}",
        summary.closed,
        summary.wins,
        summary.losses,
        summary.unknown,
        summary.rejected,
        summary.net_pnl
    );
    Ok(())
}
