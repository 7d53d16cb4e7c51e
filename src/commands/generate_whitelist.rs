use crate::whitelist::{generate_from_ranking, Ranking, WhitelistCriteria};
use anyhow::{Context, Result};
use chrono::Utc;
use log::info;
use std::fs;
use std::path::Path;

pub fn run(ranking_path: &Path, output_path: &Path, criteria: &WhitelistCriteria) -> Result<()> {
    let raw = fs::read_to_string(ranking_path)
        .with_context(|| format!("Failed to read ranking {}", ranking_path.display()))?;
    let ranking: Ranking = serde_json::from_str(&raw)
        .with_context(|| format!("Ranking {} is not valid JSON", ranking_path.display()))?;

    let generated = generate_from_ranking(&ranking, criteria, Utc::now());
    if let Some(parent) = output_path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let payload = serde_json::to_string_pretty(&generated)?;
    fs::write(output_path, payload)
        .with_context(|| format!("Failed to write whitelist {}", output_path.display()))?;

    info!(
        "Approved {} of {} ranked strategies -> {}",
        generated.total_approved,
        generated.total_ranked,
        output_path.display()
    );
    for (rank, strategy) in generated.strategies.iter().take(10).enumerate() {
        info!(
            "  {:>2}. {} wr={:.1}% trades={} pf={:.2} pnl={:.1} score={:.2}",
            rank + 1,
            strategy.strategy_id,
            strategy.win_rate,
            strategy.total_trades,
            strategy.profit_factor,
            strategy.net_pnl,
            strategy.score
        );
    }
    Ok(())
}
