//! Ledger simulation binary
//!
//! Usage: `ledger-sim [DEPOSITS] [DEPOSIT_AMOUNT] [WITHDRAWAL_AMOUNT]`
//!
//! Deposits `DEPOSITS` times into one account, then withdraws once and prints
//! the outcome as JSON. When `LEDGER_METRICS_OUT` names a file, the final
//! metrics are written there in the Prometheus text format.

use anyhow::{Context, Result};
use reduction_core::{AccountId, Amount, Config};
use relay_bus::Ledger;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let deposits: usize = args
        .next()
        .unwrap_or_else(|| "4".to_string())
        .parse()
        .context("DEPOSITS must be a count")?;
    let deposit_amount: Amount = args
        .next()
        .unwrap_or_else(|| "100.00".to_string())
        .parse()
        .context("DEPOSIT_AMOUNT must be a two-decimal amount")?;
    let withdrawal_amount: Amount = args
        .next()
        .unwrap_or_else(|| "260.00".to_string())
        .parse()
        .context("WITHDRAWAL_AMOUNT must be a two-decimal amount")?;

    let mut config = Config::from_env().context("invalid environment configuration")?;
    if std::env::var("LEDGER_STORAGE_BACKEND").is_err() {
        config.storage.backend = reduction_core::config::StorageBackend::Memory;
    }

    tracing::info!(deposits, %deposit_amount, %withdrawal_amount, "Starting ledger simulation");
    let ledger = Ledger::open(&config)?;
    let account = AccountId::new("sim");

    for i in 0..deposits {
        ledger
            .deposit(&account, &format!("dep{}", i), deposit_amount)
            .await?;
    }
    ledger.wait_idle_for(Duration::from_secs(30)).await?;

    let root = ledger.withdraw(&account, "wd0", withdrawal_amount).await?;
    let status = ledger.await_withdrawal(&root, Duration::from_secs(30)).await?;
    ledger.wait_idle_for(Duration::from_secs(30)).await?;

    let report = serde_json::json!({
        "account": account,
        "withdrawal": root.root(),
        "status": status,
        "balance": ledger.balance(&account).await?,
        "available": ledger.available(&account),
        "actors": ledger.runtime().actor_count(),
        "dead_letters": ledger.dead_letter_queue().stats(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Ok(path) = std::env::var("LEDGER_METRICS_OUT") {
        std::fs::write(&path, ledger.export_metrics()?)
            .with_context(|| format!("writing metrics to {}", path))?;
        tracing::info!(path, "Metrics written");
    }

    ledger.shutdown().await;
    Ok(())
}
