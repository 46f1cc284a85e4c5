//! CoinRace round engine
//!
//! Startup wiring: configuration, logging, the price feed pump and the
//! round scheduler, all shut down together on ctrl-c.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use coinrace::broadcast::Broadcaster;
use coinrace::chain::payout::PayoutDisburser;
use coinrace::chain::ChainVerifier;
use coinrace::config::AppConfig;
use coinrace::feed::PriceFeed;
use coinrace::game::RoundScheduler;
use coinrace::ledger::CsvLedger;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = AppConfig::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(config = %cfg.digest(), "Starting CoinRace round engine");
    cfg.validate_env()
        .context("Configuration validation failed")?;
    let private_key = std::env::var("PRIVATE_KEY").context("PRIVATE_KEY is not set")?;

    let broadcaster = Broadcaster::default();
    let ledger = Arc::new(CsvLedger::new(
        &cfg.persistence.data_dir,
        cfg.persistence.history_page_size,
    )?);
    let verifier = Arc::new(ChainVerifier::new(cfg.chain.clone())?);
    let payouts = Arc::new(PayoutDisburser::new(cfg.chain.clone(), &private_key)?);

    let (feed, pump) = PriceFeed::new(cfg.feed.clone(), broadcaster.clone());
    if let Err(e) = pump.warmup().await {
        warn!(error = %e, "Price warmup failed; waiting on the stream for the first price");
    }

    let scheduler = RoundScheduler::new(
        cfg.game.clone(),
        feed,
        ledger,
        verifier,
        payouts,
        broadcaster,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let feed_handle = tokio::spawn(pump.run(shutdown_rx.clone()));
    let scheduler_handle = tokio::spawn(async move { scheduler.run(shutdown_rx).await });

    wait_for_shutdown().await?;
    info!("Shutdown requested");
    let _ = shutdown_tx.send(true);

    match scheduler_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Round scheduler exited with an error"),
        Err(e) => error!(error = %e, "Round scheduler task panicked"),
    }
    match feed_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Price feed exited with an error"),
        Err(e) => error!(error = %e, "Price feed task panicked"),
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for ctrl-c or SIGTERM
async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
