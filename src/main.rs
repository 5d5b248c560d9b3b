use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tradeguard::audit::PerformanceAuditor;
use tradeguard::execution::{ResilientGateway, SimulatedGateway};
use tradeguard::{events, EngineConfig, ReportBundle, TradingEngine};

#[derive(Parser, Debug)]
#[command(name = "tradeguard", about = "Replay analyzer report bundles through the risk-managed execution core")]
struct Cli {
    /// TOML configuration layered over the built-in defaults
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// One report bundle JSON object per line
    #[arg(short, long)]
    ticks: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_logging();

    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref()).context("invalid configuration")?;

    tracing::info!("🚀 TradeGuard replay starting for {}", config.symbol);

    let gateway = Arc::new(ResilientGateway::new(SimulatedGateway::new(), &config.gateway));
    let (sender, receiver) = events::channel();
    let auditor = tokio::spawn(PerformanceAuditor::new(config.initial_capital).run(receiver));

    let mut engine = TradingEngine::new(&config, gateway).with_events(sender);

    let file = File::open(&cli.ticks)
        .with_context(|| format!("cannot open tick file {}", cli.ticks.display()))?;

    let mut ticks = 0usize;
    let mut skipped = 0usize;
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line.context("failed to read tick file")?;
        if line.trim().is_empty() {
            continue;
        }
        let bundle: ReportBundle = match serde_json::from_str(&line) {
            Ok(bundle) => bundle,
            Err(e) => {
                tracing::warn!("Skipping line {}: {}", line_no + 1, e);
                skipped += 1;
                continue;
            }
        };

        let outcome = engine.on_tick(&bundle).await;
        tracing::debug!("Tick {} @ {}: {:?}", ticks + 1, bundle.timestamp, outcome);
        ticks += 1;
    }

    tracing::info!("✅ Replayed {} ticks ({} skipped)", ticks, skipped);

    let ledger = engine.ledger();
    let capital = ledger.capital();
    tracing::info!(
        "Capital: ${:.2} (initial ${:.2}), allocated ${:.2}, {} open position(s), {} closed",
        capital.current_capital(),
        capital.initial_capital(),
        capital.total_allocated_cost(),
        ledger.active_positions().count(),
        ledger.closed_positions().len()
    );
    for position in ledger.active_positions() {
        tracing::info!(
            "  Open {} {:?} {:.6} @ {:.4}, unrealized ${:.2} ({:+.2}%)",
            position.id,
            position.side,
            position.size,
            position.entry_price,
            position.unrealized_pnl,
            position.unrealized_pnl_pct
        );
    }

    // closing the event channel lets the auditor finish
    drop(engine);
    let auditor = auditor.await.context("audit task failed")?;
    auditor.summary().log_report();

    Ok(())
}

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tradeguard=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
