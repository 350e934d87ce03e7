use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use withdraw_watch::config::{Config, LedgerBackendKind, LedgerConfig};
use withdraw_watch::notify::telegram::TelegramNotifier;
use withdraw_watch::onchain::adapter::ChainAdapter;
use withdraw_watch::onchain::rpc::RpcChainAdapter;
use withdraw_watch::onchain::PollOutcome;
use withdraw_watch::scheduler::Service;
use withdraw_watch::store::backend::{FileBackend, LedgerBackend, MemoryBackend, ValkeyBackend};

#[derive(Parser, Debug)]
#[command(name = "withdraw-watch", version, about = "Failed withdraw() monitor for EVM chains")]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, short, env = "WITHDRAW_WATCH_CONFIG", default_value = "withdraw-watch.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler until ctrl-c (default)
    Run,
    /// One monitoring pass over every chain
    Poll,
    /// One balance check over every chain
    Balances,
    /// Build and send the daily report now
    Report {
        /// UTC day to report on, defaults to yesterday
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Print ledger and alert state as JSON
    Status,
    /// Check RPC and notifier connectivity
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    // Initialize logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    info!("withdraw-watch v{} starting", env!("CARGO_PKG_VERSION"));

    let backend = open_backend(&config.ledger).await?;

    let mut adapters: Vec<Arc<dyn ChainAdapter>> = Vec::with_capacity(config.chains.len());
    for chain in &config.chains {
        let adapter = RpcChainAdapter::connect(&chain.name, &chain.rpc_url, config.monitoring.rpc_timeout())
            .with_context(|| format!("rpc for chain {}", chain.name))?;
        info!(
            chain = %chain.name,
            chain_id = chain.chain_id,
            contract = %chain.contract_address,
            tokens = chain.tokens.len(),
            "chain configured"
        );
        adapters.push(Arc::new(adapter));
    }

    let notifier = TelegramNotifier::new(&config.telegram)?;
    if !config.telegram.is_configured() {
        warn!("telegram not configured (set TELEGRAM_BOT_TOKEN and TELEGRAM_CHAT_ID), alerts are logged only");
    }

    let service = Arc::new(Service::new(config, adapters, backend, Arc::new(notifier))?);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => service.run().await?,
        Command::Poll => {
            service.load().await?;
            let mut failed = 0;
            for (chain, result) in service.poll_all().await {
                match result {
                    Ok(PollOutcome::Completed(report)) => print_json(&report)?,
                    Ok(PollOutcome::Skipped) => warn!(chain = %chain, "poll skipped"),
                    Err(e) => {
                        error!(chain = %chain, error = %e, "poll failed");
                        failed += 1;
                    }
                }
            }
            if failed > 0 {
                return Err(anyhow!("{failed} chain(s) failed to poll"));
            }
        }
        Command::Balances => {
            for (chain, report) in service.check_balances().await {
                info!(chain = %chain, checked = report.checked, below = report.below_threshold, "balance check done");
                print_json(&report)?;
            }
        }
        Command::Report { date } => {
            service.load().await?;
            let today = Utc::now().date_naive();
            let date = date.unwrap_or_else(|| today.pred_opt().unwrap_or(today));
            // fresh process: record balances so the report has a snapshot
            service.snapshot_balances().await;
            let report = service.build_report(date).await;
            print_json(&report)?;
            service.deliver_report(&report).await?;
        }
        Command::Status => {
            service.load().await?;
            print_json(&service.status().await)?;
        }
        Command::Check => {
            let check = service.check().await;
            print_json(&check)?;
            if !check.is_healthy() {
                return Err(anyhow!("connectivity check failed"));
            }
        }
    }

    Ok(())
}

async fn open_backend(config: &LedgerConfig) -> anyhow::Result<Arc<dyn LedgerBackend>> {
    let backend: Arc<dyn LedgerBackend> = match config.backend {
        LedgerBackendKind::File => Arc::new(FileBackend::new(&config.path)?),
        LedgerBackendKind::Valkey => {
            let store = ValkeyBackend::connect(&config.valkey_url, &config.key_prefix)
                .await
                .with_context(|| format!("connecting to Valkey at {}", config.valkey_url))?;
            store.ping().await?;
            Arc::new(store)
        }
        LedgerBackendKind::Memory => {
            warn!("memory ledger selected, state is lost on restart");
            Arc::new(MemoryBackend::new())
        }
    };
    info!(backend = %backend.describe(), "ledger backend ready");
    Ok(backend)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
