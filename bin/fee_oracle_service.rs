//! Fee Oracle Service
//!
//! Runs the reconciliation control loop against live L1/L2 endpoints:
//!
//! - Resolves contract addresses from `Lib_AddressManager` on startup
//! - Loads ledger history from `state.data_dir`
//! - Ticks every `oracle.polling_interval_seconds` until Ctrl+C
//!
//! ```text
//! fee_oracle_service --config Config.toml
//! fee_oracle_service --config Config.toml --once
//! ```
//!
//! The oracle owner key is read from the env var named by `signer.private_key_env`.

use anyhow::{bail, Context, Result};
use clap::Parser;
use ethers::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

use fee_oracle::address_registry::{resolve_all, EthersAddressRegistry};
use fee_oracle::chain_reader::{EthersBatchLogs, EthersChainReader};
use fee_oracle::ledger_state::FileSnapshotStore;
use fee_oracle::metrics;
use fee_oracle::oracle_contract::EthersFeeOracle;
use fee_oracle::parameter_controller::{ControllerSettings, ParameterController};
use fee_oracle::price_feeds::{AggregatorFeed, LastPriceSource, PriceFeedReader, PriceSource};
use fee_oracle::reconciliation::ReconciliationEngine;
use fee_oracle::rpc::http_provider;
use fee_oracle::scheduler::{ControlLoop, MonitoredAccounts, Service};
use fee_oracle::settings::{parse_address, FeedKind, FeedSettings, Settings};
use fee_oracle::shutdown;

#[derive(Parser, Debug)]
#[command(name = "fee_oracle_service", about = "Keeps L2 fee parameters aligned with L1 costs")]
struct Args {
    /// Path to the TOML configuration
    #[arg(long, default_value = "Config.toml")]
    config: String,

    /// Run a single tick and exit
    #[arg(long)]
    once: bool,
}

fn init_logging() {
    #[cfg(feature = "observability")]
    {
        tracing_subscriber::fmt()
            .json()
            .with_max_level(tracing::Level::INFO)
            .init();
    }
    #[cfg(not(feature = "observability"))]
    {
        env_logger::init();
    }
}

#[cfg(feature = "observability")]
fn init_metrics(settings: &Settings) -> Result<()> {
    metrics::describe_metrics();
    if let Some(addr) = &settings.metrics.listen_addr {
        let addr: std::net::SocketAddr = addr.parse().with_context(|| format!("metrics.listen_addr `{addr}`"))?;
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install Prometheus exporter")?;
        log::info!("Prometheus exporter listening on {}", addr);
    }
    Ok(())
}

#[cfg(not(feature = "observability"))]
fn init_metrics(_settings: &Settings) -> Result<()> {
    metrics::describe_metrics();
    Ok(())
}

fn build_price_source(
    name: &str,
    feed: &FeedSettings,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<Box<dyn PriceSource>> {
    let provider = Arc::new(http_provider(&feed.rpc_url, poll_interval)?);
    let address = parse_address(name, &feed.address)?;
    Ok(match feed.kind {
        FeedKind::Aggregator => Box::new(AggregatorFeed::new(address, provider, timeout)),
        FeedKind::LastPrice => {
            let decimals = feed
                .decimals
                .with_context(|| format!("{name}: last_price feeds need `decimals`"))?;
            Box::new(LastPriceSource::new(address, provider, decimals, timeout))
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();
    init_logging();

    let args = Args::parse();
    log::info!("Starting fee oracle service (config: {})", args.config);

    // 1. Settings
    let settings = Settings::from_path(&args.config).with_context(|| format!("loading {}", args.config))?;
    init_metrics(&settings)?;
    let timeout = settings.rpc.request_timeout();
    let poll_interval = settings.rpc.poll_interval();

    // 2. Providers
    let l1 = Arc::new(http_provider(&settings.rpc.l1_http_url, poll_interval)?);
    let l2 = Arc::new(http_provider(&settings.rpc.l2_http_url, poll_interval)?);

    // 3. Signer (L2 owner of the gas price oracles)
    let key = std::env::var(&settings.signer.private_key_env)
        .with_context(|| format!("missing signer key in ${}", settings.signer.private_key_env))?;
    let chain_id = l2.get_chainid().await.context("eth_chainId on L2")?;
    let wallet: LocalWallet = key.trim().parse::<LocalWallet>()?.with_chain_id(chain_id.as_u64());
    log::info!("Oracle owner {:?} on chain {}", wallet.address(), chain_id);
    let signer = Arc::new(SignerMiddleware::new((*l2).clone(), wallet));

    // 4. Registry lookups
    let address_manager = parse_address("contracts.address_manager", &settings.contracts.address_manager)?;
    let registry = EthersAddressRegistry::new(address_manager, Arc::clone(&l1), timeout);
    let resolved = resolve_all(&registry, &settings.contracts.registry)
        .await
        .context("resolving contract addresses")?;

    let accounts = MonitoredAccounts {
        sequencer: parse_address("accounts.sequencer", &settings.accounts.sequencer)?,
        proposer: parse_address("accounts.proposer", &settings.accounts.proposer)?,
        relayer: parse_address("accounts.relayer", &settings.accounts.relayer)?,
        fast_relayer: parse_address("accounts.fast_relayer", &settings.accounts.fast_relayer)?,
        sequencer_fee_vault: parse_address("contracts.sequencer_fee_vault", &settings.contracts.sequencer_fee_vault)?,
        secondary_fee_token: resolved.secondary_fee_token,
        secondary_fee_token_vault: resolved.fee_token_gas_price_oracle,
        billing_contract: resolved.billing_contract,
    };

    // 5. Components
    let (shutdown_handle, shutdown_signal) = shutdown::channel();
    let l1_reader = Arc::new(EthersChainReader::new("l1", Arc::clone(&l1), timeout));
    let l2_reader = Arc::new(EthersChainReader::new("l2", Arc::clone(&l2), timeout));
    let batch_logs = Arc::new(EthersBatchLogs::new(
        Arc::clone(&l1),
        resolved.canonical_transaction_chain,
        resolved.state_commitment_chain,
        timeout,
    ));
    let gas_price_oracle = parse_address("contracts.gas_price_oracle", &settings.contracts.gas_price_oracle)?;
    let fee_oracle = Arc::new(
        EthersFeeOracle::new(
            signer,
            gas_price_oracle,
            resolved.fee_token_gas_price_oracle,
            timeout,
            poll_interval,
        )
        .with_gas_price(settings.oracle.update_gas_price_wei.map(U256::from)),
    );

    let prices = PriceFeedReader::new(
        build_price_source("price_feeds.native", &settings.price_feeds.native, timeout, poll_interval)?,
        build_price_source("price_feeds.secondary", &settings.price_feeds.secondary, timeout, poll_interval)?,
    );
    let engine = ReconciliationEngine::new(Arc::new(FileSnapshotStore::new(settings.state.data_dir())));
    let controller = ParameterController::new(
        fee_oracle,
        l1_reader.clone(),
        batch_logs,
        ControllerSettings::from(&settings.oracle),
        shutdown_signal.clone(),
    );

    let mut service = ControlLoop::new(
        prices,
        l1_reader,
        l2_reader,
        engine,
        controller,
        accounts,
        settings.oracle.polling_interval(),
        shutdown_signal,
    );
    service.init().await.context("initializing control loop")?;

    // 6. Run
    if args.once {
        let report = service.tick().await;
        service.shutdown().await?;
        let failed = report.failed_steps();
        if !failed.is_empty() {
            bail!(
                "tick failed steps: {}",
                failed.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
            );
        }
        return Ok(());
    }

    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            log::info!("Shutdown signal received, finishing current tick...");
        }
        shutdown_handle.request();
    });

    service.run().await?;
    service.shutdown().await?;
    log::info!("Shutdown complete");
    Ok(())
}
