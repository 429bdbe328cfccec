//! Yield-farming agent keeper.
//!
//! Runs one automation loop per configured EVM chain. Each cycle reconciles
//! every agent against the indexer and the chain, then protects at-risk
//! borrows, keeps borrow targets funded and moves idle reserves to the best
//! ranked supply market.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use keeper_api::{IndexerClient, MarketClient, PriceClient};
use keeper_chain::{ChainClient, SimulatedWithdrawProbe, TransactionSenderBuilder};
use keeper_core::config::{load_env, ChainConfig, KeeperConfig, KeeperEnv};
use keeper_core::{ChainDriver, Collaborators, Scheduler};

const DEFAULT_LOG_FILTER: &str = "info,keeper_core=debug,keeper_chain=debug";

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    if let Err(e) = run().await {
        error!(error = %format!("{e:#}"), "Keeper stopped");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
    }
}

async fn run() -> Result<()> {
    let env = load_env()?;
    info!(env = ?env, "Environment loaded");

    let config = Arc::new(load_keeper_config(&env)?);
    config.log_config();

    let chains = ChainConfig::load_dir(&env.chains_dir)?;
    info!(count = chains.len(), dir = %env.chains_dir.display(), "Chain configs loaded");

    let services = &config.services;
    let ledger = Arc::new(IndexerClient::new(&services.indexer_url));
    let markets = Arc::new(MarketClient::with_base_url(&services.markets_url));
    let prices = Arc::new(PriceClient::new(&services.prices_url, services.price_ttl()));

    let mut drivers = Vec::with_capacity(chains.len());
    for chain in chains {
        let details = chain.chain;
        let client = match ChainClient::connect(&details.name, details.chain_id, &details.rpc.http).await {
            Ok(client) => client,
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                error!(chain = %details.name, error = %e, "Chain unreachable, not scheduling it");
                continue;
            }
        };

        // The key was validated with the environment, so a failure here is
        // the node refusing the nonce query.
        let sender = match TransactionSenderBuilder::new(client.clone())
            .pricing(details.gas.pricing)
            .max_gas_price_gwei(details.gas.max_gas_price_gwei)
            .fee_sampling(config.gas.min_gas_used, config.gas.buffer)
            .sampling(config.gas.sampling())
            .build(&env.private_key)
            .await
        {
            Ok(sender) => sender,
            Err(e) => {
                error!(chain = %details.name, error = %format!("{e:#}"), "Signer setup failed, not scheduling chain");
                continue;
            }
        };
        info!(
            chain = %details.name,
            account = %sender.address,
            nonce = sender.current_nonce(),
            gas_strategy = sender.gas_strategy_name(),
            "Signer ready"
        );

        if details.cancel_pending_on_start {
            match sender.cancel_pending().await {
                Ok(0) => info!(chain = %details.name, "No pending transactions"),
                Ok(count) => info!(chain = %details.name, count, "Pending transactions replaced"),
                Err(e) => warn!(chain = %details.name, error = %e, "Failed to cancel pending transactions"),
            }
        }

        let deps = Collaborators {
            reader: Arc::new(client.clone()),
            probe: Arc::new(SimulatedWithdrawProbe::new(client, sender.address)),
            executor: Arc::new(sender),
            ledger: ledger.clone(),
            ranking: markets.clone(),
            prices: prices.clone(),
        };
        drivers.push(Arc::new(ChainDriver::new(details, deps, config.clone())));
    }

    if drivers.is_empty() {
        bail!("no configured chain could be started");
    }

    Scheduler::new(drivers, config)
        .with_market_warmup(markets)
        .run()
        .await
}

fn load_keeper_config(env: &KeeperEnv) -> Result<KeeperConfig> {
    let mut config = match &env.config_path {
        Some(path) => KeeperConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => KeeperConfig::default(),
    };
    if let Some(ms) = env.interval_ms {
        config.scheduler.interval_ms = ms;
    }
    if config.scheduler.interval() < Duration::from_secs(1) {
        warn!(interval_ms = config.scheduler.interval_ms, "Very short cycle interval");
    }
    Ok(config)
}
