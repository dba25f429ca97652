//! depin-checker: probes the workers BRAND assigns to this checker each
//! period and delivers signed uptime proofs to them.

mod config;
mod discovery;
mod http;
mod orchestrator;
mod session;

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use depin_ledger::{
    check_checker_license, BmbStateReader, DasClient, LedgerClient, LicenseDirectory,
    NodeIdentity, ProgramAddresses, SolanaLedger,
};
use depin_protocol::{EpochClock, BMB_CACHE_CAPACITY, BMB_CACHE_TTL};
use solana_sdk::pubkey::Pubkey;
use tokio_util::sync::CancellationToken;

use config::Config;
use http::{Limited, NetworkClient, PooledHttp};
use orchestrator::{NetworkFactory, Orchestrator};
use session::CheckerCredentials;

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "depin_checker=info".parse().unwrap()),
        )
        .init();

    let config = Config::parse();
    let settings = config.orchestrator_settings()?;

    let program_id = Pubkey::from_str(&config.program_id).context("invalid --program-id")?;
    let license = Pubkey::from_str(&config.checker_license).context("invalid --checker-license")?;
    let identity = Arc::new(NodeIdentity::load(&config.keypair).context("loading checker keypair")?);
    let checker = identity.address();
    let addresses = ProgramAddresses::new(program_id);

    tracing::info!(%checker, %license, rpc = %config.rpc_url, "depin-checker starting");

    let ledger: Arc<dyn LedgerClient> =
        Arc::new(SolanaLedger::new(&config.rpc_url, identity.clone(), program_id));
    let das: Arc<dyn LicenseDirectory> = Arc::new(DasClient::new(config.das_url()));

    // The license must resolve and be activated for, and delegated to, this
    // checker before any period work starts.
    let license_index = das
        .license_index(&license)
        .await
        .with_context(|| format!("fetching checker license {license}"))?;
    tracing::info!(license_index, "Checker license");
    check_checker_license(ledger.as_ref(), &addresses, &license, &checker)
        .await
        .with_context(|| format!("checker license {license} is not usable by {checker}"))?;

    let max_concurrency = settings.max_concurrency;
    let network: NetworkFactory = Box::new(move || {
        let pooled = PooledHttp::new().context("building HTTP client")?;
        Ok(Arc::new(Limited::new(pooled, max_concurrency)) as Arc<dyn NetworkClient>)
    });

    let orchestrator = Orchestrator::new(
        EpochClock::default(),
        ledger.clone(),
        das,
        BmbStateReader::new(ledger, addresses.bmb_state(), BMB_CACHE_CAPACITY, BMB_CACHE_TTL),
        addresses,
        CheckerCredentials { identity, license },
        network,
        settings,
    );

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            on_signal.cancel();
        }
    });

    orchestrator.run(&shutdown).await;
    Ok(())
}
