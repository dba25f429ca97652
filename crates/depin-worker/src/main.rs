//! depin-worker: answers checker health probes, collects their signed
//! uptime proofs and submits one aggregate per period to the ledger.

mod aggregator;
mod api;
mod config;
mod store;
mod submit;
mod system;

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use depin_ledger::accounts::WorkerMetadata;
use depin_ledger::{
    BmbStateReader, DasClient, LedgerClient, LicenseDirectory, NodeIdentity, ProgramAddresses,
    SolanaLedger,
};
use depin_protocol::{EpochClock, BMB_CACHE_CAPACITY, BMB_CACHE_TTL};
use solana_sdk::pubkey::Pubkey;
use tokio_util::sync::CancellationToken;

use aggregator::ProofAggregator;
use api::AppState;
use config::Config;
use store::{FsProofStore, MemoryProofStore, ProofStore};
use submit::{ProofSubmitter, SubmitSettings};
use system::SystemProbe;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "depin_worker=info".parse().unwrap()),
        )
        .init();

    let config = Config::parse();

    let program_id = Pubkey::from_str(&config.program_id).context("invalid --program-id")?;
    let license = Pubkey::from_str(&config.worker_license).context("invalid --worker-license")?;
    let identity = Arc::new(NodeIdentity::load(&config.keypair).context("loading worker keypair")?);
    let worker = identity.address();
    let addresses = ProgramAddresses::new(program_id);
    tracing::info!(%worker, %license, rpc = %config.rpc_url, "depin-worker starting");

    let ledger: Arc<dyn LedgerClient> =
        Arc::new(SolanaLedger::new(&config.rpc_url, identity.clone(), program_id));
    let licenses: Arc<dyn LicenseDirectory> = Arc::new(DasClient::new(config.das_url()));

    check_registration(ledger.as_ref(), &addresses, &license, &worker, &config.public_url).await;

    let store: Arc<dyn ProofStore> = match config.proof_dir {
        Some(ref dir) => {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating proof directory {}", dir.display()))?;
            tracing::info!(dir = %dir.display(), "Storing proofs on disk");
            Arc::new(FsProofStore::new(dir))
        }
        None => {
            tracing::warn!(
                "No --proof-dir set. Checker proofs are in-memory only and \
                 will be lost on restart. Set DEPIN_PROOF_DIR in production."
            );
            Arc::new(MemoryProofStore::new())
        }
    };

    let clock = EpochClock::default();
    let bmb = Arc::new(BmbStateReader::new(
        ledger.clone(),
        addresses.bmb_state(),
        BMB_CACHE_CAPACITY,
        BMB_CACHE_TTL,
    ));
    let discovery = config.discovery_document(&worker.to_string(), &license.to_string());

    let state = AppState {
        identity: identity.clone(),
        license,
        clock,
        ledger: ledger.clone(),
        licenses: licenses.clone(),
        bmb: bmb.clone(),
        addresses,
        store: store.clone(),
        discovery: Arc::new(discovery),
        system: Arc::new(SystemProbe::new()),
    };

    let submitter = ProofSubmitter::new(
        clock,
        ledger,
        licenses,
        addresses,
        ProofAggregator::new(store, bmb, license),
        identity,
        license,
        SubmitSettings::default(),
    );

    let shutdown = CancellationToken::new();
    let submit_task = {
        let shutdown = shutdown.clone();
        let skip_startup = config.skip_startup_submit;
        tokio::spawn(async move { submitter.run(skip_startup, &shutdown).await })
    };

    tracing::info!("depin-worker listening on {}", config.listen);
    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    let on_signal = shutdown.clone();
    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown requested");
            }
            on_signal.cancel();
        })
        .await?;

    shutdown.cancel();
    submit_task.await.context("proof submitter panicked")?;
    Ok(())
}

/// Warn about registration problems that would keep checkers away. The
/// worker still serves: registration is managed outside this process.
async fn check_registration(
    ledger: &dyn LedgerClient,
    addresses: &ProgramAddresses,
    license: &Pubkey,
    worker: &Pubkey,
    public_url: &str,
) {
    let address = addresses.worker_metadata(license, worker);
    let metadata = match ledger.read_account(&address).await {
        Ok(Some(data)) => WorkerMetadata::decode(&data),
        Ok(None) => {
            tracing::warn!(%license, %worker, "Worker license is not activated for this worker");
            return;
        }
        Err(e) => {
            tracing::warn!("Could not read worker registration: {e}");
            return;
        }
    };
    match metadata {
        Ok(meta) if meta.delegated_to != *worker => {
            tracing::warn!(delegated_to = %meta.delegated_to, "Worker license is delegated elsewhere");
        }
        Ok(meta) if meta.is_suspended() => {
            tracing::warn!("Worker is suspended");
        }
        Ok(meta) if meta.discovery_uri != public_url => {
            tracing::warn!(
                registered = %meta.discovery_uri,
                public_url,
                "Registered discovery URI differs from --public-url"
            );
        }
        Ok(_) => tracing::info!("Worker registration OK"),
        Err(e) => tracing::warn!("Could not decode worker registration: {e}"),
    }
}
