use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use depin_protocol::{DEPIN_PROGRAM_ID, SESSION_MAX_EARLY_STOP, SESSION_MIN_EARLY_STOP};

use crate::orchestrator::OrchestratorSettings;
use crate::session::SessionTiming;

// ============================================================================
// CLI
// ============================================================================

#[derive(Parser, Debug)]
#[command(
    name = "depin-checker",
    about = "Checker node: probes assigned workers each period and submits signed uptime proofs"
)]
pub struct Config {
    /// Solana RPC URL used for account reads.
    #[arg(long, env = "DEPIN_RPC_URL")]
    pub rpc_url: String,

    /// DAS-capable RPC URL for license lookups. Defaults to --rpc-url.
    #[arg(long, env = "DEPIN_DAS_URL")]
    pub das_url: Option<String>,

    /// Path to the checker's Solana keypair file.
    #[arg(long, env = "DEPIN_KEYPAIR")]
    pub keypair: PathBuf,

    /// Checker license (compressed NFT asset id), base58.
    #[arg(long, env = "DEPIN_CHECKER_LICENSE")]
    pub checker_license: String,

    /// DePIN program id.
    #[arg(long, default_value = DEPIN_PROGRAM_ID, env = "DEPIN_PROGRAM_ID")]
    pub program_id: String,

    /// Max in-flight HTTP calls across discovery and all sessions.
    #[arg(long, default_value_t = 10, env = "DEPIN_MAX_CONCURRENCY")]
    pub max_concurrency: usize,

    /// Timeout for each discovery fetch, probe and proof submission.
    #[arg(long, default_value_t = 10, env = "DEPIN_HTTP_TIMEOUT_SECS")]
    pub http_timeout_secs: u64,

    /// Lower bound of the jittered interval between probes.
    #[arg(long, default_value_t = 600, env = "DEPIN_MIN_INTERVAL_SECS")]
    pub min_interval_secs: u64,

    /// Upper bound of the jittered interval between probes.
    #[arg(long, default_value_t = 1800, env = "DEPIN_MAX_INTERVAL_SECS")]
    pub max_interval_secs: u64,

    /// Delay before retrying workers whose discovery failed.
    #[arg(long, default_value_t = 1800, env = "DEPIN_DISCOVERY_RETRY_SECS")]
    pub discovery_retry_secs: u64,
}

impl Config {
    pub fn das_url(&self) -> &str {
        self.das_url.as_deref().unwrap_or(&self.rpc_url)
    }

    pub fn orchestrator_settings(&self) -> anyhow::Result<OrchestratorSettings> {
        if self.min_interval_secs > self.max_interval_secs {
            anyhow::bail!(
                "--min-interval-secs ({}) exceeds --max-interval-secs ({})",
                self.min_interval_secs,
                self.max_interval_secs
            );
        }
        Ok(OrchestratorSettings {
            session: SessionTiming {
                min_interval: Duration::from_secs(self.min_interval_secs),
                max_interval: Duration::from_secs(self.max_interval_secs),
                min_early_stop: SESSION_MIN_EARLY_STOP,
                max_early_stop: SESSION_MAX_EARLY_STOP,
                http_timeout: Duration::from_secs(self.http_timeout_secs),
            },
            max_concurrency: self.max_concurrency.max(1),
            discovery_retry: Duration::from_secs(self.discovery_retry_secs),
            ..OrchestratorSettings::default()
        })
    }
}
