use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use depin_protocol::payload::{DiscoveryDocument, DiscoveryEndpoints, DiscoveryWorker, ProofEndpoints};
use depin_protocol::DEPIN_PROGRAM_ID;

pub const DISCOVERY_VERSION: &str = "1.0.0";

#[derive(Parser, Debug)]
#[command(
    name = "depin-worker",
    about = "Worker node: answers checker probes, stores their proofs and submits the period aggregate"
)]
pub struct Config {
    /// Solana RPC URL used for account reads and proof submission.
    #[arg(long, env = "DEPIN_RPC_URL")]
    pub rpc_url: String,

    /// DAS-capable RPC URL for license lookups. Defaults to --rpc-url.
    #[arg(long, env = "DEPIN_DAS_URL")]
    pub das_url: Option<String>,

    /// Path to the worker's Solana keypair file.
    #[arg(long, env = "DEPIN_KEYPAIR")]
    pub keypair: PathBuf,

    /// Worker license (compressed NFT asset id), base58.
    #[arg(long, env = "DEPIN_WORKER_LICENSE")]
    pub worker_license: String,

    /// DePIN program id.
    #[arg(long, default_value = DEPIN_PROGRAM_ID, env = "DEPIN_PROGRAM_ID")]
    pub program_id: String,

    /// HTTP listen address.
    #[arg(long, default_value = "0.0.0.0:8080", env = "DEPIN_LISTEN")]
    pub listen: SocketAddr,

    /// Externally reachable base URL. Must match the discovery URI
    /// registered for this worker.
    #[arg(long, env = "DEPIN_PUBLIC_URL")]
    pub public_url: String,

    /// Directory for raw checker proofs.
    /// If absent, proofs are kept in memory and lost on restart.
    #[arg(long, env = "DEPIN_PROOF_DIR")]
    pub proof_dir: Option<PathBuf>,

    /// Region advertised in the discovery document.
    #[arg(long, env = "DEPIN_REGION")]
    pub region: Option<String>,

    /// Capabilities advertised in the discovery document.
    #[arg(long, value_delimiter = ',', env = "DEPIN_CAPABILITIES")]
    pub capabilities: Vec<String>,

    /// Don't submit the previous period's aggregate at startup.
    #[arg(long, env = "DEPIN_SKIP_STARTUP_SUBMIT")]
    pub skip_startup_submit: bool,
}

impl Config {
    pub fn das_url(&self) -> &str {
        self.das_url.as_deref().unwrap_or(&self.rpc_url)
    }

    pub fn discovery_document(&self, address: &str, license: &str) -> DiscoveryDocument {
        let base = self.public_url.trim_end_matches('/');
        DiscoveryDocument {
            version: DISCOVERY_VERSION.to_string(),
            worker: DiscoveryWorker {
                address: address.to_string(),
                license: license.to_string(),
                discovery_uri: self.public_url.clone(),
                region: self.region.clone(),
                capabilities: (!self.capabilities.is_empty()).then(|| self.capabilities.clone()),
            },
            endpoints: DiscoveryEndpoints {
                health: format!("{base}/health"),
                proofs: ProofEndpoints {
                    submit: format!("{base}/proof"),
                    list_by_period: format!("{base}/proofs/{{period}}"),
                },
                extra: Default::default(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Config {
        let mut args = vec![
            "depin-worker",
            "--rpc-url",
            "https://rpc.example",
            "--keypair",
            "/tmp/id.json",
            "--worker-license",
            "Lic111",
            "--public-url",
            "https://worker.example/",
        ];
        args.extend_from_slice(extra);
        Config::try_parse_from(args).unwrap()
    }

    #[test]
    fn defaults() {
        let config = parse(&[]);
        assert_eq!(config.listen, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.das_url(), "https://rpc.example");
        assert!(config.proof_dir.is_none());
        assert!(config.capabilities.is_empty());
        assert!(!config.skip_startup_submit);
    }

    #[test]
    fn discovery_document_endpoints() {
        let config = parse(&["--capabilities", "compute,storage", "--region", "eu-west-1"]);
        let doc = config.discovery_document("Worker", "License");
        assert_eq!(doc.worker.discovery_uri, "https://worker.example/");
        assert_eq!(doc.health_endpoint(), Some("https://worker.example/health"));
        assert_eq!(doc.endpoints.proofs.submit, "https://worker.example/proof");
        assert_eq!(doc.endpoints.proofs.list_by_period, "https://worker.example/proofs/{period}");
        assert_eq!(doc.worker.capabilities, Some(vec!["compute".to_string(), "storage".to_string()]));
        assert_eq!(doc.worker.region.as_deref(), Some("eu-west-1"));
    }

    #[test]
    fn public_url_is_required() {
        let args = [
            "depin-worker",
            "--rpc-url",
            "https://rpc.example",
            "--keypair",
            "/tmp/id.json",
            "--worker-license",
            "Lic111",
        ];
        assert!(Config::try_parse_from(args).is_err());
    }
}
