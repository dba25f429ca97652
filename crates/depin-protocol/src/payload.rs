//! JSON wire shapes exchanged between checkers and workers.

use serde::{Deserialize, Serialize};

use crate::constants::{MAX_PROOF_LATENCY_MS, MAX_PROOF_UPTIME};
use crate::error::ProtocolError;
use crate::period::Period;
use crate::signature::SignedPayload;

// ============================================================================
// Discovery
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryDocument {
    #[serde(default)]
    pub version: String,
    pub worker: DiscoveryWorker,
    pub endpoints: DiscoveryEndpoints,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryWorker {
    pub address: String,
    pub license: String,
    pub discovery_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryEndpoints {
    #[serde(default)]
    pub health: String,
    pub proofs: ProofEndpoints,
    /// Endpoints this node doesn't interpret.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofEndpoints {
    pub submit: String,
    pub list_by_period: String,
}

impl DiscoveryDocument {
    /// Health endpoint, if one is advertised.
    pub fn health_endpoint(&self) -> Option<&str> {
        let url = self.endpoints.health.trim();
        (!url.is_empty()).then_some(url)
    }
}

// ============================================================================
// Health probe
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckRequest {
    pub checker: String,
    /// Unix milliseconds.
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptType {
    #[serde(rename = "health_check_receipt")]
    HealthCheck,
    #[serde(rename = "proof_receipt")]
    Proof,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckReceipt {
    #[serde(rename = "type")]
    pub kind: ReceiptType,
    pub checker: String,
    pub timestamp: u64,
    pub worker: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResponse {
    pub receipt: SignedPayload<HealthCheckReceipt>,
    pub system_metrics: SystemMetrics,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    /// Host uptime in seconds.
    pub uptime: u64,
    pub cpu: CpuMetrics,
    pub memory: MemoryMetrics,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuMetrics {
    pub usage: f64,
    pub cores: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryMetrics {
    pub used: u64,
    pub total: u64,
    pub percentage: f64,
}

// ============================================================================
// Proofs
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerProofPayload {
    pub checker: String,
    pub checker_license: String,
    pub worker: String,
    pub period: Period,
    pub metrics: ProofMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProofMetrics {
    /// Mean probe latency in milliseconds.
    pub latency: f64,
    /// Successful probes as a percentage.
    pub uptime: f64,
}

impl ProofMetrics {
    /// Bounds a worker accepts: latency in (0, 30s], uptime in [0, 100].
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if !(self.latency > 0.0) || !(self.uptime >= 0.0) {
            return Err(ProtocolError::InvalidMetrics(
                "latency must be positive and uptime cannot be negative".into(),
            ));
        }
        if self.uptime > MAX_PROOF_UPTIME {
            return Err(ProtocolError::InvalidMetrics(
                "uptime cannot be greater than 100%".into(),
            ));
        }
        if self.latency > MAX_PROOF_LATENCY_MS {
            return Err(ProtocolError::InvalidMetrics(
                "latency cannot exceed 30 seconds".into(),
            ));
        }
        Ok(())
    }
}

pub type RawProof = SignedPayload<WorkerProofPayload>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerProofReceipt {
    #[serde(rename = "type")]
    pub kind: ReceiptType,
    pub checker: String,
    pub timestamp: u64,
    pub worker: String,
    pub period: Period,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerProofResponse {
    pub receipt: SignedPayload<WorkerProofReceipt>,
}

/// A stored raw proof tagged with the submitting checker's slot index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofWithIndex {
    pub checker_index: u64,
    pub proof: RawProof,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub timestamp: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn discovery_document_keeps_unknown_endpoints() {
        let doc: DiscoveryDocument = serde_json::from_value(json!({
            "worker": {
                "address": "A", "license": "L", "discoveryUri": "https://w/d.json",
                "capabilities": ["storage"]
            },
            "endpoints": {
                "health": "https://w/health",
                "proofs": { "submit": "https://w/proof", "listByPeriod": "https://w/proofs/{period}" },
                "metrics": "https://w/metrics"
            }
        }))
        .unwrap();
        assert_eq!(doc.version, "");
        assert_eq!(doc.worker.region, None);
        assert_eq!(doc.health_endpoint(), Some("https://w/health"));
        assert_eq!(doc.endpoints.extra["metrics"], "https://w/metrics");

        let back = serde_json::to_value(&doc).unwrap();
        assert_eq!(back["endpoints"]["metrics"], "https://w/metrics");
        assert_eq!(back["endpoints"]["proofs"]["listByPeriod"], "https://w/proofs/{period}");
    }

    #[test]
    fn blank_health_endpoint_is_absent() {
        let doc: DiscoveryDocument = serde_json::from_value(json!({
            "worker": { "address": "A", "license": "L", "discoveryUri": "u" },
            "endpoints": { "health": "   ", "proofs": { "submit": "s", "listByPeriod": "l" } }
        }))
        .unwrap();
        assert_eq!(doc.health_endpoint(), None);
    }

    #[test]
    fn receipt_type_tags() {
        let receipt = WorkerProofReceipt {
            kind: ReceiptType::Proof,
            checker: "c".into(),
            timestamp: 1,
            worker: "w".into(),
            period: 4,
        };
        let v = serde_json::to_value(&receipt).unwrap();
        assert_eq!(v["type"], "proof_receipt");
    }

    #[test]
    fn metrics_bounds() {
        assert!(ProofMetrics { latency: 120.0, uptime: 99.5 }.validate().is_ok());
        assert!(ProofMetrics { latency: 30_000.0, uptime: 100.0 }.validate().is_ok());
        assert!(ProofMetrics { latency: 0.0, uptime: 50.0 }.validate().is_err());
        assert!(ProofMetrics { latency: 30_001.0, uptime: 50.0 }.validate().is_err());
        assert!(ProofMetrics { latency: 10.0, uptime: 100.1 }.validate().is_err());
        assert!(ProofMetrics { latency: 10.0, uptime: -1.0 }.validate().is_err());
        assert!(ProofMetrics { latency: f64::NAN, uptime: 1.0 }.validate().is_err());
    }
}
