//! Health-check sessions.
//!
//! One session per resolved worker per period. A session probes the worker's
//! health endpoint at jittered intervals until a randomized cutoff near the
//! end of the period (or until cancelled), then signs whatever metrics it
//! gathered into a proof and delivers it to the worker.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use depin_ledger::NodeIdentity;
use depin_protocol::cancel::{sleep_or_cancelled, until};
use depin_protocol::payload::{
    HealthCheckRequest, ProofMetrics, WorkerProofPayload, WorkerProofResponse,
};
use depin_protocol::period::unix_now_ms;
use depin_protocol::retry::{retry, DelayPolicy, RetryError, RetryPolicy};
use depin_protocol::{
    Period, ProtocolError, SignedPayload, DEFAULT_MAX_PROBE_INTERVAL, DEFAULT_MIN_PROBE_INTERVAL,
    HTTP_TIMEOUT, MAX_PROOF_LATENCY_MS, SESSION_MAX_EARLY_STOP, SESSION_MIN_EARLY_STOP,
};
use rand::Rng;
use serde::Serialize;
use solana_sdk::pubkey::Pubkey;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::discovery::ResolvedWorker;
use crate::http::{HttpResponse, NetworkClient, NetworkError};

// ============================================================================
// Timing
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTiming {
    pub min_interval: Duration,
    pub max_interval: Duration,
    /// A session stops probing between `max_early_stop` and `min_early_stop`
    /// before period end.
    pub min_early_stop: Duration,
    pub max_early_stop: Duration,
    pub http_timeout: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            min_interval: DEFAULT_MIN_PROBE_INTERVAL,
            max_interval: DEFAULT_MAX_PROBE_INTERVAL,
            min_early_stop: SESSION_MIN_EARLY_STOP,
            max_early_stop: SESSION_MAX_EARLY_STOP,
            http_timeout: HTTP_TIMEOUT,
        }
    }
}

/// Uniform duration in `[low, high]`.
pub(crate) fn uniform<R: Rng + ?Sized>(rng: &mut R, low: Duration, high: Duration) -> Duration {
    if high <= low {
        return low;
    }
    rng.gen_range(low..=high)
}

/// When a session started at `now` stops probing:
/// `min(end - min_early, max(end - uniform(min_early, max_early), now + min_interval))`.
pub fn compute_cutoff<R: Rng + ?Sized>(
    now: SystemTime,
    period_end: SystemTime,
    timing: &SessionTiming,
    rng: &mut R,
) -> SystemTime {
    let early = uniform(rng, timing.min_early_stop, timing.max_early_stop);
    let latest = before(period_end, timing.min_early_stop);
    let randomized = before(period_end, early);
    let earliest = now + timing.min_interval;
    latest.min(randomized.max(earliest))
}

fn before(at: SystemTime, by: Duration) -> SystemTime {
    at.checked_sub(by).unwrap_or(UNIX_EPOCH)
}

// ============================================================================
// Metrics
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HealthMetrics {
    pub samples: u32,
    pub successes: u32,
    pub failures: u32,
    /// Running mean over every sample, failures included.
    pub avg_latency_ms: f64,
}

impl HealthMetrics {
    pub fn record(&mut self, latency_ms: f64, success: bool) {
        self.samples += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.avg_latency_ms += (latency_ms - self.avg_latency_ms) / self.samples as f64;
    }

    pub fn uptime_percent(&self) -> f64 {
        if self.samples == 0 {
            return 0.0;
        }
        self.successes as f64 / self.samples as f64 * 100.0
    }

    /// Metrics as they go into a proof; latency is clamped into the range
    /// workers accept.
    pub fn to_proof_metrics(&self) -> ProofMetrics {
        ProofMetrics {
            latency: self.avg_latency_ms.clamp(1.0, MAX_PROOF_LATENCY_MS),
            uptime: self.uptime_percent(),
        }
    }
}

// ============================================================================
// Session outcome
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Running,
    Draining,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    NoHealthEndpoint,
    Cutoff,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attestation {
    /// No samples were collected.
    Skipped,
    Delivered,
    /// The worker already holds a proof from this checker for the period,
    /// typically from an earlier attempt whose response was lost.
    AlreadyDelivered,
    Failed(String),
}

impl Attestation {
    /// The worker has this checker's proof for the period.
    pub fn is_delivered(&self) -> bool {
        matches!(self, Attestation::Delivered | Attestation::AlreadyDelivered)
    }
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub worker: String,
    pub period: Period,
    pub end: SessionEnd,
    pub metrics: HealthMetrics,
    pub attestation: Attestation,
    pub state: SessionState,
}

#[derive(Debug, Error)]
pub enum AttestationError {
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("worker returned HTTP {0}")]
    Server(u16),

    #[error("worker rejected proof with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("worker already holds this proof")]
    Duplicate,
}

impl AttestationError {
    /// Transport failures and 5xx are retried; 4xx is the worker's verdict.
    pub fn is_retryable(&self) -> bool {
        match self {
            AttestationError::Network(NetworkError::Cancelled) => false,
            AttestationError::Network(_) | AttestationError::Server(_) => true,
            AttestationError::Rejected { .. } | AttestationError::Duplicate => false,
        }
    }
}

// ============================================================================
// Manager
// ============================================================================

/// The checker's signing identity and license.
#[derive(Clone)]
pub struct CheckerCredentials {
    pub identity: Arc<NodeIdentity>,
    pub license: Pubkey,
}

impl CheckerCredentials {
    pub fn address(&self) -> String {
        self.identity.address().to_string()
    }

    fn sign_json<T: Serialize>(&self, payload: T) -> Result<serde_json::Value, ProtocolError> {
        let signed = SignedPayload::sign(payload, &self.identity.signing_key)?;
        serde_json::to_value(&signed).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

pub struct HealthCheckManager {
    network: Arc<dyn NetworkClient>,
    credentials: CheckerCredentials,
    timing: SessionTiming,
    attestation_retry: RetryPolicy<AttestationError>,
    shutdown: CancellationToken,
    sessions: JoinSet<SessionReport>,
}

impl HealthCheckManager {
    /// `shutdown` is the process-wide token; attestation delivery outlives a
    /// session's own cancellation but not shutdown.
    pub fn new(
        network: Arc<dyn NetworkClient>,
        credentials: CheckerCredentials,
        timing: SessionTiming,
        shutdown: &CancellationToken,
    ) -> Self {
        Self {
            network,
            credentials,
            timing,
            shutdown: shutdown.clone(),
            attestation_retry: RetryPolicy::checker_default()
                .retry_if(AttestationError::is_retryable),
            sessions: JoinSet::new(),
        }
    }

    pub fn with_attestation_retry(mut self, max_attempts: usize, delay: DelayPolicy) -> Self {
        self.attestation_retry =
            RetryPolicy::new(max_attempts, delay).retry_if(AttestationError::is_retryable);
        self
    }

    /// Spawn a session for `target`. `cancel` stops probing early; the
    /// attestation is still sent.
    pub fn start_session(
        &mut self,
        target: ResolvedWorker,
        period: Period,
        period_end: SystemTime,
        cancel: CancellationToken,
    ) {
        tracing::debug!(
            worker = %target.document.worker.address,
            period,
            min_interval_secs = self.timing.min_interval.as_secs(),
            max_interval_secs = self.timing.max_interval.as_secs(),
            "Starting health check session"
        );
        let session = HealthCheckSession {
            target,
            period,
            period_end,
            cancel,
            network: self.network.clone(),
            credentials: self.credentials.clone(),
            timing: self.timing,
            attestation_retry: self.attestation_retry,
            shutdown: self.shutdown.clone(),
            state: SessionState::Created,
        };
        self.sessions.spawn(session.run());
    }

    pub fn active(&self) -> usize {
        self.sessions.len()
    }

    pub async fn wait_all(&mut self) -> Vec<SessionReport> {
        let mut reports = Vec::with_capacity(self.sessions.len());
        while let Some(joined) = self.sessions.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(err) => tracing::warn!("Health check session task failed: {err}"),
            }
        }
        reports
    }
}

// ============================================================================
// Session
// ============================================================================

struct HealthCheckSession {
    target: ResolvedWorker,
    period: Period,
    period_end: SystemTime,
    cancel: CancellationToken,
    network: Arc<dyn NetworkClient>,
    credentials: CheckerCredentials,
    timing: SessionTiming,
    attestation_retry: RetryPolicy<AttestationError>,
    shutdown: CancellationToken,
    state: SessionState,
}

impl HealthCheckSession {
    fn worker(&self) -> &str {
        &self.target.document.worker.address
    }

    fn enter(&mut self, next: SessionState) {
        tracing::trace!(worker = self.worker(), from = ?self.state, to = ?next, "Session state");
        self.state = next;
    }

    async fn run(mut self) -> SessionReport {
        let mut metrics = HealthMetrics::default();

        let health_url = self.target.document.health_endpoint().map(str::to_owned);
        let end = match health_url {
            None => {
                tracing::warn!(worker = self.worker(), period = self.period, "No health endpoint; skipping session");
                SessionEnd::NoHealthEndpoint
            }
            Some(url) => {
                let cutoff = compute_cutoff(
                    SystemTime::now(),
                    self.period_end,
                    &self.timing,
                    &mut rand::thread_rng(),
                );
                tracing::debug!(
                    worker = self.worker(),
                    period = self.period,
                    session_secs = until(cutoff).as_secs(),
                    "Health check session timing calculated"
                );
                self.enter(SessionState::Running);
                self.probe_loop(&url, cutoff, &mut metrics).await
            }
        };

        self.enter(SessionState::Draining);
        if end == SessionEnd::Cancelled {
            tracing::info!(
                worker = self.worker(),
                period = self.period,
                samples = metrics.samples,
                "Health check session cancelled"
            );
        }
        let attestation = self.attest(&metrics).await;
        self.enter(SessionState::Closed);

        SessionReport {
            worker: self.worker().to_string(),
            period: self.period,
            end,
            metrics,
            attestation,
            state: self.state,
        }
    }

    async fn probe_loop(
        &self,
        url: &str,
        cutoff: SystemTime,
        metrics: &mut HealthMetrics,
    ) -> SessionEnd {
        if SystemTime::now() < cutoff && !self.probe(url, metrics).await {
            return SessionEnd::Cancelled;
        }
        loop {
            if self.cancel.is_cancelled() {
                return SessionEnd::Cancelled;
            }
            let left = until(cutoff);
            if left.is_zero() {
                tracing::debug!(worker = self.worker(), "Reached session cutoff");
                return SessionEnd::Cutoff;
            }
            let delay = uniform(
                &mut rand::thread_rng(),
                self.timing.min_interval,
                self.timing.max_interval,
            )
            .min(left);
            if !sleep_or_cancelled(delay, &self.cancel).await {
                return SessionEnd::Cancelled;
            }
            if !self.probe(url, metrics).await {
                return SessionEnd::Cancelled;
            }
        }
    }

    /// One signed probe. Returns `false` if cancelled mid-request.
    async fn probe(&self, url: &str, metrics: &mut HealthMetrics) -> bool {
        let request = HealthCheckRequest {
            checker: self.credentials.address(),
            timestamp: unix_now_ms(),
        };
        let body = match self.credentials.sign_json(request) {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!(worker = self.worker(), "Could not sign health check: {err}");
                metrics.record(0.0, false);
                return true;
            }
        };

        match self
            .network
            .post(url, &body, self.timing.http_timeout, &self.cancel)
            .await
        {
            Ok(response) => {
                let latency_ms = response.elapsed.as_secs_f64() * 1000.0;
                metrics.record(latency_ms, response.is_ok());
                tracing::info!(
                    worker = self.worker(),
                    period = self.period,
                    status = response.status,
                    latency_ms,
                    success = response.is_ok(),
                    "Health check completed"
                );
            }
            Err(NetworkError::Cancelled) => return false,
            Err(err) => {
                metrics.record(0.0, false);
                tracing::debug!(worker = self.worker(), url, "Health check failed: {err}");
            }
        }
        true
    }

    async fn attest(&self, metrics: &HealthMetrics) -> Attestation {
        if metrics.samples == 0 {
            tracing::info!(worker = self.worker(), period = self.period, "No health check samples collected; skipping proof");
            return Attestation::Skipped;
        }
        let url = self.target.document.endpoints.proofs.submit.trim();
        if url.is_empty() {
            tracing::warn!(worker = self.worker(), "No proof submission endpoint");
            return Attestation::Failed("no proof submission endpoint".into());
        }

        let proof_metrics = metrics.to_proof_metrics();
        let payload = WorkerProofPayload {
            checker: self.credentials.address(),
            checker_license: self.credentials.license.to_string(),
            worker: self.worker().to_string(),
            period: self.period,
            metrics: proof_metrics,
        };
        let body = match self.credentials.sign_json(payload) {
            Ok(body) => body,
            Err(err) => return Attestation::Failed(err.to_string()),
        };

        // The session token has usually fired by now; delivery only stops on shutdown.
        let delivery = self.shutdown.child_token();
        let result = retry(&self.attestation_retry, &delivery, |_| {
            self.deliver(url, &body, &delivery)
        })
        .await;

        match result {
            Ok(response) => {
                let receipt_valid = response
                    .json::<WorkerProofResponse>()
                    .map(|r| r.receipt.verify().is_ok() && r.receipt.public_key == self.worker())
                    .unwrap_or(false);
                if !receipt_valid {
                    tracing::warn!(worker = self.worker(), "Proof accepted but the receipt did not verify");
                }
                tracing::info!(
                    worker = self.worker(),
                    period = self.period,
                    samples = metrics.samples,
                    latency_ms = proof_metrics.latency,
                    uptime = proof_metrics.uptime,
                    "Proof submitted"
                );
                Attestation::Delivered
            }
            Err(RetryError::Failed { last: AttestationError::Duplicate, .. }) => {
                tracing::info!(worker = self.worker(), period = self.period, "Worker already holds this proof");
                Attestation::AlreadyDelivered
            }
            Err(err) => {
                tracing::warn!(worker = self.worker(), period = self.period, "Proof submission failed: {err}");
                Attestation::Failed(err.to_string())
            }
        }
    }

    async fn deliver(
        &self,
        url: &str,
        body: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, AttestationError> {
        let response = self
            .network
            .post(url, body, self.timing.http_timeout, cancel)
            .await?;
        match response.status {
            200 => Ok(response),
            status if status >= 500 => Err(AttestationError::Server(status)),
            _ if is_duplicate(&response) => Err(AttestationError::Duplicate),
            status => Err(AttestationError::Rejected {
                status,
                body: String::from_utf8_lossy(&response.body).into_owned(),
            }),
        }
    }
}

const PROOF_ALREADY_EXISTS: &str = "proof_already_exists";

/// The worker's error code for a proof it has already stored.
fn is_duplicate(response: &HttpResponse) -> bool {
    response
        .json::<serde_json::Value>()
        .ok()
        .and_then(|body| body.get("error")?.as_str().map(|code| code == PROOF_ALREADY_EXISTS))
        .unwrap_or(false)
}
