//! Per-period aggregate submission.
//!
//! After each period boundary the worker waits a random jitter, aggregates
//! the proofs collected for the period that just ended and submits them in
//! one `SubmitWorkerProof` transaction. The WorkerProof account for a
//! period can only be created once, so an "already initialized" rejection
//! counts as success.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use depin_ledger::instruction::submit_worker_proof_ix;
use depin_ledger::{LedgerClient, LedgerError, LicenseDirectory, NodeIdentity, ProgramAddresses};
use depin_protocol::aggregate::AggregateProof;
use depin_protocol::cancel::{sleep_or_cancelled, sleep_until_or_cancelled};
use depin_protocol::retry::{retry, RetryError, RetryPolicy};
use depin_protocol::{EpochClock, Period, SUBMIT_JITTER_MAX, SUBMIT_JITTER_MIN};
use rand::Rng;
use solana_sdk::commitment_config::CommitmentLevel;
use solana_sdk::pubkey::Pubkey;
use tokio_util::sync::CancellationToken;

use crate::aggregator::ProofAggregator;

#[derive(Debug, Clone, Copy)]
pub struct SubmitSettings {
    pub jitter_min: Duration,
    pub jitter_max: Duration,
    /// Margin kept between the jitter and the end of the current period.
    pub jitter_margin: Duration,
    pub retry: RetryPolicy<LedgerError>,
}

impl Default for SubmitSettings {
    fn default() -> Self {
        Self {
            jitter_min: SUBMIT_JITTER_MIN,
            jitter_max: SUBMIT_JITTER_MAX,
            jitter_margin: SUBMIT_JITTER_MIN,
            retry: RetryPolicy::worker_default().retry_if(LedgerError::is_transient),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Submitted { signature: String },
    AlreadySubmitted,
    NoProofs,
    Cancelled,
}

/// `min(uniform(min, max), remaining - margin)`, never negative.
pub fn submit_jitter<R: Rng + ?Sized>(
    rng: &mut R,
    settings: &SubmitSettings,
    remaining: Duration,
) -> Duration {
    let drawn = if settings.jitter_max <= settings.jitter_min {
        settings.jitter_min
    } else {
        rng.gen_range(settings.jitter_min..=settings.jitter_max)
    };
    drawn.min(remaining.saturating_sub(settings.jitter_margin))
}

pub struct ProofSubmitter {
    clock: EpochClock,
    ledger: Arc<dyn LedgerClient>,
    licenses: Arc<dyn LicenseDirectory>,
    addresses: ProgramAddresses,
    aggregator: ProofAggregator,
    identity: Arc<NodeIdentity>,
    license: Pubkey,
    settings: SubmitSettings,
}

impl ProofSubmitter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clock: EpochClock,
        ledger: Arc<dyn LedgerClient>,
        licenses: Arc<dyn LicenseDirectory>,
        addresses: ProgramAddresses,
        aggregator: ProofAggregator,
        identity: Arc<NodeIdentity>,
        license: Pubkey,
        settings: SubmitSettings,
    ) -> Self {
        Self {
            clock,
            ledger,
            licenses,
            addresses,
            aggregator,
            identity,
            license,
            settings,
        }
    }

    /// Submit the previous period once (unless `skip_startup`), then the
    /// period that just ended after every boundary, until `shutdown`.
    pub async fn run(&self, skip_startup: bool, shutdown: &CancellationToken) {
        let period = match self.clock.current_period() {
            Ok(period) => period,
            Err(e) => {
                tracing::error!("Cannot determine current period: {e}");
                return;
            }
        };
        tracing::info!(period, "Proof submitter started");

        if !skip_startup && period > 0 {
            self.submit_logged(period - 1, false, shutdown).await;
        }

        let mut period = period;
        while !shutdown.is_cancelled() {
            let boundary = self.clock.period_end(period);
            let wait = boundary
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO);
            tracing::info!(period, next = period as u64 + 1, seconds = wait.as_secs(), "Waiting until next period");
            if !sleep_until_or_cancelled(boundary, shutdown).await {
                break;
            }
            self.submit_logged(period, true, shutdown).await;

            period = match self.clock.current_period() {
                Ok(current) => current,
                Err(e) => {
                    tracing::error!("Cannot determine current period: {e}");
                    return;
                }
            };
        }
        tracing::info!("Proof submitter stopped");
    }

    async fn submit_logged(&self, period: Period, jitter: bool, shutdown: &CancellationToken) {
        match self.submit_period(period, jitter, shutdown).await {
            Ok(SubmitOutcome::Submitted { signature }) => {
                tracing::info!(period, %signature, "Proof submitted");
            }
            Ok(SubmitOutcome::AlreadySubmitted) => {
                tracing::info!(period, "Proof already submitted, skipping");
            }
            Ok(SubmitOutcome::NoProofs) => {
                tracing::warn!(period, "No proof data available");
            }
            Ok(SubmitOutcome::Cancelled) => {
                tracing::info!(period, "Submission cancelled");
            }
            Err(e) => {
                tracing::error!(period, "Proof submission failed: {e:#}");
            }
        }
    }

    /// Aggregate and submit `period`, optionally after a random jitter.
    pub async fn submit_period(
        &self,
        period: Period,
        jitter: bool,
        cancel: &CancellationToken,
    ) -> anyhow::Result<SubmitOutcome> {
        if jitter {
            let remaining = self.clock.remaining(None)?;
            let delay = submit_jitter(&mut rand::thread_rng(), &self.settings, remaining);
            tracing::info!(period, delay_secs = delay.as_secs(), "Waiting random jitter before submit");
            if !sleep_or_cancelled(delay, cancel).await {
                return Ok(SubmitOutcome::Cancelled);
            }
        }

        if self.proof_exists(period).await {
            return Ok(SubmitOutcome::AlreadySubmitted);
        }
        let Some(aggregate) = self.aggregator.get_aggregate_proof(period).await? else {
            return Ok(SubmitOutcome::NoProofs);
        };
        // Another process may have submitted while we aggregated.
        if self.proof_exists(period).await {
            return Ok(SubmitOutcome::AlreadySubmitted);
        }

        let aggregate = &aggregate;
        let result = retry(&self.settings.retry, cancel, |attempt| async move {
            tracing::debug!(period, attempt, "Submitting aggregate proof");
            self.send(period, aggregate).await
        })
        .await;

        match result {
            Ok(outcome) => Ok(outcome),
            Err(RetryError::Cancelled) => Ok(SubmitOutcome::Cancelled),
            Err(RetryError::Failed { attempts, last }) => Err(anyhow::Error::new(last)
                .context(format!("submitting period {period} after {attempts} attempt(s)"))),
        }
    }

    async fn send(&self, period: Period, aggregate: &AggregateProof) -> Result<SubmitOutcome, LedgerError> {
        let license = self.licenses.license_with_proof(&self.license).await?;
        let instruction = submit_worker_proof_ix(
            &self.addresses,
            &self.identity.address(),
            &license,
            period,
            aggregate,
        )?;
        match self
            .ledger
            .submit_transaction(&[instruction], CommitmentLevel::Finalized)
            .await
        {
            Ok(receipt) => {
                tracing::info!(
                    period,
                    checkers = aggregate.submitted_slots(),
                    tx = %receipt.signature,
                    "Aggregate proof landed"
                );
                Ok(SubmitOutcome::Submitted { signature: receipt.signature })
            }
            Err(LedgerError::AlreadyInitialized) => Ok(SubmitOutcome::AlreadySubmitted),
            Err(e) => Err(e),
        }
    }

    /// Read failures count as "not submitted"; the transaction itself is
    /// idempotent.
    async fn proof_exists(&self, period: Period) -> bool {
        let address = self.addresses.worker_proof(&self.license, period);
        match self.ledger.read_account(&address).await {
            Ok(account) => account.is_some(),
            Err(e) => {
                tracing::warn!(period, "Could not check for an existing proof: {e}");
                false
            }
        }
    }
}
