//! Per-period control loop.
//!
//! Waits for a period change, decides whether the period is still worth
//! joining, jitters the start, then runs the period's tasks (population,
//! own slot, assigned workers, discovery, sessions) with a retry loop that
//! gives up once the period is gone.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Context};
use depin_ledger::{
    fetch_active_workers, BmbStateReader, LedgerClient, LicenseDirectory, ProgramAddresses,
};
use depin_protocol::cancel::{deadline_token, sleep_or_cancelled};
use depin_protocol::{
    EpochClock, Period, DEFAULT_MAX_CONCURRENCY, DISCOVERY_RETRY_DELAY,
    EARLY_PROCESSING_THRESHOLD, PERIOD_BOUNDARY_BUFFER, PERIOD_SKIP_THRESHOLD,
    PERIOD_TASK_RETRY_DELAY, SESSION_CANCEL_MARGIN, START_JITTER_MAX, START_JITTER_MIN,
};
use tokio_util::sync::CancellationToken;

use crate::discovery::{assigned_workers, Discovery};
use crate::http::NetworkClient;
use crate::session::{uniform, CheckerCredentials, HealthCheckManager, SessionTiming};

/// Builds the pooled network client for one period's tasks. Dropping the
/// client at the end of the period releases its connections.
pub type NetworkFactory = Box<dyn Fn() -> anyhow::Result<Arc<dyn NetworkClient>> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    pub session: SessionTiming,
    pub max_concurrency: usize,
    pub discovery_retry: Duration,
    pub skip_threshold: Duration,
    pub early_threshold: Duration,
    pub start_jitter_min: Duration,
    pub start_jitter_max: Duration,
    pub task_retry_delay: Duration,
    pub cancel_margin: Duration,
    pub boundary_buffer: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            session: SessionTiming::default(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            discovery_retry: DISCOVERY_RETRY_DELAY,
            skip_threshold: PERIOD_SKIP_THRESHOLD,
            early_threshold: EARLY_PROCESSING_THRESHOLD,
            start_jitter_min: START_JITTER_MIN,
            start_jitter_max: START_JITTER_MAX,
            task_retry_delay: PERIOD_TASK_RETRY_DELAY,
            cancel_margin: SESSION_CANCEL_MARGIN,
            boundary_buffer: PERIOD_BOUNDARY_BUFFER,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeriodSummary {
    pub eligible: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub sessions: usize,
    pub attested: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodOutcome {
    Completed(PeriodSummary),
    /// Too little of the period left to take part.
    Skipped,
    /// Tasks kept failing until the period ended.
    Abandoned,
    Cancelled,
}

pub struct Orchestrator {
    clock: EpochClock,
    ledger: Arc<dyn LedgerClient>,
    licenses: Arc<dyn LicenseDirectory>,
    bmb: BmbStateReader,
    addresses: ProgramAddresses,
    credentials: CheckerCredentials,
    network: NetworkFactory,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clock: EpochClock,
        ledger: Arc<dyn LedgerClient>,
        licenses: Arc<dyn LicenseDirectory>,
        bmb: BmbStateReader,
        addresses: ProgramAddresses,
        credentials: CheckerCredentials,
        network: NetworkFactory,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            clock,
            ledger,
            licenses,
            bmb,
            addresses,
            credentials,
            network,
            settings,
        }
    }

    /// Run until `shutdown` fires or the clock leaves the ledger's range.
    pub async fn run(&self, shutdown: &CancellationToken) {
        tracing::info!(checker = %self.credentials.address(), "Checker orchestrator started");
        let mut last_period: Option<Period> = None;

        while !shutdown.is_cancelled() {
            let period = match self.clock.current_period() {
                Ok(period) => period,
                Err(err) => {
                    tracing::error!("Cannot determine current period: {err}");
                    return;
                }
            };

            if last_period != Some(period) {
                last_period = Some(period);
                self.process_period(period, shutdown).await;
            }

            let delay = self.next_wake(period);
            tracing::info!(period, sleep_secs = delay.as_secs(), "Sleeping until next period");
            if !sleep_or_cancelled(delay, shutdown).await {
                break;
            }
        }
        tracing::info!("Checker orchestrator stopped");
    }

    /// Time until the next boundary plus a buffer, or just the buffer if the
    /// clock already moved past `period`.
    fn next_wake(&self, period: Period) -> Duration {
        let buffer = self.settings.boundary_buffer;
        match self.clock.current_period() {
            Ok(current) if current == period => {
                let remaining = self.clock.remaining_at(period, SystemTime::now());
                if remaining > buffer {
                    remaining + buffer
                } else {
                    buffer
                }
            }
            _ => buffer,
        }
    }

    pub async fn process_period(&self, period: Period, shutdown: &CancellationToken) -> PeriodOutcome {
        let remaining = self.clock.remaining_at(period, SystemTime::now());
        if remaining < self.settings.skip_threshold {
            tracing::info!(period, remaining_secs = remaining.as_secs(), "Too little time left; skipping period");
            return PeriodOutcome::Skipped;
        }

        if remaining > self.settings.early_threshold {
            let jitter = uniform(
                &mut rand::thread_rng(),
                self.settings.start_jitter_min,
                self.settings.start_jitter_max,
            );
            tracing::info!(period, jitter_secs = jitter.as_secs(), "Delaying period start");
            if !sleep_or_cancelled(jitter, shutdown).await {
                return PeriodOutcome::Cancelled;
            }
        }

        let period_end = self.clock.period_end(period);
        loop {
            match self.run_period_tasks(period, period_end, shutdown).await {
                Ok(summary) => {
                    tracing::info!(
                        period,
                        eligible = summary.eligible,
                        resolved = summary.resolved,
                        attested = summary.attested,
                        "Completed checker tasks for period"
                    );
                    return PeriodOutcome::Completed(summary);
                }
                Err(err) => {
                    if shutdown.is_cancelled() {
                        return PeriodOutcome::Cancelled;
                    }
                    if self.clock.current_period().ok() != Some(period) {
                        tracing::error!(period, "Period changed, abandoning period tasks: {err:#}");
                        return PeriodOutcome::Abandoned;
                    }
                    tracing::error!(
                        period,
                        retry_secs = self.settings.task_retry_delay.as_secs(),
                        "Period tasks failed, will retry: {err:#}"
                    );
                    if !sleep_or_cancelled(self.settings.task_retry_delay, shutdown).await {
                        return PeriodOutcome::Cancelled;
                    }
                }
            }
        }
    }

    pub async fn run_period_tasks(
        &self,
        period: Period,
        period_end: SystemTime,
        shutdown: &CancellationToken,
    ) -> anyhow::Result<PeriodSummary> {
        tracing::info!(period, "Running checker tasks");

        let population = self
            .bmb
            .checker_count(period)
            .await
            .context("reading BMB state")?
            .filter(|&count| count > 0)
            .ok_or_else(|| anyhow!("no checker count recorded for period {period}"))?;

        let my_index = self
            .licenses
            .license_index(&self.credentials.license)
            .await
            .context("looking up checker license index")?;

        let active = fetch_active_workers(self.ledger.as_ref())
            .await
            .context("fetching active workers")?;
        let active_count = active.len();
        let eligible = assigned_workers(active, my_index, period, population as i64)?;
        tracing::info!(
            period,
            population,
            my_index,
            active = active_count,
            eligible = eligible.len(),
            "Fetched active worker accounts"
        );

        let mut summary = PeriodSummary {
            eligible: eligible.len(),
            ..PeriodSummary::default()
        };
        if eligible.is_empty() {
            tracing::warn!(period, "No eligible workers found for this period");
            return Ok(summary);
        }

        let network = (self.network)().context("creating network client")?;
        let deadline = period_end
            .checked_sub(self.settings.cancel_margin)
            .unwrap_or(period_end);
        let tasks = deadline_token(shutdown, deadline);

        let discovery = Discovery::new(
            network.clone(),
            self.addresses,
            self.settings.max_concurrency,
            self.settings.session.http_timeout,
            self.settings.discovery_retry,
        );
        let mut sessions = HealthCheckManager::new(
            network,
            self.credentials.clone(),
            self.settings.session,
            shutdown,
        );

        let resolved = discovery
            .resolve(
                eligible,
                period,
                |worker| sessions.start_session(worker, period, period_end, tasks.clone()),
                &tasks,
            )
            .await;
        summary.resolved = resolved.resolved;
        summary.unresolved = resolved.unresolved;

        let reports = sessions.wait_all().await;
        summary.sessions = reports.len();
        summary.attested = reports
            .iter()
            .filter(|r| r.attestation.is_delivered())
            .count();

        tasks.cancel();
        drop(sessions);
        drop(discovery);
        Ok(summary)
    }
}
