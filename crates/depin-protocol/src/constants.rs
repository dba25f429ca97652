// ============================================================================
// Network constants
// ============================================================================

use std::time::Duration;

// --- Program ----------------------------------------------------------------

/// DePIN program ID (mainnet).
pub const DEPIN_PROGRAM_ID: &str = "bdpFdVD8Lyy7tKrLSASvNxk7TjbwXi7ejedZkeamPnM";

/// Metaplex account-compression program that owns the license merkle trees.
pub const ACCOUNT_COMPRESSION_PROGRAM_ID: &str = "mcmt6YrQEMKw8Mw43FmpRLmf7BqRJb3Rz3c3Y5fwvPx";

// --- Period -----------------------------------------------------------------

/// Unix timestamp of the start of period 0 (2025-06-01 00:00:00 UTC).
pub const PERIOD_ZERO: u64 = 1_748_736_000;

/// Period length in seconds (1 day).
pub const PERIOD_LENGTH_SECS: u64 = 86_400;

/// Highest period the ledger can record (u16 field).
pub const MAX_PERIOD: u64 = u16::MAX as u64;

// --- Assignment -------------------------------------------------------------

/// Number of checker slots BRAND assigns to each worker per period.
pub const BRAND_SLOTS: usize = 512;

/// Bitmap width in bytes for the aggregate proof (one bit per slot).
pub const CHECKER_BITMAP_BYTES: usize = BRAND_SLOTS / 8;

/// Fixed-point scale for averaged latency/uptime stored on the ledger.
pub const METRIC_SCALE: f64 = 100_000.0;

// --- Health-check sessions ----------------------------------------------------

/// Probe interval bounds.
pub const DEFAULT_MIN_PROBE_INTERVAL: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_MAX_PROBE_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// A session stops probing somewhere in [period end - 4h, period end - 30m].
pub const SESSION_MIN_EARLY_STOP: Duration = Duration::from_secs(30 * 60);
pub const SESSION_MAX_EARLY_STOP: Duration = Duration::from_secs(4 * 60 * 60);

/// Timeout for any single HTTP call (discovery fetch, probe, proof submit).
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Max in-flight HTTP calls per process.
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

// --- Orchestration ----------------------------------------------------------

/// Don't start a period with less than this left.
pub const PERIOD_SKIP_THRESHOLD: Duration = Duration::from_secs(60 * 60);

/// Above this much remaining the period is "fresh" and start is jittered.
pub const EARLY_PROCESSING_THRESHOLD: Duration = Duration::from_secs(23 * 3600 + 50 * 60);

/// Start jitter bounds for a fresh period.
pub const START_JITTER_MIN: Duration = Duration::from_secs(60);
pub const START_JITTER_MAX: Duration = Duration::from_secs(4 * 60 * 60);

/// Backoff between failed attempts at the same period's tasks.
pub const PERIOD_TASK_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Sessions still running this close to period end are cancelled.
pub const SESSION_CANCEL_MARGIN: Duration = Duration::from_secs(10 * 60);

/// Added to the sleep until the next period boundary.
pub const PERIOD_BOUNDARY_BUFFER: Duration = Duration::from_secs(10);

/// Delay between discovery passes over unresolved workers.
pub const DISCOVERY_RETRY_DELAY: Duration = Duration::from_secs(30 * 60);

// --- Worker -----------------------------------------------------------------

/// Accepted clock skew on a signed health probe.
pub const HEALTH_TIMESTAMP_TOLERANCE: Duration = Duration::from_secs(60);

/// Proof metric bounds accepted from checkers.
pub const MAX_PROOF_LATENCY_MS: f64 = 30_000.0;
pub const MAX_PROOF_UPTIME: f64 = 100.0;

/// Aggregate submission jitter bounds after a period boundary.
pub const SUBMIT_JITTER_MIN: Duration = Duration::from_secs(60);
pub const SUBMIT_JITTER_MAX: Duration = Duration::from_secs(30 * 60);

// --- Ledger cache -----------------------------------------------------------

pub const BMB_CACHE_CAPACITY: usize = 100;
pub const BMB_CACHE_TTL: Duration = Duration::from_secs(2 * 60);
