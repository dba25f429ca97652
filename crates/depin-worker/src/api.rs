//! Worker HTTP API: health probes, proof intake and the discovery document.

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use depin_ledger::{
    check_checker_license, BmbStateReader, LedgerClient, LicenseDirectory, NodeIdentity,
    ProgramAddresses,
};
use depin_protocol::payload::{
    DiscoveryDocument, ErrorResponse, HealthCheckReceipt, HealthCheckRequest, HealthCheckResponse,
    RawProof, ReceiptType, WorkerProofReceipt, WorkerProofResponse,
};
use depin_protocol::period::unix_now_ms;
use depin_protocol::signature::{is_valid_address, SignedPayload};
use depin_protocol::{assignment_set, EpochClock, Period, HEALTH_TIMESTAMP_TOLERANCE};
use solana_sdk::pubkey::Pubkey;

use crate::store::{ProofStore, StoreError};
use crate::system::SystemProbe;

// ============================================================================
// App state
// ============================================================================

#[derive(Clone)]
pub struct AppState {
    pub identity: Arc<NodeIdentity>,
    /// Worker license; seeds the assignment set checked on proof intake.
    pub license: Pubkey,
    pub clock: EpochClock,
    pub ledger: Arc<dyn LedgerClient>,
    pub licenses: Arc<dyn LicenseDirectory>,
    pub bmb: Arc<BmbStateReader>,
    pub addresses: ProgramAddresses,
    pub store: Arc<dyn ProofStore>,
    pub discovery: Arc<DiscoveryDocument>,
    pub system: Arc<SystemProbe>,
}

impl AppState {
    fn address(&self) -> String {
        self.identity.address().to_string()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/",                           get(get_discovery))
        .route("/.well-known/discovery.json", get(get_discovery))
        .route("/health",                     post(health))
        .route("/proof",                      post(submit_proof))
        .route("/proofs/{period}",            get(list_proofs))
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Errors
// ============================================================================

fn reject(status: StatusCode, error: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            message: message.into(),
            timestamp: unix_now_ms(),
        }),
    )
        .into_response()
}

fn bad_request(error: &str, message: impl Into<String>) -> Response {
    reject(StatusCode::BAD_REQUEST, error, message)
}

fn malformed(rejection: JsonRejection) -> Response {
    bad_request("invalid_request", rejection.body_text())
}

fn signed<T: serde::Serialize>(state: &AppState, payload: T) -> Result<SignedPayload<T>, Response> {
    SignedPayload::sign(payload, &state.identity.signing_key).map_err(|e| {
        tracing::error!("Signing receipt failed: {e}");
        reject(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "failed to sign receipt")
    })
}

// ============================================================================
// Discovery
// ============================================================================

pub async fn get_discovery(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.discovery.as_ref().clone())
}

// ============================================================================
// Health
// ============================================================================

pub async fn health(
    State(state): State<AppState>,
    body: Result<Json<SignedPayload<HealthCheckRequest>>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return malformed(rejection),
    };
    let checker = request.payload.checker.clone();
    tracing::debug!(%checker, timestamp = request.payload.timestamp, "Health check request received");

    if request.verify().is_err() {
        tracing::warn!(%checker, "Health check signature verification failed");
        return bad_request(
            "invalid_signature",
            "The provided signature is not valid for the given payload",
        );
    }
    if checker != request.public_key {
        tracing::warn!(%checker, public_key = %request.public_key, "Checker address mismatch");
        return bad_request(
            "checker_address_mismatch",
            "The checker address in the payload does not match the public key of the signature",
        );
    }
    if !is_valid_address(&checker) {
        return bad_request(
            "invalid_checker_address",
            "The checker field must be a valid Solana wallet address",
        );
    }

    let now = unix_now_ms();
    let skew = now.abs_diff(request.payload.timestamp);
    if u128::from(skew) > HEALTH_TIMESTAMP_TOLERANCE.as_millis() {
        tracing::warn!(%checker, skew_ms = skew, "Health check timestamp too far from current time");
        return bad_request(
            "stale_timestamp",
            format!(
                "Timestamp is {}s apart from current time. Maximum allowed is {}s",
                skew / 1000,
                HEALTH_TIMESTAMP_TOLERANCE.as_secs()
            ),
        );
    }

    let receipt = HealthCheckReceipt {
        kind: ReceiptType::HealthCheck,
        checker,
        timestamp: now,
        worker: state.address(),
    };
    let receipt = match signed(&state, receipt) {
        Ok(receipt) => receipt,
        Err(response) => return response,
    };
    Json(HealthCheckResponse {
        receipt,
        system_metrics: state.system.snapshot(),
    })
    .into_response()
}

// ============================================================================
// Proofs
// ============================================================================

pub async fn list_proofs(
    State(state): State<AppState>,
    Path(period): Path<String>,
) -> Response {
    let Ok(period) = period.parse::<Period>() else {
        return bad_request(
            "invalid_period",
            "The period path parameter must be a non-negative integer",
        );
    };
    match state.store.list(period).await {
        Ok(proofs) => Json(proofs).into_response(),
        Err(e) => {
            tracing::error!(period, "Listing proofs failed: {e}");
            reject(
                StatusCode::INTERNAL_SERVER_ERROR,
                "proof_fetch_failed",
                format!("Failed to fetch proofs: {e}"),
            )
        }
    }
}

pub async fn submit_proof(
    State(state): State<AppState>,
    body: Result<Json<RawProof>, JsonRejection>,
) -> Response {
    let Json(proof) = match body {
        Ok(body) => body,
        Err(rejection) => return malformed(rejection),
    };
    let payload = &proof.payload;
    tracing::debug!(checker = %payload.checker, period = payload.period, "Proof submission received");

    if proof.verify().is_err() {
        tracing::warn!(checker = %payload.checker, "Invalid proof signature");
        return bad_request("invalid_proof_signature", "The provided proof signature is not valid");
    }
    if let Err(e) = payload.metrics.validate() {
        tracing::warn!(latency = payload.metrics.latency, uptime = payload.metrics.uptime, "Invalid metrics");
        return bad_request("invalid_metrics", e.to_string());
    }
    if payload.checker != proof.public_key {
        return bad_request(
            "checker_address_mismatch",
            "The checker address in the proof payload does not match the public key of the signature",
        );
    }
    let Ok(checker) = Pubkey::from_str(&payload.checker) else {
        return bad_request(
            "invalid_checker_address",
            "The checker field must be a valid Solana wallet address",
        );
    };
    let Ok(checker_license) = Pubkey::from_str(&payload.checker_license) else {
        return bad_request(
            "invalid_checker_license",
            "The checker license field must be a valid Solana address",
        );
    };

    let current = match state.clock.current_period() {
        Ok(current) => current,
        Err(e) => {
            return reject(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string());
        }
    };
    if payload.period != current {
        tracing::warn!(expected = current, got = payload.period, "Invalid proof period");
        return bad_request(
            "invalid_proof_period",
            format!("The proof period must be the current period ({current})"),
        );
    }
    if payload.worker != state.address() {
        return bad_request("invalid_worker", "The proof is addressed to a different worker");
    }

    if let Err(rejection) =
        check_checker_license(state.ledger.as_ref(), &state.addresses, &checker_license, &checker).await
    {
        match rejection.code() {
            "checker_suspended" | "checker_license_suspended" => {
                tracing::info!(%checker, "Checker or license suspended: {rejection}");
            }
            _ => tracing::warn!(%checker, "Checker license validation failed: {rejection}"),
        }
        return bad_request(rejection.code(), rejection.to_string());
    }

    let population = match state.bmb.checker_count(payload.period).await {
        Ok(Some(count)) => count,
        Ok(None) => {
            return bad_request(
                "checker_count_unavailable",
                format!("No checker count found for period {}", payload.period),
            );
        }
        Err(e) => {
            return bad_request(
                "checker_count_unavailable",
                format!("Failed to read BMB state: {e}"),
            );
        }
    };
    let checker_index = match state.licenses.license_index(&checker_license).await {
        Ok(index) => index,
        Err(e) => {
            return bad_request(
                "checker_license_unavailable",
                format!("Failed to fetch checker license asset: {e}"),
            );
        }
    };
    if checker_index >= u64::from(population) {
        return bad_request(
            "invalid_checker_license",
            "The provided checker license is not activated in BMB state",
        );
    }

    let assigned = assignment_set(state.license.as_ref(), payload.period, i64::from(population))
        .map(|set| set.contains(checker_index))
        .unwrap_or(false);
    if !assigned {
        tracing::warn!(%checker, checker_index, period = payload.period, "Checker not assigned to this worker");
        return bad_request(
            "checker_not_assigned",
            "The checker is not assigned to this worker for the period",
        );
    }

    match state.store.put_if_absent(payload.period, checker_index, &proof).await {
        Ok(()) => {}
        Err(StoreError::Conflict { .. }) => {
            tracing::warn!(period = payload.period, checker_index, "Duplicate proof");
            return bad_request(
                "proof_already_exists",
                "A proof has already been submitted for this checker license and period",
            );
        }
        Err(e) => {
            tracing::error!(period = payload.period, checker_index, "Storing proof failed: {e}");
            return reject(
                StatusCode::INTERNAL_SERVER_ERROR,
                "proof_storage_failed",
                format!("Failed to store proof: {e}"),
            );
        }
    }

    let receipt = WorkerProofReceipt {
        kind: ReceiptType::Proof,
        checker: payload.checker.clone(),
        timestamp: unix_now_ms(),
        worker: state.address(),
        period: payload.period,
    };
    match signed(&state, receipt) {
        Ok(receipt) => {
            tracing::info!(%checker, checker_index, period = payload.period, "Proof accepted");
            Json(WorkerProofResponse { receipt }).into_response()
        }
        Err(response) => response,
    }
}
