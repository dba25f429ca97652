//! Worker discovery: turn ledger registrations into verified discovery
//! documents.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use depin_ledger::{ProgramAddresses, WorkerRegistration};
use depin_protocol::payload::DiscoveryDocument;
use depin_protocol::cancel::sleep_or_cancelled;
use depin_protocol::{assignment_set, Period, ProtocolError};
use futures::StreamExt;
use solana_sdk::pubkey::Pubkey;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::http::{NetworkClient, NetworkError};

#[derive(Debug, Clone)]
pub struct ResolvedWorker {
    pub registration: WorkerRegistration,
    pub document: DiscoveryDocument,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveOutcome {
    pub resolved: usize,
    pub unresolved: usize,
    /// Stopped by `cancel` before every worker resolved.
    pub cancelled: bool,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("discovery fetch returned HTTP {0}")]
    Status(u16),

    #[error("malformed discovery document: {0}")]
    Document(String),

    #[error("invalid {field} address {value:?}")]
    Address { field: &'static str, value: String },

    #[error("document derives worker account {derived}, registration is {expected}")]
    IdentityMismatch { expected: Pubkey, derived: Pubkey },
}

/// Workers whose BRAND assignment for `period` includes `checker_index`.
pub fn assigned_workers(
    workers: Vec<WorkerRegistration>,
    checker_index: u64,
    period: Period,
    population: i64,
) -> Result<Vec<WorkerRegistration>, ProtocolError> {
    let mut assigned = Vec::new();
    for worker in workers {
        let set = assignment_set(worker.metadata.license.as_ref(), period, population)?;
        if set.contains(checker_index) {
            assigned.push(worker);
        }
    }
    Ok(assigned)
}

pub struct Discovery {
    network: Arc<dyn NetworkClient>,
    addresses: ProgramAddresses,
    concurrency: usize,
    timeout: Duration,
    retry_delay: Duration,
}

impl Discovery {
    pub fn new(
        network: Arc<dyn NetworkClient>,
        addresses: ProgramAddresses,
        concurrency: usize,
        timeout: Duration,
        retry_delay: Duration,
    ) -> Self {
        Self {
            network,
            addresses,
            concurrency: concurrency.max(1),
            timeout,
            retry_delay,
        }
    }

    /// Resolve `workers`, calling `on_resolved` once per verified worker.
    ///
    /// Unresolved workers are retried as a batch every `retry_delay` until
    /// all resolve or `cancel` fires. Cancellation returns immediately and
    /// keeps whatever already resolved.
    pub async fn resolve<F>(
        &self,
        workers: Vec<WorkerRegistration>,
        period: Period,
        mut on_resolved: F,
        cancel: &CancellationToken,
    ) -> ResolveOutcome
    where
        F: FnMut(ResolvedWorker),
    {
        let total = workers.len();
        let mut outcome = ResolveOutcome::default();
        let mut pending = workers;
        let mut pass = 0u32;

        while !pending.is_empty() {
            pass += 1;
            let mut unresolved = Vec::new();
            let mut attempts = futures::stream::iter(pending)
                .map(move |registration| async move {
                    let result = self.fetch_verified(&registration, cancel).await;
                    (registration, result)
                })
                .buffer_unordered(self.concurrency);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        outcome.cancelled = true;
                        break;
                    }
                    next = attempts.next() => match next {
                        Some((registration, Ok(document))) => {
                            outcome.resolved += 1;
                            on_resolved(ResolvedWorker { registration, document });
                        }
                        Some((registration, Err(err))) => {
                            tracing::warn!(
                                worker_account = %registration.account,
                                uri = registration.discovery_uri(),
                                period,
                                pass,
                                "Worker discovery failed: {err}"
                            );
                            unresolved.push(registration);
                        }
                        None => break,
                    },
                }
            }
            drop(attempts);

            if outcome.cancelled || unresolved.is_empty() {
                break;
            }
            tracing::info!(
                period,
                pass,
                unresolved = unresolved.len(),
                retry_secs = self.retry_delay.as_secs(),
                "Retrying unresolved workers later"
            );
            if !sleep_or_cancelled(self.retry_delay, cancel).await {
                outcome.cancelled = true;
                break;
            }
            pending = unresolved;
        }

        outcome.unresolved = total - outcome.resolved;
        outcome
    }

    async fn fetch_verified(
        &self,
        registration: &WorkerRegistration,
        cancel: &CancellationToken,
    ) -> Result<DiscoveryDocument, ResolveError> {
        let response = self
            .network
            .get(registration.discovery_uri(), self.timeout, cancel)
            .await?;
        if !response.is_ok() {
            return Err(ResolveError::Status(response.status));
        }
        let document: DiscoveryDocument = response
            .json()
            .map_err(|e| ResolveError::Document(e.to_string()))?;
        self.verify(registration, &document)?;
        Ok(document)
    }

    /// The document's `(license, address)` must derive the registration's
    /// account.
    pub fn verify(
        &self,
        registration: &WorkerRegistration,
        document: &DiscoveryDocument,
    ) -> Result<(), ResolveError> {
        let license = parse_address("license", &document.worker.license)?;
        let worker = parse_address("worker", &document.worker.address)?;
        let derived = self.addresses.worker_metadata(&license, &worker);
        if derived != registration.account {
            return Err(ResolveError::IdentityMismatch {
                expected: registration.account,
                derived,
            });
        }
        Ok(())
    }
}

fn parse_address(field: &'static str, value: &str) -> Result<Pubkey, ResolveError> {
    Pubkey::from_str(value).map_err(|_| ResolveError::Address {
        field,
        value: value.to_string(),
    })
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use depin_ledger::accounts::WorkerMetadata;
    use serde_json::json;

    pub struct Worker {
        pub registration: WorkerRegistration,
        pub address: Pubkey,
        pub uri: String,
    }

    pub fn worker(addresses: &ProgramAddresses, name: &str) -> Worker {
        let license = Pubkey::new_unique();
        let address = Pubkey::new_unique();
        let uri = format!("https://{name}/.well-known/discovery.json");
        Worker {
            registration: WorkerRegistration {
                account: addresses.worker_metadata(&license, &address),
                metadata: WorkerMetadata {
                    suspended_at: None,
                    delegated_to: address,
                    license,
                    owner: address,
                    discovery_uri: uri.clone(),
                },
            },
            address,
            uri,
        }
    }

    pub fn document(w: &Worker, name: &str) -> serde_json::Value {
        json!({
            "version": "1",
            "worker": {
                "address": w.address.to_string(),
                "license": w.registration.metadata.license.to_string(),
                "discoveryUri": w.uri,
            },
            "endpoints": {
                "health": format!("https://{name}/health"),
                "proofs": {
                    "submit": format!("https://{name}/proof"),
                    "listByPeriod": format!("https://{name}/proofs/{{period}}"),
                },
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{document, worker, Worker};
    use super::*;
    use crate::http::fake::{FakeNetwork, Method};
    use serde_json::json;

    fn discovery(network: Arc<FakeNetwork>, addresses: ProgramAddresses, retry: Duration) -> Discovery {
        Discovery::new(network, addresses, 4, Duration::from_secs(1), retry)
    }

    #[tokio::test]
    async fn resolves_verified_documents_once() {
        let addresses = ProgramAddresses::new(Pubkey::new_unique());
        let network = Arc::new(FakeNetwork::new());
        let workers: Vec<Worker> = (0..6).map(|i| worker(&addresses, &format!("w{i}"))).collect();
        for (i, w) in workers.iter().enumerate() {
            network.on_get(&w.uri, 200, document(w, &format!("w{i}")));
        }

        let d = discovery(network.clone(), addresses, Duration::from_secs(3600));
        let mut seen = Vec::new();
        let outcome = d
            .resolve(
                workers.iter().map(|w| w.registration.clone()).collect(),
                3,
                |r| seen.push(r.registration.account),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(outcome, ResolveOutcome { resolved: 6, unresolved: 0, cancelled: false });
        seen.sort();
        let mut expected: Vec<Pubkey> = workers.iter().map(|w| w.registration.account).collect();
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn identity_mismatch_is_unresolved() {
        let addresses = ProgramAddresses::new(Pubkey::new_unique());
        let honest = worker(&addresses, "honest");
        let impostor = worker(&addresses, "impostor");
        // Registration points at a document describing some other worker.
        let network = Arc::new(FakeNetwork::new());
        network.on_get(&impostor.uri, 200, document(&honest, "honest"));

        let d = discovery(network, addresses, Duration::from_secs(3600));
        let err = d
            .verify(
                &impostor.registration,
                &serde_json::from_value(document(&honest, "honest")).unwrap(),
            )
            .unwrap_err();
        assert!(matches!(err, ResolveError::IdentityMismatch { .. }));

        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stop.cancel();
        });
        let mut calls = 0;
        let outcome = d.resolve(vec![impostor.registration], 1, |_| calls += 1, &cancel).await;
        assert_eq!(calls, 0);
        assert_eq!(outcome, ResolveOutcome { resolved: 0, unresolved: 1, cancelled: true });
    }

    #[tokio::test]
    async fn unresolved_workers_are_retried_as_a_batch() {
        let addresses = ProgramAddresses::new(Pubkey::new_unique());
        let network = Arc::new(FakeNetwork::new());
        let up = worker(&addresses, "up");
        let flaky = worker(&addresses, "flaky");
        network.on_get(&up.uri, 200, document(&up, "up"));
        network.on(
            Method::Get,
            &flaky.uri,
            vec![
                Err(NetworkError::Timeout(Duration::from_secs(1))),
                Ok((503, json!(null))),
                Ok((200, document(&flaky, "flaky"))),
            ],
        );

        let d = discovery(network.clone(), addresses, Duration::from_millis(5));
        let mut resolved = 0;
        let outcome = d
            .resolve(
                vec![up.registration.clone(), flaky.registration.clone()],
                2,
                |_| resolved += 1,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(outcome.resolved, 2);
        assert_eq!(resolved, 2);
        assert_eq!(network.calls(Method::Get, &up.uri).len(), 1);
        assert_eq!(network.calls(Method::Get, &flaky.uri).len(), 3);
    }

    #[tokio::test]
    async fn cancellation_keeps_partial_results() {
        let addresses = ProgramAddresses::new(Pubkey::new_unique());
        let network = Arc::new(FakeNetwork::new());
        let good = worker(&addresses, "good");
        let dead = worker(&addresses, "dead");
        network.on_get(&good.uri, 200, document(&good, "good"));

        let d = discovery(network, addresses, Duration::from_secs(3600));
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            stop.cancel();
        });

        let started = std::time::Instant::now();
        let mut resolved = Vec::new();
        let outcome = d
            .resolve(
                vec![good.registration.clone(), dead.registration],
                9,
                |r| resolved.push(r.document.worker.address),
                &cancel,
            )
            .await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(outcome, ResolveOutcome { resolved: 1, unresolved: 1, cancelled: true });
        assert_eq!(resolved, vec![good.address.to_string()]);
    }

    #[test]
    fn assignment_filter_matches_brand() {
        let addresses = ProgramAddresses::new(Pubkey::new_unique());
        let workers: Vec<WorkerRegistration> =
            (0..40).map(|i| worker(&addresses, &format!("w{i}")).registration).collect();
        let population = 2_000;
        let period = 12;
        let assigned = assigned_workers(workers.clone(), 77, period, population).unwrap();
        for w in &workers {
            let expected = depin_protocol::is_eligible(77, w.metadata.license.as_ref(), period, population).unwrap();
            assert_eq!(assigned.contains(w), expected);
        }
        // Small populations assign every checker to every worker.
        assert_eq!(assigned_workers(workers.clone(), 3, period, 10).unwrap().len(), 40);
        assert!(assigned_workers(workers, 3, period, 0).is_err());
    }
}
