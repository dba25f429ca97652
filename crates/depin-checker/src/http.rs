//! Outbound HTTP for discovery fetches, health probes and attestations.
//!
//! Everything goes through `NetworkClient` so sessions and discovery can be
//! driven by an in-memory fake. `Limited` caps in-flight calls across every
//! session that shares it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
    /// Request round trip, excluding time spent waiting for a permit.
    pub elapsed: Duration,
}

impl HttpResponse {
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, NetworkError> {
        serde_json::from_slice(&self.body).map_err(|e| NetworkError::Decode(e.to_string()))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NetworkError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("request cancelled")]
    Cancelled,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid response body: {0}")]
    Decode(String),
}

#[async_trait]
pub trait NetworkClient: Send + Sync {
    async fn get(
        &self,
        uri: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, NetworkError>;

    async fn post(
        &self,
        uri: &str,
        body: &serde_json::Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, NetworkError>;
}

// ============================================================================
// reqwest
// ============================================================================

/// Keep-alive connection pool shared by every session of one period.
pub struct PooledHttp {
    client: reqwest::Client,
}

impl PooledHttp {
    pub fn new() -> Result<Self, NetworkError> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(8)
            .tcp_keepalive(Duration::from_secs(10))
            .build()
            .map_err(|e| NetworkError::Transport(e.to_string()))?;
        Ok(Self { client })
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, NetworkError> {
        let exchange = async {
            let started = Instant::now();
            let response = request
                .timeout(timeout)
                .send()
                .await
                .map_err(|e| classify(e, timeout))?;
            let status = response.status().as_u16();
            let body = response.bytes().await.map_err(|e| classify(e, timeout))?;
            Ok(HttpResponse {
                status,
                body: body.to_vec(),
                elapsed: started.elapsed(),
            })
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(NetworkError::Cancelled),
            result = exchange => result,
        }
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> NetworkError {
    if err.is_timeout() {
        NetworkError::Timeout(timeout)
    } else {
        NetworkError::Transport(err.to_string())
    }
}

#[async_trait]
impl NetworkClient for PooledHttp {
    async fn get(
        &self,
        uri: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, NetworkError> {
        self.send(self.client.get(uri), timeout, cancel).await
    }

    async fn post(
        &self,
        uri: &str,
        body: &serde_json::Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, NetworkError> {
        self.send(self.client.post(uri).json(body), timeout, cancel).await
    }
}

// ============================================================================
// Concurrency limiter
// ============================================================================

/// Bounds the number of in-flight calls made through `inner`.
pub struct Limited<C> {
    inner: C,
    permits: Arc<Semaphore>,
}

impl<C: NetworkClient> Limited<C> {
    pub fn new(inner: C, max_in_flight: usize) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<tokio::sync::SemaphorePermit<'_>, NetworkError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(NetworkError::Cancelled),
            permit = self.permits.acquire() => {
                permit.map_err(|_| NetworkError::Transport("limiter closed".into()))
            }
        }
    }
}

#[async_trait]
impl<C: NetworkClient> NetworkClient for Limited<C> {
    async fn get(
        &self,
        uri: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, NetworkError> {
        let _permit = self.acquire(cancel).await?;
        self.inner.get(uri, timeout, cancel).await
    }

    async fn post(
        &self,
        uri: &str,
        body: &serde_json::Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, NetworkError> {
        let _permit = self.acquire(cancel).await?;
        self.inner.post(uri, body, timeout, cancel).await
    }
}

// ============================================================================
// Test double
// ============================================================================


#[cfg(test)]
mod tests {
    use super::fake::FakeNetwork;
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records the peak number of concurrent calls.
    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl NetworkClient for Gauge {
        async fn get(
            &self,
            _uri: &str,
            _timeout: Duration,
            _cancel: &CancellationToken,
        ) -> Result<HttpResponse, NetworkError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(15)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(HttpResponse { status: 200, body: Vec::new(), elapsed: Duration::ZERO })
        }

        async fn post(
            &self,
            uri: &str,
            _body: &serde_json::Value,
            timeout: Duration,
            cancel: &CancellationToken,
        ) -> Result<HttpResponse, NetworkError> {
            self.get(uri, timeout, cancel).await
        }
    }

    #[tokio::test]
    async fn limiter_caps_in_flight_calls() {
        let limited = Arc::new(Limited::new(
            Gauge { current: AtomicUsize::new(0), peak: AtomicUsize::new(0) },
            3,
        ));
        let cancel = CancellationToken::new();
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..12 {
            let limited = limited.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                limited.get(&format!("http://w{i}"), Duration::from_secs(1), &cancel).await
            });
        }
        while let Some(done) = tasks.join_next().await {
            assert!(done.unwrap().unwrap().is_ok());
        }
        let peak = limited.inner.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak {peak}");
        assert!(peak >= 2);
    }

    #[tokio::test]
    async fn cancel_while_waiting_for_permit() {
        let limited = Arc::new(Limited::new(
            FakeNetwork::with_latency(Duration::from_secs(60)),
            1,
        ));
        let busy = CancellationToken::new();
        let holder = {
            let limited = limited.clone();
            let busy = busy.clone();
            tokio::spawn(async move { limited.get("http://slow", Duration::from_secs(1), &busy).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let waiting = CancellationToken::new();
        waiting.cancel();
        let err = limited
            .get("http://other", Duration::from_secs(1), &waiting)
            .await
            .unwrap_err();
        assert_eq!(err, NetworkError::Cancelled);

        busy.cancel();
        assert_eq!(holder.await.unwrap().unwrap_err(), NetworkError::Cancelled);
    }

    #[test]
    fn json_body_decoding() {
        let response = HttpResponse {
            status: 200,
            body: br#"{"a":1}"#.to_vec(),
            elapsed: Duration::ZERO,
        };
        let v: serde_json::Value = response.json().unwrap();
        assert_eq!(v["a"], 1);
        let bad = HttpResponse { body: b"nope".to_vec(), ..response };
        assert!(matches!(bad.json::<serde_json::Value>(), Err(NetworkError::Decode(_))));
    }
}
