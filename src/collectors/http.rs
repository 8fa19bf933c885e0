//! Shared HTTP plumbing for collectors.
//!
//! - `HttpClient`: thin wrapper over a pooled `reqwest::Client` with a
//!   per-source timeout and default headers; offers JSON, text and bytes
//!   GETs with a closed error taxonomy.
//! - `retry_with_backoff`: exponential-backoff retry over any async
//!   operation returning `CollectError`.
//! - `RateLimiter`: per-source minimum inter-request interval, safe to
//!   share across concurrent requests.
//! - `CircuitBreaker`: per (source, kind) CLOSED → OPEN → HALF_OPEN state
//!   machine with a sliding failure window and cooldown.

use std::future::Future;
use std::time::Duration;

use reqwest::header::HeaderMap;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::errors::CollectError;

/// Default retry attempts on top of the initial call.
pub const MAX_RETRIES: u32 = 3;
/// Initial backoff delay.
pub const BASE_DELAY: Duration = Duration::from_secs(1);
/// Backoff delay ceiling.
pub const MAX_DELAY: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

/// Async HTTP client with timeout and error conversion.
///
/// Owns the underlying connection pool; dropping the client releases it.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(timeout: Duration, default_headers: HeaderMap) -> Result<Self, CollectError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(default_headers)
            .build()
            .map_err(|e| CollectError::Http {
                status: None,
                url: String::new(),
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }

    async fn get_checked(&self, url: &str) -> Result<reqwest::Response, CollectError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CollectError::Http {
                status: None,
                url: url.to_string(),
                message: format!("request failed: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(CollectError::Http {
                status: Some(status.as_u16()),
                url: url.to_string(),
                message: format!("unexpected status {status}"),
            });
        }
        Ok(response)
    }

    /// GET a URL and decode the body as JSON.
    pub async fn get_json(&self, url: &str) -> Result<serde_json::Value, CollectError> {
        let response = self.get_checked(url).await?;
        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| CollectError::Parse(format!("invalid JSON from {url}: {e}")))
    }

    /// GET a URL and return the body as text.
    pub async fn get_text(&self, url: &str) -> Result<String, CollectError> {
        let response = self.get_checked(url).await?;
        response.text().await.map_err(|e| CollectError::Http {
            status: None,
            url: url.to_string(),
            message: format!("failed to read body: {e}"),
        })
    }

    /// GET a URL and return the raw body bytes (GRIB2 downloads).
    pub async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, CollectError> {
        let response = self.get_checked(url).await?;
        let bytes = response.bytes().await.map_err(|e| CollectError::Http {
            status: None,
            url: url.to_string(),
            message: format!("failed to read body: {e}"),
        })?;
        Ok(bytes.to_vec())
    }
}

// ---------------------------------------------------------------------------
// Retry with exponential backoff
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            base_delay: BASE_DELAY,
            max_delay: MAX_DELAY,
        }
    }
}

/// Run `op` up to `1 + max_retries` times with exponential backoff
/// (base·2^k capped at max_delay). On exhaustion returns `RetryExhausted`
/// carrying the last error.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, CollectError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CollectError>>,
{
    let attempts = policy.max_retries + 1;
    let mut delay = policy.base_delay;
    let mut last: Option<CollectError> = None;

    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt < attempts {
                    tracing::warn!(
                        "Attempt {}/{} failed for {}: {}. Retrying in {:.1}s",
                        attempt,
                        attempts,
                        label,
                        e,
                        delay.as_secs_f64(),
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(policy.max_delay);
                } else {
                    tracing::error!("All {} attempts failed for {}: {}", attempts, label, e);
                }
                last = Some(e);
            }
        }
    }

    Err(CollectError::RetryExhausted {
        attempts,
        // op ran at least once, so a last error exists
        last: Box::new(last.unwrap_or(CollectError::Parse("no attempt recorded".into()))),
    })
}

// ---------------------------------------------------------------------------
// Per-source rate limiter
// ---------------------------------------------------------------------------

/// Enforces a minimum interval between requests to one source.
///
/// The mutex is held across the sleep so concurrent callers queue up and
/// each departure is spaced by at least `min_interval` on the monotonic
/// clock.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    /// Wait until the next request may be dispatched.
    pub async fn acquire(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                let wait = self.min_interval - elapsed;
                tracing::debug!(
                    "Rate limiting: waiting {:.2}s before next request",
                    wait.as_secs_f64()
                );
                tokio::time::sleep(wait).await;
            }
        }
        *last = Some(Instant::now());
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Status snapshot for observability.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStatus {
    pub state: CircuitState,
    pub recent_failures: usize,
    pub last_transition: Option<Instant>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    /// Failure instants within the sliding window.
    failures: Vec<Instant>,
    opened_at: Option<Instant>,
    last_transition: Option<Instant>,
}

/// Per-(source, kind) circuit breaker.
///
/// CLOSED: failures are counted in a sliding window; reaching
/// `failure_threshold` opens the circuit. OPEN: calls fail fast until
/// `cooldown` elapses, then the first caller is let through in HALF_OPEN.
/// HALF_OPEN: success closes the circuit and resets counters; failure
/// re-opens it with a fresh cooldown.
#[derive(Debug)]
pub struct CircuitBreaker {
    source: &'static str,
    failure_threshold: usize,
    window: Duration,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(
        source: &'static str,
        failure_threshold: usize,
        window: Duration,
        cooldown: Duration,
    ) -> Self {
        Self {
            source,
            failure_threshold,
            window,
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: Vec::new(),
                opened_at: None,
                last_transition: None,
            }),
        }
    }

    /// Breaker with the defaults used by all collectors: 5 failures in
    /// 5 minutes opens it; 60 s cooldown before a probe.
    pub fn with_defaults(source: &'static str) -> Self {
        Self::new(
            source,
            5,
            Duration::from_secs(300),
            Duration::from_secs(60),
        )
    }

    /// Gate a call: `Ok` means proceed (CLOSED, or the HALF_OPEN probe),
    /// `Err(CircuitOpen)` means fail fast.
    pub async fn check(&self) -> Result<(), CollectError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.cooldown {
                    inner.state = CircuitState::HalfOpen;
                    inner.last_transition = Some(Instant::now());
                    tracing::info!("Circuit for {} entering half-open probe", self.source);
                    Ok(())
                } else {
                    Err(CollectError::CircuitOpen {
                        source_name: self.source,
                    })
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != CircuitState::Closed {
            tracing::info!("Circuit for {} closed after successful probe", self.source);
            inner.last_transition = Some(Instant::now());
        }
        inner.state = CircuitState::Closed;
        inner.failures.clear();
        inner.opened_at = None;
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        match inner.state {
            CircuitState::HalfOpen => {
                // Probe failed: back to OPEN with a fresh cooldown
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.last_transition = Some(now);
                tracing::warn!("Circuit for {} re-opened after failed probe", self.source);
            }
            CircuitState::Closed => {
                inner.failures.push(now);
                // Sweep entries that fell out of the sliding window
                let window = self.window;
                inner.failures.retain(|t| now.duration_since(*t) <= window);

                if inner.failures.len() >= self.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    inner.last_transition = Some(now);
                    tracing::warn!(
                        "Circuit for {} opened after {} failures in window",
                        self.source,
                        inner.failures.len(),
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    pub async fn status(&self) -> CircuitBreakerStatus {
        let inner = self.inner.lock().await;
        CircuitBreakerStatus {
            state: inner.state,
            recent_failures: inner.failures.len(),
            last_transition: inner.last_transition,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn plain_client() -> HttpClient {
        HttpClient::new(Duration::from_secs(5), HeaderMap::new()).unwrap()
    }

    #[tokio::test]
    async fn test_get_json_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "ok",
                "value": 42
            })))
            .mount(&server)
            .await;

        let client = plain_client();
        let body = client
            .get_json(&format!("{}/data", server.uri()))
            .await
            .unwrap();
        assert_eq!(body["value"], 42);
    }

    #[tokio::test]
    async fn test_get_json_http_error_carries_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = plain_client();
        let err = client
            .get_json(&format!("{}/missing", server.uri()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(404));
    }

    #[tokio::test]
    async fn test_get_json_invalid_body_is_parse_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/garbage"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let client = plain_client();
        let err = client
            .get_json(&format!("{}/garbage", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, CollectError::Parse(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_get_text_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>Vitesse</html>"))
            .mount(&server)
            .await;

        let client = plain_client();
        let body = client
            .get_text(&format!("{}/page", server.uri()))
            .await
            .unwrap();
        assert!(body.contains("Vitesse"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(RetryPolicy::default(), "test-op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(CollectError::Parse("transient".into()))
                } else {
                    Ok(7u32)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_carries_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(RetryPolicy::default(), "test-op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CollectError::Parse("always broken".into())) }
        })
        .await;

        // 1 initial + 3 retries
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result.unwrap_err() {
            CollectError::RetryExhausted { attempts, last } => {
                assert_eq!(attempts, 4);
                assert!(matches!(*last, CollectError::Parse(_)));
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_spaces_requests() {
        let limiter = RateLimiter::new(Duration::from_millis(1200));

        let t0 = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        let elapsed = t0.elapsed();

        // Two enforced gaps of 1.2 s each
        assert!(
            elapsed >= Duration::from_millis(2400),
            "requests not spaced: {elapsed:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_opens_after_threshold() {
        let breaker = CircuitBreaker::new(
            "test",
            3,
            Duration::from_secs(300),
            Duration::from_secs(60),
        );

        for _ in 0..3 {
            breaker.check().await.unwrap();
            breaker.record_failure().await;
        }

        let err = breaker.check().await.unwrap_err();
        assert!(matches!(err, CollectError::CircuitOpen { .. }));
        assert_eq!(breaker.status().await.state, CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_half_open_probe_closes_on_success() {
        let breaker =
            CircuitBreaker::new("test", 1, Duration::from_secs(300), Duration::from_secs(60));

        breaker.record_failure().await;
        assert!(breaker.check().await.is_err(), "should be open");

        tokio::time::advance(Duration::from_secs(61)).await;

        // First call after cooldown is the half-open probe
        breaker.check().await.unwrap();
        assert_eq!(breaker.status().await.state, CircuitState::HalfOpen);

        breaker.record_success().await;
        assert_eq!(breaker.status().await.state, CircuitState::Closed);
        assert_eq!(breaker.status().await.recent_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_failed_probe_renews_cooldown() {
        let breaker =
            CircuitBreaker::new("test", 1, Duration::from_secs(300), Duration::from_secs(60));

        breaker.record_failure().await;
        tokio::time::advance(Duration::from_secs(61)).await;
        breaker.check().await.unwrap(); // half-open probe
        breaker.record_failure().await; // probe fails

        assert_eq!(breaker.status().await.state, CircuitState::Open);
        // Cooldown renewed: still failing fast shortly after
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.check().await.is_err());
        // But open again for probing after the full cooldown
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(breaker.check().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_window_sweeps_stale_failures() {
        let breaker =
            CircuitBreaker::new("test", 3, Duration::from_secs(10), Duration::from_secs(60));

        breaker.record_failure().await;
        breaker.record_failure().await;
        // Let both failures fall out of the window
        tokio::time::advance(Duration::from_secs(11)).await;
        breaker.record_failure().await;

        // Only one failure inside the window: still closed
        assert_eq!(breaker.status().await.state, CircuitState::Closed);
        assert_eq!(breaker.status().await.recent_failures, 1);
    }
}
