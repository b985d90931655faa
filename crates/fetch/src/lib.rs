//! HTTP Fetcher and DLQ Router (`spec.md` §4.8): one request, error
//! classification, bounded retry with exponential backoff, and a
//! structured dead-letter sink for terminal failures.

use std::time::Duration;

use async_trait::async_trait;

use connect_core::auth::{Authenticator, OutboundRequest};
use connect_core::error::{ConnectError, ErrorClass};
use connect_core::model::{HttpMethod, RetryConfig};

/// One fully-formed request ready to dispatch. Distinct from
/// `connect_core::auth::OutboundRequest` — that one is mutated in
/// place by the authenticator before it becomes this.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub endpoint_id: String,
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub connection_timeout: Duration,
    pub request_timeout: Duration,
}

/// Raw outcome of one HTTP attempt, before classification.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub status: Option<u16>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub duration: Duration,
    pub transport_error: Option<String>,
}

impl FetchResult {
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("retry-after"))
            .and_then(|(_, v)| v.parse::<u64>().ok())
    }
}

/// Seam over the raw network call, so the retry loop is testable
/// without a live HTTP client (`spec.md` §9: suspension, not callbacks
/// — the production impl is `HttpFetcher`, tests substitute a fake).
#[async_trait]
pub trait RawFetch: Send + Sync {
    async fn fetch_once(&self, request: &FetchRequest) -> FetchResult;
}

/// Production implementation backed by `reqwest`.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

fn to_reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Delete => reqwest::Method::DELETE,
        HttpMethod::Patch => reqwest::Method::PATCH,
    }
}

#[async_trait]
impl RawFetch for HttpFetcher {
    async fn fetch_once(&self, request: &FetchRequest) -> FetchResult {
        let started = std::time::Instant::now();

        let mut builder = self
            .client
            .request(to_reqwest_method(request.method), &request.url)
            .timeout(request.request_timeout);
        for (k, v) in &request.headers {
            builder = builder.header(k.as_str(), v.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        match builder.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let headers = response
                    .headers()
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
                    .collect();
                let body = response.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
                FetchResult {
                    status: Some(status),
                    headers,
                    body,
                    duration: started.elapsed(),
                    transport_error: None,
                }
            }
            Err(err) => FetchResult {
                status: None,
                headers: Vec::new(),
                body: Vec::new(),
                duration: started.elapsed(),
                transport_error: Some(err.to_string()),
            },
        }
    }
}

/// Classify a raw result against the per-endpoint retry configuration.
/// `Ok(())` means success (2xx, or 304 — conditional revalidation is
/// the cache layer's concern, not an error here).
pub fn classify(endpoint_id: &str, result: &FetchResult, retry: &RetryConfig) -> Result<(), ConnectError> {
    if let Some(message) = &result.transport_error {
        return Err(ConnectError::Transport { endpoint_id: endpoint_id.to_string(), message: message.clone() });
    }
    let status = result.status.expect("status present when no transport_error");
    if status == 304 || (200..300).contains(&status) {
        return Ok(());
    }
    if status == 429 {
        return Err(ConnectError::Throttled {
            endpoint_id: endpoint_id.to_string(),
            retry_after_secs: result.retry_after_secs(),
        });
    }
    if retry.non_retryable_codes.contains(&status) {
        return Err(ConnectError::ClientPermanent { endpoint_id: endpoint_id.to_string(), status });
    }
    if retry.retryable_codes.contains(&status) || (500..600).contains(&status) {
        return Err(ConnectError::ServerTransient { endpoint_id: endpoint_id.to_string(), status });
    }
    Err(ConnectError::ClientPermanent { endpoint_id: endpoint_id.to_string(), status })
}

fn backoff_for(attempt: u32, retry: &RetryConfig) -> Duration {
    let exp = retry.base_backoff_ms.saturating_mul(1u64 << attempt.min(32));
    let capped = exp.min(retry.max_backoff_ms);
    if retry.jitter && capped > 0 {
        let jittered = rand::random::<f64>() * capped as f64;
        Duration::from_millis(jittered as u64)
    } else {
        Duration::from_millis(capped)
    }
}

/// Dispatch with retry: up to `retry.max_attempts` attempts (or a
/// single attempt when `retry.enabled == false`), backing off
/// `base * 2^attempt` capped at `max_backoff_ms`, optionally jittered.
/// A `401` is special-cased regardless of `retry.enabled` or whether
/// it is in `non_retryable_codes`: it gives the authenticator one
/// chance to force a token refresh (`Authenticator::on_unauthorized`)
/// and re-sign the request before a single extra attempt, rather than
/// failing permanently on a merely expired token.
/// Returns the last successful `FetchResult`, or `RetriesExhausted`
/// once the budget runs out.
pub async fn fetch_with_retry(
    raw: &dyn RawFetch,
    request: &FetchRequest,
    retry: &RetryConfig,
    authenticator: &dyn Authenticator,
) -> Result<FetchResult, ConnectError> {
    let max_attempts = if retry.enabled { retry.max_attempts.max(1) } else { 1 };
    let mut last_err: Option<ConnectError> = None;
    let mut attempts_made = 0u32;
    let mut current = request.clone();
    let mut refreshed_on_401 = false;
    let mut attempt = 0u32;

    loop {
        attempts_made = attempt + 1;
        let result = raw.fetch_once(&current).await;
        match classify(&current.endpoint_id, &result, retry) {
            Ok(()) => return Ok(result),
            Err(err) => {
                if result.status == Some(401) && !refreshed_on_401 {
                    refreshed_on_401 = true;
                    tracing::debug!(endpoint_id = %current.endpoint_id, "401 observed, forcing auth refresh before one retry");
                    authenticator.on_unauthorized().await;
                    let mut outbound =
                        OutboundRequest { url: current.url.clone(), headers: current.headers.clone(), query_params: Vec::new() };
                    if authenticator.authenticate(&mut outbound).await.is_ok() {
                        current.url = outbound.url;
                        current.headers = outbound.headers;
                    }
                    last_err = Some(err);
                    attempt += 1;
                    continue;
                }

                // Non-retryable classes (Config, ClientPermanent, BreakerOpen)
                // are returned as-is so the caller sees the real class —
                // wrapping them in `RetriesExhausted` would lose the signal
                // the breaker needs to open immediately.
                if !err.class().is_retryable() {
                    return Err(err);
                }
                let is_last = attempt + 1 == max_attempts;
                if is_last {
                    last_err = Some(err);
                    break;
                }
                tracing::debug!(
                    endpoint_id = %current.endpoint_id,
                    attempt,
                    error = %err,
                    "retrying after classified failure"
                );
                let delay = match (&err, result.retry_after_secs()) {
                    (ConnectError::Throttled { .. }, Some(secs)) => Duration::from_secs(secs),
                    _ => backoff_for(attempt, retry),
                };
                tokio::time::sleep(delay).await;
                last_err = Some(err);
                attempt += 1;
            }
        }
    }

    Err(ConnectError::RetriesExhausted {
        endpoint_id: request.endpoint_id.clone(),
        attempts: attempts_made,
        last_error: last_err.map(|e| e.to_string()).unwrap_or_default(),
    })
}

/// One structured dead-letter event (`spec.md` §4.8/§7).
#[derive(Debug, Clone)]
pub struct DlqEvent {
    pub endpoint_id: String,
    pub effective_url: String,
    pub offset_snapshot: serde_json::Value,
    pub status: Option<u16>,
    pub body_excerpt: String,
    pub classification: ErrorClass,
    pub attempts: u32,
    pub last_error: String,
}

const BODY_EXCERPT_LEN: usize = 512;

impl DlqEvent {
    pub fn new(
        endpoint_id: &str,
        effective_url: &str,
        offset_snapshot: serde_json::Value,
        status: Option<u16>,
        body: &[u8],
        classification: ErrorClass,
        attempts: u32,
        last_error: &str,
    ) -> Self {
        let excerpt = String::from_utf8_lossy(body);
        let body_excerpt = excerpt.chars().take(BODY_EXCERPT_LEN).collect();
        Self {
            endpoint_id: endpoint_id.to_string(),
            effective_url: effective_url.to_string(),
            offset_snapshot,
            status,
            body_excerpt,
            classification,
            attempts,
            last_error: last_error.to_string(),
        }
    }
}

/// Collects DLQ events for the orchestrator to drain once per `poll()`
/// and hand to the host's configured `dlq_topic`. A worker-scoped
/// singleton, never process-global (`spec.md` §9).
#[derive(Default)]
pub struct DlqRouter {
    events: std::sync::Mutex<Vec<DlqEvent>>,
}

impl DlqRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self, event: DlqEvent) {
        tracing::warn!(
            endpoint_id = %event.endpoint_id,
            status = ?event.status,
            attempts = event.attempts,
            "routing terminal failure to DLQ"
        );
        self.events.lock().unwrap().push(event);
    }

    pub fn drain(&self) -> Vec<DlqEvent> {
        std::mem::take(&mut self.events.lock().unwrap())
    }

    pub fn pending_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use connect_core::auth::{AuthError, NoopAuthenticator};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Counts refresh calls and signs each retry with an incrementing
    /// token, so a test can tell whether `fetch_with_retry` actually
    /// re-authenticated after a 401 rather than replaying stale headers.
    struct RefreshingAuth {
        refreshes: AtomicUsize,
    }

    impl RefreshingAuth {
        fn new() -> Self {
            Self { refreshes: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl Authenticator for RefreshingAuth {
        async fn authenticate(&self, request: &mut OutboundRequest) -> Result<(), AuthError> {
            let token = self.refreshes.load(Ordering::SeqCst);
            request.headers.retain(|(k, _)| k != "authorization");
            request.headers.push(("authorization".to_string(), format!("Bearer tok-{token}")));
            Ok(())
        }

        async fn on_unauthorized(&self) {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct ScriptedFetch {
        results: StdMutex<Vec<FetchResult>>,
        calls: AtomicUsize,
    }

    impl ScriptedFetch {
        fn new(results: Vec<FetchResult>) -> Self {
            Self { results: StdMutex::new(results), calls: AtomicUsize::new(0) }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RawFetch for ScriptedFetch {
        async fn fetch_once(&self, _request: &FetchRequest) -> FetchResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut results = self.results.lock().unwrap();
            if results.len() > 1 {
                results.remove(0)
            } else {
                results[0].clone()
            }
        }
    }

    fn ok_result(status: u16) -> FetchResult {
        FetchResult { status: Some(status), headers: Vec::new(), body: b"{}".to_vec(), duration: Duration::ZERO, transport_error: None }
    }

    fn request() -> FetchRequest {
        FetchRequest {
            endpoint_id: "api1".into(),
            method: HttpMethod::Get,
            url: "https://example.invalid/things".into(),
            headers: Vec::new(),
            body: None,
            connection_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(1),
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            enabled: true,
            max_attempts: 3,
            base_backoff_ms: 1,
            max_backoff_ms: 5,
            jitter: false,
            retryable_codes: vec![429, 500, 502, 503, 504],
            non_retryable_codes: vec![400, 401, 403, 404, 422],
            dlq_enabled: false,
            dlq_topic: None,
        }
    }

    #[test]
    fn classifies_success_and_statuses() {
        let retry = fast_retry();
        assert!(classify("api1", &ok_result(200), &retry).is_ok());
        assert!(classify("api1", &ok_result(304), &retry).is_ok());

        let err = classify("api1", &ok_result(500), &retry).unwrap_err();
        assert_eq!(err.class(), ErrorClass::ServerTransient);

        let err = classify("api1", &ok_result(404), &retry).unwrap_err();
        assert_eq!(err.class(), ErrorClass::ClientPermanent);

        let err = classify("api1", &ok_result(429), &retry).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Throttled);
    }

    #[test]
    fn transport_error_classifies_as_transport() {
        let retry = fast_retry();
        let result = FetchResult { status: None, headers: vec![], body: vec![], duration: Duration::ZERO, transport_error: Some("connection refused".into()) };
        let err = classify("api1", &result, &retry).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Transport);
    }

    #[tokio::test]
    async fn retries_server_transient_then_succeeds() {
        let fake = ScriptedFetch::new(vec![ok_result(503), ok_result(503), ok_result(200)]);
        let result = fetch_with_retry(&fake, &request(), &fast_retry(), &NoopAuthenticator).await.unwrap();
        assert_eq!(result.status, Some(200));
        assert_eq!(fake.call_count(), 3);
    }

    #[tokio::test]
    async fn exhausts_budget_and_returns_retries_exhausted() {
        let fake = ScriptedFetch::new(vec![ok_result(503)]);
        let err = fetch_with_retry(&fake, &request(), &fast_retry(), &NoopAuthenticator).await.unwrap_err();
        match err {
            ConnectError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
        assert_eq!(fake.call_count(), 3);
    }

    #[tokio::test]
    async fn non_retryable_status_fails_on_first_attempt_with_original_class() {
        let fake = ScriptedFetch::new(vec![ok_result(404)]);
        let err = fetch_with_retry(&fake, &request(), &fast_retry(), &NoopAuthenticator).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::ClientPermanent);
        assert_eq!(fake.call_count(), 1);
    }

    #[tokio::test]
    async fn disabled_retry_makes_exactly_one_attempt() {
        let mut retry = fast_retry();
        retry.enabled = false;
        let fake = ScriptedFetch::new(vec![ok_result(503)]);
        let _ = fetch_with_retry(&fake, &request(), &retry, &NoopAuthenticator).await;
        assert_eq!(fake.call_count(), 1);
    }

    #[tokio::test]
    async fn unauthorized_triggers_refresh_and_one_extra_retry() {
        let fake = ScriptedFetch::new(vec![ok_result(401), ok_result(200)]);
        let auth = RefreshingAuth::new();
        let result = fetch_with_retry(&fake, &request(), &fast_retry(), &auth).await.unwrap();
        assert_eq!(result.status, Some(200));
        assert_eq!(fake.call_count(), 2);
        assert_eq!(auth.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unauthorized_retry_is_not_repeated_on_persistent_401() {
        let mut retry = fast_retry();
        retry.enabled = false;
        let fake = ScriptedFetch::new(vec![ok_result(401)]);
        let auth = RefreshingAuth::new();
        let err = fetch_with_retry(&fake, &request(), &retry, &auth).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::ClientPermanent);
        // one original attempt plus the single 401-triggered retry, never more
        assert_eq!(fake.call_count(), 2);
        assert_eq!(auth.refreshes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dlq_router_collects_and_drains() {
        let router = DlqRouter::new();
        router.route(DlqEvent::new("api1", "https://x/y", serde_json::json!({"offset": 1}), Some(500), b"oops", ErrorClass::ServerTransient, 3, "server error"));
        assert_eq!(router.pending_count(), 1);
        let drained = router.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].endpoint_id, "api1");
        assert_eq!(router.pending_count(), 0);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = RetryConfig { jitter: false, base_backoff_ms: 100, max_backoff_ms: 300, ..fast_retry() };
        assert_eq!(backoff_for(0, &retry), Duration::from_millis(100));
        assert_eq!(backoff_for(1, &retry), Duration::from_millis(200));
        assert_eq!(backoff_for(2, &retry), Duration::from_millis(300));
    }
}
