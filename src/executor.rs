use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method, Request, Response, Uri};
use serde_json::Value;
use tokio::time::sleep;
use tracing::{Instrument, debug, info_span, warn};

use crate::cache_control::{CacheDefaults, CacheHint};
use crate::cancel::{AttemptCancellation, CancelReason, CancelSignal};
use crate::config::ClientConfig;
use crate::error::{Error, ErrorKind, TransportErrorKind};
use crate::metrics::{ExecutorMetrics, MetricsSnapshot};
use crate::retry::{RetryPolicy, RetryState};
use crate::transport::{Transport, TransportError};
use crate::util::{merge_headers, redact_uri_for_logs, resolve_uri};

const MIN_TIMEOUT: Duration = Duration::from_millis(1);

/// One logical call.
///
/// Built once and never mutated by the executor; every attempt derives a
/// fresh transport request from it.
#[derive(Clone, Debug)]
pub struct RequestSpec {
    pub(crate) service: Option<Arc<str>>,
    pub(crate) method: Method,
    pub(crate) base_url: Arc<str>,
    pub(crate) path: String,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Option<Bytes>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) max_attempts: Option<usize>,
    pub(crate) retry_delay: Option<Duration>,
    pub(crate) cancel: Option<CancelSignal>,
}

impl RequestSpec {
    pub fn new(method: Method, base_url: impl Into<Arc<str>>, path: impl Into<String>) -> Self {
        Self {
            service: None,
            method,
            base_url: base_url.into(),
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
            max_attempts: None,
            retry_delay: None,
            cancel: None,
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.max(MIN_TIMEOUT));
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = Some(retry_delay);
        self
    }

    pub fn with_cancel_signal(mut self, cancel: CancelSignal) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn max_attempts(&self) -> Option<usize> {
        self.max_attempts
    }

    pub fn retry_delay(&self) -> Option<Duration> {
        self.retry_delay
    }

    pub fn cancel_signal(&self) -> Option<&CancelSignal> {
        self.cancel.as_ref()
    }
}

#[derive(Debug)]
struct PreparedRequest {
    method: Method,
    uri: Uri,
    redacted_uri: String,
    headers: HeaderMap,
    body: Bytes,
}

impl PreparedRequest {
    fn to_transport_request(&self) -> Request<Bytes> {
        let mut request = Request::new(self.body.clone());
        *request.method_mut() = self.method.clone();
        *request.uri_mut() = self.uri.clone();
        *request.headers_mut() = self.headers.clone();
        request
    }
}

#[derive(Debug)]
enum AttemptOutcome {
    Success(Response<Value>),
    Failure(Error),
}

enum NextStep {
    Retry(Duration),
    Fail(Error),
}

/// Runs logical calls: prepares the request, drives attempts under composed
/// cancellation, reconciles cache hints and loops through the retry policy.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    client_name: String,
    transport: Arc<dyn Transport>,
    cache_defaults: Arc<CacheDefaults>,
    default_headers: HeaderMap,
    request_timeout: Duration,
    retry_policy: RetryPolicy,
    metrics: ExecutorMetrics,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Executor")
            .field("client_name", &self.inner.client_name)
            .field("request_timeout", &self.inner.request_timeout)
            .field("retry_policy", &self.inner.retry_policy)
            .field("cache_defaults", &self.inner.cache_defaults)
            .finish_non_exhaustive()
    }
}

impl Executor {
    pub fn new(
        config: &ClientConfig,
        transport: Arc<dyn Transport>,
        cache_defaults: Arc<CacheDefaults>,
        default_headers: HeaderMap,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                client_name: config.client_name().to_owned(),
                transport,
                cache_defaults,
                default_headers,
                request_timeout: config.request_timeout(),
                retry_policy: config.retry_policy().clone(),
                metrics: ExecutorMetrics::default(),
            }),
        }
    }

    pub fn cache_defaults(&self) -> &Arc<CacheDefaults> {
        &self.inner.cache_defaults
    }

    pub fn request_timeout(&self) -> Duration {
        self.inner.request_timeout
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.retry_policy
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Runs one logical call and returns the parsed JSON body of the first
    /// successful attempt (`null` for an empty body).
    pub async fn execute(&self, spec: &RequestSpec) -> Result<Value, Error> {
        self.inner.metrics.record_request_started();
        let _in_flight = self.inner.metrics.enter_in_flight();
        let result = self.run(spec).await;
        self.inner.metrics.record_request_completed(&result);
        if let Err(error) = &result {
            warn!(
                client = %self.inner.client_name,
                kind = %error.kind(),
                status = error.status(),
                error = %error,
                "request failed"
            );
        }
        result
    }

    async fn run(&self, spec: &RequestSpec) -> Result<Value, Error> {
        let prepared = self.prepare(spec)?;
        let timeout = spec
            .timeout
            .unwrap_or(self.inner.request_timeout)
            .max(MIN_TIMEOUT);
        let policy = self
            .inner
            .retry_policy
            .with_overrides(spec.max_attempts, spec.retry_delay);
        let cancel = spec.cancel.as_ref();
        let mut state = RetryState::default();

        loop {
            let span = info_span!(
                "callwire.attempt",
                client = %self.inner.client_name,
                service = spec.service.as_deref().unwrap_or_default(),
                method = %prepared.method,
                uri = %prepared.redacted_uri,
                attempt = state.attempt(),
                max_attempts = policy.configured_max_attempts()
            );
            let outcome = self
                .attempt(&prepared, timeout, cancel)
                .instrument(span)
                .await;

            let error = match outcome {
                AttemptOutcome::Success(response) => {
                    debug!(
                        status = response.status().as_u16(),
                        attempt = state.attempt(),
                        "request succeeded"
                    );
                    return Ok(response.into_body());
                }
                AttemptOutcome::Failure(error) => error,
            };
            self.inner.metrics.record_attempt_error(&error);

            match next_step(&policy, &mut state, error, cancel, &prepared) {
                NextStep::Fail(error) => return Err(error),
                NextStep::Retry(delay) => {
                    self.inner.metrics.record_retry();
                    let Some(signal) = cancel else {
                        sleep(delay).await;
                        continue;
                    };
                    tokio::select! {
                        () = sleep(delay) => {}
                        () = signal.cancelled() => {
                            debug!(
                                last_error = ?state.last_error().map(ToString::to_string),
                                "call abandoned during retry backoff"
                            );
                            return Err(abandoned(signal, &prepared));
                        }
                    }
                }
            }
        }
    }

    fn prepare(&self, spec: &RequestSpec) -> Result<PreparedRequest, Error> {
        let (uri_text, uri) = resolve_uri(&spec.base_url, &spec.path, &spec.method)?;
        let headers = merge_headers([
            &json_default_headers(),
            &self.inner.default_headers,
            &spec.headers,
        ]);
        let body = match &spec.body {
            Some(body) if spec.method != Method::GET => body.clone(),
            _ => Bytes::new(),
        };
        Ok(PreparedRequest {
            method: spec.method.clone(),
            uri,
            redacted_uri: redact_uri_for_logs(&uri_text),
            headers,
            body,
        })
    }

    async fn attempt(
        &self,
        prepared: &PreparedRequest,
        timeout: Duration,
        cancel: Option<&CancelSignal>,
    ) -> AttemptOutcome {
        self.inner.metrics.record_attempt();
        let request = prepared.to_transport_request();
        let cancellation = AttemptCancellation::compose(timeout, cancel);

        debug!("sending request");
        let exchange = tokio::select! {
            biased;
            reason = cancellation.fired() => Err(reason),
            result = self.inner.transport.send(request) => Ok(result),
        };
        cancellation.release();

        let response = match exchange {
            Err(reason) => {
                return AttemptOutcome::Failure(Error::from_cancel_reason(
                    reason,
                    &prepared.method,
                    &prepared.redacted_uri,
                ));
            }
            Ok(Err(error)) => return AttemptOutcome::Failure(transport_failure(error, prepared)),
            Ok(Ok(response)) => response,
        };

        self.reconcile_cache_hint(response.headers());
        classify_response(response, prepared)
    }

    fn reconcile_cache_hint(&self, headers: &HeaderMap) {
        let Some(hint) = CacheHint::from_headers(headers) else {
            return;
        };
        if self.inner.cache_defaults.reconcile(hint) {
            self.inner.metrics.record_cache_reconfiguration();
        }
    }
}

fn next_step(
    policy: &RetryPolicy,
    state: &mut RetryState,
    error: Error,
    cancel: Option<&CancelSignal>,
    prepared: &PreparedRequest,
) -> NextStep {
    if !error.severity().is_retryable() {
        return NextStep::Fail(error);
    }
    if let Some(signal) = cancel.filter(|signal| signal.is_cancelled()) {
        if error.kind() == ErrorKind::Cancelled {
            return NextStep::Fail(error);
        }
        return NextStep::Fail(abandoned(signal, prepared));
    }

    let failed_attempt = state.attempt();
    if !policy.should_retry(failed_attempt + 1, &error) {
        return NextStep::Fail(Error::retries_exhausted(error));
    }

    let delay = policy.backoff_delay(failed_attempt);
    warn!(
        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        error = %error,
        "retrying request"
    );
    state.record_failure(error);
    NextStep::Retry(delay)
}

fn abandoned(signal: &CancelSignal, prepared: &PreparedRequest) -> Error {
    Error::from_cancel_reason(
        CancelReason::External(signal.reason_or_default()),
        &prepared.method,
        &prepared.redacted_uri,
    )
}

fn transport_failure(error: TransportError, prepared: &PreparedRequest) -> Error {
    let kind = error.kind();
    let source = error.into_source();
    Error::transport(
        kind,
        source.to_string(),
        &prepared.method,
        &prepared.redacted_uri,
        Some(source),
    )
}

fn classify_response(response: Response<Bytes>, prepared: &PreparedRequest) -> AttemptOutcome {
    let status = response.status();
    if !status.is_success() {
        return AttemptOutcome::Failure(Error::remote_rejected(
            status.as_u16(),
            response.body(),
            &prepared.method,
            &prepared.redacted_uri,
        ));
    }

    let (parts, body) = response.into_parts();
    match parse_json_body(&body) {
        Ok(value) => AttemptOutcome::Success(Response::from_parts(parts, value)),
        Err(source) => AttemptOutcome::Failure(Error::transport(
            TransportErrorKind::Decode,
            format!("failed to decode response json: {source}"),
            &prepared.method,
            &prepared.redacted_uri,
            Some(Box::new(source)),
        )),
    }
}

fn parse_json_body(body: &[u8]) -> Result<Value, serde_json::Error> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body)
}

fn json_default_headers() -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(2);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers
}
