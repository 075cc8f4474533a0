use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use callwire::{
    CacheHint, CancelSignal, ClientConfig, Environment, ErrorKind, Executor, MemoryResultCache,
    RequestSpec, ResultCache, RetryPolicy, ServiceClients, Transport, TransportError,
    TransportErrorKind,
};
use futures_util::future::BoxFuture;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method, Request, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::time::{Instant, sleep};

const BASE_URL: &str = "https://quotes.example.com/v1";

enum Reply {
    Response {
        status: u16,
        headers: Vec<(&'static str, &'static str)>,
        body: String,
    },
    Error(TransportErrorKind),
    Hang,
}

struct Step {
    delay: Duration,
    reply: Reply,
}

impl Step {
    fn respond(status: u16, body: &str) -> Self {
        Self::respond_with(status, Vec::new(), body)
    }

    fn respond_with(status: u16, headers: Vec<(&'static str, &'static str)>, body: &str) -> Self {
        Self {
            delay: Duration::ZERO,
            reply: Reply::Response {
                status,
                headers,
                body: body.to_owned(),
            },
        }
    }

    fn fail(kind: TransportErrorKind) -> Self {
        Self {
            delay: Duration::ZERO,
            reply: Reply::Error(kind),
        }
    }

    fn hang() -> Self {
        Self {
            delay: Duration::ZERO,
            reply: Reply::Hang,
        }
    }

    fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Clone, Debug)]
struct SeenRequest {
    method: Method,
    uri: String,
    headers: HeaderMap,
    body: Bytes,
    at: Instant,
}

#[derive(Default)]
struct ScriptedTransport {
    steps: Mutex<VecDeque<Step>>,
    seen: Mutex<Vec<SeenRequest>>,
}

impl ScriptedTransport {
    fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<SeenRequest> {
        self.seen.lock().expect("lock seen requests").clone()
    }

    fn request_count(&self) -> usize {
        self.seen.lock().expect("lock seen requests").len()
    }
}

impl Transport for ScriptedTransport {
    fn send(
        &self,
        request: Request<Bytes>,
    ) -> BoxFuture<'_, Result<Response<Bytes>, TransportError>> {
        let (parts, body) = request.into_parts();
        self.seen
            .lock()
            .expect("lock seen requests")
            .push(SeenRequest {
                method: parts.method,
                uri: parts.uri.to_string(),
                headers: parts.headers,
                body,
                at: Instant::now(),
            });
        let step = self.steps.lock().expect("lock steps").pop_front();

        Box::pin(async move {
            let Some(step) = step else {
                return Err(TransportError::new(
                    TransportErrorKind::Other,
                    "script exhausted",
                ));
            };
            if !step.delay.is_zero() {
                sleep(step.delay).await;
            }
            match step.reply {
                Reply::Response {
                    status,
                    headers,
                    body,
                } => {
                    let mut response = Response::builder().status(status);
                    for (name, value) in headers {
                        response = response.header(name, value);
                    }
                    Ok(response
                        .body(Bytes::from(body))
                        .expect("scripted response should build"))
                }
                Reply::Error(kind) => Err(TransportError::new(kind, format!("scripted {kind}"))),
                Reply::Hang => std::future::pending().await,
            }
        })
    }
}

fn clients(transport: Arc<ScriptedTransport>, policy: RetryPolicy) -> ServiceClients {
    let config = ClientConfig::new(Environment::Development)
        .with_service("quotes", BASE_URL)
        .with_retry_policy(policy);
    ServiceClients::builder(config)
        .transport(transport)
        .try_build()
        .expect("clients should build")
}

fn standard_policy() -> RetryPolicy {
    RetryPolicy::standard()
        .max_attempts(2)
        .base_delay(Duration::from_secs(1))
}

#[tokio::test(start_paused = true)]
async fn transport_failures_stop_after_max_attempts() {
    let transport = ScriptedTransport::new(vec![
        Step::fail(TransportErrorKind::Connect),
        Step::fail(TransportErrorKind::Connect),
        Step::fail(TransportErrorKind::Connect),
    ]);
    let clients = clients(transport.clone(), standard_policy());
    let quotes = clients.service("quotes").expect("quotes service");
    let started = Instant::now();

    let error = quotes
        .get("/quotes/ACME")
        .send()
        .await
        .expect_err("every attempt fails");

    assert_eq!(transport.request_count(), 2);
    assert_eq!(error.kind(), ErrorKind::TransportFailed);
    assert!(error.is_retries_exhausted());
    assert!(error.message().starts_with("network request failed"));
    assert_eq!(error.status(), 0);
    assert_eq!(
        error.last_error().and_then(|last| last.transport_cause()),
        Some(TransportErrorKind::Connect)
    );

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(1), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn service_unavailable_then_success_returns_second_body_and_applies_hint() {
    let transport = ScriptedTransport::new(vec![
        Step::respond(503, r#"{"message":"warming up"}"#),
        Step::respond_with(
            200,
            vec![("cache-control", "max-age=45, stale-while-revalidate=15")],
            r#"{"symbol":"ACME","price":12.5}"#,
        ),
    ]);
    let clients = clients(transport.clone(), standard_policy());
    let quotes = clients.service("quotes").expect("quotes service");

    let body = quotes
        .get("/quotes/ACME")
        .send()
        .await
        .expect("second attempt succeeds");

    assert_eq!(body, json!({"symbol": "ACME", "price": 12.5}));
    assert_eq!(transport.request_count(), 2);
    assert_eq!(
        clients.cache_defaults().current(),
        CacheHint::new(Duration::from_secs(45), Duration::from_secs(60))
    );

    let requests = transport.requests();
    assert!(requests[1].at.duration_since(requests[0].at) >= Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn hint_on_rejected_response_is_applied_before_the_retry() {
    let transport = ScriptedTransport::new(vec![
        Step::respond_with(503, vec![("cache-control", "max-age=20")], ""),
        Step::respond(200, "{}"),
    ]);
    let clients = clients(transport.clone(), standard_policy());
    let quotes = clients.service("quotes").expect("quotes service");

    let body = quotes
        .get("/quotes/ACME")
        .send()
        .await
        .expect("second attempt succeeds");

    assert_eq!(body, json!({}));
    assert_eq!(transport.request_count(), 2);
    assert_eq!(
        clients.cache_defaults().current(),
        CacheHint::new(Duration::from_secs(20), Duration::from_secs(20))
    );
    assert_eq!(clients.metrics_snapshot().cache_reconfigurations, 1);
}

#[tokio::test(start_paused = true)]
async fn backoff_doubles_between_attempts() {
    let transport = ScriptedTransport::new(vec![
        Step::respond(500, ""),
        Step::respond(502, ""),
        Step::respond(504, ""),
        Step::respond(500, ""),
    ]);
    let policy = RetryPolicy::standard()
        .max_attempts(4)
        .base_delay(Duration::from_millis(100));
    let clients = clients(transport.clone(), policy);
    let quotes = clients.service("quotes").expect("quotes service");

    let error = quotes
        .get("/quotes/ACME")
        .send()
        .await
        .expect_err("all attempts fail");

    assert!(error.is_retries_exhausted());
    assert_eq!(error.last_error().map(|last| last.status()), Some(500));

    let requests = transport.requests();
    assert_eq!(requests.len(), 4);
    let gaps = requests
        .windows(2)
        .map(|pair| pair[1].at.duration_since(pair[0].at))
        .collect::<Vec<_>>();
    for (gap, expected_ms) in gaps.iter().zip([100_u64, 200, 400]) {
        assert!(*gap >= Duration::from_millis(expected_ms), "{gaps:?}");
        assert!(*gap < Duration::from_millis(expected_ms * 2), "{gaps:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn terminal_rejection_is_not_retried() {
    let transport = ScriptedTransport::new(vec![
        Step::respond(
            422,
            r#"{"error":{"message":"address is invalid"},"code":4221}"#,
        ),
        Step::respond(200, "{}"),
    ]);
    let clients = clients(transport.clone(), standard_policy().max_attempts(5));
    let quotes = clients.service("quotes").expect("quotes service");

    let error = quotes
        .post("/orders")
        .json(&json!({"address": "???"}))
        .expect("json body")
        .send()
        .await
        .expect_err("422 is terminal");

    assert_eq!(transport.request_count(), 1);
    assert_eq!(error.kind(), ErrorKind::RemoteRejected);
    assert_eq!(error.status(), 422);
    assert_eq!(error.message(), "address is invalid");
    assert_eq!(error.code(), Some("4221"));
    assert!(!error.severity().is_retryable());
}

#[tokio::test(start_paused = true)]
async fn rate_limited_and_request_timeout_statuses_are_retried() {
    let transport = ScriptedTransport::new(vec![
        Step::respond(429, r#"{"message":"slow down"}"#),
        Step::respond(408, ""),
        Step::respond(200, r#"{"ok":true}"#),
    ]);
    let clients = clients(transport.clone(), standard_policy().max_attempts(3));
    let quotes = clients.service("quotes").expect("quotes service");

    let body = quotes
        .get("/quotes/ACME")
        .send()
        .await
        .expect("third attempt succeeds");

    assert_eq!(body, json!({"ok": true}));
    assert_eq!(transport.request_count(), 3);
    assert_eq!(clients.metrics_snapshot().retries, 2);
}

#[tokio::test(start_paused = true)]
async fn attempt_timeout_fires_and_is_retried() {
    let transport = ScriptedTransport::new(vec![Step::hang(), Step::hang()]);
    let clients = clients(transport.clone(), standard_policy());
    let quotes = clients.service("quotes").expect("quotes service");
    let started = Instant::now();

    let error = quotes
        .get("/quotes/ACME")
        .timeout(Duration::from_secs(2))
        .send()
        .await
        .expect_err("upstream never answers");

    assert_eq!(transport.request_count(), 2);
    assert!(error.is_retries_exhausted());
    let last = error.last_error().expect("last error");
    assert_eq!(last.kind(), ErrorKind::TimedOut);
    assert_eq!(last.message(), "request timed out after 2000ms");

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(5), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(6), "{elapsed:?}");
    assert_eq!(clients.metrics_snapshot().timeouts, 2);
}

#[tokio::test(start_paused = true)]
async fn late_response_loses_to_timeout() {
    let transport = ScriptedTransport::new(vec![
        Step::respond(200, r#"{"late":true}"#).after(Duration::from_secs(3)),
    ]);
    let clients = clients(transport.clone(), RetryPolicy::disabled());
    let quotes = clients.service("quotes").expect("quotes service");

    let error = quotes
        .get("/quotes/ACME")
        .timeout(Duration::from_secs(1))
        .send()
        .await
        .expect_err("response arrives after the timeout");

    assert_eq!(
        error.last_error().map(|last| last.kind()),
        Some(ErrorKind::TimedOut)
    );
}

#[tokio::test(start_paused = true)]
async fn external_cancel_abandons_in_flight_call() {
    let transport = ScriptedTransport::new(vec![Step::hang(), Step::respond(200, "{}")]);
    let clients = clients(transport.clone(), standard_policy());
    let quotes = clients.service("quotes").expect("quotes service");
    let signal = CancelSignal::new();
    let canceller = signal.clone();
    tokio::spawn(async move {
        sleep(Duration::from_secs(3)).await;
        canceller.cancel_with("screen closed");
    });
    let started = Instant::now();

    let error = quotes
        .get("/quotes/ACME")
        .timeout(Duration::from_secs(30))
        .cancel_signal(signal)
        .send()
        .await
        .expect_err("caller cancelled");

    assert_eq!(error.kind(), ErrorKind::Cancelled);
    assert_eq!(error.message(), "request cancelled: screen closed");
    assert_eq!(transport.request_count(), 1);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(3), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(4), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn external_cancel_during_backoff_stops_the_call() {
    let transport = ScriptedTransport::new(vec![
        Step::fail(TransportErrorKind::Read),
        Step::respond(200, "{}"),
    ]);
    let clients = clients(
        transport.clone(),
        standard_policy().base_delay(Duration::from_secs(10)),
    );
    let quotes = clients.service("quotes").expect("quotes service");
    let signal = CancelSignal::new();
    let canceller = signal.clone();
    tokio::spawn(async move {
        sleep(Duration::from_secs(2)).await;
        canceller.cancel();
    });

    let error = quotes
        .get("/quotes/ACME")
        .cancel_signal(signal)
        .send()
        .await
        .expect_err("cancelled while waiting to retry");

    assert_eq!(error.kind(), ErrorKind::Cancelled);
    assert_eq!(transport.request_count(), 1);
    let metrics = clients.metrics_snapshot();
    assert_eq!(metrics.requests_failed, 1);
    assert_eq!(metrics.in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn invalid_json_success_body_is_retried_as_decode_failure() {
    let transport = ScriptedTransport::new(vec![
        Step::respond(200, "<html>maintenance</html>"),
        Step::respond(200, "<html>maintenance</html>"),
    ]);
    let clients = clients(transport.clone(), standard_policy());
    let quotes = clients.service("quotes").expect("quotes service");

    let error = quotes
        .get("/quotes/ACME")
        .send()
        .await
        .expect_err("body is not json");

    assert_eq!(transport.request_count(), 2);
    assert_eq!(
        error.last_error().and_then(|last| last.transport_cause()),
        Some(TransportErrorKind::Decode)
    );
}

#[derive(Debug, Deserialize)]
struct PriceBody {
    price: f64,
}

#[tokio::test(start_paused = true)]
async fn send_with_transforms_decoded_body() {
    let transport = ScriptedTransport::new(vec![Step::respond(200, r#"{"price":12.5}"#)]);
    let clients = clients(transport.clone(), standard_policy());
    let quotes = clients.service("quotes").expect("quotes service");

    let doubled = quotes
        .get("/quotes/ACME")
        .send_with(|body: PriceBody| body.price * 2.0)
        .await
        .expect("transform runs on success");

    assert_eq!(doubled, 25.0);
}

#[tokio::test(start_paused = true)]
async fn mismatched_shape_is_a_decode_error_without_retry() {
    let transport = ScriptedTransport::new(vec![
        Step::respond(200, r#"{"unexpected":true}"#),
        Step::respond(200, r#"{"price":1.0}"#),
    ]);
    let clients = clients(transport.clone(), standard_policy());
    let quotes = clients.service("quotes").expect("quotes service");

    let error = quotes
        .get("/quotes/ACME")
        .send_json::<PriceBody>()
        .await
        .expect_err("shape does not match");

    assert_eq!(transport.request_count(), 1);
    assert_eq!(error.transport_cause(), Some(TransportErrorKind::Decode));
    assert!(!error.is_retries_exhausted());
    assert_eq!(error.uri(), "https://quotes.example.com/v1/quotes/ACME");
}

#[tokio::test(start_paused = true)]
async fn headers_merge_and_get_bodies_are_dropped() {
    let transport = ScriptedTransport::new(vec![
        Step::respond(200, "{}"),
        Step::respond(200, "{}"),
    ]);
    let config = ClientConfig::new(Environment::Development).with_service("quotes", BASE_URL);
    let clients = ServiceClients::builder(config)
        .transport(transport.clone())
        .default_header(
            HeaderName::from_static("x-client"),
            HeaderValue::from_static("dashboard"),
        )
        .try_build()
        .expect("clients should build");
    let quotes = clients.service("quotes").expect("quotes service");

    quotes
        .get("/quotes/ACME")
        .body_bytes("ignored")
        .try_header("content-type", "text/plain")
        .expect("valid header")
        .send()
        .await
        .expect("get succeeds");
    quotes
        .put("quotes/ACME")
        .body_bytes(r#"{"watch":true}"#)
        .send()
        .await
        .expect("put succeeds");

    let requests = transport.requests();
    assert_eq!(requests[0].method, Method::GET);
    assert_eq!(requests[0].uri, "https://quotes.example.com/v1/quotes/ACME");
    assert!(requests[0].body.is_empty());
    assert_eq!(requests[0].headers[CONTENT_TYPE], "text/plain");
    assert_eq!(requests[0].headers["accept"], "application/json");
    assert_eq!(requests[0].headers["x-client"], "dashboard");

    assert_eq!(requests[1].method, Method::PUT);
    assert_eq!(requests[1].body, Bytes::from_static(br#"{"watch":true}"#));
    assert_eq!(requests[1].headers[CONTENT_TYPE], "application/json");
}

#[tokio::test(start_paused = true)]
async fn invalid_header_is_rejected_before_sending() {
    let transport = ScriptedTransport::new(Vec::new());
    let clients = clients(transport.clone(), standard_policy());
    let quotes = clients.service("quotes").expect("quotes service");

    let error = quotes
        .get("/quotes/ACME")
        .try_header("bad header", "value")
        .err()
        .expect("header name with a space is invalid");

    assert_eq!(
        error.transport_cause(),
        Some(TransportErrorKind::InvalidRequest)
    );
    assert_eq!(transport.request_count(), 0);
}

#[derive(Default)]
struct CountingCache {
    applied: Mutex<Vec<CacheHint>>,
}

impl ResultCache for CountingCache {
    fn set_default_lifetimes(&self, hint: CacheHint) {
        self.applied.lock().expect("lock applied hints").push(hint);
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_calls_reconfigure_cache_once_per_distinct_hint() {
    let steps = (0..8)
        .map(|_| Step::respond_with(200, vec![("Cache-Control", "MAX-AGE=30")], "{}"))
        .collect();
    let transport = ScriptedTransport::new(steps);
    let cache = Arc::new(CountingCache::default());
    let config = ClientConfig::new(Environment::Development).with_service("quotes", BASE_URL);
    let clients = ServiceClients::builder(config)
        .transport(transport.clone())
        .result_cache(cache.clone())
        .try_build()
        .expect("clients should build");

    let mut handles = Vec::new();
    for index in 0..8 {
        let quotes = clients.service("quotes").expect("quotes service").clone();
        handles.push(tokio::spawn(async move {
            quotes.get(format!("/quotes/{index}")).send().await
        }));
    }
    for handle in handles {
        handle
            .await
            .expect("task should join")
            .expect("call should succeed");
    }

    let hint = CacheHint::new(Duration::from_secs(30), Duration::from_secs(30));
    assert_eq!(*cache.applied.lock().expect("lock applied hints"), vec![hint]);
    assert_eq!(clients.cache_defaults().current(), hint);
    assert_eq!(clients.metrics_snapshot().cache_reconfigurations, 1);
}

#[tokio::test(start_paused = true)]
async fn executor_runs_request_specs_directly() {
    let transport = ScriptedTransport::new(vec![Step::respond(200, r#"[1,2,3]"#)]);
    let cache = Arc::new(MemoryResultCache::default());
    let config = ClientConfig::new(Environment::Production);
    let executor = Executor::new(
        &config,
        transport.clone(),
        Arc::new(callwire::CacheDefaults::new(CacheHint::DEFAULT, cache)),
        HeaderMap::new(),
    );
    let spec = RequestSpec::new(Method::DELETE, BASE_URL, "/watchlist/ACME")
        .with_max_attempts(1)
        .with_timeout(Duration::from_secs(1));

    let body = executor.execute(&spec).await.expect("delete succeeds");

    assert_eq!(body, Value::from(vec![1, 2, 3]));
    assert_eq!(executor.request_timeout(), Duration::from_secs(30));
    assert_eq!(transport.requests()[0].method, Method::DELETE);
}
