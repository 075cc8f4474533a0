use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::Result;
use crate::cancel::CancelSignal;
use crate::client::ServiceClient;
use crate::error::{Error, TransportErrorKind};
use crate::executor::RequestSpec;
use crate::util::{append_query_pairs, join_base_path, redact_uri_for_logs};

/// Collects the per-call inputs of one logical call against a
/// [`ServiceClient`]. Nothing is sent until one of the `send*` methods runs.
pub struct RequestBuilder<'a> {
    client: &'a ServiceClient,
    method: Method,
    path: String,
    query_pairs: Vec<(String, String)>,
    headers: HeaderMap,
    body: Option<Bytes>,
    timeout: Option<Duration>,
    max_attempts: Option<usize>,
    retry_delay: Option<Duration>,
    cancel: Option<CancelSignal>,
}

impl<'a> RequestBuilder<'a> {
    pub(crate) fn new(client: &'a ServiceClient, method: Method, path: String) -> Self {
        Self {
            client,
            method,
            path,
            query_pairs: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
            max_attempts: None,
            retry_delay: None,
            cancel: None,
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> Result<Self> {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|source| self.invalid(format!("invalid header name {name:?}: {source}")))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|source| self.invalid(format!("invalid header value {name:?}: {source}")))?;
        Ok(self.header(header_name, header_value))
    }

    pub fn query_pair(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_pairs.push((name.into(), value.into()));
        self
    }

    pub fn query_pairs<K, V, I>(mut self, pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.query_pairs.extend(
            pairs
                .into_iter()
                .map(|(name, value)| (name.into(), value.into())),
        );
        self
    }

    /// Ignored for `GET`.
    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn json<T>(self, payload: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(payload)
            .map_err(|source| self.invalid(format!("failed to encode request json: {source}")))?;
        Ok(self
            .body_bytes(body)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json")))
    }

    /// Per-attempt timeout for this call.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.max(Duration::from_millis(1)));
        self
    }

    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = Some(retry_delay);
        self
    }

    pub fn cancel_signal(mut self, cancel: CancelSignal) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn into_spec(self) -> RequestSpec {
        let path = append_query_pairs(&self.path, &self.query_pairs);
        RequestSpec {
            service: Some(self.client.name_shared()),
            method: self.method,
            base_url: self.client.base_url_shared(),
            path,
            headers: self.headers,
            body: self.body,
            timeout: self.timeout,
            max_attempts: self.max_attempts,
            retry_delay: self.retry_delay,
            cancel: self.cancel,
        }
    }

    pub async fn send(self) -> Result<Value> {
        let client = self.client;
        let spec = self.into_spec();
        client.executor().execute(&spec).await
    }

    /// Decodes the successful body into `T`. A body that does not match `T`
    /// fails with a decode error and is not retried.
    pub async fn send_json<T>(self) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let client = self.client;
        let spec = self.into_spec();
        let value = client.executor().execute(&spec).await?;
        decode_value(value, &spec)
    }

    /// Like [`send_json`](Self::send_json), then maps the decoded value.
    pub async fn send_with<T, R, F>(self, transform: F) -> Result<R>
    where
        T: DeserializeOwned,
        F: FnOnce(T) -> R,
    {
        self.send_json::<T>().await.map(transform)
    }

    fn invalid(&self, message: String) -> Error {
        Error::invalid_request(message, &self.method, &self.path)
    }
}

fn decode_value<T>(value: Value, spec: &RequestSpec) -> Result<T>
where
    T: DeserializeOwned,
{
    serde_json::from_value(value).map_err(|source| {
        let uri = redact_uri_for_logs(&join_base_path(spec.base_url(), spec.path()));
        Error::transport(
            TransportErrorKind::Decode,
            format!("failed to decode response json: {source}"),
            spec.method(),
            &uri,
            Some(Box::new(source)),
        )
    })
}
