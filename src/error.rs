use std::borrow::Cow;
use std::time::SystemTime;

use http::Method;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::cancel::CancelReason;
use crate::util::truncate_body;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

const RETRIES_EXHAUSTED_MESSAGE: &str = "network request failed";

/// The closed set of failure kinds a logical call can end with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The upstream answered with a non-2xx status.
    RemoteRejected,
    /// Connection, DNS, TLS or protocol failure below the application layer.
    TransportFailed,
    /// The per-attempt timeout fired before a response arrived.
    TimedOut,
    /// The caller-supplied cancellation signal fired.
    Cancelled,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RemoteRejected => "remote_rejected",
            Self::TransportFailed => "transport_failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Retryable,
    Terminal,
}

impl Severity {
    /// Status 0 stands for "no HTTP status" and is retryable.
    pub const fn from_status(status: u16) -> Self {
        match status {
            408 | 429 => Self::Retryable,
            400..=499 => Self::Terminal,
            _ => Self::Retryable,
        }
    }

    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Retryable)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Decode,
    InvalidRequest,
    RetriesExhausted,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Decode => "decode",
            Self::InvalidRequest => "invalid_request",
            Self::RetriesExhausted => "retries_exhausted",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("{message} (http {status}) for {method} {uri}")]
    RemoteRejected {
        status: u16,
        message: String,
        code: Option<String>,
        details: Option<Map<String, Value>>,
        body: String,
        method: Method,
        uri: String,
        timestamp: SystemTime,
    },
    #[error("{message} ({cause}) for {method} {uri}")]
    TransportFailed {
        cause: TransportErrorKind,
        message: String,
        method: Method,
        uri: String,
        timestamp: SystemTime,
        #[source]
        source: Option<BoxError>,
    },
    #[error("request timed out after {timeout_ms}ms for {method} {uri}")]
    TimedOut {
        timeout_ms: u128,
        method: Method,
        uri: String,
        timestamp: SystemTime,
    },
    #[error("request cancelled for {method} {uri}: {reason}")]
    Cancelled {
        reason: String,
        method: Method,
        uri: String,
        timestamp: SystemTime,
    },
}

impl Error {
    pub(crate) fn remote_rejected(status: u16, body: &[u8], method: &Method, uri: &str) -> Self {
        let rejection = parse_rejection_body(status, body);
        Self::RemoteRejected {
            status,
            message: rejection.message,
            code: rejection.code,
            details: rejection.details,
            body: truncate_body(body),
            method: method.clone(),
            uri: uri.to_owned(),
            timestamp: SystemTime::now(),
        }
    }

    pub(crate) fn transport(
        cause: TransportErrorKind,
        message: impl Into<String>,
        method: &Method,
        uri: &str,
        source: Option<BoxError>,
    ) -> Self {
        Self::TransportFailed {
            cause,
            message: message.into(),
            method: method.clone(),
            uri: uri.to_owned(),
            timestamp: SystemTime::now(),
            source,
        }
    }

    pub(crate) fn invalid_request(message: impl Into<String>, method: &Method, uri: &str) -> Self {
        Self::transport(TransportErrorKind::InvalidRequest, message, method, uri, None)
    }

    pub(crate) fn from_cancel_reason(reason: CancelReason, method: &Method, uri: &str) -> Self {
        match reason {
            CancelReason::Timeout(timeout) => Self::TimedOut {
                timeout_ms: timeout.as_millis(),
                method: method.clone(),
                uri: uri.to_owned(),
                timestamp: SystemTime::now(),
            },
            CancelReason::External(reason) => Self::Cancelled {
                reason,
                method: method.clone(),
                uri: uri.to_owned(),
                timestamp: SystemTime::now(),
            },
        }
    }

    /// Collapses a retry-eligible failure that ran out of attempts into the
    /// generic network failure. The classified error stays reachable through
    /// [`Error::last_error`].
    pub(crate) fn retries_exhausted(last: Error) -> Self {
        let method = last.method().clone();
        let uri = last.uri().to_owned();
        let message = format!("{RETRIES_EXHAUSTED_MESSAGE}: {}", last.message());
        Self::transport(
            TransportErrorKind::RetriesExhausted,
            message,
            &method,
            &uri,
            Some(Box::new(last)),
        )
    }

    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::RemoteRejected { .. } => ErrorKind::RemoteRejected,
            Self::TransportFailed { .. } => ErrorKind::TransportFailed,
            Self::TimedOut { .. } => ErrorKind::TimedOut,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// HTTP status of the rejection, `0` when the failure has none.
    pub const fn status(&self) -> u16 {
        match self {
            Self::RemoteRejected { status, .. } => *status,
            _ => 0,
        }
    }

    pub const fn severity(&self) -> Severity {
        Severity::from_status(self.status())
    }

    pub fn message(&self) -> Cow<'_, str> {
        match self {
            Self::RemoteRejected { message, .. } | Self::TransportFailed { message, .. } => {
                Cow::Borrowed(message)
            }
            Self::TimedOut { timeout_ms, .. } => {
                Cow::Owned(format!("request timed out after {timeout_ms}ms"))
            }
            Self::Cancelled { reason, .. } => Cow::Owned(format!("request cancelled: {reason}")),
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            Self::RemoteRejected { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    pub fn details(&self) -> Option<&Map<String, Value>> {
        match self {
            Self::RemoteRejected { details, .. } => details.as_ref(),
            _ => None,
        }
    }

    pub const fn timestamp(&self) -> SystemTime {
        match self {
            Self::RemoteRejected { timestamp, .. }
            | Self::TransportFailed { timestamp, .. }
            | Self::TimedOut { timestamp, .. }
            | Self::Cancelled { timestamp, .. } => *timestamp,
        }
    }

    pub const fn method(&self) -> &Method {
        match self {
            Self::RemoteRejected { method, .. }
            | Self::TransportFailed { method, .. }
            | Self::TimedOut { method, .. }
            | Self::Cancelled { method, .. } => method,
        }
    }

    pub fn uri(&self) -> &str {
        match self {
            Self::RemoteRejected { uri, .. }
            | Self::TransportFailed { uri, .. }
            | Self::TimedOut { uri, .. }
            | Self::Cancelled { uri, .. } => uri,
        }
    }

    pub const fn transport_cause(&self) -> Option<TransportErrorKind> {
        match self {
            Self::TransportFailed { cause, .. } => Some(*cause),
            _ => None,
        }
    }

    pub const fn is_retries_exhausted(&self) -> bool {
        matches!(
            self,
            Self::TransportFailed {
                cause: TransportErrorKind::RetriesExhausted,
                ..
            }
        )
    }

    /// The last classified error of a call that exhausted its attempts.
    pub fn last_error(&self) -> Option<&Error> {
        match self {
            Self::TransportFailed {
                cause: TransportErrorKind::RetriesExhausted,
                source: Some(source),
                ..
            } => source.downcast_ref::<Error>(),
            _ => None,
        }
    }
}

struct RejectionBody {
    message: String,
    code: Option<String>,
    details: Option<Map<String, Value>>,
}

fn parse_rejection_body(status: u16, body: &[u8]) -> RejectionBody {
    let fallback = || format!("HTTP {status}");
    let Ok(Value::Object(mut object)) = serde_json::from_slice::<Value>(body) else {
        return RejectionBody {
            message: fallback(),
            code: None,
            details: None,
        };
    };

    let nested = match object.get("error") {
        Some(Value::Object(nested)) => Some(nested.clone()),
        _ => None,
    };
    let message = non_empty_str(object.get("message"))
        .or_else(|| non_empty_str(object.get("error")))
        .or_else(|| nested.as_ref().and_then(|inner| non_empty_str(inner.get("message"))))
        .unwrap_or_else(fallback);
    let code = code_value(object.get("code"))
        .or_else(|| nested.as_ref().and_then(|inner| code_value(inner.get("code"))));
    let details = match object.remove("details") {
        Some(Value::Object(details)) => Some(details),
        _ => None,
    };

    RejectionBody {
        message,
        code,
        details,
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(text)) if !text.trim().is_empty() => Some(text.clone()),
        _ => None,
    }
}

fn code_value(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(code)) if !code.is_empty() => Some(code.clone()),
        Some(Value::Number(code)) => Some(code.to_string()),
        _ => None,
    }
}
