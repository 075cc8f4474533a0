//! `callwire` is the resilient request layer behind every outbound call to
//! backend services: per-attempt timeouts composed with caller cancellation,
//! exponential retry, cache-control driven cache defaults and a closed error
//! taxonomy.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use callwire::prelude::{ClientConfig, Environment, RetryPolicy, ServiceClients};
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct Quote {
//!     symbol: String,
//!     price: f64,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::new(Environment::Production)
//!         .with_service("quotes", "https://quotes.example.com/v1")
//!         .with_retry_policy(RetryPolicy::standard().max_attempts(3));
//!     let clients = ServiceClients::builder(config).try_build()?;
//!     let quotes = clients.service("quotes").ok_or("quotes is not configured")?;
//!
//!     let quote: Quote = quotes
//!         .get("/quotes/ACME")
//!         .timeout(Duration::from_secs(5))
//!         .send_json()
//!         .await?;
//!
//!     println!("{} {}", quote.symbol, quote.price);
//!     Ok(())
//! }
//! ```
//!
//! # Failure Semantics
//!
//! - 4xx responses other than 408 and 429 fail immediately with
//!   [`ErrorKind::RemoteRejected`] and the upstream status, code and details.
//! - Everything else is retried until the attempt budget runs out, then fails
//!   with a generic transport error; [`Error::last_error`] keeps the cause.
//! - A fired [`CancelSignal`] abandons the whole call.

mod cache_control;
mod cancel;
mod client;
mod config;
mod error;
mod executor;
mod metrics;
mod request;
mod retry;
mod transport;
mod util;

pub use crate::cache_control::{
    CacheDefaults, CacheHint, CacheLookup, MemoryResultCache, ResultCache,
};
pub use crate::cancel::{AttemptCancellation, CancelReason, CancelSignal};
pub use crate::client::{ServiceClient, ServiceClients, ServiceClientsBuilder};
pub use crate::config::{ClientConfig, ConfigError, Environment};
pub use crate::error::{BoxError, Error, ErrorKind, Severity, TransportErrorKind};
pub use crate::executor::{Executor, RequestSpec};
pub use crate::metrics::MetricsSnapshot;
pub use crate::request::RequestBuilder;
pub use crate::retry::{RetryPolicy, backoff_delay, should_retry};
pub use crate::transport::{HyperTransport, HyperTransportBuilder, Transport, TransportError};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        CacheHint, CancelSignal, ClientConfig, Environment, Error, ErrorKind, RetryPolicy,
        ServiceClient, ServiceClients, TransportErrorKind,
    };
}
