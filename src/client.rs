use std::collections::BTreeMap;
use std::sync::Arc;

use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use tracing::debug;

use crate::cache_control::{CacheDefaults, MemoryResultCache, ResultCache};
use crate::config::{ClientConfig, ConfigError};
use crate::executor::Executor;
use crate::metrics::MetricsSnapshot;
use crate::request::RequestBuilder;
use crate::transport::{HyperTransport, Transport};
use crate::util::is_valid_base_url;

/// Narrow call surface bound to one upstream base address.
///
/// Cloning is cheap; every clone and every sibling client built by the same
/// [`ServiceClients`] shares one executor and one set of cache defaults.
#[derive(Clone, Debug)]
pub struct ServiceClient {
    name: Arc<str>,
    base_url: Arc<str>,
    executor: Executor,
}

impl ServiceClient {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn request(&self, method: Method, path: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, method, path.into())
    }

    pub fn get(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::GET, path)
    }

    pub fn post(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::POST, path)
    }

    pub fn put(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PUT, path)
    }

    pub fn patch(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PATCH, path)
    }

    pub fn delete(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::DELETE, path)
    }

    pub(crate) fn name_shared(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    pub(crate) fn base_url_shared(&self) -> Arc<str> {
        Arc::clone(&self.base_url)
    }

    pub(crate) fn executor(&self) -> &Executor {
        &self.executor
    }
}

pub struct ServiceClientsBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    result_cache: Option<Arc<dyn ResultCache>>,
    default_headers: HeaderMap,
}

impl ServiceClientsBuilder {
    pub(crate) fn new(config: ClientConfig) -> Self {
        Self {
            config,
            transport: None,
            result_cache: None,
            default_headers: HeaderMap::new(),
        }
    }

    /// Replaces the pooled hyper transport, e.g. with a test double.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// The cache whose default lifetimes follow upstream cache-control hints.
    /// A [`MemoryResultCache`] is used when none is given.
    pub fn result_cache(mut self, result_cache: Arc<dyn ResultCache>) -> Self {
        self.result_cache = Some(result_cache);
        self
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    pub fn try_build(self) -> Result<ServiceClients, ConfigError> {
        self.config.validate()?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HyperTransport::new()?),
        };
        let result_cache: Arc<dyn ResultCache> = match self.result_cache {
            Some(result_cache) => result_cache,
            None => Arc::new(MemoryResultCache::new(self.config.cache_defaults())),
        };
        let cache_defaults = Arc::new(CacheDefaults::new(
            self.config.cache_defaults(),
            result_cache,
        ));
        let executor = Executor::new(
            &self.config,
            transport,
            cache_defaults,
            self.default_headers,
        );

        let services = self
            .config
            .services()
            .iter()
            .map(|(name, base_url)| {
                let client = ServiceClient {
                    name: Arc::from(name.as_str()),
                    base_url: Arc::from(base_url.as_str()),
                    executor: executor.clone(),
                };
                (name.clone(), client)
            })
            .collect::<BTreeMap<_, _>>();
        debug!(
            client = self.config.client_name(),
            services = services.len(),
            environment = ?self.config.environment(),
            "service clients built"
        );

        Ok(ServiceClients {
            config: self.config,
            executor,
            services,
        })
    }
}

/// Factory for per-service clients over one shared executor.
#[derive(Clone, Debug)]
pub struct ServiceClients {
    config: ClientConfig,
    executor: Executor,
    services: BTreeMap<String, ServiceClient>,
}

impl ServiceClients {
    pub fn builder(config: ClientConfig) -> ServiceClientsBuilder {
        ServiceClientsBuilder::new(config)
    }

    /// Reads the configuration from `CALLWIRE_*` environment variables and
    /// builds clients over the default transport.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::builder(ClientConfig::from_env()?).try_build()
    }

    /// The client of a configured service.
    pub fn service(&self, name: &str) -> Option<&ServiceClient> {
        self.services.get(name)
    }

    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    /// A client for an ad-hoc base address sharing this factory's executor.
    pub fn client_for(&self, base_url: &str) -> Result<ServiceClient, ConfigError> {
        if !is_valid_base_url(base_url) {
            return Err(ConfigError::InvalidServiceUrl {
                service: base_url.to_owned(),
                url: base_url.to_owned(),
            });
        }
        Ok(ServiceClient {
            name: Arc::from(base_url),
            base_url: Arc::from(base_url),
            executor: self.executor.clone(),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn cache_defaults(&self) -> &Arc<CacheDefaults> {
        self.executor.cache_defaults()
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.executor.metrics_snapshot()
    }
}
