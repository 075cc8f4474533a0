use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;

use crate::cache_control::CacheHint;
use crate::retry::RetryPolicy;
use crate::util::is_valid_base_url;

const ENV_ENVIRONMENT: &str = "CALLWIRE_ENV";
const ENV_TIMEOUT_MS: &str = "CALLWIRE_TIMEOUT_MS";
const ENV_MAX_ATTEMPTS: &str = "CALLWIRE_MAX_ATTEMPTS";
const ENV_RETRY_DELAY_MS: &str = "CALLWIRE_RETRY_DELAY_MS";
const ENV_MAX_RETRY_DELAY_MS: &str = "CALLWIRE_MAX_RETRY_DELAY_MS";
const ENV_SERVICE_PREFIX: &str = "CALLWIRE_SERVICE_";
const ENV_SERVICE_SUFFIX: &str = "_URL";

const DEFAULT_CLIENT_NAME: &str = "callwire";
const DEVELOPMENT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const PRODUCTION_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: String, value: String },
    #[error("invalid base url for service {service}: {url:?}")]
    InvalidServiceUrl { service: String, url: String },
    #[error("failed to initialize tls: {message}")]
    TlsInit { message: String },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    /// `production`/`prod` in any case; everything else is non-production.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Self::Production,
            _ => Self::Development,
        }
    }

    pub const fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }

    pub const fn default_request_timeout(self) -> Duration {
        match self {
            Self::Development => DEVELOPMENT_REQUEST_TIMEOUT,
            Self::Production => PRODUCTION_REQUEST_TIMEOUT,
        }
    }
}

/// Process-level settings shared by every service client.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    environment: Environment,
    client_name: String,
    services: BTreeMap<String, String>,
    request_timeout: Duration,
    retry_policy: RetryPolicy,
    cache_defaults: CacheHint,
}

impl ClientConfig {
    pub fn new(environment: Environment) -> Self {
        Self {
            environment,
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
            services: BTreeMap::new(),
            request_timeout: environment.default_request_timeout(),
            retry_policy: RetryPolicy::standard(),
            cache_defaults: CacheHint::DEFAULT,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    /// Reads `CALLWIRE_*` entries from `vars`; other entries are ignored.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let vars = vars
            .into_iter()
            .filter(|(name, _)| name.as_ref().starts_with("CALLWIRE_"))
            .map(|(name, value)| (name.as_ref().to_owned(), value.as_ref().to_owned()))
            .collect::<BTreeMap<_, _>>();

        let environment = vars
            .get(ENV_ENVIRONMENT)
            .map(|value| Environment::parse(value))
            .unwrap_or_default();
        let mut config = Self::new(environment);

        if let Some(timeout_ms) = parse_var::<u64>(&vars, ENV_TIMEOUT_MS)? {
            config = config.with_request_timeout(Duration::from_millis(timeout_ms));
        }
        let mut retry_policy = config.retry_policy.clone();
        if let Some(max_attempts) = parse_var::<usize>(&vars, ENV_MAX_ATTEMPTS)? {
            retry_policy = retry_policy.max_attempts(max_attempts);
        }
        if let Some(delay_ms) = parse_var::<u64>(&vars, ENV_RETRY_DELAY_MS)? {
            retry_policy = retry_policy.base_delay(Duration::from_millis(delay_ms));
        }
        if let Some(max_delay_ms) = parse_var::<u64>(&vars, ENV_MAX_RETRY_DELAY_MS)? {
            retry_policy = retry_policy.max_delay(Duration::from_millis(max_delay_ms));
        }
        config = config.with_retry_policy(retry_policy);

        for (name, url) in &vars {
            let Some(service) = name
                .strip_prefix(ENV_SERVICE_PREFIX)
                .and_then(|rest| rest.strip_suffix(ENV_SERVICE_SUFFIX))
                .filter(|service| !service.is_empty())
            else {
                continue;
            };
            config = config.with_service(service.to_ascii_lowercase(), url.trim());
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    pub fn with_service(mut self, name: impl Into<String>, base_url: impl Into<String>) -> Self {
        self.services.insert(name.into(), base_url.into());
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_cache_defaults(mut self, cache_defaults: CacheHint) -> Self {
        self.cache_defaults = cache_defaults;
        self
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    pub fn services(&self) -> &BTreeMap<String, String> {
        &self.services
    }

    pub fn service_url(&self, name: &str) -> Option<&str> {
        self.services.get(name).map(String::as_str)
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn cache_defaults(&self) -> CacheHint {
        self.cache_defaults
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (service, url) in &self.services {
            if !is_valid_base_url(url) {
                return Err(ConfigError::InvalidServiceUrl {
                    service: service.clone(),
                    url: url.clone(),
                });
            }
        }
        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(Environment::default())
    }
}

fn parse_var<T>(vars: &BTreeMap<String, String>, name: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
{
    let Some(value) = vars.get(name) else {
        return Ok(None);
    };
    value
        .trim()
        .parse::<T>()
        .map(Some)
        .map_err(|_| ConfigError::InvalidValue {
            name: name.to_owned(),
            value: value.clone(),
        })
}
