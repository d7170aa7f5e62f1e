//! Configuration resolution
//!
//! Turns raw, untrusted settings (`RawConfig`) into an immutable, validated
//! `Configuration`. Resolution is pure: the same input always yields the same
//! configuration, and any invalid input yields a `ConfigError` carrying every
//! problem found.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use url::Url;
use validator::{Validate, ValidationError};

use kvguard_common::ConfigError;
use kvguard_store::Endpoint;

/// Default number of connection attempts per establishment cycle
pub const DEFAULT_MAX_CONNECTION_RETRIES: u32 = 10;

/// Default worker count
pub const DEFAULT_WORKER_COUNT: u32 = 3;

/// Port used when the store URI does not name one
pub const DEFAULT_PORT: u16 = 6379;

/// Backoff growth per attempt
pub const RETRY_STEP: Duration = Duration::from_millis(50);

/// Backoff ceiling
pub const RETRY_CAP: Duration = Duration::from_millis(2000);

/// URI schemes accepted for the store
pub const SUPPORTED_SCHEMES: &[&str] = &["store", "stores", "redis", "rediss"];

/// Prefix for environment overrides in `RawConfig::load`
pub const ENV_PREFIX: &str = "KVGUARD";

/// Delay between connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Always wait the same amount
    Fixed(Duration),
    /// Wait `attempt * step`, never more than `cap`
    Linear { step: Duration, cap: Duration },
}

impl RetryStrategy {
    /// Fixed delay when an override is configured, linear backoff otherwise.
    pub fn from_override(retry_delay_millis: Option<u64>) -> Self {
        match retry_delay_millis {
            Some(ms) => RetryStrategy::Fixed(Duration::from_millis(ms)),
            None => RetryStrategy::default(),
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            RetryStrategy::Fixed(delay) => delay,
            RetryStrategy::Linear { step, cap } => step.saturating_mul(attempt).min(cap),
        }
    }

    pub fn delay_millis(&self, attempt: u32) -> u64 {
        kvguard_common::duration_millis(self.delay_for(attempt))
    }
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::Linear {
            step: RETRY_STEP,
            cap: RETRY_CAP,
        }
    }
}

/// Settings as supplied by the caller. Unknown fields are ignored.
///
/// Field names follow the camelCase form (`storeURL`, `maxConnectionRetries`,
/// ...); snake_case and all-lowercase spellings are accepted as well, the
/// latter because environment overrides arrive lowercased.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct RawConfig {
    #[serde(
        rename = "storeURL",
        alias = "storeUrl",
        alias = "store_url",
        alias = "storeurl",
        default
    )]
    #[validate(
        required(message = "storeURL is required"),
        url(message = "storeURL must be a valid URI")
    )]
    pub store_url: Option<String>,

    #[serde(
        rename = "maxConnectionRetries",
        alias = "max_connection_retries",
        alias = "maxconnectionretries",
        default
    )]
    #[validate(range(min = 1, message = "maxConnectionRetries must be a positive integer"))]
    pub max_connection_retries: Option<i64>,

    #[serde(
        rename = "retryDelayMillis",
        alias = "retry_delay_millis",
        alias = "retrydelaymillis",
        default
    )]
    #[validate(range(min = 0, message = "retryDelayMillis must not be negative"))]
    pub retry_delay_millis: Option<i64>,

    #[serde(
        rename = "workerCount",
        alias = "worker_count",
        alias = "workercount",
        default
    )]
    #[validate(range(min = 1, message = "workerCount must be a positive integer"))]
    pub worker_count: Option<i64>,
}

impl RawConfig {
    /// Raw settings pointing at `store_url`, everything else defaulted.
    pub fn new(store_url: impl Into<String>) -> Self {
        Self {
            store_url: Some(store_url.into()),
            ..Default::default()
        }
    }

    pub fn with_max_connection_retries(mut self, retries: i64) -> Self {
        self.max_connection_retries = Some(retries);
        self
    }

    pub fn with_retry_delay_millis(mut self, delay: i64) -> Self {
        self.retry_delay_millis = Some(delay);
        self
    }

    pub fn with_worker_count(mut self, count: i64) -> Self {
        self.worker_count = Some(count);
        self
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json)
            .map_err(|e| ConfigError::new(format!("malformed configuration: {}", e)))
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        serde_json::from_value(value)
            .map_err(|e| ConfigError::new(format!("malformed configuration: {}", e)))
    }

    /// Load from a configuration file (format chosen by extension), with
    /// `KVGUARD_*` environment variables taking precedence.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path))
            .add_source(::config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .map_err(|e| {
                ConfigError::new(format!(
                    "failed to read configuration from {}: {}",
                    path.display(),
                    e
                ))
            })?;

        settings
            .try_deserialize()
            .map_err(|e| ConfigError::new(format!("malformed configuration: {}", e)))
    }

    /// Validate and normalize into a `Configuration`.
    pub fn resolve(self) -> Result<Configuration, ConfigError> {
        Configuration::resolve(self)
    }
}

/// Validated connection settings. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    store_uri: String,
    hostname: String,
    port: u16,
    max_connection_retries: u32,
    retry_delay_millis: Option<u64>,
    worker_count: u32,
    retry_strategy: RetryStrategy,
}

impl Configuration {
    pub fn resolve(raw: RawConfig) -> Result<Self, ConfigError> {
        let mut problems = Vec::new();

        if let Err(errors) = raw.validate() {
            let mut fields: Vec<_> = errors.field_errors().into_iter().collect();
            fields.sort_by(|a, b| a.0.cmp(&b.0));
            for (field, errs) in fields {
                for err in errs.iter() {
                    problems.push(describe(&field.to_string(), err));
                }
            }
        }

        let url = match raw.store_url.as_deref() {
            Some(uri) => match Url::parse(uri) {
                Ok(url) => {
                    if let Err(err) = validate_store_url(&url) {
                        problems.push(describe("store_url", &err));
                    }
                    Some(url)
                }
                // Already reported by the `url` validator
                Err(_) => None,
            },
            None => None,
        };

        let max_connection_retries = bounded(
            "maxConnectionRetries",
            raw.max_connection_retries,
            DEFAULT_MAX_CONNECTION_RETRIES,
            &mut problems,
        );
        let worker_count = bounded(
            "workerCount",
            raw.worker_count,
            DEFAULT_WORKER_COUNT,
            &mut problems,
        );
        // Negative delays are already reported by the range validator
        let retry_delay_millis = raw.retry_delay_millis.and_then(|ms| u64::try_from(ms).ok());

        if !problems.is_empty() {
            return Err(ConfigError::new(problems.join("; ")));
        }

        let url = url.ok_or_else(|| ConfigError::new("storeURL is required"))?;
        let hostname = url.host_str().unwrap_or_default().to_string();
        let port = url.port().unwrap_or(DEFAULT_PORT);

        Ok(Self {
            store_uri: url.to_string(),
            hostname,
            port,
            max_connection_retries,
            retry_delay_millis,
            worker_count,
            retry_strategy: RetryStrategy::from_override(retry_delay_millis),
        })
    }

    pub fn store_uri(&self) -> &str {
        &self.store_uri
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn max_connection_retries(&self) -> u32 {
        self.max_connection_retries
    }

    pub fn retry_delay_millis(&self) -> Option<u64> {
        self.retry_delay_millis
    }

    pub fn worker_count(&self) -> u32 {
        self.worker_count
    }

    pub fn retry_strategy(&self) -> RetryStrategy {
        self.retry_strategy
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.store_uri.clone(), self.hostname.clone(), self.port)
    }
}

/// Scheme and host checks on top of URI syntax.
fn validate_store_url(url: &Url) -> Result<(), ValidationError> {
    if !SUPPORTED_SCHEMES.contains(&url.scheme()) {
        return Err(
            ValidationError::new("store_url_scheme").with_message(
                format!(
                    "storeURL scheme '{}' is not one of {}",
                    url.scheme(),
                    SUPPORTED_SCHEMES.join(", ")
                )
                .into(),
            ),
        );
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(ValidationError::new("store_url_host")
            .with_message("storeURL must name a host".into()));
    }
    Ok(())
}

fn describe(field: &str, err: &ValidationError) -> String {
    match &err.message {
        Some(message) => message.to_string(),
        None => format!("{}: {}", field, err.code),
    }
}

/// `value` as a `u32`, or `default` when unset. Out-of-range values are
/// recorded in `problems`.
fn bounded(field: &str, value: Option<i64>, default: u32, problems: &mut Vec<String>) -> u32 {
    match value {
        None => default,
        Some(v) => u32::try_from(v).unwrap_or_else(|_| {
            // Values below 1 were reported by the range validator
            if v > 0 {
                problems.push(format!("{} value {} is out of range", field, v));
            }
            default
        }),
    }
}
