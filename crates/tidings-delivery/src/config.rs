//! Configuration for the reliable delivery service.
//!
//! [`ServiceConfig`] is the user-facing, serde-friendly form loaded with
//! figment from defaults, `tidings.toml` and `TIDINGS_*` environment
//! variables. It converts into the `Duration`-typed [`DeliveryConfig`] the
//! service runs on. [`ConfigUpdate`] carries the two settings that can be
//! changed while the service is running.

use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::{
    retry::{BackoffStrategy, RetryPolicy},
    DEFAULT_MAX_DELIVERY_THREADS, DEFAULT_MAX_QUEUE_LENGTH,
};

const CONFIG_FILE: &str = "tidings.toml";
const ENV_PREFIX: &str = "TIDINGS_";

/// Property name of the retry attempt limit in configuration updates.
pub const MAX_RETRY_ATTEMPTS_PROPERTY: &str = "maxIndicationDeliveryRetryAttempts";

/// Property name of the retry interval in configuration updates.
pub const MIN_RETRY_INTERVAL_PROPERTY: &str = "minIndicationDeliveryRetryInterval";

/// Settings captured by each destination queue when it is created.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSettings {
    /// Retry limit, interval and backoff.
    pub retry: RetryPolicy,
    /// Initial maximum number of queued indications.
    pub max_queue_length: usize,
    /// Recompute the maximum length once, after one lifetime has passed.
    pub adaptive_queue_length: bool,
    /// Fixed sequence identifier lifetime. Derived from the retry settings
    /// when absent.
    pub lifetime_override: Option<Duration>,
    /// How long a destination may fail before its subscriptions are
    /// reported for removal.
    pub subscription_removal_interval: Duration,
}

impl QueueSettings {
    /// How long an indication may stay queued before it expires.
    ///
    /// Without an override this is ten times the longest time the retry
    /// policy can keep an indication around with fixed backoff.
    pub fn lifetime(&self) -> Duration {
        self.lifetime_override.unwrap_or_else(|| {
            self.retry
                .min_retry_interval
                .saturating_mul(u32::from(self.retry.max_retry_attempts))
                .saturating_mul(10)
        })
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_queue_length: DEFAULT_MAX_QUEUE_LENGTH,
            adaptive_queue_length: true,
            lifetime_override: None,
            subscription_removal_interval: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

/// Runtime configuration of the reliable delivery service.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Upper bound on concurrently running delivery workers.
    pub max_delivery_threads: usize,
    /// Settings handed to every new destination queue.
    pub queue: QueueSettings,
    /// How often the dispatcher reclaims finished workers.
    pub idle_cleanup_interval: Duration,
    /// Time allowed for in-flight deliveries during shutdown.
    pub shutdown_timeout: Duration,
    /// First component of every sequence context.
    pub indication_service_name: String,
    /// Second component of every sequence context.
    pub object_manager_name: String,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_delivery_threads: DEFAULT_MAX_DELIVERY_THREADS,
            queue: QueueSettings::default(),
            idle_cleanup_interval: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(30),
            indication_service_name: "PG:IndicationService".to_string(),
            object_manager_name: "Pegasus".to_string(),
        }
    }
}

/// A setting that can be changed while the service is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigUpdate {
    /// New retry limit. Zero turns reliable delivery off for new
    /// indications.
    MaxRetryAttempts(u16),
    /// New minimum retry interval.
    MinRetryInterval(Duration),
}

impl ConfigUpdate {
    /// Parses a configuration property update.
    ///
    /// Accepts `maxIndicationDeliveryRetryAttempts` (a count) and
    /// `minIndicationDeliveryRetryInterval` (whole seconds).
    ///
    /// # Errors
    ///
    /// Returns an error for unknown property names, values that are not
    /// decimal integers, and a zero retry interval.
    pub fn parse(property: &str, value: &str) -> Result<Self> {
        match property {
            MAX_RETRY_ATTEMPTS_PROPERTY => {
                let attempts = value
                    .trim()
                    .parse::<u16>()
                    .with_context(|| format!("invalid value '{value}' for {property}"))?;
                Ok(Self::MaxRetryAttempts(attempts))
            },
            MIN_RETRY_INTERVAL_PROPERTY => {
                let seconds = value
                    .trim()
                    .parse::<u64>()
                    .with_context(|| format!("invalid value '{value}' for {property}"))?;
                ensure!(seconds > 0, "{property} must be greater than zero");
                Ok(Self::MinRetryInterval(Duration::from_secs(seconds)))
            },
            other => bail!("unknown delivery configuration property '{other}'"),
        }
    }

    /// Applies the update to a settings snapshot.
    pub fn apply(self, settings: &mut QueueSettings) {
        match self {
            Self::MaxRetryAttempts(attempts) => settings.retry.max_retry_attempts = attempts,
            Self::MinRetryInterval(interval) => settings.retry.min_retry_interval = interval,
        }
    }
}

/// Delivery service configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables prefixed with `TIDINGS_` (highest priority)
/// 2. Configuration file (`tidings.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// ```no_run
/// use tidings_delivery::ServiceConfig;
///
/// let config = ServiceConfig::load().expect("Failed to load configuration");
/// println!("delivering with up to {} workers", config.max_delivery_threads);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Maximum number of concurrent delivery workers.
    ///
    /// Environment variable: `TIDINGS_MAX_DELIVERY_THREADS`
    #[serde(default = "default_max_delivery_threads")]
    pub max_delivery_threads: usize,

    /// Retries after the initial attempt; zero disables reliable delivery.
    ///
    /// Environment variable: `TIDINGS_MAX_INDICATION_DELIVERY_RETRY_ATTEMPTS`
    #[serde(default = "default_max_retry_attempts")]
    pub max_indication_delivery_retry_attempts: u16,

    /// Minimum seconds between attempts for the same indication.
    ///
    /// Environment variable:
    /// `TIDINGS_MIN_INDICATION_DELIVERY_RETRY_INTERVAL_SECONDS`
    #[serde(default = "default_min_retry_interval")]
    pub min_indication_delivery_retry_interval_seconds: u64,

    /// Maximum number of indications queued per destination.
    ///
    /// Environment variable: `TIDINGS_MAX_QUEUE_LENGTH`
    #[serde(default = "default_max_queue_length")]
    pub max_queue_length: usize,

    /// Recompute each queue's maximum length from its observed arrival rate.
    ///
    /// Environment variable: `TIDINGS_ADAPTIVE_QUEUE_LENGTH`
    #[serde(default = "default_true")]
    pub adaptive_queue_length: bool,

    /// Fixed sequence identifier lifetime in seconds.
    ///
    /// Environment variable: `TIDINGS_SEQUENCE_IDENTIFIER_LIFETIME_SECONDS`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_identifier_lifetime_seconds: Option<u64>,

    /// Seconds of failed delivery before subscriptions are reported for
    /// removal.
    ///
    /// Environment variable: `TIDINGS_SUBSCRIPTION_REMOVAL_INTERVAL_SECONDS`
    #[serde(default = "default_subscription_removal_interval")]
    pub subscription_removal_interval_seconds: u64,

    /// Seconds between reclaiming finished delivery workers.
    ///
    /// Environment variable: `TIDINGS_IDLE_WORKER_CLEANUP_INTERVAL_SECONDS`
    #[serde(default = "default_idle_cleanup_interval")]
    pub idle_worker_cleanup_interval_seconds: u64,

    /// Seconds allowed for in-flight deliveries at shutdown.
    ///
    /// Environment variable: `TIDINGS_SHUTDOWN_TIMEOUT_SECONDS`
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,

    /// How retry delays grow: `fixed`, `linear` or `exponential`.
    ///
    /// Environment variable: `TIDINGS_BACKOFF_STRATEGY`
    #[serde(default)]
    pub backoff_strategy: BackoffStrategy,

    /// Largest retry delay in seconds when backoff grows the delay.
    ///
    /// Environment variable: `TIDINGS_MAX_RETRY_DELAY_SECONDS`
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_seconds: u64,

    /// Jitter factor for retry timing (0.0 to 1.0).
    ///
    /// Environment variable: `TIDINGS_RETRY_JITTER_FACTOR`
    #[serde(default)]
    pub retry_jitter_factor: f64,

    /// Indication service name used in sequence contexts.
    ///
    /// Environment variable: `TIDINGS_INDICATION_SERVICE_NAME`
    #[serde(default = "default_indication_service_name")]
    pub indication_service_name: String,

    /// Object manager name used in sequence contexts.
    ///
    /// Environment variable: `TIDINGS_OBJECT_MANAGER_NAME`
    #[serde(default = "default_object_manager_name")]
    pub object_manager_name: String,
}

impl ServiceConfig {
    /// Loads configuration from defaults, `tidings.toml` and `TIDINGS_*`
    /// environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or the merged
    /// configuration fails [`ServiceConfig::validate`].
    pub fn load() -> Result<Self> {
        Self::from_figment(Self::figment())
    }

    /// Returns the figment used by [`ServiceConfig::load`], for callers
    /// that want to merge additional providers.
    pub fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    /// Extracts and validates configuration from a figment.
    ///
    /// # Errors
    ///
    /// Returns an error if extraction or validation fails.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().context("Failed to load delivery configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns an error for a zero worker bound, a zero retry interval, a
    /// zero queue length or a jitter factor outside `0.0..=1.0`.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_delivery_threads > 0, "max_delivery_threads must be greater than zero");
        ensure!(
            self.min_indication_delivery_retry_interval_seconds > 0,
            "min_indication_delivery_retry_interval_seconds must be greater than zero"
        );
        ensure!(self.max_queue_length > 0, "max_queue_length must be greater than zero");
        ensure!(
            (0.0..=1.0).contains(&self.retry_jitter_factor),
            "retry_jitter_factor must be between 0.0 and 1.0, got {}",
            self.retry_jitter_factor
        );
        Ok(())
    }

    /// Converts to the runtime configuration.
    pub fn to_delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            max_delivery_threads: self.max_delivery_threads,
            queue: QueueSettings {
                retry: self.to_retry_policy(),
                max_queue_length: self.max_queue_length,
                adaptive_queue_length: self.adaptive_queue_length,
                lifetime_override: self
                    .sequence_identifier_lifetime_seconds
                    .map(Duration::from_secs),
                subscription_removal_interval: Duration::from_secs(
                    self.subscription_removal_interval_seconds,
                ),
            },
            idle_cleanup_interval: Duration::from_secs(self.idle_worker_cleanup_interval_seconds),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_seconds),
            indication_service_name: self.indication_service_name.clone(),
            object_manager_name: self.object_manager_name.clone(),
        }
    }

    /// Converts the retry settings to a policy.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retry_attempts: self.max_indication_delivery_retry_attempts,
            min_retry_interval: Duration::from_secs(
                self.min_indication_delivery_retry_interval_seconds,
            ),
            max_delay: Duration::from_secs(self.max_retry_delay_seconds),
            jitter_factor: self.retry_jitter_factor,
            backoff_strategy: self.backoff_strategy,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_delivery_threads: default_max_delivery_threads(),
            max_indication_delivery_retry_attempts: default_max_retry_attempts(),
            min_indication_delivery_retry_interval_seconds: default_min_retry_interval(),
            max_queue_length: default_max_queue_length(),
            adaptive_queue_length: true,
            sequence_identifier_lifetime_seconds: None,
            subscription_removal_interval_seconds: default_subscription_removal_interval(),
            idle_worker_cleanup_interval_seconds: default_idle_cleanup_interval(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
            backoff_strategy: BackoffStrategy::Fixed,
            max_retry_delay_seconds: default_max_retry_delay(),
            retry_jitter_factor: 0.0,
            indication_service_name: default_indication_service_name(),
            object_manager_name: default_object_manager_name(),
        }
    }
}

fn default_max_delivery_threads() -> usize {
    DEFAULT_MAX_DELIVERY_THREADS
}

fn default_max_retry_attempts() -> u16 {
    3
}

fn default_min_retry_interval() -> u64 {
    20
}

fn default_max_queue_length() -> usize {
    DEFAULT_MAX_QUEUE_LENGTH
}

fn default_true() -> bool {
    true
}

fn default_subscription_removal_interval() -> u64 {
    30 * 24 * 60 * 60
}

fn default_idle_cleanup_interval() -> u64 {
    300
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_max_retry_delay() -> u64 {
    600
}

fn default_indication_service_name() -> String {
    "PG:IndicationService".to_string()
}

fn default_object_manager_name() -> String {
    "Pegasus".to_string()
}
