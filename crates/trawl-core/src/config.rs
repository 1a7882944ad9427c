use std::str::FromStr;
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::AppError;
use crate::governor::{MIN_RATE_FLOOR, RateGovernorConfig};
use crate::memory::BackpressureConfig;

/// Settings for one retrieval pipeline (one logical remote endpoint).
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Name used for the rate governor and in logs.
    pub endpoint_name: String,
    pub governor: RateGovernorConfig,
    pub cache: CacheConfig,
    pub circuit: CircuitBreakerConfig,
    pub backpressure: BackpressureConfig,
    /// Overall deadline for each network call.
    pub request_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            endpoint_name: "default".to_string(),
            governor: RateGovernorConfig::default(),
            cache: CacheConfig::default(),
            circuit: CircuitBreakerConfig::default(),
            backpressure: BackpressureConfig::default(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl PipelineConfig {
    pub fn with_endpoint_name(mut self, name: impl Into<String>) -> Self {
        self.endpoint_name = name.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Read configuration from environment variables. Unset variables keep
    /// their defaults.
    ///
    /// - `TRAWL_ENDPOINT_NAME`
    /// - `TRAWL_RATE_INITIAL`, `TRAWL_RATE_MIN`, `TRAWL_RATE_MAX` (requests/s)
    /// - `TRAWL_CACHE_MAX_ENTRIES`, `TRAWL_CACHE_MAX_BYTES`, `TRAWL_CACHE_TTL_SECS`
    /// - `TRAWL_CIRCUIT_FAILURE_THRESHOLD`, `TRAWL_CIRCUIT_RECOVERY_SECS`
    /// - `TRAWL_MEMORY_THRESHOLD_BYTES` (enables backpressure)
    /// - `TRAWL_REQUEST_TIMEOUT_SECS`
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(name) = lookup("TRAWL_ENDPOINT_NAME") {
            let name = name.trim();
            if name.is_empty() {
                return Err(AppError::ConfigError(
                    "TRAWL_ENDPOINT_NAME must not be empty".into(),
                ));
            }
            config.endpoint_name = name.to_string();
        }

        let rates = &mut config.governor;
        rates.initial_rate = parse_rate(&lookup, "TRAWL_RATE_INITIAL", rates.initial_rate)?;
        rates.min_rate = parse_rate(&lookup, "TRAWL_RATE_MIN", rates.min_rate)?;
        rates.max_rate = parse_rate(&lookup, "TRAWL_RATE_MAX", rates.max_rate)?;
        if rates.min_rate > rates.max_rate {
            return Err(AppError::ConfigError(format!(
                "TRAWL_RATE_MIN ({}) must not exceed TRAWL_RATE_MAX ({})",
                rates.min_rate, rates.max_rate
            )));
        }

        config.cache.max_size = parse(&lookup, "TRAWL_CACHE_MAX_ENTRIES", config.cache.max_size)?;
        config.cache.memory_threshold_bytes = parse(
            &lookup,
            "TRAWL_CACHE_MAX_BYTES",
            config.cache.memory_threshold_bytes,
        )?;
        config.cache.default_ttl = Duration::from_secs(parse(
            &lookup,
            "TRAWL_CACHE_TTL_SECS",
            config.cache.default_ttl.as_secs(),
        )?);

        let threshold = parse(
            &lookup,
            "TRAWL_CIRCUIT_FAILURE_THRESHOLD",
            config.circuit.failure_threshold,
        )?;
        if threshold == 0 {
            return Err(AppError::ConfigError(
                "TRAWL_CIRCUIT_FAILURE_THRESHOLD must be at least 1".into(),
            ));
        }
        config.circuit.failure_threshold = threshold;
        config.circuit.recovery_timeout = Duration::from_secs(parse(
            &lookup,
            "TRAWL_CIRCUIT_RECOVERY_SECS",
            config.circuit.recovery_timeout.as_secs(),
        )?);

        if lookup("TRAWL_MEMORY_THRESHOLD_BYTES").is_some() {
            let bytes = parse(&lookup, "TRAWL_MEMORY_THRESHOLD_BYTES", 0u64)?;
            config.backpressure = config.backpressure.with_threshold(bytes);
        }

        let timeout = parse(
            &lookup,
            "TRAWL_REQUEST_TIMEOUT_SECS",
            config.request_timeout.as_secs(),
        )?;
        if timeout == 0 {
            return Err(AppError::ConfigError(
                "TRAWL_REQUEST_TIMEOUT_SECS must be at least 1".into(),
            ));
        }
        config.request_timeout = Duration::from_secs(timeout);

        Ok(config)
    }
}

fn parse<F, T>(lookup: &F, key: &str, default: T) -> Result<T, AppError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| {
            AppError::ConfigError(format!(
                "Invalid {key} '{raw}': must be a non-negative integer"
            ))
        }),
    }
}

fn parse_rate<F>(lookup: &F, key: &str, default: f64) -> Result<f64, AppError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    match raw.trim().parse::<f64>() {
        Ok(rate) if rate.is_finite() && rate >= MIN_RATE_FLOOR => Ok(rate),
        _ => Err(AppError::ConfigError(format!(
            "Invalid {key} '{raw}': must be at least {MIN_RATE_FLOOR} requests per second"
        ))),
    }
}
