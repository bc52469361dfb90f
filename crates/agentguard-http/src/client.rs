//! Health-probe client for remote agent servers, backed by `reqwest`.
//!
//! Features:
//! - One circuit breaker per agent host, shared through a registry
//! - Per-attempt deadline through a cancellation token (the request is
//!   dropped when the token fires)
//! - Retry with short exponential backoff for transient errors

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Deserializer, Serialize};

use agentguard_core::{
    create_timeout_controller, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry,
    CircuitState, GuardError, RetryConfig, RetryPolicy,
};

const TIMEOUT_MESSAGE: &str = "health probe timed out";

/// Agent health as seen through its circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Breaker closed: the agent is answering normally.
    Healthy,
    /// Breaker half-open: the agent is being probed after failures.
    Degraded,
    /// Breaker open: the agent is being skipped.
    Unhealthy,
    /// The agent has never been probed.
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl From<CircuitState> for HealthStatus {
    fn from(state: CircuitState) -> Self {
        match state {
            CircuitState::Closed => Self::Healthy,
            CircuitState::HalfOpen => Self::Degraded,
            CircuitState::Open => Self::Unhealthy,
        }
    }
}

/// Configuration for `ProbeClient`.
///
/// Every field left out of a config file takes the probe default below,
/// including fields missing inside a partial `retry` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Path appended to the agent's base URL.
    #[serde(default = "default_path")]
    pub path: String,
    /// Deadline for each attempt.
    #[serde(
        rename = "timeout_ms",
        with = "agentguard_core::serde_ms",
        default = "default_timeout"
    )]
    pub timeout: Duration,
    #[serde(default = "default_retry", deserialize_with = "probe_retry")]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            timeout: default_timeout(),
            retry: default_retry(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

fn default_path() -> String {
    "/health".into()
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 2,
        base_delay: Duration::from_millis(500),
        max_delay: Duration::from_secs(5),
        ..Default::default()
    }
}

/// Field-wise overrides of `default_retry()`.
#[derive(Deserialize)]
struct RetryOverrides {
    max_attempts: Option<u32>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    multiplier: Option<f64>,
    jitter_fraction: Option<f64>,
}

fn probe_retry<'de, D: Deserializer<'de>>(deserializer: D) -> Result<RetryConfig, D::Error> {
    let overrides = RetryOverrides::deserialize(deserializer)?;
    let base = default_retry();
    Ok(RetryConfig {
        max_attempts: overrides.max_attempts.unwrap_or(base.max_attempts),
        base_delay: overrides
            .base_delay_ms
            .map_or(base.base_delay, Duration::from_millis),
        max_delay: overrides
            .max_delay_ms
            .map_or(base.max_delay, Duration::from_millis),
        multiplier: overrides.multiplier.unwrap_or(base.multiplier),
        jitter_fraction: overrides.jitter_fraction.unwrap_or(base.jitter_fraction),
    })
}

/// Outcome of a successful probe.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub url: String,
    pub status: u16,
    /// Wall time across all attempts, backoff included.
    pub latency: Duration,
    pub health: HealthStatus,
}

/// HTTP health prober with built-in reliability features.
pub struct ProbeClient {
    http: reqwest::Client,
    registry: Arc<CircuitBreakerRegistry>,
    retry: RetryPolicy,
    config: ProbeConfig,
}

impl ProbeClient {
    /// Create a new client whose breakers live in `registry`.
    pub fn new(registry: Arc<CircuitBreakerRegistry>, config: ProbeConfig) -> Result<Self, GuardError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| GuardError::Other(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            registry,
            retry: RetryPolicy::new(config.retry.clone()),
            config,
        })
    }

    /// Create with default configuration.
    pub fn with_defaults(registry: Arc<CircuitBreakerRegistry>) -> Result<Self, GuardError> {
        Self::new(registry, ProbeConfig::default())
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// The breaker guarding the agent at `base_url`.
    pub fn breaker_for(&self, base_url: &str) -> Result<CircuitBreaker, GuardError> {
        let name = dependency_name(base_url)?;
        Ok(self
            .registry
            .get(&name, Some(self.config.circuit_breaker.clone())))
    }

    /// Current health of the agent at `base_url`, without probing it.
    pub fn health(&self, base_url: &str) -> HealthStatus {
        let Ok(name) = dependency_name(base_url) else {
            return HealthStatus::Unknown;
        };
        self.registry
            .peek(&name)
            .map_or(HealthStatus::Unknown, |b| b.state().into())
    }

    /// Probe the agent at `base_url`.
    ///
    /// Non-2xx answers count as failures. Transient failures (transport
    /// errors, timeouts, 5xx, 429) are retried; an open circuit is returned
    /// straight away.
    pub async fn probe(&self, base_url: &str) -> Result<ProbeReport, GuardError> {
        let url = format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            self.config.path.trim_start_matches('/')
        );
        let breaker = self.breaker_for(base_url)?;
        let start = Instant::now();

        let status = self
            .retry
            .execute_if(|| self.attempt(&breaker, &url), GuardError::is_retryable)
            .await
            .map_err(|e| {
                tracing::warn!(url = %url, error = %e, "health probe failed");
                e
            })?;

        Ok(ProbeReport {
            url,
            status,
            latency: start.elapsed(),
            health: breaker.state().into(),
        })
    }

    async fn attempt(&self, breaker: &CircuitBreaker, url: &str) -> Result<u16, GuardError> {
        // The deadline sits inside the breaker: an aborted request is a
        // failure the breaker must see, since it will never settle.
        let controller = create_timeout_controller(self.config.timeout);
        let outcome = breaker
            .execute(|| controller.run(self.send_once(url), Some(TIMEOUT_MESSAGE)))
            .await;
        controller.cleanup();
        outcome
    }

    async fn send_once(&self, url: &str) -> Result<u16, GuardError> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| GuardError::Http(e.to_string()))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GuardError::Status { status, body });
        }
        tracing::debug!(url, status, "health probe answered");
        Ok(status)
    }
}

impl std::fmt::Debug for ProbeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeClient")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish()
    }
}

/// Breaker name for an agent: `agent:<host>:<port>`.
pub fn dependency_name(base_url: &str) -> Result<String, GuardError> {
    let url = reqwest::Url::parse(base_url)
        .map_err(|e| GuardError::Other(format!("invalid agent URL {base_url}: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| GuardError::Other(format!("agent URL has no host: {base_url}")))?;
    let port = url.port_or_known_default().unwrap_or(0);
    Ok(format!("agent:{host}:{port}"))
}
