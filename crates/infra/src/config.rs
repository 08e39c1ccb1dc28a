//! Engine configuration from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use forgejobs_core::TenantId;

use crate::executor::ExecutorConfig;
use crate::heartbeat::HeartbeatConfig;
use crate::retry::BackoffPolicy;
use crate::scheduler::DEFAULT_CLAIM_LIMIT;

pub const ENV_ENABLED: &str = "FORGEJOBS_ENABLED";
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_REDIS_URL: &str = "REDIS_URL";
pub const ENV_MAX_RUNTIME_SECONDS: &str = "FORGEJOBS_MAX_RUNTIME_SECONDS";
pub const ENV_CLAIM_LIMIT: &str = "FORGEJOBS_CLAIM_LIMIT";
pub const ENV_MANUAL_COOLDOWN_SECONDS: &str = "FORGEJOBS_MANUAL_COOLDOWN_SECONDS";
pub const ENV_HEARTBEAT_INTERVAL_SECONDS: &str = "FORGEJOBS_HEARTBEAT_INTERVAL_SECONDS";
pub const ENV_CLEANUP_INTERVAL_SECONDS: &str = "FORGEJOBS_CLEANUP_INTERVAL_SECONDS";
pub const ENV_LOCK_TTL_SECONDS: &str = "FORGEJOBS_LOCK_TTL_SECONDS";
pub const ENV_MAX_BACKOFF_SECONDS: &str = "FORGEJOBS_MAX_BACKOFF_SECONDS";
pub const ENV_WORKER_CONCURRENCY: &str = "FORGEJOBS_WORKER_CONCURRENCY";
pub const ENV_HTTP_ADDR: &str = "FORGEJOBS_HTTP_ADDR";
pub const ENV_TENANT_ID: &str = "FORGEJOBS_TENANT_ID";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var} ({value:?}): {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub enabled: bool,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub max_runtime: Duration,
    pub claim_limit: usize,
    pub manual_cooldown: Duration,
    pub heartbeat_interval: Duration,
    pub cleanup_interval: Duration,
    pub lock_ttl: Duration,
    pub max_backoff: Option<Duration>,
    pub worker_concurrency: usize,
    pub http_addr: SocketAddr,
    pub tenant_id: TenantId,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            database_url: None,
            redis_url: None,
            max_runtime: Duration::from_secs(21_600),
            claim_limit: DEFAULT_CLAIM_LIMIT,
            manual_cooldown: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(15),
            cleanup_interval: Duration::from_secs(3_600),
            lock_ttl: Duration::from_secs(120),
            max_backoff: None,
            worker_concurrency: 4,
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            tenant_id: TenantId::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let defaults = Self::default();
        Ok(Self {
            enabled: env.parse_with(ENV_ENABLED, parse_bool)?.unwrap_or(defaults.enabled),
            database_url: env.get(ENV_DATABASE_URL),
            redis_url: env.get(ENV_REDIS_URL),
            max_runtime: env.seconds(ENV_MAX_RUNTIME_SECONDS, 1)?.unwrap_or(defaults.max_runtime),
            claim_limit: env.count(ENV_CLAIM_LIMIT)?.unwrap_or(defaults.claim_limit),
            manual_cooldown: env
                .seconds(ENV_MANUAL_COOLDOWN_SECONDS, 0)?
                .unwrap_or(defaults.manual_cooldown),
            heartbeat_interval: env
                .seconds(ENV_HEARTBEAT_INTERVAL_SECONDS, 1)?
                .unwrap_or(defaults.heartbeat_interval),
            cleanup_interval: env
                .seconds(ENV_CLEANUP_INTERVAL_SECONDS, 1)?
                .unwrap_or(defaults.cleanup_interval),
            lock_ttl: env.seconds(ENV_LOCK_TTL_SECONDS, 1)?.unwrap_or(defaults.lock_ttl),
            max_backoff: env.seconds(ENV_MAX_BACKOFF_SECONDS, 1)?,
            worker_concurrency: env
                .count(ENV_WORKER_CONCURRENCY)?
                .unwrap_or(defaults.worker_concurrency),
            http_addr: env
                .parse_with(ENV_HTTP_ADDR, |v| v.parse::<SocketAddr>().map_err(|e| e.to_string()))?
                .unwrap_or(defaults.http_addr),
            tenant_id: env
                .parse_with(ENV_TENANT_ID, |v| v.parse::<TenantId>().map_err(|e| e.message().to_string()))?
                .unwrap_or(defaults.tenant_id),
        })
    }

    pub fn backoff(&self) -> BackoffPolicy {
        match self.max_backoff {
            Some(cap) => BackoffPolicy::capped(cap),
            None => BackoffPolicy::uncapped(),
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_runtime: self.max_runtime,
            backoff: self.backoff(),
        }
    }

    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            enabled: self.enabled,
            interval: self.heartbeat_interval,
            cleanup_interval: self.cleanup_interval,
            lock_ttl: self.lock_ttl,
            max_runtime: self.max_runtime,
        }
    }

    pub fn manual_cooldown(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.manual_cooldown).unwrap_or(chrono::Duration::MAX)
    }
}

struct Lookup<F>(F);

impl<F: Fn(&str) -> Option<String>> Lookup<F> {
    fn get(&self, var: &str) -> Option<String> {
        (self.0)(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn parse_with<T>(
        &self,
        var: &'static str,
        parse: impl FnOnce(&str) -> Result<T, String>,
    ) -> Result<Option<T>, ConfigError> {
        let Some(value) = self.get(var) else {
            return Ok(None);
        };
        parse(&value)
            .map(Some)
            .map_err(|reason| ConfigError::Invalid { var, value, reason })
    }

    fn seconds(&self, var: &'static str, min: u64) -> Result<Option<Duration>, ConfigError> {
        self.parse_with(var, |v| {
            let secs: u64 = v.parse().map_err(|_| "expected a whole number of seconds".to_string())?;
            if secs < min {
                return Err(format!("must be at least {min}"));
            }
            Ok(Duration::from_secs(secs))
        })
    }

    fn count(&self, var: &'static str) -> Result<Option<usize>, ConfigError> {
        self.parse_with(var, |v| match v.parse::<usize>() {
            Ok(0) | Err(_) => Err("expected a positive integer".to_string()),
            Ok(n) => Ok(n),
        })
    }
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err("expected a boolean".to_string()),
    }
}
