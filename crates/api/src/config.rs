//! Process configuration from environment variables.
//!
//! `main` loads an optional `.env` file (dotenvy) before calling
//! [`ApiConfig::from_env`].

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use larder_infra::jobs::WorkerConfig;
use larder_observability::LogFormat;

const DEV_JWT_SECRET: &str = "dev-secret";

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_addr: SocketAddr,
    pub jwt_secret: String,
    /// Postgres queue store when set, in-memory otherwise.
    pub database_url: Option<String>,
    pub worker_concurrency: usize,
    pub job_lease: Duration,
    pub job_max_attempts: u32,
    pub worker_poll: Duration,
    /// Request-path wait budget for synchronous job endpoints.
    pub wait_timeout: Duration,
    pub log_format: LogFormat,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            jwt_secret: DEV_JWT_SECRET.to_string(),
            database_url: None,
            worker_concurrency: 2,
            job_lease: Duration::from_secs(300),
            job_max_attempts: 3,
            worker_poll: Duration::from_millis(250),
            wait_timeout: Duration::from_secs(30),
            log_format: LogFormat::Json,
        }
    }
}

impl ApiConfig {
    /// True when `JWT_SECRET` was not provided. `main` warns about it once
    /// logging is up.
    pub fn uses_dev_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source (tests pass a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let jwt_secret = get("JWT_SECRET").unwrap_or(defaults.jwt_secret);

        Ok(Self {
            bind_addr: parse_or(get("BIND_ADDR"), "BIND_ADDR", defaults.bind_addr)?,
            jwt_secret,
            database_url: get("DATABASE_URL"),
            worker_concurrency: parse_or(get("WORKER_CONCURRENCY"), "WORKER_CONCURRENCY", defaults.worker_concurrency)?
                .max(1),
            job_lease: Duration::from_secs(parse_or(get("JOB_LEASE_SECS"), "JOB_LEASE_SECS", defaults.job_lease.as_secs())?),
            job_max_attempts: parse_or(get("JOB_MAX_ATTEMPTS"), "JOB_MAX_ATTEMPTS", defaults.job_max_attempts)?.max(1),
            worker_poll: Duration::from_millis(parse_or(
                get("WORKER_POLL_MS"),
                "WORKER_POLL_MS",
                defaults.worker_poll.as_millis() as u64,
            )?),
            wait_timeout: Duration::from_secs(parse_or(
                get("WAIT_TIMEOUT_SECS"),
                "WAIT_TIMEOUT_SECS",
                defaults.wait_timeout.as_secs(),
            )?),
            log_format: parse_or(get("LOG_FORMAT"), "LOG_FORMAT", defaults.log_format)?,
        })
    }

    /// Worker settings shared by every lane.
    pub fn worker_config(&self) -> WorkerConfig {
        let sweep = (self.job_lease / 4).clamp(Duration::from_millis(100), Duration::from_secs(30));
        WorkerConfig::default()
            .with_concurrency(self.worker_concurrency)
            .with_poll_interval(self.worker_poll)
            .with_lease_timeout(self.job_lease)
            .with_sweep_interval(sweep)
            .with_max_attempts(self.job_max_attempts)
            .with_handler_timeout(self.job_lease)
    }
}

fn parse_or<T>(raw: Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match raw {
        Some(value) => value
            .trim()
            .parse()
            .with_context(|| format!("invalid {key}: {value}")),
        None => Ok(default),
    }
}
