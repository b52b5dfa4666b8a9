//! Configuration (spec.md §6.5).
//!
//! Every option is read from an environment variable under the `AMELIA_`
//! prefix with a documented default. `Config::from_env` never panics;
//! malformed values fail loudly with a descriptive `anyhow::Error` so
//! misconfiguration is caught at startup, not mid-run.

use std::time::Duration;

use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_url: String,

    pub log_retention_days: u32,
    pub log_retention_max_events: usize,

    pub websocket_idle_timeout_seconds: u64,
    pub workflow_start_timeout_seconds: u64,

    pub max_concurrent: usize,
    pub retry: RetryPolicy,

    pub max_review_iterations: u32,
    pub max_task_review_iterations: u32,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid value for {key}: {e}")),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let max_concurrent: usize = env_or("AMELIA_MAX_CONCURRENT", 5)?;
        anyhow::ensure!(max_concurrent >= 1, "AMELIA_MAX_CONCURRENT must be >= 1");

        let log_retention_days: u32 = env_or("AMELIA_LOG_RETENTION_DAYS", 30)?;
        anyhow::ensure!(log_retention_days >= 1, "AMELIA_LOG_RETENTION_DAYS must be >= 1");

        let log_retention_max_events: usize = env_or("AMELIA_LOG_RETENTION_MAX_EVENTS", 100_000)?;
        anyhow::ensure!(
            log_retention_max_events >= 1_000,
            "AMELIA_LOG_RETENTION_MAX_EVENTS must be >= 1000"
        );

        let max_retries: u32 = env_or("AMELIA_RETRY_MAX_RETRIES", 3)?;
        anyhow::ensure!(max_retries <= 10, "AMELIA_RETRY_MAX_RETRIES must be <= 10");
        let base_delay_secs: f64 = env_or("AMELIA_RETRY_BASE_DELAY", 1.0)?;
        let max_delay_secs: f64 = env_or("AMELIA_RETRY_MAX_DELAY", 60.0)?;

        Ok(Self {
            host: std::env::var("AMELIA_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
            port: env_or("AMELIA_PORT", 8420)?,
            database_url: std::env::var("AMELIA_DATABASE_URL").unwrap_or_else(|_| {
                "postgres://localhost/amelia".into()
            }),
            log_retention_days,
            log_retention_max_events,
            websocket_idle_timeout_seconds: env_or("AMELIA_WEBSOCKET_IDLE_TIMEOUT_SECONDS", 300)?,
            workflow_start_timeout_seconds: env_or("AMELIA_WORKFLOW_START_TIMEOUT_SECONDS", 60)?,
            max_concurrent,
            retry: RetryPolicy::new(
                max_retries,
                Duration::from_secs_f64(base_delay_secs),
                Duration::from_secs_f64(max_delay_secs),
            ),
            max_review_iterations: env_or("AMELIA_MAX_REVIEW_ITERATIONS", 3)?,
            max_task_review_iterations: env_or("AMELIA_MAX_TASK_REVIEW_ITERATIONS", 5)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_falls_back_to_default_when_unset() {
        std::env::remove_var("AMELIA_TEST_UNSET_KEY");
        let value: u16 = env_or("AMELIA_TEST_UNSET_KEY", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn env_or_reports_parse_errors() {
        std::env::set_var("AMELIA_TEST_BAD_KEY", "not-a-number");
        let result: anyhow::Result<u16> = env_or("AMELIA_TEST_BAD_KEY", 1);
        assert!(result.is_err());
        std::env::remove_var("AMELIA_TEST_BAD_KEY");
    }
}
