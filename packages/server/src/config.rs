//! Environment configuration.

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub worker_count: usize,
    pub chunk_size: usize,
    pub job_timeout_ms: u64,
    pub job_retention_days: i64,
    /// Passed through to a real LLM provider client when one is wired in
    pub llm_api_key: Option<String>,
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("{key} has an invalid value: {raw}")),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            port: env_parsed("PORT", 3000)?,
            worker_count: env_parsed("WORKER_COUNT", 2)?,
            chunk_size: env_parsed("CHUNK_SIZE", 5)?,
            job_timeout_ms: env_parsed("JOB_TIMEOUT_MS", 300_000)?,
            job_retention_days: env_parsed("JOB_RETENTION_DAYS", 30)?,
            llm_api_key: std::env::var("LLM_API_KEY").ok(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_parsed_default_and_override() {
        std::env::remove_var("TEST_KNOB_A");
        assert_eq!(env_parsed("TEST_KNOB_A", 42u64).unwrap(), 42);

        std::env::set_var("TEST_KNOB_B", "7");
        assert_eq!(env_parsed("TEST_KNOB_B", 42u64).unwrap(), 7);

        std::env::set_var("TEST_KNOB_C", "not a number");
        assert!(env_parsed("TEST_KNOB_C", 42u64).is_err());
    }
}
