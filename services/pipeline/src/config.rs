use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;
use stratum_activity::RetryPolicy;
use stratum_core::PipelineLimits;

// Pipeline service configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Optional Postgres URL; without it the service runs fully in memory.
    pub database_url: Option<String>,
    // Change-log retention (entries).
    pub log_capacity: usize,
    // Per-client stream queue depth.
    pub client_queue_capacity: usize,
    // Events the listener consumes per batch.
    pub dispatch_batch_size: usize,
    // Dispatch retry bounds.
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 200;
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 5000;

#[derive(Debug, Deserialize)]
struct PipelineConfigOverride {
    metrics_bind: Option<String>,
    database_url: Option<String>,
    log_capacity: Option<usize>,
    client_queue_capacity: Option<usize>,
    dispatch_batch_size: Option<usize>,
    retry_max_attempts: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    retry_max_delay_ms: Option<u64>,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        // Environment variables provide defaults for local development.
        let limits = PipelineLimits::default();
        let metrics_bind = std::env::var("STRATUM_METRICS_BIND")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .with_context(|| "parse STRATUM_METRICS_BIND")?;
        let database_url = std::env::var("STRATUM_DATABASE_URL").ok();
        let log_capacity = std::env::var("STRATUM_LOG_CAPACITY")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(limits.log_capacity);
        let client_queue_capacity = std::env::var("STRATUM_CLIENT_QUEUE_CAPACITY")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(limits.client_queue_capacity);
        let dispatch_batch_size = std::env::var("STRATUM_DISPATCH_BATCH")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(limits.dispatch_batch_size);
        let retry_max_attempts = std::env::var("STRATUM_RETRY_MAX_ATTEMPTS")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_RETRY_MAX_ATTEMPTS);
        let retry_base_delay_ms = std::env::var("STRATUM_RETRY_BASE_DELAY_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_RETRY_BASE_DELAY_MS);
        let retry_max_delay_ms = std::env::var("STRATUM_RETRY_MAX_DELAY_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_RETRY_MAX_DELAY_MS);
        Ok(Self {
            metrics_bind,
            database_url,
            log_capacity,
            client_queue_capacity,
            dispatch_batch_size,
            retry_max_attempts,
            retry_base_delay_ms,
            retry_max_delay_ms,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("STRATUM_PIPELINE_CONFIG") {
            // YAML overrides allow ops-friendly config files.
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read STRATUM_PIPELINE_CONFIG: {path}"))?;
            let override_cfg: PipelineConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse pipeline config yaml")?;
            if let Some(value) = override_cfg.metrics_bind {
                config.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
            }
            if let Some(value) = override_cfg.database_url {
                config.database_url = Some(value);
            }
            if let Some(value) = override_cfg.log_capacity {
                if value > 0 {
                    config.log_capacity = value;
                }
            }
            if let Some(value) = override_cfg.client_queue_capacity {
                if value > 0 {
                    config.client_queue_capacity = value;
                }
            }
            if let Some(value) = override_cfg.dispatch_batch_size {
                if value > 0 {
                    config.dispatch_batch_size = value;
                }
            }
            if let Some(value) = override_cfg.retry_max_attempts {
                if value > 0 {
                    config.retry_max_attempts = value;
                }
            }
            if let Some(value) = override_cfg.retry_base_delay_ms {
                config.retry_base_delay_ms = value;
            }
            if let Some(value) = override_cfg.retry_max_delay_ms {
                config.retry_max_delay_ms = value;
            }
        }
        Ok(config)
    }

    pub fn limits(&self) -> PipelineLimits {
        PipelineLimits {
            log_capacity: self.log_capacity,
            client_queue_capacity: self.client_queue_capacity,
            dispatch_batch_size: self.dispatch_batch_size,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }
}
