use std::net::SocketAddr;
use std::time::Duration;

use crate::domain::entities::connection::HealthPolicy;
use crate::domain::services::circuit_breaker::BreakerConfig;
use crate::domain::services::tick_pipeline::TickPipelineConfig;

/// Server configuration: health scoring, circuit breaking, tick flushing,
/// and the HTTP bind address. All tunables have production defaults and
/// can be overridden from the environment with range validation.
#[derive(Clone)]
pub struct BridgeConfig {
    pub bind_addr: SocketAddr,
    pub database_url: String,

    // Connection health
    pub healthy_threshold: u8,
    pub health_recovery_step: u8,
    pub health_failure_penalty: u8,
    pub max_consecutive_failures: u32,
    pub heartbeat_timeout_secs: u64,  // silence before Degraded
    pub disconnect_timeout_secs: u64, // silence before Disconnected
    pub sweep_interval_secs: u64,

    // Command dispatch
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_secs: u64,
    pub breaker_window_secs: u64,
    pub command_queue_ttl_secs: u64,
    pub pending_poll_limit: i64,

    // Tick ingestion
    pub flush_interval_secs: u64,
    pub tick_buffer_ttl_secs: u64,
    pub tick_batch_rows: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            database_url: "sqlite://data/mtlink.db".to_string(),

            healthy_threshold: 70,
            health_recovery_step: 10,
            health_failure_penalty: 10,
            max_consecutive_failures: 10,
            heartbeat_timeout_secs: 60,
            disconnect_timeout_secs: 300,
            sweep_interval_secs: 30,

            breaker_failure_threshold: 5,
            breaker_cooldown_secs: 30,
            breaker_window_secs: 60,
            command_queue_ttl_secs: 3600,
            pending_poll_limit: 50,

            flush_interval_secs: 5,
            tick_buffer_ttl_secs: 300,
            tick_batch_rows: 1000,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults on missing or out-of-range values.
    pub fn from_env() -> Self {
        let mut config = BridgeConfig::default();

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }

        if let Ok(addr) = std::env::var("BIND_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(value) => config.bind_addr = value,
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse BIND_ADDR '{}': {}, using default: {}",
                        addr,
                        e,
                        config.bind_addr
                    );
                }
            }
        }

        if let Ok(threshold) = std::env::var("HEALTHY_THRESHOLD") {
            match threshold.parse::<u8>() {
                Ok(value) if value <= 100 => config.healthy_threshold = value,
                Ok(value) => {
                    tracing::warn!(
                        "Invalid HEALTHY_THRESHOLD value: {} (must be 0-100), using default: {}",
                        value,
                        config.healthy_threshold
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse HEALTHY_THRESHOLD '{}': {}, using default: {}",
                        threshold,
                        e,
                        config.healthy_threshold
                    );
                }
            }
        }

        if let Ok(cap) = std::env::var("MAX_CONSECUTIVE_FAILURES") {
            if let Ok(value) = cap.parse::<u32>() {
                if value > 0 && value <= 100 {
                    config.max_consecutive_failures = value;
                }
            }
        }

        if let Ok(timeout) = std::env::var("HEARTBEAT_TIMEOUT_SECS") {
            if let Ok(value) = timeout.parse::<u64>() {
                if value >= 5 && value <= 3600 {
                    config.heartbeat_timeout_secs = value;
                }
            }
        }

        if let Ok(timeout) = std::env::var("DISCONNECT_TIMEOUT_SECS") {
            if let Ok(value) = timeout.parse::<u64>() {
                if value >= config.heartbeat_timeout_secs && value <= 86400 {
                    config.disconnect_timeout_secs = value;
                }
            }
        }

        if let Ok(threshold) = std::env::var("BREAKER_FAILURE_THRESHOLD") {
            if let Ok(value) = threshold.parse::<u32>() {
                if value > 0 && value <= 100 {
                    config.breaker_failure_threshold = value;
                }
            }
        }

        if let Ok(cooldown) = std::env::var("BREAKER_COOLDOWN_SECS") {
            if let Ok(value) = cooldown.parse::<u64>() {
                if value > 0 && value <= 3600 {
                    config.breaker_cooldown_secs = value;
                }
            }
        }

        if let Ok(interval) = std::env::var("TICK_FLUSH_INTERVAL_SECS") {
            if let Ok(value) = interval.parse::<u64>() {
                if value > 0 && value <= 300 {
                    config.flush_interval_secs = value;
                }
            }
        }

        if let Ok(ttl) = std::env::var("TICK_BUFFER_TTL_SECS") {
            if let Ok(value) = ttl.parse::<u64>() {
                if value >= config.flush_interval_secs && value <= 3600 {
                    config.tick_buffer_ttl_secs = value;
                }
            }
        }

        if let Ok(rows) = std::env::var("TICK_BATCH_ROWS") {
            if let Ok(value) = rows.parse::<usize>() {
                if value >= 10 && value <= 10_000 {
                    config.tick_batch_rows = value;
                }
            }
        }

        config
    }

    pub fn health_policy(&self) -> HealthPolicy {
        HealthPolicy {
            recovery_step: self.health_recovery_step,
            failure_penalty: self.health_failure_penalty,
            healthy_threshold: self.healthy_threshold,
            max_consecutive_failures: self.max_consecutive_failures,
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker_failure_threshold,
            success_threshold: 1,
            cooldown: Duration::from_secs(self.breaker_cooldown_secs),
            window: Duration::from_secs(self.breaker_window_secs),
        }
    }

    pub fn tick_pipeline_config(&self) -> TickPipelineConfig {
        TickPipelineConfig {
            flush_interval: Duration::from_secs(self.flush_interval_secs),
            buffer_ttl: Duration::from_secs(self.tick_buffer_ttl_secs),
            max_batch_rows: self.tick_batch_rows,
        }
    }

    pub fn command_queue_ttl(&self) -> Duration {
        Duration::from_secs(self.command_queue_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.healthy_threshold, 70);
        assert_eq!(config.breaker_failure_threshold, 5);
        assert_eq!(config.tick_batch_rows, 1000);
        assert_eq!(config.flush_interval_secs, 5);
    }

    #[test]
    fn test_derived_configs_match() {
        let config = BridgeConfig::default();

        let policy = config.health_policy();
        assert_eq!(policy.healthy_threshold, 70);
        assert_eq!(policy.max_consecutive_failures, 10);

        let breaker = config.breaker_config();
        assert_eq!(breaker.failure_threshold, 5);
        assert_eq!(breaker.cooldown, Duration::from_secs(30));

        let pipeline = config.tick_pipeline_config();
        assert_eq!(pipeline.max_batch_rows, 1000);
        assert_eq!(pipeline.buffer_ttl, Duration::from_secs(300));
    }
}
