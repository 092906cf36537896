//! Connection entity
//!
//! One logical connection per trading account. Process-local and never
//! persisted: the EA re-handshakes after a restart and the registry is
//! rebuilt from the next heartbeat.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Connection state machine
///
/// Connecting → Connected (first heartbeat) → Degraded (score below
/// threshold or missed heartbeats) → Disconnected (hard failure cap or
/// explicit removal). Disconnected is terminal until the account
/// re-registers; Degraded recovers to Connected on a good heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Degraded,
    Disconnected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Disconnected => "disconnected",
        };
        write!(f, "{}", s)
    }
}

/// Tunables for health scoring and state transitions
#[derive(Debug, Clone)]
pub struct HealthPolicy {
    /// Score gained per successful heartbeat
    pub recovery_step: u8,
    /// Base penalty per failure; scales with consecutive_failures
    pub failure_penalty: u8,
    /// A connection is healthy above this score
    pub healthy_threshold: u8,
    /// Consecutive failures after which the connection is dropped
    pub max_consecutive_failures: u32,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            recovery_step: 10,
            failure_penalty: 10,
            healthy_threshold: 70,
            max_consecutive_failures: 10,
        }
    }
}

/// Account metrics carried by a heartbeat
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatMetrics {
    pub balance: f64,
    pub equity: f64,
    pub margin: f64,
    pub free_margin: f64,
    pub latency_ms: u32,
}

/// Live connection for one trading account
#[derive(Debug, Clone, Serialize)]
pub struct Connection {
    pub account_id: i64,
    pub account_number: String,
    pub broker: String,
    pub state: ConnectionState,
    /// Always within [0, 100]
    pub health_score: u8,
    pub consecutive_failures: u32,
    pub heartbeat_count: u64,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Rolling average, weighted toward history
    pub latency_ms: Option<u32>,
    pub balance: f64,
    pub equity: f64,
    pub margin: f64,
    pub free_margin: f64,
    pub connected_at: DateTime<Utc>,
}

impl Connection {
    pub fn new(account_id: i64, account_number: String, broker: String) -> Self {
        Self {
            account_id,
            account_number,
            broker,
            state: ConnectionState::Connecting,
            health_score: 100,
            consecutive_failures: 0,
            heartbeat_count: 0,
            last_heartbeat: None,
            latency_ms: None,
            balance: 0.0,
            equity: 0.0,
            margin: 0.0,
            free_margin: 0.0,
            connected_at: Utc::now(),
        }
    }

    /// Apply one successful heartbeat: counters reset, score recovers
    /// toward 100, Degraded returns to Connected once above threshold.
    pub fn apply_heartbeat(&mut self, metrics: HeartbeatMetrics, policy: &HealthPolicy) {
        self.heartbeat_count += 1;
        self.last_heartbeat = Some(Utc::now());
        self.consecutive_failures = 0;

        // Widened to u64: the weighted sum can exceed u32 for large
        // EA-supplied latencies; the average itself always fits.
        self.latency_ms = Some(match self.latency_ms {
            Some(prev) => ((prev as u64 * 3 + metrics.latency_ms as u64) / 4) as u32,
            None => metrics.latency_ms,
        });

        self.balance = metrics.balance;
        self.equity = metrics.equity;
        self.margin = metrics.margin;
        self.free_margin = metrics.free_margin;

        self.health_score = self
            .health_score
            .saturating_add(policy.recovery_step)
            .min(100);

        // Disconnected stays terminal until an explicit re-register
        if self.state != ConnectionState::Disconnected
            && self.health_score > policy.healthy_threshold
        {
            self.state = ConnectionState::Connected;
        }
    }

    /// Apply one delivery/response failure with an escalating penalty.
    pub fn apply_failure(&mut self, policy: &HealthPolicy) {
        self.consecutive_failures += 1;

        let penalty = (policy.failure_penalty as u32) * self.consecutive_failures;
        self.health_score = self.health_score.saturating_sub(penalty.min(100) as u8);

        if self.consecutive_failures >= policy.max_consecutive_failures {
            self.state = ConnectionState::Disconnected;
        } else if self.health_score <= policy.healthy_threshold
            && self.state != ConnectionState::Disconnected
        {
            self.state = ConnectionState::Degraded;
        }
    }

    pub fn is_healthy(&self, policy: &HealthPolicy) -> bool {
        self.health_score > policy.healthy_threshold
            && self.state != ConnectionState::Disconnected
    }

    /// Whether the fast-path queue is worth targeting at all
    pub fn is_reachable(&self) -> bool {
        self.state != ConnectionState::Disconnected
    }
}
