//! Connection Registry / Health Monitor
//!
//! Tracks at most one live connection per account. The registry is the
//! leaf of the dependency graph: the dispatcher and reconciler consult it
//! to decide whether a target is reachable, nothing depends on its
//! internals.

use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::domain::entities::connection::{
    Connection, ConnectionState, HealthPolicy, HeartbeatMetrics,
};
use crate::domain::errors::CoreError;

/// Outcome of one periodic health sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub degraded: usize,
    pub disconnected: usize,
}

pub struct ConnectionRegistry {
    policy: HealthPolicy,
    connections: RwLock<HashMap<i64, Connection>>,
}

impl ConnectionRegistry {
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            policy,
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    /// Register a connection for an account. Idempotent: re-registering
    /// replaces the old connection, resets its counters, and moves the
    /// account to Connected.
    pub async fn register(
        &self,
        account_id: i64,
        account_number: String,
        broker: String,
    ) -> Connection {
        let mut connections = self.connections.write().await;
        let mut conn = Connection::new(account_id, account_number, broker);
        conn.state = ConnectionState::Connected;

        if connections.insert(account_id, conn.clone()).is_some() {
            info!("Re-registered connection for account {}", account_id);
        } else {
            info!("Registered new connection for account {}", account_id);
        }

        conn
    }

    pub async fn get(&self, account_id: i64) -> Option<Connection> {
        let connections = self.connections.read().await;
        connections.get(&account_id).cloned()
    }

    pub async fn all(&self) -> Vec<Connection> {
        let connections = self.connections.read().await;
        connections.values().cloned().collect()
    }

    /// Apply a heartbeat. Unknown accounts are rejected, not silently
    /// ignored, so the HTTP layer can return an explicit 4xx and the EA
    /// knows to re-handshake.
    pub async fn process_heartbeat(
        &self,
        account_id: i64,
        metrics: HeartbeatMetrics,
    ) -> Result<Connection, CoreError> {
        let mut connections = self.connections.write().await;
        let conn = connections
            .get_mut(&account_id)
            .ok_or(CoreError::UnknownAccount(account_id))?;

        conn.apply_heartbeat(metrics, &self.policy);
        debug!(
            "Heartbeat for account {}: score={} latency={:?}ms",
            account_id, conn.health_score, conn.latency_ms
        );
        Ok(conn.clone())
    }

    /// Record a delivery/response failure against the account's health.
    /// Unknown accounts are a no-op here: the failure already surfaced
    /// elsewhere and there is no connection to penalize.
    pub async fn record_failure(&self, account_id: i64) {
        let mut connections = self.connections.write().await;
        if let Some(conn) = connections.get_mut(&account_id) {
            conn.apply_failure(&self.policy);
            warn!(
                "Failure recorded for account {}: score={} consecutive={} state={}",
                account_id, conn.health_score, conn.consecutive_failures, conn.state
            );
        }
    }

    pub async fn is_healthy(&self, account_id: i64) -> bool {
        let connections = self.connections.read().await;
        connections
            .get(&account_id)
            .map(|c| c.is_healthy(&self.policy))
            .unwrap_or(false)
    }

    /// Explicit disconnect; the account must re-register afterwards
    pub async fn remove(&self, account_id: i64) -> bool {
        let mut connections = self.connections.write().await;
        let removed = connections.remove(&account_id).is_some();
        if removed {
            info!("Removed connection for account {}", account_id);
        }
        removed
    }

    /// Periodic health sweep: connections whose last heartbeat is older
    /// than `heartbeat_timeout` are degraded, and older than
    /// `disconnect_timeout` are dropped to Disconnected. Connections that
    /// never heartbeated are judged from their registration time.
    pub async fn sweep(
        &self,
        heartbeat_timeout: chrono::Duration,
        disconnect_timeout: chrono::Duration,
    ) -> SweepOutcome {
        let now = chrono::Utc::now();
        let mut outcome = SweepOutcome::default();
        let mut connections = self.connections.write().await;

        for conn in connections.values_mut() {
            if conn.state == ConnectionState::Disconnected {
                continue;
            }

            let last_seen = conn.last_heartbeat.unwrap_or(conn.connected_at);
            let silence = now - last_seen;

            if silence > disconnect_timeout {
                warn!(
                    "Account {} silent for {}s, marking disconnected",
                    conn.account_id,
                    silence.num_seconds()
                );
                conn.state = ConnectionState::Disconnected;
                outcome.disconnected += 1;
            } else if silence > heartbeat_timeout && conn.state != ConnectionState::Degraded {
                warn!(
                    "Account {} missed heartbeats for {}s, marking degraded",
                    conn.account_id,
                    silence.num_seconds()
                );
                conn.state = ConnectionState::Degraded;
                outcome.degraded += 1;
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> HeartbeatMetrics {
        HeartbeatMetrics {
            balance: 5_000.0,
            equity: 5_000.0,
            margin: 0.0,
            free_margin: 5_000.0,
            latency_ms: 20,
        }
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let registry = ConnectionRegistry::new(HealthPolicy::default());

        registry.register(42, "100042".to_string(), "Broker".to_string()).await;
        registry.record_failure(42).await;
        registry.record_failure(42).await;

        let conn = registry.register(42, "100042".to_string(), "Broker".to_string()).await;
        assert_eq!(conn.state, ConnectionState::Connected);
        assert_eq!(conn.consecutive_failures, 0);
        assert_eq!(conn.health_score, 100);
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_account_rejected() {
        let registry = ConnectionRegistry::new(HealthPolicy::default());
        let result = registry.process_heartbeat(99, metrics()).await;
        assert!(matches!(result, Err(CoreError::UnknownAccount(99))));
    }

    #[tokio::test]
    async fn test_heartbeat_resets_failures() {
        let registry = ConnectionRegistry::new(HealthPolicy::default());
        registry.register(1, "1".to_string(), "b".to_string()).await;

        for _ in 0..4 {
            registry.record_failure(1).await;
        }
        let conn = registry.get(1).await.unwrap();
        assert_eq!(conn.consecutive_failures, 4);

        let conn = registry.process_heartbeat(1, metrics()).await.unwrap();
        assert_eq!(conn.consecutive_failures, 0);
        assert_eq!(conn.heartbeat_count, 1);
    }

    #[tokio::test]
    async fn test_is_healthy_gates_on_state_and_score() {
        let registry = ConnectionRegistry::new(HealthPolicy::default());
        assert!(!registry.is_healthy(1).await);

        registry.register(1, "1".to_string(), "b".to_string()).await;
        assert!(registry.is_healthy(1).await);

        for _ in 0..10 {
            registry.record_failure(1).await;
        }
        assert!(!registry.is_healthy(1).await);
        assert_eq!(
            registry.get(1).await.unwrap().state,
            ConnectionState::Disconnected
        );
    }

    #[tokio::test]
    async fn test_remove() {
        let registry = ConnectionRegistry::new(HealthPolicy::default());
        registry.register(1, "1".to_string(), "b".to_string()).await;

        assert!(registry.remove(1).await);
        assert!(!registry.remove(1).await);
        assert!(registry.get(1).await.is_none());
    }

    #[tokio::test]
    async fn test_sweep_degrades_stale_connections() {
        let registry = ConnectionRegistry::new(HealthPolicy::default());
        registry.register(1, "1".to_string(), "b".to_string()).await;

        // Registration just happened, nothing is stale yet
        let outcome = registry
            .sweep(chrono::Duration::seconds(60), chrono::Duration::seconds(300))
            .await;
        assert_eq!(outcome, SweepOutcome::default());

        // Zero-width timeouts make the fresh registration count as silent
        let outcome = registry
            .sweep(chrono::Duration::zero(), chrono::Duration::seconds(300))
            .await;
        assert_eq!(outcome.degraded, 1);
        assert_eq!(
            registry.get(1).await.unwrap().state,
            ConnectionState::Degraded
        );

        let outcome = registry
            .sweep(chrono::Duration::zero(), chrono::Duration::zero())
            .await;
        assert_eq!(outcome.disconnected, 1);
        assert_eq!(
            registry.get(1).await.unwrap().state,
            ConnectionState::Disconnected
        );
    }
}
