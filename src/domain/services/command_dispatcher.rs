//! Command Dispatcher
//!
//! Creates commands, persists them durably, pushes them onto the target
//! account's fast-path queue, and applies the single allowed terminal
//! transition when the EA responds.
//!
//! Delivery contract:
//! - The durable row is written before the fast-path push and is never
//!   rolled back; a lost push only costs latency because the polling read
//!   path picks the row up.
//! - A command that will be queued immediately is written as `executing`,
//!   not `pending`, so a concurrent retry scan cannot queue it a second
//!   time between the insert and the push.
//! - Retriable execution failures feed the per-account circuit breaker;
//!   once open, new command creation is rejected until a success closes
//!   the circuit again.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::entities::command::{
    CommandKind, CommandOutcome, CommandPriority, CommandStatus,
};
use crate::domain::errors::{CoreError, FailureClass};
use crate::domain::services::circuit_breaker::{BreakerStats, CommandCircuitBreakers};
use crate::domain::services::connection_registry::ConnectionRegistry;
use crate::infrastructure::fast_path::{CommandResponseEvent, FastPath};
use crate::persistence::models::{CommandRecord, CreateCommand};
use crate::persistence::repository::CommandRepository;
use crate::persistence::DbPool;

pub struct CommandDispatcher {
    commands: CommandRepository,
    fast_path: Arc<dyn FastPath>,
    breakers: CommandCircuitBreakers,
    registry: Arc<ConnectionRegistry>,
}

impl CommandDispatcher {
    pub fn new(
        pool: DbPool,
        fast_path: Arc<dyn FastPath>,
        registry: Arc<ConnectionRegistry>,
        breakers: CommandCircuitBreakers,
    ) -> Self {
        Self {
            commands: CommandRepository::new(pool),
            fast_path,
            breakers,
            registry,
        }
    }

    /// Create a command with a freshly generated id.
    pub async fn create_command(
        &self,
        account_id: i64,
        kind: CommandKind,
        priority: CommandPriority,
    ) -> Result<CommandRecord, CoreError> {
        self.create_command_with_id(Uuid::new_v4(), account_id, kind, priority)
            .await
    }

    /// Create a command under a caller-supplied id. Re-invoking with an id
    /// that already exists returns the existing row untouched: no second
    /// durable write, no second fast-path push.
    pub async fn create_command_with_id(
        &self,
        id: Uuid,
        account_id: i64,
        kind: CommandKind,
        priority: CommandPriority,
    ) -> Result<CommandRecord, CoreError> {
        if !self.breakers.is_call_permitted(account_id).await {
            warn!(
                "Rejecting command {} for account {}: circuit open",
                kind.name(),
                account_id
            );
            return Err(CoreError::CircuitOpen(account_id));
        }

        if let Some(existing) = self.commands.get(&id.to_string()).await? {
            debug!("Command {} already exists, returning existing row", id);
            return Ok(existing);
        }

        // The registry decides whether a fast-path push is worth attempting.
        let reachable = self
            .registry
            .get(account_id)
            .await
            .map(|c| c.is_reachable())
            .unwrap_or(false);

        let status = if reachable {
            CommandStatus::Executing
        } else {
            CommandStatus::Pending
        };

        let record = self
            .commands
            .create(CreateCommand {
                id: id.to_string(),
                account_id,
                kind: kind.name().to_string(),
                payload: kind.payload().to_string(),
                priority: priority.as_str().to_string(),
                status: status.as_str().to_string(),
            })
            .await?;

        info!(
            "Created command {} ({}, {}) for account {} as {}",
            record.id,
            record.kind,
            record.priority,
            account_id,
            record.status
        );

        if reachable {
            let view = flatten_view(&record);
            if let Err(e) = self.fast_path.push(account_id, view).await {
                // The durable row is the fallback delivery path; a push
                // failure only costs latency and one health penalty.
                warn!(
                    "Fast-path push failed for command {} (account {}): {}",
                    record.id, account_id, e
                );
                self.registry.record_failure(account_id).await;
            }
        }

        Ok(record)
    }

    /// Ordered non-destructive read for polling agents: priority tiers
    /// first (high, normal, low), FIFO within a tier.
    pub async fn get_pending_commands(
        &self,
        account_id: i64,
        limit: i64,
    ) -> Result<Vec<CommandRecord>, CoreError> {
        Ok(self.commands.get_pending(account_id, limit).await?)
    }

    /// Apply the terminal transition for one command and publish the
    /// response exactly once. Calling twice with the same id is a no-op
    /// the second time: no state change and no second publish.
    pub async fn process_command_response(
        &self,
        command_id: Uuid,
        outcome: CommandOutcome,
        response: Option<Value>,
    ) -> Result<CommandRecord, CoreError> {
        let record = self
            .commands
            .get(&command_id.to_string())
            .await?
            .ok_or(CoreError::UnknownCommand(command_id))?;

        if CommandStatus::parse(&record.status).is_some_and(|s| s.is_terminal()) {
            debug!(
                "Command {} already terminal ({}), ignoring duplicate response",
                command_id, record.status
            );
            return Ok(record);
        }

        let status = outcome.status();
        let response_text = response.as_ref().map(|v| v.to_string());
        let rows = self
            .commands
            .finalize(
                &command_id.to_string(),
                status.as_str(),
                response_text.as_deref(),
            )
            .await?;

        if rows == 0 {
            // A concurrent response won the transition; this one is a no-op.
            let current = self
                .commands
                .get(&command_id.to_string())
                .await?
                .ok_or(CoreError::UnknownCommand(command_id))?;
            return Ok(current);
        }

        match outcome {
            CommandOutcome::Completed => {
                self.breakers.on_success(record.account_id).await;
            }
            CommandOutcome::Failed => {
                let code = response
                    .as_ref()
                    .and_then(|r| r.get("error_code"))
                    .and_then(Value::as_str)
                    .unwrap_or("UNKNOWN");

                match FailureClass::from_code(code) {
                    FailureClass::Retriable => {
                        warn!(
                            "Command {} failed with retriable error {}",
                            command_id, code
                        );
                        self.breakers.on_failure(record.account_id).await;
                        self.registry.record_failure(record.account_id).await;
                    }
                    FailureClass::NonRetriable => {
                        warn!(
                            "Command {} rejected by EA with {}, not counted against circuit",
                            command_id, code
                        );
                    }
                }
            }
        }

        let updated = self
            .commands
            .get(&command_id.to_string())
            .await?
            .ok_or(CoreError::UnknownCommand(command_id))?;

        self.fast_path.publish_response(CommandResponseEvent {
            command_id,
            status: updated.status.clone(),
            response,
            updated_at: updated.executed_at.unwrap_or(updated.created_at),
        });

        info!(
            "Command {} finished as {} for account {}",
            command_id, updated.status, updated.account_id
        );
        Ok(updated)
    }

    /// Breaker view for the account status endpoint
    pub async fn dispatch_stats(&self, account_id: i64) -> BreakerStats {
        self.breakers.stats(account_id).await
    }

    /// Executing + pending row counts for the status endpoint
    pub async fn backlog(&self, account_id: i64) -> Result<(i64, i64), CoreError> {
        let pending = self.commands.count_by_status(account_id, "pending").await?;
        let executing = self
            .commands
            .count_by_status(account_id, "executing")
            .await?;
        Ok((pending, executing))
    }
}

/// Flattened command view for the fast-path queue: the payload fields with
/// `id` and `type` merged in, matching what the EA consumes directly.
fn flatten_view(record: &CommandRecord) -> Value {
    let mut view = match record.payload_json() {
        Value::Object(map) => Value::Object(map),
        other => serde_json::json!({ "params": other }),
    };
    if let Value::Object(map) = &mut view {
        map.insert("id".to_string(), Value::String(record.id.clone()));
        map.insert("type".to_string(), Value::String(record.kind.clone()));
        map.insert(
            "priority".to_string(),
            Value::String(record.priority.clone()),
        );
    }
    view
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::connection::HealthPolicy;
    use crate::domain::entities::trade::TradeDirection;
    use crate::domain::services::circuit_breaker::BreakerConfig;
    use crate::infrastructure::fast_path::{FastPathError, InMemoryFastPath};
    use crate::persistence::init_database;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::broadcast;

    async fn dispatcher_with(
        fast_path: Arc<dyn FastPath>,
    ) -> (CommandDispatcher, Arc<ConnectionRegistry>) {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let registry = Arc::new(ConnectionRegistry::new(HealthPolicy::default()));
        let dispatcher = CommandDispatcher::new(
            pool,
            fast_path,
            registry.clone(),
            CommandCircuitBreakers::new(BreakerConfig::default()),
        );
        (dispatcher, registry)
    }

    fn open_trade_kind() -> CommandKind {
        CommandKind::OpenTrade(crate::domain::entities::command::OpenTradeParams {
            symbol: "EURUSD".to_string(),
            direction: TradeDirection::Buy,
            volume: 0.1,
            stop_loss: None,
            take_profit: None,
            comment: None,
        })
    }

    /// Fast path that rejects every push, for delivery-failure tests
    struct RejectingFastPath {
        new_commands: broadcast::Sender<i64>,
        responses: broadcast::Sender<CommandResponseEvent>,
    }

    impl RejectingFastPath {
        fn new() -> Self {
            Self {
                new_commands: broadcast::channel(8).0,
                responses: broadcast::channel(8).0,
            }
        }
    }

    #[async_trait]
    impl FastPath for RejectingFastPath {
        async fn push(&self, _account_id: i64, _view: Value) -> Result<(), FastPathError> {
            Err(FastPathError::PushRejected("queue unavailable".to_string()))
        }

        async fn drain(&self, _account_id: i64) -> Vec<Value> {
            Vec::new()
        }

        fn subscribe_new_commands(&self) -> broadcast::Receiver<i64> {
            self.new_commands.subscribe()
        }

        fn subscribe_responses(&self) -> broadcast::Receiver<CommandResponseEvent> {
            self.responses.subscribe()
        }

        fn publish_response(&self, event: CommandResponseEvent) {
            let _ = self.responses.send(event);
        }
    }

    #[tokio::test]
    async fn test_created_command_is_immediately_pollable() {
        let fp = Arc::new(InMemoryFastPath::new(Duration::from_secs(3600)));
        let (dispatcher, registry) = dispatcher_with(fp.clone()).await;
        registry.register(1, "1".to_string(), "b".to_string()).await;

        let created = dispatcher
            .create_command(1, open_trade_kind(), CommandPriority::High)
            .await
            .unwrap();

        let pending = dispatcher.get_pending_commands(1, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, created.id);
        assert_eq!(pending[0].kind, "OPEN_TRADE");
        assert_eq!(pending[0].status, "executing");

        // And the fast-path view was queued with the same identity
        let views = fp.drain(1).await;
        assert_eq!(views.len(), 1);
        assert_eq!(views[0]["id"], created.id);
        assert_eq!(views[0]["type"], "OPEN_TRADE");
        assert_eq!(views[0]["symbol"], "EURUSD");
    }

    #[tokio::test]
    async fn test_unreachable_account_gets_pending_row_no_push() {
        let fp = Arc::new(InMemoryFastPath::new(Duration::from_secs(3600)));
        let (dispatcher, _registry) = dispatcher_with(fp.clone()).await;

        // No registered connection at all
        let created = dispatcher
            .create_command(5, CommandKind::Ping, CommandPriority::Normal)
            .await
            .unwrap();

        assert_eq!(created.status, "pending");
        assert_eq!(fp.queue_depth(5).await, 0);
    }

    #[tokio::test]
    async fn test_push_failure_does_not_fail_creation() {
        let fp = Arc::new(RejectingFastPath::new());
        let (dispatcher, registry) = dispatcher_with(fp).await;
        registry.register(2, "2".to_string(), "b".to_string()).await;

        let created = dispatcher
            .create_command(2, CommandKind::Ping, CommandPriority::Normal)
            .await
            .unwrap();

        // Durable row survives and the account took one health penalty
        assert_eq!(created.status, "executing");
        let conn = registry.get(2).await.unwrap();
        assert_eq!(conn.consecutive_failures, 1);

        let pending = dispatcher.get_pending_commands(2, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_same_id_create_is_noop() {
        let fp = Arc::new(InMemoryFastPath::new(Duration::from_secs(3600)));
        let (dispatcher, registry) = dispatcher_with(fp.clone()).await;
        registry.register(1, "1".to_string(), "b".to_string()).await;

        let id = Uuid::new_v4();
        let first = dispatcher
            .create_command_with_id(id, 1, CommandKind::Ping, CommandPriority::Normal)
            .await
            .unwrap();
        let second = dispatcher
            .create_command_with_id(id, 1, CommandKind::Ping, CommandPriority::Normal)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
        // Exactly one durable row and one push attempt
        assert_eq!(dispatcher.get_pending_commands(1, 10).await.unwrap().len(), 1);
        assert_eq!(fp.queue_depth(1).await, 1);
    }

    #[tokio::test]
    async fn test_response_terminal_transition_and_idempotence() {
        let fp = Arc::new(InMemoryFastPath::new(Duration::from_secs(3600)));
        let (dispatcher, registry) = dispatcher_with(fp.clone()).await;
        registry.register(1, "1".to_string(), "b".to_string()).await;

        let created = dispatcher
            .create_command(1, open_trade_kind(), CommandPriority::Normal)
            .await
            .unwrap();
        let id = Uuid::parse_str(&created.id).unwrap();

        let mut rx = fp.subscribe_responses();

        let done = dispatcher
            .process_command_response(id, CommandOutcome::Completed, Some(json!({"ticket": 1001})))
            .await
            .unwrap();
        assert_eq!(done.status, "completed");
        assert!(done.executed_at.is_some());

        // Exactly one publish
        let event = rx.recv().await.unwrap();
        assert_eq!(event.command_id, id);

        // Second response: no state change, no second publish
        let again = dispatcher
            .process_command_response(id, CommandOutcome::Failed, Some(json!({"error_code": "TIMEOUT"})))
            .await
            .unwrap();
        assert_eq!(again.status, "completed");
        assert_eq!(again.executed_at, done.executed_at);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_command_response_rejected() {
        let fp = Arc::new(InMemoryFastPath::new(Duration::from_secs(3600)));
        let (dispatcher, _) = dispatcher_with(fp).await;

        let result = dispatcher
            .process_command_response(Uuid::new_v4(), CommandOutcome::Completed, None)
            .await;
        assert!(matches!(result, Err(CoreError::UnknownCommand(_))));
    }

    #[tokio::test]
    async fn test_retriable_failures_open_circuit() {
        let fp = Arc::new(InMemoryFastPath::new(Duration::from_secs(3600)));
        let (dispatcher, registry) = dispatcher_with(fp).await;
        registry.register(7, "7".to_string(), "b".to_string()).await;

        // 6 consecutive retriable failures against threshold 5
        for _ in 0..6 {
            let created = match dispatcher
                .create_command(7, CommandKind::Ping, CommandPriority::Normal)
                .await
            {
                Ok(record) => record,
                // Circuit already open partway through; that is the point
                Err(CoreError::CircuitOpen(_)) => break,
                Err(e) => panic!("unexpected error: {}", e),
            };
            let id = Uuid::parse_str(&created.id).unwrap();
            dispatcher
                .process_command_response(
                    id,
                    CommandOutcome::Failed,
                    Some(json!({"error_code": "NETWORK_ERROR"})),
                )
                .await
                .unwrap();
        }

        let result = dispatcher
            .create_command(7, CommandKind::Ping, CommandPriority::Normal)
            .await;
        assert!(matches!(result, Err(CoreError::CircuitOpen(7))));
    }

    #[tokio::test]
    async fn test_non_retriable_failures_leave_circuit_closed() {
        let fp = Arc::new(InMemoryFastPath::new(Duration::from_secs(3600)));
        let (dispatcher, registry) = dispatcher_with(fp).await;
        registry.register(8, "8".to_string(), "b".to_string()).await;

        for _ in 0..8 {
            let created = dispatcher
                .create_command(8, CommandKind::Ping, CommandPriority::Normal)
                .await
                .unwrap();
            let id = Uuid::parse_str(&created.id).unwrap();
            dispatcher
                .process_command_response(
                    id,
                    CommandOutcome::Failed,
                    Some(json!({"error_code": "INVALID_VOLUME"})),
                )
                .await
                .unwrap();
        }

        // Validation failures never open the circuit
        assert!(dispatcher
            .create_command(8, CommandKind::Ping, CommandPriority::Normal)
            .await
            .is_ok());
    }
}
