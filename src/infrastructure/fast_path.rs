//! Fast-path command delivery
//!
//! Low-latency delivery channel used in addition to the durable command
//! table: a per-account FIFO of flattened command views plus best-effort
//! notification channels. The durable row is always the fallback, so a
//! fast-path failure never fails command creation.
//!
//! The trait is the seam: any durable-queue + fast-notify pair satisfies
//! the contract. The in-memory implementation bounds entry lifetime with a
//! TTL so a vanished agent cannot accumulate stale views forever.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;
use uuid::Uuid;

/// Fast-path delivery error. Absorbed by the dispatcher, never fatal.
#[derive(Debug, Clone, Error)]
pub enum FastPathError {
    #[error("fast-path push rejected: {0}")]
    PushRejected(String),
}

/// Published once per terminal command transition
#[derive(Debug, Clone, Serialize)]
pub struct CommandResponseEvent {
    pub command_id: Uuid,
    pub status: String,
    pub response: Option<Value>,
    pub updated_at: DateTime<Utc>,
}

/// Delivery channel contract: append-only per-account queue with pop-once
/// consumption, plus best-effort pub/sub for new commands and responses.
#[async_trait]
pub trait FastPath: Send + Sync {
    /// Push a flattened command view onto the account's queue and emit a
    /// "new command" notification.
    async fn push(&self, account_id: i64, view: Value) -> Result<(), FastPathError>;

    /// Pop-once consumption of everything queued for the account.
    async fn drain(&self, account_id: i64) -> Vec<Value>;

    /// Best-effort "new command" notifications, carrying the account id.
    fn subscribe_new_commands(&self) -> broadcast::Receiver<i64>;

    /// Command response events, one per terminal transition.
    fn subscribe_responses(&self) -> broadcast::Receiver<CommandResponseEvent>;

    /// Publish a terminal transition to observers.
    fn publish_response(&self, event: CommandResponseEvent);
}

struct QueueEntry {
    view: Value,
    queued_at: Instant,
}

/// In-process fast path backed by per-account queues and broadcast channels
pub struct InMemoryFastPath {
    queues: Mutex<HashMap<i64, VecDeque<QueueEntry>>>,
    entry_ttl: Duration,
    new_commands: broadcast::Sender<i64>,
    responses: broadcast::Sender<CommandResponseEvent>,
}

impl InMemoryFastPath {
    pub fn new(entry_ttl: Duration) -> Self {
        let (new_commands, _) = broadcast::channel(256);
        let (responses, _) = broadcast::channel(256);
        Self {
            queues: Mutex::new(HashMap::new()),
            entry_ttl,
            new_commands,
            responses,
        }
    }

    /// Queued (non-expired) views for one account without consuming them
    pub async fn queue_depth(&self, account_id: i64) -> usize {
        let ttl = self.entry_ttl;
        let queues = self.queues.lock().await;
        queues
            .get(&account_id)
            .map(|q| q.iter().filter(|e| e.queued_at.elapsed() <= ttl).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl FastPath for InMemoryFastPath {
    async fn push(&self, account_id: i64, view: Value) -> Result<(), FastPathError> {
        {
            let mut queues = self.queues.lock().await;
            let queue = queues.entry(account_id).or_default();
            // Expired entries are pruned on the write path to bound buildup
            // when the agent has disappeared.
            while let Some(front) = queue.front() {
                if front.queued_at.elapsed() > self.entry_ttl {
                    queue.pop_front();
                } else {
                    break;
                }
            }
            queue.push_back(QueueEntry {
                view,
                queued_at: Instant::now(),
            });
        }

        // Best-effort: no subscribers is fine
        let _ = self.new_commands.send(account_id);
        debug!("Pushed fast-path command view for account {}", account_id);
        Ok(())
    }

    async fn drain(&self, account_id: i64) -> Vec<Value> {
        let entries = {
            let mut queues = self.queues.lock().await;
            queues.remove(&account_id).unwrap_or_default()
        };

        entries
            .into_iter()
            .filter(|e| e.queued_at.elapsed() <= self.entry_ttl)
            .map(|e| e.view)
            .collect()
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_push_drain_fifo() {
        let fp = InMemoryFastPath::new(Duration::from_secs(3600));
        fp.push(1, json!({"id": "a"})).await.unwrap();
        fp.push(1, json!({"id": "b"})).await.unwrap();
        fp.push(2, json!({"id": "c"})).await.unwrap();

        assert_eq!(fp.queue_depth(1).await, 2);

        let drained = fp.drain(1).await;
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0]["id"], "a");
        assert_eq!(drained[1]["id"], "b");

        // Pop-once: a second drain is empty
        assert!(fp.drain(1).await.is_empty());
        assert_eq!(fp.drain(2).await.len(), 1);
    }

    #[tokio::test]
    async fn test_expired_entries_dropped() {
        let fp = InMemoryFastPath::new(Duration::from_millis(10));
        fp.push(1, json!({"id": "stale"})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(fp.queue_depth(1).await, 0);
        assert!(fp.drain(1).await.is_empty());
    }

    #[tokio::test]
    async fn test_new_command_notification() {
        let fp = InMemoryFastPath::new(Duration::from_secs(3600));
        let mut rx = fp.subscribe_new_commands();

        fp.push(7, json!({"id": "x"})).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_response_publish() {
        let fp = InMemoryFastPath::new(Duration::from_secs(3600));
        let mut rx = fp.subscribe_responses();

        let id = Uuid::new_v4();
        fp.publish_response(CommandResponseEvent {
            command_id: id,
            status: "completed".to_string(),
            response: Some(json!({"ticket": 1001})),
            updated_at: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.command_id, id);
        assert_eq!(event.status, "completed");
    }
}
