//! Database Models
//!
//! Persistent data structures for commands, trades, and buffered ticks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Command record in database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CommandRecord {
    pub id: String,
    pub account_id: i64,
    pub kind: String,
    pub payload: String, // JSON string
    pub priority: String, // "high", "normal" or "low"
    pub status: String,   // "pending", "executing", "completed" or "failed"
    pub response: Option<String>, // JSON string
    pub created_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
}

impl CommandRecord {
    /// Parse the stored payload JSON. Returns an empty object for malformed rows.
    pub fn payload_json(&self) -> serde_json::Value {
        serde_json::from_str(&self.payload).unwrap_or_else(|_| serde_json::json!({}))
    }

    /// Parse the stored response JSON, if any.
    pub fn response_json(&self) -> Option<serde_json::Value> {
        self.response
            .as_deref()
            .and_then(|r| serde_json::from_str(r).ok())
    }
}

/// Trade record in database, keyed by the EA-assigned ticket
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TradeRecord {
    pub ticket: i64,
    pub account_id: i64,
    pub symbol: String,
    pub direction: String, // "buy" or "sell"
    pub volume: f64,
    pub open_price: f64,
    pub open_time: DateTime<Utc>,
    pub close_price: Option<f64>,
    pub close_time: Option<DateTime<Utc>>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub profit: Option<f64>,
    pub status: String, // "open" or "closed"
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Create command input
#[derive(Debug, Clone)]
pub struct CreateCommand {
    pub id: String,
    pub account_id: i64,
    pub kind: String,
    pub payload: String,
    pub priority: String,
    pub status: String,
}

/// Durable tick row input
#[derive(Debug, Clone)]
pub struct CreateTick {
    pub scope: String,
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub spread: f64,
    pub volume: f64,
    pub tradeable: bool,
    pub ticked_at: DateTime<Utc>,
}
