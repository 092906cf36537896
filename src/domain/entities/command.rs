//! Command entities
//!
//! A command is a unit of work the server asks the EA to perform. Known
//! kinds carry typed parameters; unknown kinds flow through the catch-all
//! variant with an opaque payload so newer EAs stay compatible.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::domain::entities::trade::TradeDirection;

/// Delivery priority. Determines polling order within one account;
/// no cross-account ordering is promised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandPriority {
    High,
    Normal,
    Low,
}

impl CommandPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandPriority::High => "high",
            CommandPriority::Normal => "normal",
            CommandPriority::Low => "low",
        }
    }
}

impl Default for CommandPriority {
    fn default() -> Self {
        CommandPriority::Normal
    }
}

/// Command lifecycle status. Transitions are monotonic: a terminal status
/// is never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Executing => "executing",
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(CommandStatus::Pending),
            "executing" => Some(CommandStatus::Executing),
            "completed" => Some(CommandStatus::Completed),
            "failed" => Some(CommandStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandStatus::Completed | CommandStatus::Failed)
    }
}

/// Terminal outcome reported by the EA for one command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Completed,
    Failed,
}

impl CommandOutcome {
    pub fn status(&self) -> CommandStatus {
        match self {
            CommandOutcome::Completed => CommandStatus::Completed,
            CommandOutcome::Failed => CommandStatus::Failed,
        }
    }
}

/// Parameters for opening a position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenTradeParams {
    pub symbol: String,
    pub direction: TradeDirection,
    pub volume: f64,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Parameters for modifying an existing position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifyTradeParams {
    pub ticket: i64,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
}

/// The known command vocabulary plus a forward-compatible catch-all.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    OpenTrade(OpenTradeParams),
    ModifyTrade(ModifyTradeParams),
    CloseTrade { ticket: i64 },
    CloseAllTrades,
    GetTradeHistory { days: u32 },
    Ping,
    /// Unknown kind: the tag and payload pass through untouched.
    Custom { name: String, params: Value },
}

impl CommandKind {
    /// Wire tag for this kind
    pub fn name(&self) -> &str {
        match self {
            CommandKind::OpenTrade(_) => "OPEN_TRADE",
            CommandKind::ModifyTrade(_) => "MODIFY_TRADE",
            CommandKind::CloseTrade { .. } => "CLOSE_TRADE",
            CommandKind::CloseAllTrades => "CLOSE_ALL_TRADES",
            CommandKind::GetTradeHistory { .. } => "GET_TRADE_HISTORY",
            CommandKind::Ping => "PING",
            CommandKind::Custom { name, .. } => name,
        }
    }

    /// Payload object for durable storage and the fast-path view
    pub fn payload(&self) -> Value {
        match self {
            CommandKind::OpenTrade(p) => json!(p),
            CommandKind::ModifyTrade(p) => json!(p),
            CommandKind::CloseTrade { ticket } => json!({ "ticket": ticket }),
            CommandKind::CloseAllTrades => json!({}),
            CommandKind::GetTradeHistory { days } => json!({ "days": days }),
            CommandKind::Ping => json!({}),
            CommandKind::Custom { params, .. } => params.clone(),
        }
    }

    /// Rebuild a kind from its stored tag and payload. Unknown tags land in
    /// `Custom`; malformed payloads for known tags do too, preserving the
    /// row rather than dropping it.
    pub fn from_parts(name: &str, payload: Value) -> Self {
        let fallback = |payload: Value| CommandKind::Custom {
            name: name.to_string(),
            params: payload,
        };

        match name {
            "OPEN_TRADE" => match serde_json::from_value(payload.clone()) {
                Ok(p) => CommandKind::OpenTrade(p),
                Err(_) => fallback(payload),
            },
            "MODIFY_TRADE" => match serde_json::from_value(payload.clone()) {
                Ok(p) => CommandKind::ModifyTrade(p),
                Err(_) => fallback(payload),
            },
            "CLOSE_TRADE" => match payload.get("ticket").and_then(Value::as_i64) {
                Some(ticket) => CommandKind::CloseTrade { ticket },
                None => fallback(payload),
            },
            "CLOSE_ALL_TRADES" => CommandKind::CloseAllTrades,
            "GET_TRADE_HISTORY" => match payload.get("days").and_then(Value::as_u64) {
                Some(days) => CommandKind::GetTradeHistory { days: days as u32 },
                None => fallback(payload),
            },
            "PING" => CommandKind::Ping,
            _ => fallback(payload),
        }
    }
}
