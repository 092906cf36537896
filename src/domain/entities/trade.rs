//! Trade entities
//!
//! The EA-assigned ticket is the reconciliation key: exactly one trade row
//! exists per ticket, and its status mirrors the EA's last authoritative
//! report rather than the server's expectation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Trade direction as reported by the EA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeDirection {
    Buy,
    Sell,
}

impl TradeDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeDirection::Buy => "buy",
            TradeDirection::Sell => "sell",
        }
    }
}

/// Trade lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Open,
    Closed,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Open => "open",
            TradeStatus::Closed => "closed",
        }
    }
}

/// One position/ticket as reported by the EA in a sync payload or a
/// command response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EaTradeView {
    pub ticket: i64,
    pub symbol: String,
    pub direction: TradeDirection,
    pub volume: f64,
    pub open_price: f64,
    pub open_time: DateTime<Utc>,
    #[serde(default)]
    pub close_price: Option<f64>,
    #[serde(default)]
    pub close_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub profit: Option<f64>,
}

impl EaTradeView {
    /// A ticket with a close time is closed; everything else the EA still
    /// holds is open.
    pub fn status(&self) -> TradeStatus {
        if self.close_time.is_some() {
            TradeStatus::Closed
        } else {
            TradeStatus::Open
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_status_follows_close_time() {
        let mut view = EaTradeView {
            ticket: 1,
            symbol: "EURUSD".to_string(),
            direction: TradeDirection::Sell,
            volume: 0.2,
            open_price: 1.0850,
            open_time: Utc::now(),
            close_price: None,
            close_time: None,
            stop_loss: None,
            take_profit: None,
            profit: None,
        };
        assert_eq!(view.status(), TradeStatus::Open);

        view.close_time = Some(Utc::now());
        view.close_price = Some(1.0900);
        assert_eq!(view.status(), TradeStatus::Closed);
    }

    #[test]
    fn test_direction_serde_lowercase() {
        assert_eq!(serde_json::to_string(&TradeDirection::Buy).unwrap(), "\"buy\"");
        let d: TradeDirection = serde_json::from_str("\"sell\"").unwrap();
        assert_eq!(d, TradeDirection::Sell);
    }
}
