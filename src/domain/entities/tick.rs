//! Tick entity
//!
//! A single price quote pushed by the EA. Kept minimal: the ingestion path
//! deserializes thousands of these per second.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single price tick received from the EA
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    /// Spread in price units; derived from bid/ask when absent
    #[serde(default)]
    pub spread: Option<f64>,
    #[serde(default)]
    pub volume: f64,
    pub time: DateTime<Utc>,
    #[serde(default = "default_tradeable")]
    pub tradeable: bool,
}

fn default_tradeable() -> bool {
    true
}

impl Tick {
    pub fn effective_spread(&self) -> f64 {
        self.spread.unwrap_or(self.ask - self.bid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spread_derived_when_absent() {
        let tick = Tick {
            symbol: "EURUSD".to_string(),
            bid: 1.0850,
            ask: 1.0852,
            spread: None,
            volume: 0.0,
            time: Utc::now(),
            tradeable: true,
        };
        assert!((tick.effective_spread() - 0.0002).abs() < 1e-9);
    }

    #[test]
    fn test_defaults_on_deserialize() {
        let tick: Tick = serde_json::from_str(
            r#"{"symbol":"EURUSD","bid":1.0850,"ask":1.0852,"time":"2026-08-30T12:00:00Z"}"#,
        )
        .unwrap();
        assert!(tick.tradeable);
        assert_eq!(tick.volume, 0.0);
        assert!(tick.spread.is_none());
    }
}
