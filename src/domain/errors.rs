//! Core error taxonomy
//!
//! Caller misuse (unknown account/command) is returned to the caller.
//! Transient infrastructure trouble is absorbed locally: logged, counted
//! against the account's health, never propagated as a hard failure of the
//! request that triggered it.

use thiserror::Error;
use uuid::Uuid;

use crate::persistence::DatabaseError;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Operation against an account with no registered connection.
    /// Never retried automatically; maps to a 4xx upstream.
    #[error("unknown account: {0}")]
    UnknownAccount(i64),

    /// Response for a command id that does not exist
    #[error("unknown command: {0}")]
    UnknownCommand(Uuid),

    /// Circuit breaker is open for the account; command creation suspended
    /// until a success is observed
    #[error("account {0} is degraded: command creation suspended")]
    CircuitOpen(i64),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Classification of an EA-reported execution failure.
///
/// Only retriable (network/timeout-class) failures feed the circuit
/// breaker; validation and business-rule rejections never do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Retriable,
    NonRetriable,
}

impl FailureClass {
    /// Explicit predicate over the EA's error-code tag. Unknown codes are
    /// treated as non-retriable so a broken EA cannot trip the breaker
    /// with garbage.
    pub fn from_code(code: &str) -> Self {
        match code.to_ascii_uppercase().as_str() {
            "TIMEOUT" | "TRADE_TIMEOUT" | "NETWORK_ERROR" | "NO_CONNECTION" | "BROKER_BUSY"
            | "REQUOTE" | "PRICE_OFF" => FailureClass::Retriable,
            _ => FailureClass::NonRetriable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_classification() {
        assert_eq!(FailureClass::from_code("TIMEOUT"), FailureClass::Retriable);
        assert_eq!(FailureClass::from_code("timeout"), FailureClass::Retriable);
        assert_eq!(
            FailureClass::from_code("NO_CONNECTION"),
            FailureClass::Retriable
        );
        assert_eq!(
            FailureClass::from_code("INVALID_VOLUME"),
            FailureClass::NonRetriable
        );
        assert_eq!(
            FailureClass::from_code("NOT_ENOUGH_MONEY"),
            FailureClass::NonRetriable
        );
        assert_eq!(FailureClass::from_code(""), FailureClass::NonRetriable);
    }
}
