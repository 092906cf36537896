//! Per-account circuit breaker
//!
//! Implements the standard pattern, keyed by account:
//! - **Closed**: command creation flows normally
//! - **Open**: the account is degraded, creation is rejected immediately
//! - **Half-Open**: cooldown elapsed, the next outcome decides
//!
//! Only retriable execution failures are recorded here; validation and
//! business-rule rejections never open the circuit.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures within the window before opening the circuit
    pub failure_threshold: u32,
    /// Successes needed to close the circuit from half-open
    pub success_threshold: u32,
    /// Time to wait before moving from open to half-open
    pub cooldown: Duration,
    /// Rolling window for counting failures
    pub window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            cooldown: Duration::from_secs(30),
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct AccountBreaker {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    window_start: Instant,
}

impl AccountBreaker {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
            window_start: Instant::now(),
        }
    }

    fn reset_window_if_expired(&mut self, window: Duration) {
        if self.window_start.elapsed() > window {
            self.failure_count = 0;
            self.window_start = Instant::now();
        }
    }
}

/// Statistics for one account's breaker
#[derive(Debug, Clone)]
pub struct BreakerStats {
    pub state: BreakerState,
    pub failure_count: u32,
    pub time_since_last_failure: Option<Duration>,
}

/// Circuit breakers for all accounts, created lazily per account
pub struct CommandCircuitBreakers {
    config: BreakerConfig,
    accounts: Mutex<HashMap<i64, AccountBreaker>>,
}

impl CommandCircuitBreakers {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            accounts: Mutex::new(HashMap::new()),
        }
    }

    /// Whether command creation is currently permitted for this account.
    /// An open circuit moves to half-open once the cooldown has elapsed.
    pub async fn is_call_permitted(&self, account_id: i64) -> bool {
        let mut accounts = self.accounts.lock().await;
        let breaker = accounts.entry(account_id).or_insert_with(AccountBreaker::new);
        breaker.reset_window_if_expired(self.config.window);

        match breaker.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                if let Some(last_failure) = breaker.last_failure {
                    if last_failure.elapsed() >= self.config.cooldown {
                        breaker.state = BreakerState::HalfOpen;
                        breaker.success_count = 0;
                        true
                    } else {
                        false
                    }
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => true,
        }
    }

    /// Record a successful command execution
    pub async fn on_success(&self, account_id: i64) {
        let mut accounts = self.accounts.lock().await;
        let breaker = accounts.entry(account_id).or_insert_with(AccountBreaker::new);

        match breaker.state {
            BreakerState::HalfOpen => {
                breaker.success_count += 1;
                if breaker.success_count >= self.config.success_threshold {
                    breaker.state = BreakerState::Closed;
                    breaker.failure_count = 0;
                    breaker.success_count = 0;
                    breaker.window_start = Instant::now();
                }
            }
            BreakerState::Closed => {
                breaker.failure_count = 0;
                breaker.window_start = Instant::now();
            }
            BreakerState::Open => {}
        }
    }

    /// Record a retriable execution failure
    pub async fn on_failure(&self, account_id: i64) {
        let mut accounts = self.accounts.lock().await;
        let breaker = accounts.entry(account_id).or_insert_with(AccountBreaker::new);
        breaker.reset_window_if_expired(self.config.window);

        match breaker.state {
            BreakerState::Closed => {
                breaker.failure_count += 1;
                breaker.last_failure = Some(Instant::now());
                if breaker.failure_count >= self.config.failure_threshold {
                    breaker.state = BreakerState::Open;
                }
            }
            BreakerState::HalfOpen => {
                breaker.state = BreakerState::Open;
                breaker.success_count = 0;
                breaker.failure_count = 1;
                breaker.last_failure = Some(Instant::now());
            }
            BreakerState::Open => {
                breaker.last_failure = Some(Instant::now());
            }
        }
    }

    pub async fn state(&self, account_id: i64) -> BreakerState {
        let accounts = self.accounts.lock().await;
        accounts
            .get(&account_id)
            .map(|b| b.state)
            .unwrap_or(BreakerState::Closed)
    }

    pub async fn stats(&self, account_id: i64) -> BreakerStats {
        let accounts = self.accounts.lock().await;
        match accounts.get(&account_id) {
            Some(b) => BreakerStats {
                state: b.state,
                failure_count: b.failure_count,
                time_since_last_failure: b.last_failure.map(|t| t.elapsed()),
            },
            None => BreakerStats {
                state: BreakerState::Closed,
                failure_count: 0,
                time_since_last_failure: None,
            },
        }
    }
}
