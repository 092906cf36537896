//! Persistence Layer
//!
//! Durable storage for commands, trades, and ticks. Connections are
//! process-local and deliberately never persisted: the EA re-handshakes
//! after a restart and the registry is rebuilt from the next heartbeat.
//!
//! Uses SQLite for local storage with async operations via sqlx.
//!
//! # Database Schema
//!
//! ## Commands Table
//! - id: UUID (client-generated before any I/O)
//! - account_id: Target trading account
//! - kind: Command tag (e.g., "OPEN_TRADE")
//! - payload: JSON parameters for the command kind
//! - priority: "high", "normal", or "low"
//! - status: "pending", "executing", "completed", "failed"
//! - response: JSON response from the EA, set on terminal transition
//! - created_at / executed_at: Timestamps
//!
//! ## Trades Table
//! - ticket: EA-assigned ticket number, the reconciliation key
//! - account_id, symbol, direction, volume
//! - open/close price and time, stop_loss, take_profit, profit
//! - status: "open" or "closed" (mirrors the EA's last authoritative report)
//! - source: Provenance tag ("ea_sync", "command_response")
//!
//! ## Ticks Table
//! - scope: Account id or "global"
//! - symbol, bid, ask, spread, volume, tradeable
//! - ticked_at: Quote timestamp from the EA

pub mod models;
pub mod repository;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Database connection pool
pub type DbPool = SqlitePool;

/// Database initialization error
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Database connection error: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Query error: {0}")]
    QueryError(String),
}

/// Initialize the database connection pool
///
/// # Arguments
/// - `database_url`: Path to SQLite database file (e.g., "sqlite://data/mtlink.db")
///
/// # Errors
/// Returns error if database connection fails or migrations fail
pub async fn init_database(database_url: &str) -> Result<DbPool, DatabaseError> {
    info!("Initializing database: {}", database_url);

    // Ensure data directory exists
    if let Some(db_path) = database_url.strip_prefix("sqlite://") {
        if let Some(parent) = Path::new(db_path).parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::ConnectionError(sqlx::Error::Configuration(Box::new(e)))
            })?;
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .log_statements(tracing::log::LevelFilter::Debug);

    // A pooled ":memory:" URL gives every connection its own empty database,
    // so in-memory pools must stay on a single connection.
    let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;

    info!("✓ Database initialized successfully");

    Ok(pool)
}

/// Run database migrations
async fn run_migrations(pool: &DbPool) -> Result<(), DatabaseError> {
    info!("Running database migrations...");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS commands (
            id TEXT PRIMARY KEY,
            account_id INTEGER NOT NULL,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL,
            priority TEXT NOT NULL CHECK(priority IN ('high', 'normal', 'low')),
            status TEXT NOT NULL CHECK(status IN ('pending', 'executing', 'completed', 'failed')),
            response TEXT,
            created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
            executed_at DATETIME
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::MigrationError(format!("Failed to create commands table: {}", e)))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS trades (
            ticket INTEGER PRIMARY KEY,
            account_id INTEGER NOT NULL,
            symbol TEXT NOT NULL,
            direction TEXT NOT NULL CHECK(direction IN ('buy', 'sell')),
            volume REAL NOT NULL,
            open_price REAL NOT NULL,
            open_time DATETIME NOT NULL,
            close_price REAL,
            close_time DATETIME,
            stop_loss REAL,
            take_profit REAL,
            profit REAL,
            status TEXT NOT NULL CHECK(status IN ('open', 'closed')),
            source TEXT NOT NULL,
            created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::MigrationError(format!("Failed to create trades table: {}", e)))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ticks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            scope TEXT NOT NULL,
            symbol TEXT NOT NULL,
            bid REAL NOT NULL,
            ask REAL NOT NULL,
            spread REAL NOT NULL,
            volume REAL NOT NULL DEFAULT 0.0,
            tradeable BOOLEAN NOT NULL DEFAULT 1,
            ticked_at DATETIME NOT NULL,
            created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::MigrationError(format!("Failed to create ticks table: {}", e)))?;

    // Indexes for the hot query paths
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_commands_account_status ON commands(account_id, status)",
    )
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::MigrationError(format!("Failed to create index: {}", e)))?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_commands_created_at ON commands(created_at)")
        .execute(pool)
        .await
        .map_err(|e| DatabaseError::MigrationError(format!("Failed to create index: {}", e)))?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_trades_account_status ON trades(account_id, status)",
    )
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::MigrationError(format!("Failed to create index: {}", e)))?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_ticks_symbol_time ON ticks(symbol, ticked_at)")
        .execute(pool)
        .await
        .map_err(|e| DatabaseError::MigrationError(format!("Failed to create index: {}", e)))?;

    info!("✓ Database migrations completed successfully");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_database_init() {
        let pool = init_database("sqlite::memory:").await;
        assert!(pool.is_ok());
    }

    #[tokio::test]
    async fn test_migrations() {
        let pool = init_database("sqlite::memory:").await.unwrap();

        // Verify tables exist
        let result: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('commands', 'trades', 'ticks')"
        )
        .fetch_one(&pool)
        .await
        .unwrap();

        assert_eq!(result.0, 3);
    }
}
