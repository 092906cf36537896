//! Database Repository
//!
//! Data access layer for commands, trades, and ticks. Every method is a
//! single short transaction; callers compose them without holding locks
//! across statements.

use super::models::*;
use super::{DatabaseError, DbPool};
use crate::domain::entities::trade::EaTradeView;
use chrono::Utc;
use sqlx::Row;
use tracing::{debug, error};

/// Command repository
pub struct CommandRepository {
    pool: DbPool,
}

impl CommandRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert a new command row. The id is caller-generated before any I/O.
    pub async fn create(&self, command: CreateCommand) -> Result<CommandRecord, DatabaseError> {
        let now = Utc::now();
        let record = sqlx::query_as::<_, CommandRecord>(
            r#"
            INSERT INTO commands (
                id, account_id, kind, payload, priority, status, response, created_at, executed_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, NULL)
            RETURNING *
            "#,
        )
        .bind(&command.id)
        .bind(command.account_id)
        .bind(&command.kind)
        .bind(&command.payload)
        .bind(&command.priority)
        .bind(&command.status)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create command: {}", e);
            DatabaseError::QueryError(format!("Failed to create command: {}", e))
        })?;

        debug!(
            "Created command: {} ({}) for account {}",
            record.id, record.kind, record.account_id
        );
        Ok(record)
    }

    /// Get command by id
    pub async fn get(&self, id: &str) -> Result<Option<CommandRecord>, DatabaseError> {
        let record = sqlx::query_as::<_, CommandRecord>("SELECT * FROM commands WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to get command {}: {}", id, e);
                DatabaseError::QueryError(format!("Failed to get command: {}", e))
            })?;

        Ok(record)
    }

    /// Undelivered commands for one account, in priority order then FIFO.
    ///
    /// Non-destructive: this is the poll fallback used when the fast-path
    /// notification was missed, so reading must not consume anything.
    pub async fn get_pending(
        &self,
        account_id: i64,
        limit: i64,
    ) -> Result<Vec<CommandRecord>, DatabaseError> {
        let records = sqlx::query_as::<_, CommandRecord>(
            r#"
            SELECT * FROM commands
            WHERE account_id = ?1 AND status IN ('pending', 'executing')
            ORDER BY
                CASE priority WHEN 'high' THEN 0 WHEN 'normal' THEN 1 ELSE 2 END,
                created_at ASC
            LIMIT ?2
            "#,
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get pending commands for {}: {}", account_id, e);
            DatabaseError::QueryError(format!("Failed to get pending commands: {}", e))
        })?;

        Ok(records)
    }

    /// Apply the single allowed terminal transition.
    ///
    /// Guarded at the SQL level: rows already terminal are untouched, so a
    /// duplicate response is a no-op. Returns the number of rows affected
    /// (0 means the command was already terminal).
    pub async fn finalize(
        &self,
        id: &str,
        status: &str,
        response: Option<&str>,
    ) -> Result<u64, DatabaseError> {
        let now = Utc::now();
        let rows_affected = sqlx::query(
            r#"
            UPDATE commands
            SET status = ?1, response = ?2, executed_at = ?3
            WHERE id = ?4 AND status IN ('pending', 'executing')
            "#,
        )
        .bind(status)
        .bind(response)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to finalize command {}: {}", id, e);
            DatabaseError::QueryError(format!("Failed to finalize command: {}", e))
        })?
        .rows_affected();

        Ok(rows_affected)
    }

    /// Count commands per status for one account (status endpoint)
    pub async fn count_by_status(
        &self,
        account_id: i64,
        status: &str,
    ) -> Result<i64, DatabaseError> {
        let row = sqlx::query(
            "SELECT COUNT(*) as count FROM commands WHERE account_id = ?1 AND status = ?2",
        )
        .bind(account_id)
        .bind(status)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to count commands for {}: {}", account_id, e);
            DatabaseError::QueryError(format!("Failed to count commands: {}", e))
        })?;

        let count: i64 = row.get("count");
        Ok(count)
    }
}

/// Outcome of a reconciliation upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// Trade repository
pub struct TradeRepository {
    pool: DbPool,
}

impl TradeRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Get trade by ticket
    pub async fn get(&self, ticket: i64) -> Result<Option<TradeRecord>, DatabaseError> {
        let record = sqlx::query_as::<_, TradeRecord>("SELECT * FROM trades WHERE ticket = ?1")
            .bind(ticket)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to get trade {}: {}", ticket, e);
                DatabaseError::QueryError(format!("Failed to get trade: {}", e))
            })?;

        Ok(record)
    }

    /// Write one EA-reported ticket: create it if unseen, otherwise overwrite
    /// the mutable fields with the EA values. The EA view always wins over
    /// locally cached state, never the reverse.
    pub async fn upsert_from_ea(
        &self,
        account_id: i64,
        view: &EaTradeView,
        source: &str,
    ) -> Result<UpsertOutcome, DatabaseError> {
        let now = Utc::now();
        let status = view.status().as_str();

        let existing = self.get(view.ticket).await?;
        match existing {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO trades (
                        ticket, account_id, symbol, direction, volume,
                        open_price, open_time, close_price, close_time,
                        stop_loss, take_profit, profit, status, source,
                        created_at, updated_at
                    )
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15)
                    "#,
                )
                .bind(view.ticket)
                .bind(account_id)
                .bind(&view.symbol)
                .bind(view.direction.as_str())
                .bind(view.volume)
                .bind(view.open_price)
                .bind(view.open_time)
                .bind(view.close_price)
                .bind(view.close_time)
                .bind(view.stop_loss)
                .bind(view.take_profit)
                .bind(view.profit)
                .bind(status)
                .bind(source)
                .bind(now)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    error!("Failed to create trade {}: {}", view.ticket, e);
                    DatabaseError::QueryError(format!("Failed to create trade: {}", e))
                })?;

                debug!("Created trade {} for account {}", view.ticket, account_id);
                Ok(UpsertOutcome::Created)
            }
            Some(_) => {
                sqlx::query(
                    r#"
                    UPDATE trades
                    SET volume = ?1, close_price = ?2, close_time = ?3,
                        stop_loss = ?4, take_profit = ?5, profit = ?6,
                        status = ?7, updated_at = ?8
                    WHERE ticket = ?9
                    "#,
                )
                .bind(view.volume)
                .bind(view.close_price)
                .bind(view.close_time)
                .bind(view.stop_loss)
                .bind(view.take_profit)
                .bind(view.profit)
                .bind(status)
                .bind(now)
                .bind(view.ticket)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    error!("Failed to update trade {}: {}", view.ticket, e);
                    DatabaseError::QueryError(format!("Failed to update trade: {}", e))
                })?;

                Ok(UpsertOutcome::Updated)
            }
        }
    }

    /// Tickets currently marked open for one account
    pub async fn open_tickets(&self, account_id: i64) -> Result<Vec<i64>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT ticket FROM trades WHERE account_id = ?1 AND status = 'open'",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get open tickets for {}: {}", account_id, e);
            DatabaseError::QueryError(format!("Failed to get open tickets: {}", e))
        })?;

        Ok(rows.iter().map(|r| r.get::<i64, _>("ticket")).collect())
    }

    /// Mark an open ticket closed (EA silence implies closure)
    pub async fn close_ticket(&self, account_id: i64, ticket: i64) -> Result<(), DatabaseError> {
        let now = Utc::now();
        let rows_affected = sqlx::query(
            r#"
            UPDATE trades
            SET status = 'closed', close_time = COALESCE(close_time, ?1), updated_at = ?1
            WHERE account_id = ?2 AND ticket = ?3 AND status = 'open'
            "#,
        )
        .bind(now)
        .bind(account_id)
        .bind(ticket)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to close trade {}: {}", ticket, e);
            DatabaseError::QueryError(format!("Failed to close trade: {}", e))
        })?
        .rows_affected();

        if rows_affected == 0 {
            return Err(DatabaseError::QueryError(format!(
                "Trade not found or already closed: {}",
                ticket
            )));
        }

        debug!("Closed trade {} for account {}", ticket, account_id);
        Ok(())
    }

    /// All open trades for one account
    pub async fn get_open(&self, account_id: i64) -> Result<Vec<TradeRecord>, DatabaseError> {
        let records = sqlx::query_as::<_, TradeRecord>(
            "SELECT * FROM trades WHERE account_id = ?1 AND status = 'open' ORDER BY open_time DESC",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get open trades for {}: {}", account_id, e);
            DatabaseError::QueryError(format!("Failed to get open trades: {}", e))
        })?;

        Ok(records)
    }
}

/// Tick repository
pub struct TickRepository {
    pool: DbPool,
}

impl TickRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Write one bounded batch of ticks in a single transaction.
    ///
    /// The caller chunks input to the configured batch size; this method
    /// never splits or retries on its own.
    pub async fn insert_batch(&self, rows: &[CreateTick]) -> Result<usize, DatabaseError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(|e| {
            error!("Failed to begin tick batch transaction: {}", e);
            DatabaseError::QueryError(format!("Failed to begin transaction: {}", e))
        })?;

        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO ticks (scope, symbol, bid, ask, spread, volume, tradeable, ticked_at, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
            )
            .bind(&row.scope)
            .bind(&row.symbol)
            .bind(row.bid)
            .bind(row.ask)
            .bind(row.spread)
            .bind(row.volume)
            .bind(row.tradeable)
            .bind(row.ticked_at)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                error!("Failed to insert tick for {}: {}", row.symbol, e);
                DatabaseError::QueryError(format!("Failed to insert tick: {}", e))
            })?;
        }

        tx.commit().await.map_err(|e| {
            error!("Failed to commit tick batch: {}", e);
            DatabaseError::QueryError(format!("Failed to commit tick batch: {}", e))
        })?;

        debug!("Wrote tick batch of {} rows", rows.len());
        Ok(rows.len())
    }

    /// Total persisted ticks for one symbol (test and status helper)
    pub async fn count_for_symbol(&self, symbol: &str) -> Result<i64, DatabaseError> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM ticks WHERE symbol = ?1")
            .bind(symbol)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to count ticks for {}: {}", symbol, e);
                DatabaseError::QueryError(format!("Failed to count ticks: {}", e))
            })?;

        let count: i64 = row.get("count");
        Ok(count)
    }
}
