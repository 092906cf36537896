//! Trade Reconciliation Engine
//!
//! Resolves divergence between the durable trade table and the EA's
//! authoritative trade list. The EA never reports open positions it no
//! longer holds, so a ticket that is open locally but absent from a report
//! is closed, not treated as a transient gap.
//!
//! Syncs for the same account are serialized through a per-account async
//! mutex; two concurrent syncs must not race on the same ticket's close
//! decision. Different accounts reconcile independently.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::domain::entities::trade::EaTradeView;
use crate::domain::errors::CoreError;
use crate::persistence::repository::{TradeRepository, UpsertOutcome};
use crate::persistence::DbPool;

/// Provenance tag for rows written by the sync path
const SOURCE_EA_SYNC: &str = "ea_sync";

/// One ticket mutation that failed during a sync. Collected, not raised:
/// a partial failure never aborts the remaining tickets.
#[derive(Debug, Clone, Serialize)]
pub struct TicketFailure {
    pub ticket: i64,
    pub error: String,
}

/// Counts returned from one sync for observability
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconciliationReport {
    pub created: u32,
    pub updated: u32,
    pub closed: u32,
    pub failures: Vec<TicketFailure>,
}

pub struct TradeReconciler {
    trades: TradeRepository,
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl TradeReconciler {
    pub fn new(pool: DbPool) -> Self {
        Self {
            trades: TradeRepository::new(pool),
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn account_lock(&self, account_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(account_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// EA-wins set reconciliation.
    ///
    /// 1. Upsert every reported ticket (EA values overwrite local state).
    /// 2. Close every locally-open ticket absent from the report.
    ///
    /// Per-ticket errors are collected into the report; only the open-set
    /// query itself can fail the call.
    pub async fn sync_trades_from_ea(
        &self,
        account_id: i64,
        ea_trades: &[EaTradeView],
    ) -> Result<ReconciliationReport, CoreError> {
        let lock = self.account_lock(account_id).await;
        let _guard = lock.lock().await;

        let mut report = ReconciliationReport::default();
        let mut reported: HashSet<i64> = HashSet::with_capacity(ea_trades.len());

        for view in ea_trades {
            reported.insert(view.ticket);
            match self
                .trades
                .upsert_from_ea(account_id, view, SOURCE_EA_SYNC)
                .await
            {
                Ok(UpsertOutcome::Created) => report.created += 1,
                Ok(UpsertOutcome::Updated) => report.updated += 1,
                Err(e) => {
                    warn!(
                        "Sync for account {} failed on ticket {}: {}",
                        account_id, view.ticket, e
                    );
                    report.failures.push(TicketFailure {
                        ticket: view.ticket,
                        error: e.to_string(),
                    });
                }
            }
        }

        let open_tickets = self.trades.open_tickets(account_id).await?;
        for ticket in open_tickets {
            if reported.contains(&ticket) {
                continue;
            }
            match self.trades.close_ticket(account_id, ticket).await {
                Ok(()) => report.closed += 1,
                Err(e) => {
                    warn!(
                        "Sync for account {} could not close ticket {}: {}",
                        account_id, ticket, e
                    );
                    report.failures.push(TicketFailure {
                        ticket,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Reconciled account {}: created={} updated={} closed={} failures={}",
            account_id,
            report.created,
            report.updated,
            report.closed,
            report.failures.len()
        );
        Ok(report)
    }

    /// Open trades snapshot for the account status endpoint
    pub async fn open_trades(
        &self,
        account_id: i64,
    ) -> Result<Vec<crate::persistence::models::TradeRecord>, CoreError> {
        Ok(self.trades.get_open(account_id).await?)
    }
}
