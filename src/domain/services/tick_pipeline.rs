//! Tick Ingestion Pipeline
//!
//! Buffers incoming price ticks per (scope, symbol) and flushes them to
//! durable storage on a fixed schedule. The buffer carries a TTL that is
//! independent of the flush cadence: if the writer stalls, buffered data
//! expires instead of growing without bound. Losing ticks is preferred
//! over exhausting memory during a sustained backend outage.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::domain::entities::tick::Tick;
use crate::persistence::models::CreateTick;
use crate::persistence::repository::TickRepository;
use crate::persistence::{DatabaseError, DbPool};

/// Scope tag for ticks not tied to one account
pub const GLOBAL_SCOPE: &str = "global";

#[derive(Debug, Clone)]
pub struct TickPipelineConfig {
    /// Cadence of the background flush task
    pub flush_interval: Duration,
    /// Lifetime of a buffered tick; expired entries are dropped at flush
    pub buffer_ttl: Duration,
    /// Upper bound on rows per insert transaction
    pub max_batch_rows: usize,
}

impl Default for TickPipelineConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(5),
            buffer_ttl: Duration::from_secs(300),
            max_batch_rows: 1000,
        }
    }
}

struct BufferedTick {
    scope: String,
    tick: Tick,
    buffered_at: Instant,
}

impl BufferedTick {
    fn to_row(&self) -> CreateTick {
        CreateTick {
            scope: self.scope.clone(),
            symbol: self.tick.symbol.clone(),
            bid: self.tick.bid,
            ask: self.tick.ask,
            spread: self.tick.effective_spread(),
            volume: self.tick.volume,
            tradeable: self.tick.tradeable,
            ticked_at: self.tick.time,
        }
    }
}

pub struct TickBuffer {
    config: TickPipelineConfig,
    buffers: Mutex<HashMap<(String, String), Vec<BufferedTick>>>,
    ticks: TickRepository,
}

impl TickBuffer {
    pub fn new(pool: DbPool, config: TickPipelineConfig) -> Self {
        Self {
            config,
            buffers: Mutex::new(HashMap::new()),
            ticks: TickRepository::new(pool),
        }
    }

    pub fn config(&self) -> &TickPipelineConfig {
        &self.config
    }

    /// Append one tick. Never blocks on the durable store.
    ///
    /// Expired entries in the touched buffer are pruned on the write path,
    /// so a stalled flush worker cannot grow a live symbol's buffer past
    /// its TTL worth of data.
    pub async fn buffer_tick(&self, scope: &str, tick: Tick) {
        let ttl = self.config.buffer_ttl;
        let mut buffers = self.buffers.lock().await;
        let key = (scope.to_string(), tick.symbol.clone());
        let entries = buffers.entry(key).or_default();
        entries.retain(|e| e.buffered_at.elapsed() <= ttl);
        entries.push(BufferedTick {
            scope: scope.to_string(),
            tick,
            buffered_at: Instant::now(),
        });
    }

    /// Append a batch of ticks under one lock acquisition, pruning expired
    /// entries from each touched buffer.
    pub async fn buffer_batch(&self, scope: &str, ticks: Vec<Tick>) {
        let ttl = self.config.buffer_ttl;
        let now = Instant::now();
        let mut buffers = self.buffers.lock().await;
        for tick in ticks {
            let key = (scope.to_string(), tick.symbol.clone());
            let entries = buffers.entry(key).or_default();
            entries.retain(|e| e.buffered_at.elapsed() <= ttl);
            entries.push(BufferedTick {
                scope: scope.to_string(),
                tick,
                buffered_at: now,
            });
        }
    }

    /// Buffered entries across all symbols, expired included
    pub async fn pending(&self) -> usize {
        let buffers = self.buffers.lock().await;
        buffers.values().map(Vec::len).sum()
    }

    /// Drain every buffer and write the contents in bounded batches.
    ///
    /// The read+clear is atomic (one lock scope), so overlapping flushes
    /// can never double-write the same ticks. Entries past their TTL are
    /// dropped before writing. If the store rejects a batch, the unwritten
    /// remainder goes back into the buffer, still subject to its TTL, and
    /// the next scheduled flush retries.
    pub async fn flush(&self) -> Result<usize, DatabaseError> {
        let drained: Vec<BufferedTick> = {
            let mut buffers = self.buffers.lock().await;
            std::mem::take(&mut *buffers).into_values().flatten().collect()
        };

        if drained.is_empty() {
            return Ok(0);
        }

        let ttl = self.config.buffer_ttl;
        let (live, expired): (Vec<BufferedTick>, Vec<BufferedTick>) = drained
            .into_iter()
            .partition(|t| t.buffered_at.elapsed() <= ttl);

        if !expired.is_empty() {
            warn!(
                "Dropping {} buffered ticks past their {}s TTL",
                expired.len(),
                ttl.as_secs()
            );
        }

        let mut written = 0usize;
        let mut remaining = live;

        while !remaining.is_empty() {
            let take = remaining.len().min(self.config.max_batch_rows);
            let rows: Vec<CreateTick> = remaining[..take].iter().map(BufferedTick::to_row).collect();

            match self.ticks.insert_batch(&rows).await {
                Ok(count) => {
                    written += count;
                    remaining.drain(..take);
                }
                Err(e) => {
                    warn!(
                        "Tick flush failed after {} rows, re-buffering {}: {}",
                        written,
                        remaining.len(),
                        e
                    );
                    let mut buffers = self.buffers.lock().await;
                    for entry in remaining {
                        let key = (entry.scope.clone(), entry.tick.symbol.clone());
                        buffers.entry(key).or_default().push(entry);
                    }
                    return Err(e);
                }
            }
        }

        if written > 0 {
            debug!("Flushed {} ticks", written);
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::init_database;
    use chrono::Utc;

    fn tick(symbol: &str, bid: f64) -> Tick {
        Tick {
            symbol: symbol.to_string(),
            bid,
            ask: bid + 0.0002,
            spread: None,
            volume: 1.0,
            time: Utc::now(),
            tradeable: true,
        }
    }

    async fn buffer(config: TickPipelineConfig) -> (TickBuffer, TickRepository) {
        let pool = init_database("sqlite::memory:").await.unwrap();
        (
            TickBuffer::new(pool.clone(), config),
            TickRepository::new(pool),
        )
    }

    #[tokio::test]
    async fn test_flush_empties_buffer() {
        let (buf, repo) = buffer(TickPipelineConfig::default()).await;

        buf.buffer_tick(GLOBAL_SCOPE, tick("EURUSD", 1.0850)).await;
        buf.buffer_tick(GLOBAL_SCOPE, tick("GBPUSD", 1.2700)).await;
        assert_eq!(buf.pending().await, 2);

        let written = buf.flush().await.unwrap();
        assert_eq!(written, 2);
        assert_eq!(buf.pending().await, 0);
        assert_eq!(repo.count_for_symbol("EURUSD").await.unwrap(), 1);

        // Nothing left: a second flush writes nothing
        assert_eq!(buf.flush().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_large_buffer_split_into_bounded_batches() {
        let (buf, repo) = buffer(TickPipelineConfig {
            max_batch_rows: 1000,
            ..Default::default()
        })
        .await;

        let ticks: Vec<Tick> = (0..1500)
            .map(|i| tick("EURUSD", 1.0850 + i as f64 * 1e-5))
            .collect();
        buf.buffer_batch(GLOBAL_SCOPE, ticks).await;

        // 1500 buffered, batch cap 1000: one cycle writes 1000 + 500
        let written = buf.flush().await.unwrap();
        assert_eq!(written, 1500);
        assert_eq!(buf.pending().await, 0);
        assert_eq!(repo.count_for_symbol("EURUSD").await.unwrap(), 1500);
    }

    #[tokio::test]
    async fn test_expired_ticks_not_flushed() {
        let (buf, repo) = buffer(TickPipelineConfig {
            buffer_ttl: Duration::from_millis(10),
            ..Default::default()
        })
        .await;

        buf.buffer_tick(GLOBAL_SCOPE, tick("EURUSD", 1.0850)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        buf.buffer_tick(GLOBAL_SCOPE, tick("EURUSD", 1.0851)).await;

        let written = buf.flush().await.unwrap();
        assert_eq!(written, 1);
        assert_eq!(repo.count_for_symbol("EURUSD").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ingest_prunes_expired_when_flush_stalls() {
        let (buf, _repo) = buffer(TickPipelineConfig {
            buffer_ttl: Duration::from_millis(10),
            ..Default::default()
        })
        .await;

        // No flush ever runs; the write path alone must bound the buffer
        for _ in 0..20 {
            buf.buffer_tick(GLOBAL_SCOPE, tick("EURUSD", 1.0850)).await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;

        buf.buffer_tick(GLOBAL_SCOPE, tick("EURUSD", 1.0851)).await;
        assert_eq!(buf.pending().await, 1);
    }

    #[tokio::test]
    async fn test_failed_flush_rebuffers_unwritten_ticks() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let buf = TickBuffer::new(pool.clone(), TickPipelineConfig::default());

        for i in 0..5 {
            buf.buffer_tick(GLOBAL_SCOPE, tick("EURUSD", 1.0850 + i as f64 * 1e-4))
                .await;
        }

        // Store goes away mid-operation
        pool.close().await;

        assert!(buf.flush().await.is_err());
        // Everything unwritten is back in the buffer awaiting the next cycle
        assert_eq!(buf.pending().await, 5);
    }

    #[tokio::test]
    async fn test_per_scope_separation() {
        let (buf, repo) = buffer(TickPipelineConfig::default()).await;

        buf.buffer_tick("42", tick("EURUSD", 1.0850)).await;
        buf.buffer_tick(GLOBAL_SCOPE, tick("EURUSD", 1.0851)).await;

        assert_eq!(buf.flush().await.unwrap(), 2);
        assert_eq!(repo.count_for_symbol("EURUSD").await.unwrap(), 2);
    }
}
