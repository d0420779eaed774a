//! Hooks around statement preparation and execution.

use rowmap_core::Error;

use crate::instance::InstanceStats;

/// Receives statement lifecycle events.
///
/// All methods have empty defaults. Observers are called inline on the
/// executing task and must not block.
pub trait StatementObserver: Send + Sync {
    /// A cached statement finished preparing, successfully or not.
    fn on_prepare(&self, _key: &str, _sql: &str, _result: Result<(), &Error>) {}

    /// An execution instance reached a terminal state.
    fn on_finish(&self, _stats: &InstanceStats, _error: Option<&Error>) {}

    /// A cached statement was removed from the cache.
    fn on_evict(&self, _key: &str) {}
}

/// Default observer: emits `tracing` events. Bound parameters are never
/// part of an event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl StatementObserver for TracingObserver {
    fn on_prepare(&self, key: &str, sql: &str, result: Result<(), &Error>) {
        match result {
            Ok(()) => tracing::debug!(key, sql, "statement prepared"),
            Err(error) => tracing::warn!(
                key,
                sql,
                kind = ?error.kind(),
                sqlstate = ?error.sqlstate(),
                "statement preparation failed"
            ),
        }
    }

    fn on_finish(&self, stats: &InstanceStats, error: Option<&Error>) {
        match error {
            None => tracing::trace!(
                key = %stats.key,
                seq = stats.seq,
                tx = ?stats.tx_id,
                responded_in = ?stats.responded_in,
                rows_fetched = stats.rows_fetched,
                rows_affected = stats.rows_affected,
                "statement finished"
            ),
            Some(error) => tracing::debug!(
                key = %stats.key,
                seq = stats.seq,
                tx = ?stats.tx_id,
                responded_in = ?stats.responded_in,
                kind = ?error.kind(),
                sqlstate = ?error.sqlstate(),
                "statement failed"
            ),
        }
    }

    fn on_evict(&self, key: &str) {
        tracing::debug!(key, "statement evicted");
    }
}
