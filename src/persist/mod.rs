pub mod sqlite;

use uuid::Uuid;

use crate::engine::types::{BacktestResult, Statistics};
use crate::strategy::BacktestRequest;

/// Persistence of completed (or failed) backtest sessions. One persisted
/// shape: the session row carries the expression and condition JSON inline;
/// statistics, snapshots, trades, holdings, drawdown periods and factor
/// contributions land in their own tables.
pub trait ResultStore: Send + Sync {
    fn save_result(&self, request: &BacktestRequest, result: &BacktestResult)
        -> anyhow::Result<()>;

    /// Persist an error marker for a failed session. Cancelled runs are
    /// never persisted at all.
    fn mark_failed(
        &self,
        backtest_id: Uuid,
        request: &BacktestRequest,
        code: &str,
        message: &str,
    ) -> anyhow::Result<()>;

    fn load_statistics(&self, backtest_id: Uuid) -> anyhow::Result<Option<Statistics>>;

    fn session_status(&self, backtest_id: Uuid) -> anyhow::Result<Option<String>>;
}

/// No-op store for callers that do not persist (tests, the warmer).
#[derive(Default)]
pub struct NullResultStore;

impl ResultStore for NullResultStore {
    fn save_result(&self, _: &BacktestRequest, _: &BacktestResult) -> anyhow::Result<()> {
        Ok(())
    }

    fn mark_failed(&self, _: Uuid, _: &BacktestRequest, _: &str, _: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn load_statistics(&self, _: Uuid) -> anyhow::Result<Option<Statistics>> {
        Ok(None)
    }

    fn session_status(&self, _: Uuid) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}
