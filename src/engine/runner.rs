//! `run_backtest` orchestration: validate, hash, load, detect corporate
//! actions, per-day cache/compute/evaluate/simulate/emit, aggregate,
//! persist. Every path, including failure, ends with a terminal progress
//! event; cancelled runs persist nothing.

use std::sync::Arc;

use chrono::NaiveDate;
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::progress::{PreparationStage, ProgressHub, ProgressState};
use super::simulator::Simulator;
use super::statistics;
use super::types::{BacktestResult, ChartData, HoldingView};
use crate::cache::factor_cache::FactorCache;
use crate::conditions::evaluator::CompiledRule;
use crate::config::Config;
use crate::data::loader::{load_market_data, MarketData};
use crate::data::PriceStore;
use crate::error::{BacktestError, Result};
use crate::factors::deps;
use crate::factors::engine::{ComputeContext, FactorEngine};
use crate::factors::table::FactorTable;
use crate::persist::ResultStore;
use crate::strategy::{decimal_to_f64, BacktestRequest};
use crate::util::retry::RetryPolicy;

/// The backtest entry point. Holds only shared collaborators; each run owns
/// its own market data, factor tables and simulator state, so concurrent
/// runs share nothing mutable.
pub struct BacktestRunner {
    config: Config,
    store: Arc<dyn PriceStore>,
    cache: Arc<FactorCache>,
    results: Arc<dyn ResultStore>,
    hub: Arc<ProgressHub>,
}

impl BacktestRunner {
    pub fn new(
        config: Config,
        store: Arc<dyn PriceStore>,
        cache: Arc<FactorCache>,
        results: Arc<dyn ResultStore>,
        hub: Arc<ProgressHub>,
    ) -> Self {
        Self {
            config,
            store,
            cache,
            results,
            hub,
        }
    }

    pub fn hub(&self) -> Arc<ProgressHub> {
        Arc::clone(&self.hub)
    }

    /// Run one backtest to completion. The returned result has already been
    /// persisted and announced on the progress stream.
    pub async fn run_backtest(
        &self,
        request: BacktestRequest,
        cancel: CancellationToken,
    ) -> Result<BacktestResult> {
        self.run_with_id(Uuid::new_v4(), request, cancel).await
    }

    /// Same as [`Self::run_backtest`] with a caller-assigned id, so
    /// consumers can subscribe to the progress stream before starting.
    pub async fn run_with_id(
        &self,
        backtest_id: Uuid,
        request: BacktestRequest,
        cancel: CancellationToken,
    ) -> Result<BacktestResult> {
        let session = backtest_id.to_string();
        self.hub.reset_delta_state(&session);

        let outcome = self.execute(backtest_id, &request, &cancel).await;

        match &outcome {
            Ok(result) => {
                self.hub
                    .emit_completed(&session, result.statistics.clone(), None);
            }
            Err(err) if err.is_cancelled() => {
                self.hub.emit_error(&session, "cancelled");
            }
            Err(err) => {
                self.hub.emit_error(&session, &err.to_string());
                let results = Arc::clone(&self.results);
                let req = request.clone();
                let code = err.code();
                let message = err.to_string();
                let persisted = tokio::task::spawn_blocking(move || {
                    results.mark_failed(backtest_id, &req, code, &message)
                })
                .await;
                if let Ok(Err(persist_err)) = persisted {
                    tracing::error!(error = %persist_err, "failed to persist error marker");
                }
            }
        }
        outcome
    }

    async fn execute(
        &self,
        backtest_id: Uuid,
        request: &BacktestRequest,
        cancel: &CancellationToken,
    ) -> Result<BacktestResult> {
        let session = backtest_id.to_string();
        request.validate_request()?;
        let buy_rule = CompiledRule::buy_rule(request)?;

        let strategy_hash = request.strategy_hash();
        let universe_key = request.universe_key();
        tracing::info!(%backtest_id, %strategy_hash, %universe_key, "backtest started");

        self.hub.emit_preparation(
            &session,
            PreparationStage::LoadingPriceData,
            "loading price window",
        );
        let policy = RetryPolicy::db(self.config.db_timeout, self.config.max_retries);
        let data = load_market_data(
            self.store.as_ref(),
            &self.cache,
            request,
            self.config.corporate_action_threshold,
            &policy,
        )
        .await?;
        self.check_cancel(cancel)?;
        self.hub.emit_preparation(
            &session,
            PreparationStage::LoadingFinancialData,
            "fundamental records ready",
        );

        let days = data.trading_days(request.start_date, request.end_date);
        let mask = deps::compute_mask(
            &request.buy_conditions,
            request.buy_expression.as_ref(),
            &request.sell_conditions,
            request.priority_factor.as_deref(),
        );

        self.hub.emit_preparation(
            &session,
            PreparationStage::CalculatingFactors,
            "computing factor tables",
        );
        let tables = self
            .factor_tables(&data, &mask, &days, &universe_key, &strategy_hash)
            .await?;
        self.check_cancel(cancel)?;

        self.hub.emit_preparation(
            &session,
            PreparationStage::PreparingSimulation,
            "starting simulation",
        );
        let mut sim = Simulator::new(request, buy_rule.clone())?;
        let empty = Arc::new(FactorTable::new(
            request.start_date,
            Vec::new(),
        ));

        let total_days = days.len();
        for (i, &day) in days.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(BacktestError::Cancelled);
            }
            let table = tables.get(&day).unwrap_or(&empty);
            let outcome = sim.step(day, &data, &data.corporate_actions, table)?;

            for trade in &sim.trades()[outcome.trade_range.clone()] {
                self.hub.emit_trade(&session, trade.clone());
            }
            let snap = &outcome.snapshot;
            self.hub.emit_progress(
                &session,
                ProgressState {
                    date: day.to_string(),
                    portfolio_value: decimal_to_f64(snap.portfolio_value),
                    cash: decimal_to_f64(snap.cash),
                    position_value: decimal_to_f64(snap.invested),
                    daily_return: snap.daily_return,
                    cumulative_return: snap.cumulative_return,
                    progress_percent: ((i + 1) * 100 / total_days) as u32,
                    current_mdd: snap.drawdown,
                    buy_count: outcome.buy_count,
                    sell_count: outcome.sell_count,
                },
            );
        }

        let last_day = *days.last().expect("non-empty trading window");
        sim.finalize(last_day, &data)?;

        let result = assemble_result(backtest_id, request, sim, &buy_rule, &data, last_day);

        let results = Arc::clone(&self.results);
        let persist_req = request.clone();
        let persist_result = result.clone();
        tokio::task::spawn_blocking(move || results.save_result(&persist_req, &persist_result))
            .await
            .map_err(|e| BacktestError::Internal(e.to_string()))?
            .map_err(|e| BacktestError::ExternalFailure(format!("persist failed: {e}")))?;

        tracing::info!(
            %backtest_id,
            total_return = result.statistics.total_return,
            trades = result.trades.len(),
            "backtest completed"
        );
        Ok(result)
    }

    fn check_cancel(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            Err(BacktestError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Batch cache consult, compute the missing dates, write them back.
    async fn factor_tables(
        &self,
        data: &MarketData,
        mask: &crate::factors::registry::ComputeMask,
        days: &[NaiveDate],
        universe_key: &str,
        strategy_hash: &str,
    ) -> Result<FxHashMap<NaiveDate, Arc<FactorTable>>> {
        let mut tables = self
            .cache
            .get_factors_batch(days, universe_key, strategy_hash)
            .await;

        let missing: Vec<NaiveDate> = days
            .iter()
            .copied()
            .filter(|d| !tables.contains_key(d))
            .collect();
        tracing::info!(
            requested = days.len(),
            cache_hits = tables.len(),
            to_compute = missing.len(),
            "factor table coverage"
        );

        if !missing.is_empty() {
            let ctx = ComputeContext::new(data, mask);
            let engine = FactorEngine::new(self.config.factor_backend);
            let computed = engine.compute_dates(&ctx, &missing)?;
            self.cache
                .set_factors_batch(&computed, universe_key, strategy_hash)
                .await;
            for table in computed {
                tables.insert(table.date, table);
            }
        }
        Ok(tables)
    }
}

fn assemble_result(
    backtest_id: Uuid,
    request: &BacktestRequest,
    sim: Simulator,
    buy_rule: &CompiledRule,
    data: &MarketData,
    last_day: NaiveDate,
) -> BacktestResult {
    let (trades, daily_history, holdings) = sim.into_parts();
    let initial_capital = decimal_to_f64(request.initial_capital);

    let stats = statistics::compute_statistics(&daily_history, &trades, initial_capital);
    let monthly = statistics::monthly_breakdown(&daily_history, &trades);
    let yearly = statistics::yearly_breakdown(&daily_history, &trades);
    let drawdowns = statistics::drawdown_periods(&daily_history);

    let mut factor_names: Vec<String> = buy_rule
        .factor_names()
        .into_iter()
        .map(str::to_string)
        .collect();
    factor_names.sort_unstable();
    factor_names.dedup();
    let contributions = statistics::factor_contributions(&trades, &factor_names);

    let portfolio_value = daily_history
        .last()
        .map_or(initial_capital, |s| decimal_to_f64(s.portfolio_value));
    let current_holdings: Vec<HoldingView> = holdings
        .values()
        .map(|p| {
            let current_price = data
                .series
                .get(&p.stock)
                .and_then(|s| s.close_on_or_before(last_day))
                .map_or(decimal_to_f64(p.avg_price), |(_, c)| c);
            let value = current_price * p.quantity as f64;
            let cost = decimal_to_f64(p.avg_price) * p.quantity as f64;
            HoldingView {
                stock: p.stock.clone(),
                quantity: p.quantity,
                avg_price: p.avg_price,
                current_price,
                value,
                profit: value - cost,
                profit_rate: if cost > 0.0 { (value - cost) / cost * 100.0 } else { 0.0 },
                weight: if portfolio_value > 0.0 { value / portfolio_value * 100.0 } else { 0.0 },
                buy_date: p.entry_date,
                hold_days: p.hold_days,
                factors: p.entry_factors.clone(),
            }
        })
        .collect();

    let chart_data = ChartData {
        dates: daily_history.iter().map(|s| s.date).collect(),
        values: daily_history
            .iter()
            .map(|s| decimal_to_f64(s.portfolio_value))
            .collect(),
    };

    BacktestResult {
        backtest_id,
        statistics: stats,
        daily_performance: daily_history,
        monthly_performance: monthly,
        yearly_performance: yearly,
        trades,
        current_holdings,
        drawdown_periods: drawdowns,
        factor_contributions: contributions,
        chart_data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryKv;
    use crate::persist::sqlite::SqliteResultStore;
    use crate::testutil;
    use chrono::NaiveDate;

    fn runner(store: crate::data::frame::FrameStore) -> BacktestRunner {
        BacktestRunner::new(
            Config::default(),
            Arc::new(store),
            Arc::new(FactorCache::new(
                Some(Arc::new(InMemoryKv::new())),
                std::time::Duration::from_secs(60),
            )),
            Arc::new(SqliteResultStore::in_memory().unwrap()),
            Arc::new(ProgressHub::default()),
        )
    }

    #[tokio::test]
    async fn end_to_end_run_persists_and_completes() {
        let start = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();
        let store =
            testutil::store_of(&[("AAA", start, &[100.0, 102.0, 104.0, 101.0, 103.0])]);
        let runner = runner(store);
        let req = testutil::sample_request(start, NaiveDate::from_ymd_opt(2024, 6, 7).unwrap());

        let result = runner
            .run_backtest(req, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.daily_performance.len(), 5);
        assert!(!result.trades.is_empty());
        assert_eq!(result.chart_data.dates.len(), 5);
        // FINAL liquidation leaves nothing open.
        assert!(result.current_holdings.is_empty());
    }

    #[tokio::test]
    async fn invalid_request_fails_before_any_work() {
        let start = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();
        let store = testutil::store_of(&[("AAA", start, &[100.0, 101.0])]);
        let runner = runner(store);
        let mut req = testutil::sample_request(start, NaiveDate::from_ymd_opt(2024, 6, 7).unwrap());
        req.max_positions = 0;

        let err = runner
            .run_backtest(req, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[tokio::test]
    async fn pre_cancelled_token_aborts() {
        let start = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();
        let store = testutil::store_of(&[("AAA", start, &[100.0, 101.0, 102.0])]);
        let runner = runner(store);
        let req = testutil::sample_request(start, NaiveDate::from_ymd_opt(2024, 6, 5).unwrap());

        let token = CancellationToken::new();
        token.cancel();
        let err = runner.run_backtest(req, token).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn event_stream_ends_with_completed() {
        use crate::engine::progress::ProgressEvent;

        let start = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();
        let store = testutil::store_of(&[("AAA", start, &[100.0, 102.0, 104.0])]);
        let runner = runner(store);
        let req = testutil::sample_request(start, NaiveDate::from_ymd_opt(2024, 6, 5).unwrap());

        let id = Uuid::new_v4();
        let hub = runner.hub();
        let mut rx = hub.subscribe(&id.to_string());

        runner
            .run_with_id(id, req, CancellationToken::new())
            .await
            .unwrap();

        let mut saw_preparation = false;
        let mut saw_progress = false;
        let mut saw_trade = false;
        loop {
            match rx.recv().await.unwrap() {
                ProgressEvent::Preparation { .. } => saw_preparation = true,
                ProgressEvent::Progress(_) | ProgressEvent::Delta { .. } => saw_progress = true,
                ProgressEvent::Trade { .. } => saw_trade = true,
                ProgressEvent::Completed { statistics, .. } => {
                    assert_eq!(statistics.trading_days, 3);
                    break;
                }
                ProgressEvent::Error { message } => panic!("unexpected error event: {message}"),
            }
        }
        assert!(saw_preparation && saw_progress && saw_trade);
    }
}
