//! The live trading jobs. 07:00 KST selects and previews; 09:00 KST
//! executes against the broker. Both reuse the backtest factor engine and
//! condition evaluator with `calc_date = today` and share no in-memory
//! state with batch backtests.

use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::broker::{
    ensure_fresh_token, place_order_with_retry, BrokerClient, OrderRequest, OrderSide,
};
use super::{
    count_business_days, DailyPerformance, LiveStateStore, LiveStrategy, PreviewCandidate,
    RebalancePreview,
};
use crate::cache::factor_cache::FactorCache;
use crate::conditions::evaluator::{ranked_candidates, select_top, CompiledRule};
use crate::config::Config;
use crate::data::loader::{load_market_data, MarketData};
use crate::data::PriceStore;
use crate::factors::deps;
use crate::factors::engine::{ComputeContext, FactorEngine};
use crate::strategy::decimal_to_f64;
use crate::util::retry::RetryPolicy;

pub struct LiveTrader {
    price_store: Arc<dyn PriceStore>,
    cache: Arc<FactorCache>,
    state: Arc<dyn LiveStateStore>,
    broker: Arc<dyn BrokerClient>,
    config: Config,
}

impl LiveTrader {
    pub fn new(
        price_store: Arc<dyn PriceStore>,
        cache: Arc<FactorCache>,
        state: Arc<dyn LiveStateStore>,
        broker: Arc<dyn BrokerClient>,
        config: Config,
    ) -> Self {
        Self {
            price_store,
            cache,
            state,
            broker,
            config,
        }
    }

    /// 07:00 job: refresh hold-day counters, run selection for every active
    /// strategy and persist the rebalance previews. Strategies run
    /// sequentially; one failure never blocks the rest.
    pub async fn selection_job(&self, today: NaiveDate) {
        tracing::info!(%today, "selection job started");
        for strategy in self.state.active_strategies() {
            if let Err(err) = self.select_for(&strategy, today).await {
                tracing::error!(strategy = %strategy.strategy_id, error = %err, "selection failed");
            }
        }
    }

    async fn select_for(&self, strategy: &LiveStrategy, today: NaiveDate) -> anyhow::Result<()> {
        let id = strategy.strategy_id;

        // Business-day hold-day refresh.
        for position in self.state.positions(id) {
            let days = count_business_days(position.buy_date, today);
            self.state.set_hold_days(id, &position.stock, days);
        }

        let data = self.load_window(strategy, today).await?;
        let Some(&calc_date) = data.calendar.last() else {
            anyhow::bail!("no trading data available on {today}");
        };

        let spec = &strategy.spec;
        let hash = spec.strategy_hash();
        let universe_key = spec.universe_key();

        // Same machinery as the backtest, cache included.
        let mask = deps::compute_mask(
            &spec.buy_conditions,
            spec.buy_expression.as_ref(),
            &spec.sell_conditions,
            spec.priority_factor.as_deref(),
        );
        let cached = self
            .cache
            .get_factors_batch(&[calc_date], &universe_key, &hash)
            .await;
        let table = match cached.get(&calc_date) {
            Some(table) => Arc::clone(table),
            None => {
                let ctx = ComputeContext::new(&data, &mask);
                let engine = FactorEngine::new(self.config.factor_backend);
                let table = Arc::new(engine.compute_one(&ctx, calc_date)?);
                self.cache
                    .set_factors_batch(std::slice::from_ref(&table), &universe_key, &hash)
                    .await;
                table
            }
        };

        let buy_rule = CompiledRule::buy_rule(spec)?;
        let satisfied = buy_rule.evaluate(&table);
        let mut excluded: rustc_hash::FxHashSet<String> = self
            .state
            .positions(id)
            .into_iter()
            .map(|p| p.stock)
            .collect();
        for (stock, action) in &data.corporate_actions {
            if action.event_date <= calc_date {
                excluded.insert(stock.clone());
            }
        }

        let held = self.state.positions(id).len();
        let slots = (spec.max_positions as usize).saturating_sub(held);
        let ranked = ranked_candidates(
            &table,
            &satisfied,
            spec.priority_factor.as_deref(),
            spec.priority_order,
            &excluded,
        );
        let selected = select_top(ranked, slots);

        let balance = self
            .broker
            .balance()
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        let budget = if selected.is_empty() {
            Decimal::ZERO
        } else {
            balance.cash / Decimal::from(selected.len() as u64)
        };

        let candidates: Vec<PreviewCandidate> = selected
            .iter()
            .enumerate()
            .filter_map(|(rank, stock)| {
                let close = data
                    .series
                    .get(stock)
                    .and_then(|s| s.close_on_or_before(calc_date))
                    .map(|(_, c)| c)?;
                let price = Decimal::from_f64(close)?;
                if price <= Decimal::ZERO {
                    return None;
                }
                let quantity = (budget / price).floor().to_u64()?;
                (quantity >= 1).then_some(PreviewCandidate {
                    stock: stock.clone(),
                    rank: rank as u32 + 1,
                    target_quantity: quantity,
                })
            })
            .collect();

        tracing::info!(
            strategy = %id,
            %calc_date,
            candidates = candidates.len(),
            "rebalance preview saved"
        );
        self.state.save_preview(RebalancePreview {
            strategy_id: id,
            trade_date: today,
            generated_at: chrono::Utc::now(),
            candidates,
        });
        Ok(())
    }

    /// 09:00 job: refresh credentials, place sells from the standing rules,
    /// then buys from the 07:00 preview. A missing preview skips the
    /// strategy entirely so execution always follows the previewed signal.
    pub async fn execution_job(&self, today: NaiveDate) {
        tracing::info!(%today, "execution job started");
        for strategy in self.state.active_strategies() {
            if let Err(err) = self.execute_for(&strategy, today).await {
                tracing::error!(strategy = %strategy.strategy_id, error = %err, "execution failed");
            }
        }
    }

    async fn execute_for(&self, strategy: &LiveStrategy, today: NaiveDate) -> anyhow::Result<()> {
        let id = strategy.strategy_id;
        if let Err(err) = ensure_fresh_token(self.broker.as_ref(), chrono::Utc::now()).await {
            anyhow::bail!("token refresh failed, skipping strategy: {err}");
        }

        let data = self.load_window(strategy, today).await?;
        let policy = RetryPolicy::broker(self.config.broker_timeout, self.config.max_retries);
        let spec = &strategy.spec;
        let mut sell_count = 0u32;

        // Sell rules: stop-loss, take-profit, hold-day expiry.
        for position in self.state.positions(id) {
            let Some(close) = data
                .series
                .get(&position.stock)
                .and_then(|s| s.close_on_or_before(today))
                .map(|(_, c)| c)
            else {
                continue;
            };
            let entry = decimal_to_f64(position.avg_price);
            if entry <= 0.0 {
                continue;
            }
            let return_pct = (close - entry) / entry * 100.0;

            if position.hold_days < spec.hold_days.min_hold_days {
                continue;
            }
            let triggered = spec
                .target_and_loss
                .stop_loss
                .is_some_and(|sl| return_pct <= -sl)
                || spec
                    .target_and_loss
                    .target_gain
                    .is_some_and(|tg| return_pct >= tg)
                || position.hold_days >= spec.hold_days.max_hold_days;
            if !triggered {
                continue;
            }

            let order = OrderRequest {
                stock: position.stock.clone(),
                side: OrderSide::Sell,
                quantity: position.quantity,
                limit_price: None,
            };
            match place_order_with_retry(self.broker.as_ref(), &policy, &order).await {
                Ok(fill) => {
                    self.state.remove_position(id, &fill.stock);
                    sell_count += 1;
                }
                Err(err) => {
                    tracing::error!(stock = %position.stock, error = %err, "sell order failed");
                }
            }
        }

        // Buys come from the 07:00 preview only.
        let Some(preview) = self.state.latest_preview(id, today) else {
            tracing::warn!(
                strategy = %id,
                "no rebalance preview for today; skipping buys (was the 07:00 job healthy?)"
            );
            return Ok(());
        };

        let held = self.state.positions(id).len();
        let slots = (spec.max_positions as usize).saturating_sub(held);
        let mut buy_count = 0u32;
        for candidate in preview.candidates.iter().take(slots) {
            let order = OrderRequest {
                stock: candidate.stock.clone(),
                side: OrderSide::Buy,
                quantity: candidate.target_quantity,
                limit_price: None,
            };
            match place_order_with_retry(self.broker.as_ref(), &policy, &order).await {
                Ok(fill) => {
                    self.state.upsert_position(
                        id,
                        super::LivePosition {
                            stock: fill.stock,
                            quantity: fill.quantity,
                            avg_price: fill.price,
                            buy_date: today,
                            hold_days: 0,
                        },
                    );
                    buy_count += 1;
                }
                Err(err) => {
                    tracing::error!(stock = %candidate.stock, error = %err, "buy order failed");
                }
            }
        }

        // Per-day performance from the post-trade balance.
        let balance = self
            .broker
            .balance()
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        let mut position_value = 0.0;
        for position in self.state.positions(id) {
            if let Some((_, close)) = data
                .series
                .get(&position.stock)
                .and_then(|s| s.close_on_or_before(today))
            {
                position_value += close * position.quantity as f64;
            }
        }
        self.state.record_daily_performance(
            id,
            DailyPerformance {
                date: today,
                portfolio_value: decimal_to_f64(balance.cash) + position_value,
                cash: decimal_to_f64(balance.cash),
                buy_count,
                sell_count,
            },
        );
        Ok(())
    }

    /// Load the trailing price window for a strategy with `end = today`.
    /// The start reaches a week back so the latest trading day is always
    /// inside the simulated window even across holidays.
    async fn load_window(
        &self,
        strategy: &LiveStrategy,
        today: NaiveDate,
    ) -> crate::error::Result<MarketData> {
        let mut spec = strategy.spec.clone();
        spec.start_date = today - chrono::Days::new(7);
        spec.end_date = today;
        let policy = RetryPolicy::db(self.config.db_timeout, self.config.max_retries);
        load_market_data(
            self.price_store.as_ref(),
            &self.cache,
            &spec,
            self.config.corporate_action_threshold,
            &policy,
        )
        .await
    }
}
