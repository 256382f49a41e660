//! Shared fixtures for unit and integration tests.
#![doc(hidden)]

use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::cache::factor_cache::FactorCache;
use crate::conditions::{CondOp, CondValue, ConditionSpec};
use crate::data::frame::{rows_from_closes, FrameStore, PriceRow};
use crate::data::loader::{load_market_data, MarketData};
use crate::strategy::{
    BacktestRequest, HoldDaysRule, PositionSizing, PriorityOrder, RebalanceFrequency,
    TargetAndLoss, FIXED_TAX_RATE,
};
use crate::util::retry::RetryPolicy;

pub fn always_true_condition() -> ConditionSpec {
    ConditionSpec {
        id: "A".into(),
        factor: "MOMENTUM_1M".into(),
        operator: CondOp::Gt,
        value: CondValue::Scalar(-999.0),
        exp_left_side: None,
    }
}

pub fn condition(id: &str, factor: &str, operator: CondOp, value: f64) -> ConditionSpec {
    ConditionSpec {
        id: id.into(),
        factor: factor.into(),
        operator,
        value: CondValue::Scalar(value),
        exp_left_side: None,
    }
}

/// A minimal valid request over the window with an always-true buy
/// condition and typical KRX cost parameters.
pub fn sample_request(start: NaiveDate, end: NaiveDate) -> BacktestRequest {
    BacktestRequest {
        name: "test".into(),
        buy_conditions: vec![always_true_condition()],
        buy_expression: None,
        sell_conditions: vec![],
        condition_sell: None,
        target_and_loss: TargetAndLoss::default(),
        hold_days: HoldDaysRule::default(),
        start_date: start,
        end_date: end,
        initial_capital: Decimal::from(1_000_000u64),
        rebalance_frequency: RebalanceFrequency::Daily,
        max_positions: 1,
        position_sizing: PositionSizing::EqualWeight,
        commission_rate: 0.0015,
        tax_rate: FIXED_TAX_RATE,
        slippage: 0.001,
        target_themes: None,
        target_stocks: None,
        target_universes: None,
        priority_factor: None,
        priority_order: PriorityOrder::Desc,
    }
}

pub fn store_of(series: &[(&str, NaiveDate, &[f64])]) -> FrameStore {
    let mut rows: Vec<PriceRow> = Vec::new();
    for (stock, start, closes) in series {
        rows.extend(rows_from_closes(stock, *start, closes, 1000.0));
    }
    FrameStore::new(rows, vec![])
}

pub async fn load(store: &FrameStore, req: &BacktestRequest) -> MarketData {
    load_market_data(
        store,
        &FactorCache::disabled(),
        req,
        50.0,
        &RetryPolicy::db(std::time::Duration::from_secs(5), 1),
    )
    .await
    .expect("market data loads")
}
