//! End-to-end backtest scenarios over deterministic synthetic data.

use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use factorlab::cache::factor_cache::FactorCache;
use factorlab::cache::InMemoryKv;
use factorlab::config::Config;
use factorlab::conditions::{CondOp, CondValue, ConditionSpec};
use factorlab::data::frame::{rows_from_closes, FrameStore};
use factorlab::engine::progress::ProgressHub;
use factorlab::engine::runner::BacktestRunner;
use factorlab::engine::types::{BacktestResult, SellReason, TradeSide};
use factorlab::factors::fundamentals::{
    FundamentalRecord, ReportCode, ACC_NET_INCOME, ACC_REVENUE, ACC_TOTAL_ASSETS, ACC_TOTAL_EQUITY,
};
use factorlab::persist::sqlite::SqliteResultStore;
use factorlab::strategy::BacktestRequest;
use factorlab::testutil;

/// Scenario 1 price path: D1..D10 closes, opens equal to previous close.
const SCENARIO_CLOSES: [f64; 10] = [100.0, 102.0, 104.0, 101.0, 103.0, 99.0, 97.0, 100.0, 105.0, 110.0];

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn runner_for(store: FrameStore) -> (BacktestRunner, Arc<SqliteResultStore>) {
    let results = Arc::new(SqliteResultStore::in_memory().unwrap());
    let runner = BacktestRunner::new(
        Config::default(),
        Arc::new(store),
        Arc::new(FactorCache::disabled()),
        results.clone(),
        Arc::new(ProgressHub::default()),
    );
    (runner, results)
}

async fn run(store: FrameStore, req: BacktestRequest) -> BacktestResult {
    let (runner, _) = runner_for(store);
    runner
        .run_backtest(req, CancellationToken::new())
        .await
        .expect("backtest runs")
}

/// Scenario window: 2024-06-03 (Mon) through 2024-06-14 (Fri), ten
/// consecutive trading days.
fn scenario_window() -> (NaiveDate, NaiveDate) {
    (d(2024, 6, 3), d(2024, 6, 14))
}

#[tokio::test]
async fn scenario_1_single_stock_deterministic() {
    let (start, end) = scenario_window();
    let store = testutil::store_of(&[("AAA", start, &SCENARIO_CLOSES)]);
    let req = testutil::sample_request(start, end);
    let result = run(store, req).await;

    // Exactly one entry and the FINAL liquidation.
    assert_eq!(result.trades.len(), 2);
    let buy = &result.trades[0];
    assert_eq!(buy.side, TradeSide::Buy);
    assert_eq!(buy.date, start);

    // Entry at D1 open x (1 + slippage) = 100.100.
    let exec_price = Decimal::from_f64(100.0).unwrap() * Decimal::from_f64(1.001).unwrap();
    assert_eq!(buy.price, exec_price);
    // Quantity: largest whole-share count the cash covers after commission.
    let affordable = (Decimal::from(1_000_000u64)
        / (exec_price * Decimal::from_f64(1.0015).unwrap()))
    .floor();
    assert_eq!(Decimal::from(buy.quantity), affordable);
    assert_eq!(buy.quantity, 9975);

    let finale = &result.trades[1];
    assert_eq!(finale.side, TradeSide::Sell);
    assert_eq!(finale.sell_reason, Some(SellReason::Final));
    assert_eq!(finale.date, end);
    assert_eq!(finale.price, Decimal::from_f64(110.0).unwrap());

    // Total return derives from 110/100.100 net of costs.
    let qty = Decimal::from(buy.quantity);
    let buy_cost = buy.amount + buy.commission;
    let sell_amount = Decimal::from_f64(110.0).unwrap() * qty;
    let net = sell_amount
        - sell_amount * Decimal::from_f64(0.0015).unwrap()
        - sell_amount * Decimal::from_f64(0.0023).unwrap();
    let expected_final = Decimal::from(1_000_000u64) - buy_cost + net;
    let expected_return = (expected_final - Decimal::from(1_000_000u64))
        / Decimal::from(1_000_000u64)
        * Decimal::from(100u64);
    let got = result.statistics.total_return;
    let want = {
        use rust_decimal::prelude::ToPrimitive;
        expected_return.to_f64().unwrap()
    };
    assert!(
        (got - want).abs() < 1e-6,
        "total return {got} != expected {want}"
    );
    assert_eq!(result.statistics.trading_days, 10);
}

#[tokio::test]
async fn scenario_2_stop_loss_triggers_on_threshold() {
    let (start, end) = scenario_window();
    let store = testutil::store_of(&[("AAA", start, &SCENARIO_CLOSES)]);
    let mut req = testutil::sample_request(start, end);
    req.target_and_loss.target_gain = Some(20.0);
    req.target_and_loss.stop_loss = Some(3.0);
    let result = run(store, req).await;

    let stop = result
        .trades
        .iter()
        .find(|t| t.sell_reason == Some(SellReason::StopLoss))
        .expect("stop loss fired");
    // D6 close 99 is only -1.1% from 100.1; D7 close 97 is -3.1%.
    assert_eq!(stop.date, d(2024, 6, 11));
    assert_eq!(stop.price, Decimal::from_f64(97.0).unwrap());

    // No same-day re-entry; the next buy is on the following rebalance day.
    assert!(!result
        .trades
        .iter()
        .any(|t| t.side == TradeSide::Buy && t.date == stop.date));
    let reentry = result
        .trades
        .iter()
        .find(|t| t.side == TradeSide::Buy && t.date > stop.date)
        .expect("re-entry after stop loss");
    assert_eq!(reentry.date, d(2024, 6, 12));
}

#[tokio::test]
async fn scenario_3_min_hold_blocks_stop_loss() {
    let (start, end) = scenario_window();
    let store = testutil::store_of(&[("AAA", start, &SCENARIO_CLOSES)]);
    let mut req = testutil::sample_request(start, end);
    req.target_and_loss.target_gain = Some(20.0);
    req.target_and_loss.stop_loss = Some(3.0);
    req.hold_days.min_hold_days = 8;
    let result = run(store, req).await;

    assert!(
        !result
            .trades
            .iter()
            .any(|t| t.sell_reason == Some(SellReason::StopLoss)),
        "stop loss at D7 must be suppressed by min_hold_days=8"
    );
    // Position rides through to the FINAL exit at D10; realised PnL
    // reflects the 110 close, not the 97 dip.
    let finale = result
        .trades
        .iter()
        .find(|t| t.sell_reason == Some(SellReason::Final))
        .expect("final sale");
    assert_eq!(finale.date, end);
    assert!(finale.realized_pnl.unwrap() > Decimal::ZERO);
}

#[tokio::test]
async fn scenario_4_corporate_action_forces_liquidation_and_blocks() {
    let (start, end) = scenario_window();
    // +56% on D4 marks an unadjusted bonus/split event.
    let store = testutil::store_of(&[(
        "BBB",
        start,
        &[100.0, 101.0, 102.0, 160.0, 165.0, 170.0, 172.0, 171.0, 173.0, 175.0],
    )]);
    let req = testutil::sample_request(start, end);
    let result = run(store, req).await;

    let forced = result
        .trades
        .iter()
        .find(|t| t.sell_reason == Some(SellReason::CorporateAction))
        .expect("forced liquidation");
    assert_eq!(forced.stock, "BBB");
    // Liquidated at the D3 close (last clean bar), on the event date.
    assert_eq!(forced.price, Decimal::from_f64(102.0).unwrap());
    assert_eq!(forced.date, d(2024, 6, 6));

    // No buy of BBB at or after the event date, even though the buy
    // condition stays true.
    let event_date = d(2024, 6, 6);
    assert!(!result
        .trades
        .iter()
        .any(|t| t.side == TradeSide::Buy && t.date >= event_date));
}

fn accounts(net_income: f64) -> FxHashMap<String, f64> {
    [
        (ACC_REVENUE, 1_000.0),
        (ACC_NET_INCOME, net_income),
        (ACC_TOTAL_ASSETS, 2_000.0),
        (ACC_TOTAL_EQUITY, 1_000.0),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

#[tokio::test]
async fn scenario_5_future_fundamentals_never_leak() {
    // Trading days around 2024-05-15.
    let start = d(2024, 4, 1);
    let end = d(2024, 5, 17);
    let closes: Vec<f64> = (0..40).map(|i| 100.0 + f64::from(i) * 0.5).collect();

    // The prior fiscal record is available (published 2023); the sentinel
    // record reports 2024-03-31 but only becomes available 2024-06-29.
    let prior = FundamentalRecord::new("AAA", 2022, ReportCode::Annual, accounts(100.0));
    let mut sentinel = FundamentalRecord::new("AAA", 2024, ReportCode::Q1, accounts(-500.0));
    sentinel.report_date = d(2024, 3, 31);
    sentinel.available_date = d(2024, 6, 29);
    assert!(sentinel.available_date > end);

    let rows = rows_from_closes("AAA", start, &closes, 1_000.0);
    let with_sentinel = FrameStore::new(rows.clone(), vec![prior.clone(), sentinel]);
    let without_sentinel = FrameStore::new(rows, vec![prior]);

    let mut req = testutil::sample_request(start, end);
    req.buy_conditions = vec![ConditionSpec {
        id: "A".into(),
        factor: "ROE".into(),
        operator: CondOp::Gt,
        value: CondValue::Scalar(0.0),
        exp_left_side: None,
    }];

    let a = run(with_sentinel, req.clone()).await;
    let b = run(without_sentinel, req).await;

    // The candidate decisions on every day (hence the whole trade list)
    // must be identical with and without the future-published record.
    let a_trades = serde_json::to_string(&a.trades).unwrap();
    let b_trades = serde_json::to_string(&b.trades).unwrap();
    assert_eq!(a_trades, b_trades);
    assert!(
        a.trades.iter().any(|t| t.side == TradeSide::Buy),
        "the prior record's positive ROE admits the stock"
    );
    // The sentinel's negative earnings never reach any factor snapshot.
    for trade in &a.trades {
        if let Some(roe) = trade.factors.get("ROE") {
            assert!(*roe > 0.0, "leaked look-ahead ROE {roe}");
        }
    }
}

#[tokio::test]
async fn scenario_6_cache_entries_isolated_per_strategy() {
    let (start, end) = scenario_window();
    let kv = Arc::new(InMemoryKv::new());

    let run_with_cache = |closes: &'static [f64; 10], req: BacktestRequest, kv: Arc<InMemoryKv>| async move {
        let store = testutil::store_of(&[("AAA", start, closes)]);
        let runner = BacktestRunner::new(
            Config::default(),
            Arc::new(store),
            Arc::new(FactorCache::new(Some(kv), std::time::Duration::from_secs(600))),
            Arc::new(SqliteResultStore::in_memory().unwrap()),
            Arc::new(ProgressHub::default()),
        );
        runner
            .run_with_id(Uuid::new_v4(), req, CancellationToken::new())
            .await
            .unwrap()
    };

    let req_a = testutil::sample_request(start, end);
    let mut req_b = testutil::sample_request(start, end);
    req_b.buy_conditions[0].value = CondValue::Scalar(500.0); // impossible condition

    let hash_a = req_a.strategy_hash();
    let hash_b = req_b.strategy_hash();
    assert_ne!(hash_a, hash_b, "different conditions produce different hashes");

    let result_a = run_with_cache(&SCENARIO_CLOSES, req_a, kv.clone()).await;
    assert!(!result_a.trades.is_empty());

    // Strategy B sees a cold cache for its own hash: its (always-false)
    // conditions yield no trades even though A's tables are cached.
    let result_b = run_with_cache(&SCENARIO_CLOSES, req_b, kv.clone()).await;
    assert!(result_b.trades.is_empty());

    // Keys for both strategies coexist under distinct hashes.
    let factor_keys_a = factorlab::cache::factor_cache::factor_key(start, "all", &hash_a);
    let factor_keys_b = factorlab::cache::factor_cache::factor_key(start, "all", &hash_b);
    assert!(kv.len() >= 20, "both strategies cached their own tables");
    assert_ne!(factor_keys_a, factor_keys_b);
}
