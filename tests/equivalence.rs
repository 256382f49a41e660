//! Universal invariants: backend equivalence, cache cold/warm equivalence,
//! deterministic replay, trade-price integrity and the snapshot identity.

use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;

use factorlab::cache::factor_cache::FactorCache;
use factorlab::cache::InMemoryKv;
use factorlab::config::Config;
use factorlab::data::frame::{rows_from_closes, FrameStore, PriceRow};
use factorlab::engine::progress::ProgressHub;
use factorlab::engine::runner::BacktestRunner;
use factorlab::engine::types::{BacktestResult, TradeSide};
use factorlab::factors::engine::{compute_table, create_backend, BackendKind, ComputeContext};
use factorlab::factors::fundamentals::{FundamentalRecord, ReportCode, ALL_ACCOUNTS};
use factorlab::factors::registry::ComputeMask;
use factorlab::persist::sqlite::SqliteResultStore;
use factorlab::strategy::BacktestRequest;
use factorlab::testutil;

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

/// A varied multi-stock market: trends, oscillations and volume texture,
/// long enough for the 252-row factors to activate.
fn rich_market(days: usize) -> (Vec<PriceRow>, Vec<FundamentalRecord>) {
    let start = d(2023, 1, 2);
    let mut rows = Vec::new();
    let specs: [(&str, f64, f64, f64); 4] = [
        ("AAA", 100.0, 0.08, 3.0),
        ("BBB", 50.0, -0.02, 1.5),
        ("CCC", 20_000.0, 0.5, 400.0),
        ("DDD", 7_000.0, 0.0, 250.0),
    ];
    for (stock, base, drift, swing) in specs {
        let closes: Vec<f64> = (0..days)
            .map(|i| {
                let i = i as f64;
                base + drift * i + swing * (i * 0.13).sin() + swing * 0.4 * (i * 0.041).cos()
            })
            .collect();
        rows.extend(rows_from_closes(stock, start, &closes, 10_000.0));
    }

    let mut fundamentals = Vec::new();
    for (i, (stock, base, ..)) in specs.iter().enumerate() {
        for year in [2021, 2022] {
            let mut accounts = FxHashMap::default();
            for (j, name) in ALL_ACCOUNTS.iter().enumerate() {
                accounts.insert(
                    (*name).to_string(),
                    base * (1.0 + j as f64) * (1.0 + i as f64 * 0.3) * (year - 2020) as f64,
                );
            }
            fundamentals.push(FundamentalRecord::new(
                *stock,
                year,
                ReportCode::Annual,
                accounts,
            ));
        }
    }
    (rows, fundamentals)
}

#[tokio::test(flavor = "multi_thread")]
async fn factor_backends_are_pointwise_equal() {
    let (rows, fundamentals) = rich_market(300);
    let store = FrameStore::new(rows, fundamentals);
    let req = testutil::sample_request(d(2024, 1, 2), d(2024, 3, 29));
    let data = testutil::load(&store, &req).await;

    let mask = ComputeMask::all();
    let ctx = ComputeContext::new(&data, &mask);

    let frame = create_backend(BackendKind::Frame);
    let columnar = create_backend(BackendKind::Columnar);
    let native = create_backend(BackendKind::Native);

    let calc_dates: Vec<NaiveDate> = data
        .trading_days(req.start_date, req.end_date)
        .into_iter()
        .step_by(13)
        .collect();
    assert!(!calc_dates.is_empty());

    for calc_date in calc_dates {
        let t_frame = compute_table(frame.as_ref(), &ctx, calc_date).unwrap();
        let t_columnar = compute_table(columnar.as_ref(), &ctx, calc_date).unwrap();
        let t_native = compute_table(native.as_ref(), &ctx, calc_date).unwrap();

        assert_eq!(t_frame.stocks, t_native.stocks);
        assert_eq!(t_columnar.stocks, t_native.stocks);

        let mut names: Vec<&str> = t_native.factor_names();
        names.sort_unstable();
        for name in names {
            for stock in &t_native.stocks {
                let n = t_native.value(stock, name);
                let f = t_frame.value(stock, name);
                let c = t_columnar.value(stock, name);
                assert_close(n, f, stock, name, calc_date, "frame");
                assert_close(n, c, stock, name, calc_date, "columnar");
            }
        }
    }
}

fn assert_close(
    reference: Option<f32>,
    other: Option<f32>,
    stock: &str,
    factor: &str,
    date: NaiveDate,
    backend: &str,
) {
    match (reference, other) {
        (None, None) => {}
        (Some(a), Some(b)) => {
            let a = f64::from(a);
            let b = f64::from(b);
            let scale = a.abs().max(b.abs()).max(1e-6);
            assert!(
                (a - b).abs() / scale <= 1e-4,
                "{factor} for {stock} on {date}: native={a} {backend}={b}"
            );
        }
        (a, b) => panic!(
            "{factor} for {stock} on {date}: definedness differs (native={a:?} {backend}={b:?})"
        ),
    }
}

fn result_fingerprint(result: &BacktestResult) -> (String, String) {
    (
        serde_json::to_string(&result.trades).unwrap(),
        serde_json::to_string(&result.statistics).unwrap(),
    )
}

async fn run_with(
    kv: Option<Arc<InMemoryKv>>,
    backend: BackendKind,
    req: BacktestRequest,
) -> BacktestResult {
    let (rows, fundamentals) = rich_market(300);
    let store = FrameStore::new(rows, fundamentals);
    let cache = match kv {
        Some(kv) => FactorCache::new(Some(kv), std::time::Duration::from_secs(600)),
        None => FactorCache::disabled(),
    };
    let config = Config {
        factor_backend: backend,
        ..Config::default()
    };
    let runner = BacktestRunner::new(
        config,
        Arc::new(store),
        Arc::new(cache),
        Arc::new(SqliteResultStore::in_memory().unwrap()),
        Arc::new(ProgressHub::default()),
    );
    runner
        .run_backtest(req, CancellationToken::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn deterministic_replay_is_byte_identical() {
    let mut req = testutil::sample_request(d(2024, 1, 2), d(2024, 3, 29));
    req.max_positions = 3;
    req.priority_factor = Some("MOMENTUM_3M".into());

    let a = run_with(None, BackendKind::Native, req.clone()).await;
    let b = run_with(None, BackendKind::Native, req).await;

    assert_eq!(result_fingerprint(&a), result_fingerprint(&b));
}

#[tokio::test]
async fn cold_and_warm_cache_runs_are_identical() {
    let kv = Arc::new(InMemoryKv::new());
    let mut req = testutil::sample_request(d(2024, 1, 2), d(2024, 3, 29));
    req.max_positions = 2;

    let cold = run_with(Some(kv.clone()), BackendKind::Native, req.clone()).await;
    assert!(kv.len() > 0, "cold run populated the remote tier");
    let warm = run_with(Some(kv), BackendKind::Native, req).await;

    assert_eq!(result_fingerprint(&cold), result_fingerprint(&warm));
}

#[tokio::test]
async fn trades_execute_at_their_dates_prices() {
    let start = d(2024, 6, 3);
    let closes = [100.0, 102.0, 104.0, 101.0, 103.0];
    let store = testutil::store_of(&[("AAA", start, &closes)]);
    let runner = BacktestRunner::new(
        Config::default(),
        Arc::new(store),
        Arc::new(FactorCache::disabled()),
        Arc::new(SqliteResultStore::in_memory().unwrap()),
        Arc::new(ProgressHub::default()),
    );
    let req = testutil::sample_request(start, d(2024, 6, 7));
    let result = runner
        .run_backtest(req, CancellationToken::new())
        .await
        .unwrap();

    // Opens equal the previous close in this fixture.
    let opens = [100.0, 100.0, 102.0, 104.0, 101.0];
    let dates: Vec<NaiveDate> = (0..5).map(|i| start + chrono::Days::new(i)).collect();
    for trade in &result.trades {
        let idx = dates.iter().position(|d| *d == trade.date).unwrap();
        let price = trade.price.to_f64().unwrap();
        match trade.side {
            TradeSide::Buy => {
                let expected = opens[idx] * 1.001;
                assert!(
                    (price - expected).abs() < 1e-9,
                    "buy on {} filled at {price}, expected open-based {expected}",
                    trade.date
                );
            }
            TradeSide::Sell => {
                let expected = closes[idx];
                assert!(
                    (price - expected).abs() < 1e-9,
                    "sell on {} filled at {price}, expected close {expected}",
                    trade.date
                );
            }
        }
    }
}

#[tokio::test]
async fn snapshot_identity_over_a_long_window() {
    let mut req = testutil::sample_request(d(2024, 1, 2), d(2024, 3, 29));
    req.max_positions = 4;
    req.target_and_loss.stop_loss = Some(5.0);
    req.target_and_loss.target_gain = Some(8.0);
    let result = run_with(None, BackendKind::Native, req).await;

    assert!(result.daily_performance.len() >= 30);
    for snap in &result.daily_performance {
        let cash = snap.cash.to_f64().unwrap();
        let invested = snap.invested.to_f64().unwrap();
        let value = snap.portfolio_value.to_f64().unwrap();
        assert!(
            ((cash + invested) - value).abs() <= value.abs() * 1e-6,
            "identity broken on {}",
            snap.date
        );
        assert!(cash >= 0.0, "negative cash on {}", snap.date);
    }
}
