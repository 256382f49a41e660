//! Multi-stage market data loading: cached price window, fundamentals and
//! shares-outstanding loaded concurrently on independent sessions, then
//! corporate-action filtering and universe bucketing.

use chrono::{Days, NaiveDate};
use polars::prelude::DataFrame;

use super::corporate::{self, ActionMap};
use super::frame::{frame_from_series, series_from_frame};
use super::{columns, PriceStore, SeriesMap};
use crate::cache::factor_cache::FactorCache;
use crate::error::{BacktestError, Result};
use crate::factors::fundamentals::{FundamentalHistory, ALL_ACCOUNTS};
use crate::strategy::BacktestRequest;
use crate::util::retry::{with_retry, RetryPolicy, Transient};

/// Longest factor lookback: 12-month momentum over ~240 trading rows needs
/// roughly 300 calendar days of history before the window start.
pub const LOOKBACK_DAYS: u64 = 300;

/// Everything the engine needs in memory for one backtest.
#[derive(Debug)]
pub struct MarketData {
    /// Per-stock series, corporate-action rows already dropped.
    pub series: SeriesMap,
    /// Canonical price frame rebuilt from `series` for the polars backends.
    pub frame: DataFrame,
    /// All trading dates in the extended window, ascending.
    pub calendar: Vec<NaiveDate>,
    pub corporate_actions: ActionMap,
    pub fundamentals: FundamentalHistory,
}

impl MarketData {
    /// Trading days within the simulated window.
    pub fn trading_days(&self, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
        self.calendar
            .iter()
            .copied()
            .filter(|d| *d >= start && *d <= end)
            .collect()
    }

    /// Sorted stock universe.
    pub fn universe(&self) -> Vec<String> {
        let mut stocks: Vec<String> = self.series.keys().cloned().collect();
        stocks.sort_unstable();
        stocks
    }
}

/// Load prices (cache-first), fundamentals and shares outstanding in
/// parallel, then filter corporate actions and apply universe buckets.
/// Observed latency is roughly the max of the three loads, not the sum.
pub async fn load_market_data(
    store: &dyn PriceStore,
    cache: &FactorCache,
    req: &BacktestRequest,
    corporate_action_threshold: f64,
    policy: &RetryPolicy,
) -> Result<MarketData> {
    let extended_start = req.start_date - Days::new(LOOKBACK_DAYS);
    let end = req.end_date;

    let themes = req.target_themes.clone();
    let stocks = req.target_stocks.clone();
    let themes_csv = themes.as_deref().map(join_sorted).unwrap_or_default();
    let stocks_csv = stocks.as_deref().map(join_sorted).unwrap_or_default();

    let themes_ref = themes.as_deref();
    let stocks_ref = stocks.as_deref();
    let start_year = chrono::Datelike::year(&req.start_date) - 5;
    let end_year = chrono::Datelike::year(&end);

    let prices_fut = async {
        if let Some(series) = cache
            .get_price_window(extended_start, end, &themes_csv, &stocks_csv)
            .await
        {
            tracing::info!("price window served from cache");
            return Ok(series);
        }
        let frame = with_retry(policy, "load_prices", move || async move {
            store
                .load_prices(extended_start, end, themes_ref, stocks_ref)
                .await
                .map_err(|e| Transient::Retryable(e.to_string()))
        })
        .await
        .map_err(BacktestError::ExternalFailure)?;
        let series = series_from_frame(&frame)?;
        if !series.is_empty() {
            cache
                .set_price_window(extended_start, end, &themes_csv, &stocks_csv, &series)
                .await;
        }
        Ok::<SeriesMap, BacktestError>(series)
    };

    let fundamentals_fut = async {
        with_retry(policy, "load_fundamentals", move || async move {
            store
                .load_fundamentals(start_year, end_year, &ALL_ACCOUNTS, stocks_ref)
                .await
                .map_err(|e| Transient::Retryable(e.to_string()))
        })
        .await
        .map_err(BacktestError::ExternalFailure)
    };

    let shares_fut = async {
        with_retry(policy, "load_shares_outstanding", move || async move {
            store
                .load_shares_outstanding(extended_start, end, stocks_ref)
                .await
                .map_err(|e| Transient::Retryable(e.to_string()))
        })
        .await
        .map_err(BacktestError::ExternalFailure)
    };

    let (series, fundamentals, shares) =
        tokio::join!(prices_fut, fundamentals_fut, shares_fut);
    let mut series = series?;
    let fundamentals = fundamentals?;
    let shares = shares?;

    if series.is_empty() {
        return Err(BacktestError::DataUnavailable(format!(
            "no price data between {extended_start} and {end} for the requested universe"
        )));
    }

    merge_shares(&mut series, &shares)?;

    let corporate_actions =
        corporate::detect_and_filter(&mut series, corporate_action_threshold);

    apply_universe_buckets(&mut series, req);
    if series.is_empty() {
        return Err(BacktestError::DataUnavailable(
            "universe filter removed every stock".into(),
        ));
    }

    let frame = frame_from_series(&series)?;
    let mut calendar: Vec<NaiveDate> = series
        .values()
        .flat_map(|s| s.dates.iter().copied())
        .collect();
    calendar.sort_unstable();
    calendar.dedup();

    if !calendar.iter().any(|d| *d >= req.start_date && *d <= end) {
        return Err(BacktestError::DataUnavailable(format!(
            "no trading days between {} and {end}",
            req.start_date
        )));
    }

    tracing::info!(
        stocks = series.len(),
        trading_days = calendar.len(),
        corporate_actions = corporate_actions.len(),
        "market data loaded"
    );

    Ok(MarketData {
        series,
        frame,
        calendar,
        corporate_actions,
        fundamentals: FundamentalHistory::from_records(fundamentals),
    })
}

fn join_sorted(items: &[String]) -> String {
    let mut sorted: Vec<&str> = items.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.join(",")
}

/// Patch missing market-cap / shares values from the dedicated loader.
fn merge_shares(series: &mut SeriesMap, shares: &DataFrame) -> Result<()> {
    if shares.height() == 0 {
        return Ok(());
    }
    let stocks = shares.column(columns::STOCK)?.str()?;
    let dates = shares.column(columns::DATE)?.date()?;
    let share_counts = shares.column(columns::SHARES)?.f64()?;
    let caps = shares.column(columns::MARKET_CAP)?.f64()?;

    const EPOCH_OFFSET_DAYS: i32 = 719_163;
    for i in 0..shares.height() {
        let (Some(stock), Some(days)) = (stocks.get(i), dates.phys.get(i)) else {
            continue;
        };
        let Some(date) = NaiveDate::from_num_days_from_ce_opt(days + EPOCH_OFFSET_DAYS) else {
            continue;
        };
        let Some(s) = series.get_mut(stock) else { continue };
        let Some(idx) = s.index_of(date) else { continue };
        if let Some(count) = share_counts.get(i) {
            if s.shares[idx].is_nan() || s.shares[idx] <= 0.0 {
                s.shares[idx] = count;
            }
        }
        if let Some(cap) = caps.get(i) {
            if s.market_cap[idx].is_nan() || s.market_cap[idx] <= 0.0 {
                s.market_cap[idx] = cap;
            }
        }
    }
    Ok(())
}

/// Keep only stocks whose market cap on the first simulated trading day
/// falls inside one of the requested size buckets.
fn apply_universe_buckets(series: &mut SeriesMap, req: &BacktestRequest) {
    let Some(buckets) = &req.target_universes else {
        return;
    };
    if buckets.is_empty() {
        return;
    }
    let start = req.start_date;
    series.retain(|_, s| {
        let n = s.dates.partition_point(|d| *d < start);
        let idx = if n < s.len() { n } else { s.len().saturating_sub(1) };
        if s.is_empty() {
            return false;
        }
        let cap = s.market_cap[idx];
        if !cap.is_finite() {
            return false;
        }
        buckets.iter().any(|b| {
            let (min, max) = b.cap_bounds();
            cap >= min && max.is_none_or(|m| cap < m)
        })
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::frame::{rows_from_closes, FrameStore};
    use crate::strategy::UniverseId;
    use crate::testutil::sample_request as request;

    #[tokio::test]
    async fn loads_and_builds_calendar() {
        let start = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();
        let rows = rows_from_closes("AAA", start, &[100.0, 101.0, 102.0, 103.0], 1000.0);
        let store = FrameStore::new(rows, vec![]);
        let cache = FactorCache::disabled();
        let req = request(start, NaiveDate::from_ymd_opt(2024, 6, 7).unwrap());

        let data = load_market_data(&store, &cache, &req, 50.0, &test_policy())
            .await
            .unwrap();
        assert_eq!(data.universe(), vec!["AAA".to_string()]);
        assert_eq!(data.trading_days(req.start_date, req.end_date).len(), 4);
        assert!(data.corporate_actions.is_empty());
    }

    #[tokio::test]
    async fn empty_window_is_data_unavailable() {
        let store = FrameStore::new(vec![], vec![]);
        let cache = FactorCache::disabled();
        let start = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();
        let req = request(start, NaiveDate::from_ymd_opt(2024, 6, 7).unwrap());

        let err = load_market_data(&store, &cache, &req, 50.0, &test_policy())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "DATA_UNAVAILABLE");
    }

    #[tokio::test]
    async fn corporate_action_filtered_during_load() {
        let start = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();
        let rows = rows_from_closes("BBB", start, &[100.0, 101.0, 102.0, 160.0, 165.0], 1000.0);
        let store = FrameStore::new(rows, vec![]);
        let cache = FactorCache::disabled();
        let req = request(start, NaiveDate::from_ymd_opt(2024, 6, 10).unwrap());

        let data = load_market_data(&store, &cache, &req, 50.0, &test_policy())
            .await
            .unwrap();
        assert!(data.corporate_actions.contains_key("BBB"));
        // Event and post-event bars gone.
        assert_eq!(data.series["BBB"].len(), 3);
    }

    #[tokio::test]
    async fn universe_buckets_filter_by_cap() {
        let start = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();
        // rows_from_closes sets market_cap = close * 1e6; far below any
        // KOSPI bucket minimum except the small one.
        let rows = rows_from_closes("AAA", start, &[100.0, 101.0], 1000.0);
        let store = FrameStore::new(rows, vec![]);
        let cache = FactorCache::disabled();

        let mut req = request(start, NaiveDate::from_ymd_opt(2024, 6, 5).unwrap());
        req.target_universes = Some(vec![UniverseId::KospiMega]);
        let err = load_market_data(&store, &cache, &req, 50.0, &test_policy())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "DATA_UNAVAILABLE");

        req.target_universes = Some(vec![UniverseId::KospiSmall]);
        let data = load_market_data(&store, &cache, &req, 50.0, &test_policy())
            .await
            .unwrap();
        assert_eq!(data.universe().len(), 1);
    }

    fn test_policy() -> RetryPolicy {
        RetryPolicy::db(std::time::Duration::from_secs(5), 2)
    }
}
