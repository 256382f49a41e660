pub mod corporate;
pub mod frame;
pub mod loader;
pub mod universe;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use polars::prelude::DataFrame;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::factors::fundamentals::FundamentalRecord;

/// Canonical column names of the price frame.
pub mod columns {
    pub const STOCK: &str = "stock_code";
    pub const NAME: &str = "stock_name";
    pub const DATE: &str = "date";
    pub const OPEN: &str = "open_price";
    pub const HIGH: &str = "high_price";
    pub const LOW: &str = "low_price";
    pub const CLOSE: &str = "close_price";
    pub const VOLUME: &str = "volume";
    pub const TRADING_VALUE: &str = "trading_value";
    pub const MARKET_CAP: &str = "market_cap";
    pub const SHARES: &str = "listed_shares";
    pub const CHANGE_RATE: &str = "CHANGE_RATE";
}

/// Read-only access to the external price/fundamentals store. Each method
/// must be callable on an independent session so the three loaders can run
/// concurrently.
#[async_trait]
pub trait PriceStore: Send + Sync {
    /// Daily bars for the window, already restricted to the requested
    /// themes/stocks. Rows with non-positive open/high/low/close are
    /// corporate-action blackout rows and must not be returned.
    async fn load_prices(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        themes: Option<&[String]>,
        stocks: Option<&[String]>,
    ) -> Result<DataFrame>;

    /// Quarterly/annual fundamental records for the fiscal-year range.
    async fn load_fundamentals(
        &self,
        start_year: i32,
        end_year: i32,
        accounts: &[&str],
        stocks: Option<&[String]>,
    ) -> Result<Vec<FundamentalRecord>>;

    /// (stock, date, listed_shares, market_cap) rows used to backfill the
    /// price frame where the bar columns are missing.
    async fn load_shares_outstanding(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        stocks: Option<&[String]>,
    ) -> Result<DataFrame>;
}

/// One daily bar. All five price fields are strictly positive for a valid
/// bar; the loaders filter everything else out.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub trading_value: f64,
    pub market_cap: f64,
    pub shares_outstanding: f64,
}

/// Ascending per-stock daily series. The native factor backend and the
/// simulator both read from these contiguous arrays; serialisability is
/// what the price-window cache stores.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StockSeries {
    pub dates: Vec<NaiveDate>,
    pub open: Vec<f64>,
    pub high: Vec<f64>,
    pub low: Vec<f64>,
    pub close: Vec<f64>,
    pub volume: Vec<f64>,
    pub trading_value: Vec<f64>,
    pub market_cap: Vec<f64>,
    pub shares: Vec<f64>,
}

impl StockSeries {
    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    /// Exact index of a trading date.
    pub fn index_of(&self, date: NaiveDate) -> Option<usize> {
        self.dates.binary_search(&date).ok()
    }

    /// Number of rows with date <= the given date (window end for lookback
    /// computations).
    pub fn rows_through(&self, date: NaiveDate) -> usize {
        self.dates.partition_point(|d| *d <= date)
    }

    pub fn bar_at(&self, idx: usize) -> Bar {
        Bar {
            open: self.open[idx],
            high: self.high[idx],
            low: self.low[idx],
            close: self.close[idx],
            volume: self.volume[idx],
            trading_value: self.trading_value[idx],
            market_cap: self.market_cap[idx],
            shares_outstanding: self.shares[idx],
        }
    }

    pub fn bar_on(&self, date: NaiveDate) -> Option<Bar> {
        self.index_of(date).map(|i| self.bar_at(i))
    }

    /// Last close on or before `date`. Forward-fill is only ever used for
    /// holdings valuation, never for entry decisions.
    pub fn close_on_or_before(&self, date: NaiveDate) -> Option<(NaiveDate, f64)> {
        let n = self.rows_through(date);
        if n == 0 {
            None
        } else {
            Some((self.dates[n - 1], self.close[n - 1]))
        }
    }

    /// Close of the bar immediately before `date`.
    pub fn prev_close(&self, date: NaiveDate) -> Option<f64> {
        let n = self.dates.partition_point(|d| *d < date);
        if n == 0 {
            None
        } else {
            Some(self.close[n - 1])
        }
    }

    pub(crate) fn truncate_from(&mut self, date: NaiveDate) {
        let keep = self.dates.partition_point(|d| *d < date);
        self.dates.truncate(keep);
        self.open.truncate(keep);
        self.high.truncate(keep);
        self.low.truncate(keep);
        self.close.truncate(keep);
        self.volume.truncate(keep);
        self.trading_value.truncate(keep);
        self.market_cap.truncate(keep);
        self.shares.truncate(keep);
    }
}

pub type SeriesMap = FxHashMap<String, StockSeries>;
