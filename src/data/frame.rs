use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use polars::prelude::*;
use rustc_hash::FxHashMap;

use super::{columns, Bar, PriceStore, SeriesMap, StockSeries};
use crate::factors::fundamentals::FundamentalRecord;

/// One flat price row; the in-memory storage unit of [`FrameStore`].
#[derive(Debug, Clone)]
pub struct PriceRow {
    pub stock: String,
    pub date: NaiveDate,
    pub bar: Bar,
}

/// A [`PriceStore`] over in-memory rows (optionally loaded from parquet).
/// Serves the integration tests, the cache warmer and any deployment where
/// the upstream store has already been exported to files.
#[derive(Debug, Default, Clone)]
pub struct FrameStore {
    rows: Vec<PriceRow>,
    /// stock -> industry/theme, for theme-filtered universes.
    industries: FxHashMap<String, String>,
    fundamentals: Vec<FundamentalRecord>,
}

impl FrameStore {
    pub fn new(rows: Vec<PriceRow>, fundamentals: Vec<FundamentalRecord>) -> Self {
        let mut store = Self {
            rows,
            industries: FxHashMap::default(),
            fundamentals,
        };
        store.rows.sort_by(|a, b| (&a.stock, a.date).cmp(&(&b.stock, b.date)));
        store
    }

    pub fn with_industries(mut self, industries: FxHashMap<String, String>) -> Self {
        self.industries = industries;
        self
    }

    /// Load bars from a parquet export with the canonical column names.
    pub fn from_parquet(path: &str, fundamentals: Vec<FundamentalRecord>) -> Result<Self> {
        let df = LazyFrame::scan_parquet(path.into(), ScanArgsParquet::default())?
            .collect()
            .context("failed to read price parquet")?;
        let series = series_from_frame(&df)?;
        let mut rows = Vec::new();
        for (stock, s) in &series {
            for i in 0..s.len() {
                rows.push(PriceRow {
                    stock: stock.clone(),
                    date: s.dates[i],
                    bar: s.bar_at(i),
                });
            }
        }
        Ok(Self::new(rows, fundamentals))
    }

    fn matching_rows(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        themes: Option<&[String]>,
        stocks: Option<&[String]>,
    ) -> Vec<&PriceRow> {
        self.rows
            .iter()
            .filter(|r| r.date >= start && r.date <= end)
            .filter(|r| valid_bar(&r.bar))
            .filter(|r| match (themes, stocks) {
                (None, None) => true,
                _ => {
                    let theme_hit = themes.is_some_and(|t| {
                        self.industries
                            .get(&r.stock)
                            .is_some_and(|ind| t.iter().any(|x| x == ind))
                    });
                    let stock_hit = stocks.is_some_and(|s| s.iter().any(|x| *x == r.stock));
                    theme_hit || stock_hit
                }
            })
            .collect()
    }
}

fn valid_bar(bar: &Bar) -> bool {
    bar.open > 0.0 && bar.high > 0.0 && bar.low > 0.0 && bar.close > 0.0 && bar.volume >= 0.0
}

#[async_trait]
impl PriceStore for FrameStore {
    async fn load_prices(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        themes: Option<&[String]>,
        stocks: Option<&[String]>,
    ) -> Result<DataFrame> {
        let rows = self.matching_rows(start, end, themes, stocks);
        frame_from_rows(&rows)
    }

    async fn load_fundamentals(
        &self,
        start_year: i32,
        end_year: i32,
        _accounts: &[&str],
        stocks: Option<&[String]>,
    ) -> Result<Vec<FundamentalRecord>> {
        Ok(self
            .fundamentals
            .iter()
            .filter(|r| r.fiscal_year >= start_year && r.fiscal_year <= end_year)
            .filter(|r| stocks.is_none_or(|s| s.iter().any(|x| *x == r.stock)))
            .cloned()
            .collect())
    }

    async fn load_shares_outstanding(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        stocks: Option<&[String]>,
    ) -> Result<DataFrame> {
        let rows = self.matching_rows(start, end, None, stocks);
        let stocks_col: Vec<&str> = rows.iter().map(|r| r.stock.as_str()).collect();
        let dates: Vec<NaiveDate> = rows.iter().map(|r| r.date).collect();
        let shares: Vec<f64> = rows.iter().map(|r| r.bar.shares_outstanding).collect();
        let caps: Vec<f64> = rows.iter().map(|r| r.bar.market_cap).collect();
        let df = df! {
            columns::STOCK => stocks_col,
            columns::DATE => dates,
            columns::SHARES => shares,
            columns::MARKET_CAP => caps,
        }?;
        Ok(df)
    }
}

fn frame_from_rows(rows: &[&PriceRow]) -> Result<DataFrame> {
    let stocks: Vec<&str> = rows.iter().map(|r| r.stock.as_str()).collect();
    let dates: Vec<NaiveDate> = rows.iter().map(|r| r.date).collect();
    let df = df! {
        columns::STOCK => stocks,
        columns::DATE => dates,
        columns::OPEN => rows.iter().map(|r| r.bar.open).collect::<Vec<_>>(),
        columns::HIGH => rows.iter().map(|r| r.bar.high).collect::<Vec<_>>(),
        columns::LOW => rows.iter().map(|r| r.bar.low).collect::<Vec<_>>(),
        columns::CLOSE => rows.iter().map(|r| r.bar.close).collect::<Vec<_>>(),
        columns::VOLUME => rows.iter().map(|r| r.bar.volume).collect::<Vec<_>>(),
        columns::TRADING_VALUE => rows.iter().map(|r| r.bar.trading_value).collect::<Vec<_>>(),
        columns::MARKET_CAP => rows.iter().map(|r| r.bar.market_cap).collect::<Vec<_>>(),
        columns::SHARES => rows.iter().map(|r| r.bar.shares_outstanding).collect::<Vec<_>>(),
    }?;
    Ok(df)
}

/// Rebuild the canonical price frame from per-stock series (after
/// corporate-action truncation), sorted by (stock, date).
pub fn frame_from_series(series: &SeriesMap) -> Result<DataFrame> {
    let mut keys: Vec<&String> = series.keys().collect();
    keys.sort_unstable();

    let mut stocks: Vec<&str> = Vec::new();
    let mut dates: Vec<NaiveDate> = Vec::new();
    let mut open = Vec::new();
    let mut high = Vec::new();
    let mut low = Vec::new();
    let mut close = Vec::new();
    let mut volume = Vec::new();
    let mut trading_value = Vec::new();
    let mut market_cap = Vec::new();
    let mut shares = Vec::new();

    for key in keys {
        let s = &series[key];
        for i in 0..s.len() {
            stocks.push(key.as_str());
            dates.push(s.dates[i]);
            open.push(s.open[i]);
            high.push(s.high[i]);
            low.push(s.low[i]);
            close.push(s.close[i]);
            volume.push(s.volume[i]);
            trading_value.push(s.trading_value[i]);
            market_cap.push(s.market_cap[i]);
            shares.push(s.shares[i]);
        }
    }

    let df = df! {
        columns::STOCK => stocks,
        columns::DATE => dates,
        columns::OPEN => open,
        columns::HIGH => high,
        columns::LOW => low,
        columns::CLOSE => close,
        columns::VOLUME => volume,
        columns::TRADING_VALUE => trading_value,
        columns::MARKET_CAP => market_cap,
        columns::SHARES => shares,
    }?;
    Ok(df)
}

/// Decompose the canonical price frame into per-stock ascending series.
pub fn series_from_frame(df: &DataFrame) -> Result<SeriesMap> {
    let mut map = SeriesMap::default();
    if df.height() == 0 {
        return Ok(map);
    }

    let stocks = df.column(columns::STOCK)?.str()?;
    let dates = df.column(columns::DATE)?.date()?;
    let open = df.column(columns::OPEN)?.f64()?;
    let high = df.column(columns::HIGH)?.f64()?;
    let low = df.column(columns::LOW)?.f64()?;
    let close = df.column(columns::CLOSE)?.f64()?;
    let volume = df.column(columns::VOLUME)?.f64()?;
    let trading_value = df.column(columns::TRADING_VALUE)?.f64()?;
    let market_cap = df.column(columns::MARKET_CAP)?.f64()?;
    let shares = df.column(columns::SHARES)?.f64()?;

    const EPOCH_OFFSET_DAYS: i32 = 719_163; // days from CE to 1970-01-01

    for i in 0..df.height() {
        let (Some(stock), Some(days)) = (stocks.get(i), dates.phys.get(i)) else {
            continue;
        };
        let Some(date) = NaiveDate::from_num_days_from_ce_opt(days + EPOCH_OFFSET_DAYS) else {
            continue;
        };
        let entry = map.entry(stock.to_string()).or_insert_with(StockSeries::default);
        entry.dates.push(date);
        entry.open.push(open.get(i).unwrap_or(f64::NAN));
        entry.high.push(high.get(i).unwrap_or(f64::NAN));
        entry.low.push(low.get(i).unwrap_or(f64::NAN));
        entry.close.push(close.get(i).unwrap_or(f64::NAN));
        entry.volume.push(volume.get(i).unwrap_or(0.0));
        entry
            .trading_value
            .push(trading_value.get(i).unwrap_or(f64::NAN));
        entry.market_cap.push(market_cap.get(i).unwrap_or(f64::NAN));
        entry.shares.push(shares.get(i).unwrap_or(f64::NAN));
    }

    // The store returns (stock, date)-sorted rows, but a hand-built frame
    // may not be sorted; normalise.
    for s in map.values_mut() {
        if !s.dates.is_sorted() {
            let mut order: Vec<usize> = (0..s.len()).collect();
            order.sort_by_key(|&i| s.dates[i]);
            let reorder = |v: &Vec<f64>| order.iter().map(|&i| v[i]).collect::<Vec<f64>>();
            s.open = reorder(&s.open);
            s.high = reorder(&s.high);
            s.low = reorder(&s.low);
            s.close = reorder(&s.close);
            s.volume = reorder(&s.volume);
            s.trading_value = reorder(&s.trading_value);
            s.market_cap = reorder(&s.market_cap);
            s.shares = reorder(&s.shares);
            let mut dates: Vec<NaiveDate> = order.iter().map(|&i| s.dates[i]).collect();
            std::mem::swap(&mut s.dates, &mut dates);
        }
    }

    Ok(map)
}

/// Convenience for tests and the warmer: build rows from a close-price path
/// with open = previous close (first open = first close).
pub fn rows_from_closes(stock: &str, start: NaiveDate, closes: &[f64], volume: f64) -> Vec<PriceRow> {
    let mut rows = Vec::with_capacity(closes.len());
    let mut date = start;
    for (i, &close) in closes.iter().enumerate() {
        let open = if i == 0 { close } else { closes[i - 1] };
        rows.push(PriceRow {
            stock: stock.to_string(),
            date,
            bar: Bar {
                open,
                high: close.max(open) * 1.01,
                low: close.min(open) * 0.99,
                close,
                volume,
                trading_value: close * volume,
                market_cap: close * 1_000_000.0,
                shares_outstanding: 1_000_000.0,
            },
        });
        date = next_weekday(date);
    }
    rows
}

fn next_weekday(d: NaiveDate) -> NaiveDate {
    let mut next = d + chrono::Days::new(1);
    while matches!(next.weekday(), chrono::Weekday::Sat | chrono::Weekday::Sun) {
        next = next + chrono::Days::new(1);
    }
    next
}
