//! Universe classification summary: stock counts per KOSPI/KOSDAQ size
//! bucket, computed at the latest trading date with complete market-cap
//! coverage.

use chrono::NaiveDate;
use rustc_hash::FxHashMap;
use serde::Serialize;

use super::SeriesMap;
use crate::strategy::UniverseId;

/// Minimum stocks with market-cap data for a date to count as complete.
/// Guards against classifying off a half-loaded trading day.
pub const COMPLETE_DAY_MIN_STOCKS: usize = 2000;

#[derive(Debug, Clone, Serialize)]
pub struct UniverseInfo {
    pub id: UniverseId,
    pub name: &'static str,
    pub market: &'static str,
    pub stock_count: u32,
    pub min_cap: f64,
    pub max_cap: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UniverseSummary {
    pub trade_date: Option<NaiveDate>,
    pub universes: Vec<UniverseInfo>,
}

/// The latest trading date on which at least `min_stocks` stocks carry a
/// positive market cap.
pub fn latest_complete_trading_date(series: &SeriesMap, min_stocks: usize) -> Option<NaiveDate> {
    let mut counts: FxHashMap<NaiveDate, usize> = FxHashMap::default();
    for s in series.values() {
        for i in 0..s.len() {
            if s.market_cap[i] > 0.0 {
                *counts.entry(s.dates[i]).or_insert(0) += 1;
            }
        }
    }
    counts
        .into_iter()
        .filter(|(_, count)| *count >= min_stocks)
        .map(|(date, _)| date)
        .max()
}

/// Bucket counts on the reference date. `min_stocks` is configurable so
/// small research universes can still be summarised.
pub fn universe_summary(series: &SeriesMap, min_stocks: usize) -> UniverseSummary {
    let Some(trade_date) = latest_complete_trading_date(series, min_stocks) else {
        tracing::warn!("no trading date with complete market-cap coverage");
        return UniverseSummary {
            trade_date: None,
            universes: Vec::new(),
        };
    };

    let mut counts: FxHashMap<UniverseId, u32> = FxHashMap::default();
    for s in series.values() {
        let Some(idx) = s.index_of(trade_date) else { continue };
        let cap = s.market_cap[idx];
        if cap <= 0.0 {
            continue;
        }
        for id in UniverseId::ALL {
            let (min, max) = id.cap_bounds();
            if cap >= min && max.is_none_or(|m| cap < m) {
                *counts.entry(id).or_insert(0) += 1;
            }
        }
    }

    UniverseSummary {
        trade_date: Some(trade_date),
        universes: UniverseId::ALL
            .into_iter()
            .map(|id| {
                let (min_cap, max_cap) = id.cap_bounds();
                UniverseInfo {
                    id,
                    name: id.display_name(),
                    market: id.market(),
                    stock_count: counts.get(&id).copied().unwrap_or(0),
                    min_cap,
                    max_cap,
                }
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::StockSeries;

    fn series_with_cap(start: NaiveDate, caps: &[f64]) -> StockSeries {
        let mut s = StockSeries::default();
        for (i, &cap) in caps.iter().enumerate() {
            s.dates.push(start + chrono::Days::new(i as u64));
            s.open.push(100.0);
            s.high.push(101.0);
            s.low.push(99.0);
            s.close.push(100.0);
            s.volume.push(1000.0);
            s.trading_value.push(100_000.0);
            s.market_cap.push(cap);
            s.shares.push(1_000_000.0);
        }
        s
    }

    #[test]
    fn picks_latest_complete_date() {
        let start = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();
        let mut map = SeriesMap::default();
        // Two stocks on day 1, only one carries a cap on day 2.
        map.insert("AAA".into(), series_with_cap(start, &[1.0e12, 2.0e12]));
        let mut partial = series_with_cap(start, &[5.0e11, 0.0]);
        partial.market_cap[1] = 0.0;
        map.insert("BBB".into(), partial);

        let latest = latest_complete_trading_date(&map, 2).unwrap();
        assert_eq!(latest, start, "day 2 is incomplete, day 1 wins");
    }

    #[test]
    fn buckets_count_by_cap_bounds() {
        let start = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();
        let mut map = SeriesMap::default();
        map.insert("MEGA".into(), series_with_cap(start, &[12.0e12]));
        map.insert("LARGE".into(), series_with_cap(start, &[5.0e12]));
        map.insert("SMALL".into(), series_with_cap(start, &[1.0e11]));

        let summary = universe_summary(&map, 3);
        assert_eq!(summary.trade_date, Some(start));
        let count = |id: UniverseId| {
            summary
                .universes
                .iter()
                .find(|u| u.id == id)
                .unwrap()
                .stock_count
        };
        assert_eq!(count(UniverseId::KospiMega), 1);
        assert_eq!(count(UniverseId::KospiLarge), 1);
        assert_eq!(count(UniverseId::KospiSmall), 1);
        assert_eq!(count(UniverseId::KospiMid), 0);
        // The same caps classify on the KOSDAQ scale too.
        assert_eq!(count(UniverseId::KosdaqMega), 2);
    }

    #[test]
    fn empty_universe_yields_no_date() {
        let summary = universe_summary(&SeriesMap::default(), 1);
        assert!(summary.trade_date.is_none());
        assert!(summary.universes.is_empty());
    }
}
