//! Corporate-action detection on unadjusted price data.
//!
//! The upstream feed carries raw (unadjusted) prices, so a bonus issue or a
//! split shows up as an overnight price collapse and a consolidation as a
//! jump. Any one-day move beyond the threshold flags the stock; bars from
//! the event date onward are dropped so no post-event price leaks into
//! factor computation or simulation, and the simulator force-liquidates at
//! the last clean bar.

use chrono::NaiveDate;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use super::SeriesMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Positive jump: bonus issue or forward split left the series
    /// unadjusted upward.
    BonusSplit,
    /// Negative jump: reverse split / capital reduction.
    Consolidation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorporateAction {
    pub stock: String,
    pub event_date: NaiveDate,
    pub prev_close: f64,
    pub new_close: f64,
    pub change_rate: f64,
    pub action_type: ActionType,
}

pub type ActionMap = FxHashMap<String, CorporateAction>;

/// Scan every stock series for its earliest |change| >= threshold event,
/// truncate the series at the event date, and return the events keyed by
/// stock. `threshold` is in percent (50.0 = a 50% one-day move).
pub fn detect_and_filter(series: &mut SeriesMap, threshold: f64) -> ActionMap {
    let mut actions = ActionMap::default();

    for (stock, s) in series.iter_mut() {
        let mut event: Option<(usize, f64)> = None;
        for i in 1..s.len() {
            let prev = s.close[i - 1];
            if prev <= 0.0 {
                continue;
            }
            let change = (s.close[i] - prev) / prev * 100.0;
            if change.abs() >= threshold {
                event = Some((i, change));
                break;
            }
        }

        if let Some((idx, change)) = event {
            let action = CorporateAction {
                stock: stock.clone(),
                event_date: s.dates[idx],
                prev_close: s.close[idx - 1],
                new_close: s.close[idx],
                change_rate: change,
                action_type: if change > 0.0 {
                    ActionType::BonusSplit
                } else {
                    ActionType::Consolidation
                },
            };
            tracing::warn!(
                stock = %stock,
                event_date = %action.event_date,
                change = format!("{change:+.1}%"),
                kind = ?action.action_type,
                "corporate action detected; truncating series and forcing liquidation"
            );
            let event_date = action.event_date;
            actions.insert(stock.clone(), action);
            // Drop the event bar and everything after it.
            s.truncate_from(event_date);
        }
    }

    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::StockSeries;

    fn make_series(closes: &[f64]) -> StockSeries {
        let mut s = StockSeries::default();
        for (i, &c) in closes.iter().enumerate() {
            s.dates.push(
                NaiveDate::from_ymd_opt(2024, 1, 2).unwrap() + chrono::Days::new(i as u64),
            );
            s.open.push(c);
            s.high.push(c);
            s.low.push(c);
            s.close.push(c);
            s.volume.push(1000.0);
            s.trading_value.push(c * 1000.0);
            s.market_cap.push(c * 1e6);
            s.shares.push(1e6);
        }
        s
    }

    #[test]
    fn split_jump_detected_and_truncated() {
        let mut map = SeriesMap::default();
        map.insert("BBB".into(), make_series(&[100.0, 101.0, 102.0, 160.0, 165.0]));
        let actions = detect_and_filter(&mut map, 50.0);

        let action = actions.get("BBB").expect("event detected");
        assert_eq!(action.action_type, ActionType::BonusSplit);
        assert_eq!(
            action.event_date,
            NaiveDate::from_ymd_opt(2024, 1, 5).unwrap()
        );
        assert_eq!(action.prev_close, 102.0);
        assert_eq!(action.new_close, 160.0);

        // Post-event bars are gone; last clean bar survives.
        let s = &map["BBB"];
        assert_eq!(s.len(), 3);
        assert_eq!(*s.close.last().unwrap(), 102.0);
    }

    #[test]
    fn consolidation_detected() {
        let mut map = SeriesMap::default();
        map.insert("CCC".into(), make_series(&[100.0, 45.0, 46.0]));
        let actions = detect_and_filter(&mut map, 50.0);
        assert_eq!(actions["CCC"].action_type, ActionType::Consolidation);
        assert_eq!(map["CCC"].len(), 1);
    }

    #[test]
    fn earliest_event_wins() {
        let mut map = SeriesMap::default();
        map.insert(
            "DDD".into(),
            make_series(&[100.0, 160.0, 100.0, 300.0]),
        );
        let actions = detect_and_filter(&mut map, 50.0);
        assert_eq!(
            actions["DDD"].event_date,
            NaiveDate::from_ymd_opt(2024, 1, 3).unwrap()
        );
        assert_eq!(map["DDD"].len(), 1);
    }

    #[test]
    fn normal_moves_untouched() {
        let mut map = SeriesMap::default();
        map.insert("AAA".into(), make_series(&[100.0, 120.0, 90.0, 110.0]));
        let actions = detect_and_filter(&mut map, 50.0);
        assert!(actions.is_empty());
        assert_eq!(map["AAA"].len(), 4);
    }

    #[test]
    fn threshold_is_configurable() {
        let mut map = SeriesMap::default();
        map.insert("AAA".into(), make_series(&[100.0, 130.0]));
        assert!(detect_and_filter(&mut map, 50.0).is_empty());
        let mut map2 = SeriesMap::default();
        map2.insert("AAA".into(), make_series(&[100.0, 130.0]));
        assert!(!detect_and_filter(&mut map2, 25.0).is_empty());
    }
}
