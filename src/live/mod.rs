pub mod broker;
pub mod executor;
pub mod scheduler;

use chrono::{Datelike, NaiveDate, Weekday};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::strategy::BacktestRequest;

/// An active live strategy: the same specification the backtester consumes,
/// executed against the brokerage sandbox instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveStrategy {
    pub strategy_id: Uuid,
    pub name: String,
    pub spec: BacktestRequest,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivePosition {
    pub stock: String,
    pub quantity: u64,
    #[serde(with = "rust_decimal::serde::float")]
    pub avg_price: Decimal,
    pub buy_date: NaiveDate,
    pub hold_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewCandidate {
    pub stock: String,
    pub rank: u32,
    pub target_quantity: u64,
}

/// The 07:00 selection output the 09:00 execution job replays. Execution
/// never recomputes a missing preview; it skips the strategy so orders
/// always match the previewed signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalancePreview {
    pub strategy_id: Uuid,
    pub trade_date: NaiveDate,
    pub generated_at: chrono::DateTime<chrono::Utc>,
    pub candidates: Vec<PreviewCandidate>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DailyPerformance {
    pub date: NaiveDate,
    pub portfolio_value: f64,
    pub cash: f64,
    pub buy_count: u32,
    pub sell_count: u32,
}

/// Storage of live-trading state (positions, previews, per-day
/// performance). The production implementation wraps the operational
/// database; the in-memory one serves tests and dry runs.
pub trait LiveStateStore: Send + Sync {
    fn active_strategies(&self) -> Vec<LiveStrategy>;
    fn positions(&self, strategy_id: Uuid) -> Vec<LivePosition>;
    fn set_hold_days(&self, strategy_id: Uuid, stock: &str, hold_days: u32);
    fn upsert_position(&self, strategy_id: Uuid, position: LivePosition);
    fn remove_position(&self, strategy_id: Uuid, stock: &str);
    fn save_preview(&self, preview: RebalancePreview);
    fn latest_preview(&self, strategy_id: Uuid, trade_date: NaiveDate) -> Option<RebalancePreview>;
    fn record_daily_performance(&self, strategy_id: Uuid, performance: DailyPerformance);
}

/// Business days (Mon-Fri) strictly after `from`, up to and including `to`.
pub fn count_business_days(from: NaiveDate, to: NaiveDate) -> u32 {
    let mut count = 0;
    let mut d = from;
    while d < to {
        d = d + chrono::Days::new(1);
        if !matches!(d.weekday(), Weekday::Sat | Weekday::Sun) {
            count += 1;
        }
    }
    count
}

#[derive(Default)]
pub struct InMemoryLiveState {
    strategies: Mutex<Vec<LiveStrategy>>,
    positions: Mutex<FxHashMap<Uuid, Vec<LivePosition>>>,
    previews: Mutex<Vec<RebalancePreview>>,
    performance: Mutex<FxHashMap<Uuid, Vec<DailyPerformance>>>,
}

impl InMemoryLiveState {
    pub fn new(strategies: Vec<LiveStrategy>) -> Self {
        Self {
            strategies: Mutex::new(strategies),
            ..Self::default()
        }
    }

    pub fn performance_history(&self, strategy_id: Uuid) -> Vec<DailyPerformance> {
        self.performance
            .lock()
            .get(&strategy_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl LiveStateStore for InMemoryLiveState {
    fn active_strategies(&self) -> Vec<LiveStrategy> {
        self.strategies
            .lock()
            .iter()
            .filter(|s| s.is_active)
            .cloned()
            .collect()
    }

    fn positions(&self, strategy_id: Uuid) -> Vec<LivePosition> {
        self.positions
            .lock()
            .get(&strategy_id)
            .cloned()
            .unwrap_or_default()
    }

    fn set_hold_days(&self, strategy_id: Uuid, stock: &str, hold_days: u32) {
        if let Some(list) = self.positions.lock().get_mut(&strategy_id) {
            if let Some(p) = list.iter_mut().find(|p| p.stock == stock) {
                p.hold_days = hold_days;
            }
        }
    }

    fn upsert_position(&self, strategy_id: Uuid, position: LivePosition) {
        let mut map = self.positions.lock();
        let list = map.entry(strategy_id).or_default();
        match list.iter_mut().find(|p| p.stock == position.stock) {
            Some(existing) => *existing = position,
            None => list.push(position),
        }
    }

    fn remove_position(&self, strategy_id: Uuid, stock: &str) {
        if let Some(list) = self.positions.lock().get_mut(&strategy_id) {
            list.retain(|p| p.stock != stock);
        }
    }

    fn save_preview(&self, preview: RebalancePreview) {
        self.previews.lock().push(preview);
    }

    fn latest_preview(&self, strategy_id: Uuid, trade_date: NaiveDate) -> Option<RebalancePreview> {
        self.previews
            .lock()
            .iter()
            .filter(|p| p.strategy_id == strategy_id && p.trade_date == trade_date)
            .max_by_key(|p| p.generated_at)
            .cloned()
    }

    fn record_daily_performance(&self, strategy_id: Uuid, performance: DailyPerformance) {
        self.performance
            .lock()
            .entry(strategy_id)
            .or_default()
            .push(performance);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn business_day_counting_skips_weekends() {
        // Fri 2024-06-07 -> Mon 2024-06-10 is one business day.
        let fri = NaiveDate::from_ymd_opt(2024, 6, 7).unwrap();
        let mon = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
        assert_eq!(count_business_days(fri, mon), 1);
        // A full week spans five.
        let next_fri = NaiveDate::from_ymd_opt(2024, 6, 14).unwrap();
        assert_eq!(count_business_days(fri, next_fri), 5);
        assert_eq!(count_business_days(fri, fri), 0);
    }

    #[test]
    fn latest_preview_picks_newest_for_date() {
        let state = InMemoryLiveState::default();
        let id = Uuid::new_v4();
        let date = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
        let older = RebalancePreview {
            strategy_id: id,
            trade_date: date,
            generated_at: chrono::Utc::now() - chrono::Duration::hours(2),
            candidates: vec![],
        };
        let newer = RebalancePreview {
            strategy_id: id,
            trade_date: date,
            generated_at: chrono::Utc::now(),
            candidates: vec![PreviewCandidate {
                stock: "005930".into(),
                rank: 1,
                target_quantity: 10,
            }],
        };
        state.save_preview(older);
        state.save_preview(newer);
        let got = state.latest_preview(id, date).unwrap();
        assert_eq!(got.candidates.len(), 1);
        assert!(state
            .latest_preview(id, date + chrono::Days::new(1))
            .is_none());
    }
}
