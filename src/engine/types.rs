use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SellReason {
    TargetGain,
    StopLoss,
    MinHold,
    MaxHold,
    Condition,
    Rebalance,
    CorporateAction,
    Final,
}

/// An open position. Quantity is whole shares; `avg_price` is the FIFO
/// average of entry fills including slippage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub stock: String,
    pub entry_date: NaiveDate,
    #[serde(with = "rust_decimal::serde::float")]
    pub avg_price: Decimal,
    pub quantity: u64,
    pub hold_days: u32,
    /// Factor row at entry, kept for trade attribution.
    pub entry_factors: BTreeMap<String, f32>,
    pub buy_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub date: NaiveDate,
    pub side: TradeSide,
    pub stock: String,
    pub quantity: u64,
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub commission: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub tax: Decimal,
    /// Sell-only: net proceeds minus entry cost basis.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realized_pnl: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hold_days: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sell_reason: Option<SellReason>,
    /// Entry factor snapshot (sells carry the snapshot taken at entry).
    pub factors: BTreeMap<String, f32>,
    pub note: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailySnapshot {
    pub date: NaiveDate,
    #[serde(with = "rust_decimal::serde::float")]
    pub portfolio_value: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub cash: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub invested: Decimal,
    pub daily_return: f64,
    pub cumulative_return: f64,
    pub drawdown: f64,
    pub trade_count: u32,
}

/// Aggregate statistics over one completed backtest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Statistics {
    pub total_return: f64,
    pub annualized_return: f64,
    pub volatility: f64,
    pub downside_volatility: f64,
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub win_rate: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub profit_loss_ratio: f64,
    pub initial_capital: f64,
    pub final_capital: f64,
    pub peak_capital: f64,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub trading_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawdownPeriod {
    pub start_date: NaiveDate,
    pub trough_date: NaiveDate,
    /// None while the drawdown is still open at the end of the window.
    pub end_date: Option<NaiveDate>,
    pub peak_value: f64,
    pub trough_value: f64,
    pub drawdown_pct: f64,
    pub recovered: bool,
    pub duration_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonthlyStat {
    pub year: i32,
    pub month: u32,
    /// Percentage points of cumulative return gained within the month.
    pub monthly_return: f64,
    pub cumulative_return: f64,
    pub trade_count: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub win_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YearlyStat {
    pub year: i32,
    pub yearly_return: f64,
    pub cumulative_return: f64,
    pub trade_count: u32,
    pub win_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorContribution {
    pub factor_name: String,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub win_rate: f64,
    pub avg_return: f64,
    /// win_rate x avg_return; the ranking key.
    pub contribution_score: f64,
    pub importance_rank: u32,
}

/// A final-state holding as reported to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoldingView {
    pub stock: String,
    pub quantity: u64,
    #[serde(with = "rust_decimal::serde::float")]
    pub avg_price: Decimal,
    pub current_price: f64,
    pub value: f64,
    pub profit: f64,
    pub profit_rate: f64,
    pub weight: f64,
    pub buy_date: NaiveDate,
    pub hold_days: u32,
    pub factors: BTreeMap<String, f32>,
}

/// Parallel arrays for chart rendering.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChartData {
    pub dates: Vec<NaiveDate>,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub backtest_id: Uuid,
    pub statistics: Statistics,
    pub daily_performance: Vec<DailySnapshot>,
    pub monthly_performance: Vec<MonthlyStat>,
    pub yearly_performance: Vec<YearlyStat>,
    pub trades: Vec<Trade>,
    pub current_holdings: Vec<HoldingView>,
    pub drawdown_periods: Vec<DrawdownPeriod>,
    pub factor_contributions: Vec<FactorContribution>,
    pub chart_data: ChartData,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sell_reason_wire_names() {
        assert_eq!(
            serde_json::to_string(&SellReason::TargetGain).unwrap(),
            "\"TARGET_GAIN\""
        );
        assert_eq!(
            serde_json::to_string(&SellReason::CorporateAction).unwrap(),
            "\"CORPORATE_ACTION\""
        );
        assert_eq!(serde_json::to_string(&SellReason::Final).unwrap(), "\"FINAL\"");
    }

    #[test]
    fn trade_serialises_decimals_as_floats() {
        let trade = Trade {
            date: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            side: TradeSide::Buy,
            stock: "005930".into(),
            quantity: 10,
            price: Decimal::new(100_100, 3),
            amount: Decimal::new(1_001_000, 3),
            commission: Decimal::new(1502, 3),
            tax: Decimal::ZERO,
            realized_pnl: None,
            return_pct: None,
            hold_days: None,
            sell_reason: None,
            factors: BTreeMap::new(),
            note: String::new(),
        };
        let json = serde_json::to_value(&trade).unwrap();
        assert_eq!(json["side"], "BUY");
        assert!(json["price"].is_f64());
        assert!(json.get("realized_pnl").is_none());
    }
}
