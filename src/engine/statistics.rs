//! Aggregate statistics over a completed simulation: returns, risk,
//! trade quality, calendar breakdowns, drawdown periods and per-factor
//! attribution. Empty-trade cases zero the dependent ratios instead of
//! failing.

use chrono::Datelike;
use statrs::statistics::Statistics as Stat;

use super::types::{
    DailySnapshot, DrawdownPeriod, FactorContribution, MonthlyStat, Statistics, Trade, TradeSide,
    YearlyStat,
};
use crate::strategy::decimal_to_f64;

const TRADING_DAYS_PER_YEAR: f64 = 252.0;

pub fn compute_statistics(
    daily_history: &[DailySnapshot],
    trades: &[Trade],
    initial_capital: f64,
) -> Statistics {
    let mut stats = Statistics {
        initial_capital,
        ..Statistics::default()
    };
    let Some(last) = daily_history.last() else {
        return stats;
    };

    let final_value = decimal_to_f64(last.portfolio_value);
    let trading_days = daily_history.len() as f64;

    stats.start_date = daily_history.first().map(|s| s.date);
    stats.end_date = Some(last.date);
    stats.trading_days = daily_history.len() as u32;
    stats.final_capital = final_value;
    stats.peak_capital = daily_history
        .iter()
        .map(|s| decimal_to_f64(s.portfolio_value))
        .fold(initial_capital, f64::max);

    if initial_capital > 0.0 {
        stats.total_return = (final_value - initial_capital) / initial_capital * 100.0;
        if final_value > 0.0 && trading_days > 0.0 {
            stats.annualized_return = ((final_value / initial_capital)
                .powf(TRADING_DAYS_PER_YEAR / trading_days)
                - 1.0)
                * 100.0;
        }
    }

    // Daily returns as fractions.
    let returns: Vec<f64> = daily_history.iter().map(|s| s.daily_return / 100.0).collect();
    if returns.len() >= 2 {
        stats.volatility = returns.as_slice().std_dev() * TRADING_DAYS_PER_YEAR.sqrt() * 100.0;
    }
    let negatives: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
    if negatives.len() >= 2 {
        stats.downside_volatility =
            negatives.as_slice().std_dev() * TRADING_DAYS_PER_YEAR.sqrt() * 100.0;
    }

    stats.max_drawdown = max_drawdown_pct(daily_history);

    stats.sharpe_ratio = safe_div(stats.annualized_return, stats.volatility);
    stats.sortino_ratio = safe_div(stats.annualized_return, stats.downside_volatility);
    stats.calmar_ratio = safe_div(stats.annualized_return, stats.max_drawdown);

    // Trade-quality metrics over closed (SELL) trades.
    let sells: Vec<&Trade> = trades.iter().filter(|t| t.side == TradeSide::Sell).collect();
    let wins: Vec<f64> = sells
        .iter()
        .filter_map(|t| t.return_pct.filter(|r| *r > 0.0))
        .collect();
    let losses: Vec<f64> = sells
        .iter()
        .filter_map(|t| t.return_pct.filter(|r| *r < 0.0))
        .collect();

    stats.total_trades = trades.len() as u32;
    stats.winning_trades = wins.len() as u32;
    stats.losing_trades = losses.len() as u32;
    if !sells.is_empty() {
        stats.win_rate = wins.len() as f64 / sells.len() as f64 * 100.0;
    }
    if !wins.is_empty() {
        stats.avg_win = wins.iter().sum::<f64>() / wins.len() as f64;
    }
    if !losses.is_empty() {
        stats.avg_loss = losses.iter().sum::<f64>() / losses.len() as f64;
    }
    stats.profit_loss_ratio = safe_div(stats.avg_win, stats.avg_loss.abs());

    stats
}

fn safe_div(num: f64, den: f64) -> f64 {
    if den.abs() < f64::EPSILON {
        0.0
    } else {
        num / den
    }
}

fn max_drawdown_pct(history: &[DailySnapshot]) -> f64 {
    let mut peak = f64::MIN;
    let mut worst = 0.0f64;
    for snap in history {
        let value = decimal_to_f64(snap.portfolio_value);
        if value > peak {
            peak = value;
        }
        if peak > 0.0 {
            let dd = (peak - value) / peak * 100.0;
            if dd > worst {
                worst = dd;
            }
        }
    }
    worst
}

/// Calendar-month breakdown: within a group the return is the change of
/// cumulative return between the group's first and last snapshot.
pub fn monthly_breakdown(history: &[DailySnapshot], trades: &[Trade]) -> Vec<MonthlyStat> {
    let mut out: Vec<MonthlyStat> = Vec::new();
    for snap in history {
        let key = (snap.date.year(), snap.date.month());
        match out.last_mut() {
            Some(current) if (current.year, current.month) == key => {
                current.monthly_return = snap.cumulative_return
                    + current.monthly_return
                    - current.cumulative_return;
                current.cumulative_return = snap.cumulative_return;
            }
            _ => out.push(MonthlyStat {
                year: key.0,
                month: key.1,
                monthly_return: 0.0,
                cumulative_return: snap.cumulative_return,
                trade_count: 0,
                winning_trades: 0,
                losing_trades: 0,
                win_rate: 0.0,
            }),
        }
    }

    for stat in &mut out {
        let sells = trades.iter().filter(|t| {
            t.side == TradeSide::Sell
                && t.date.year() == stat.year
                && t.date.month() == stat.month
        });
        for trade in sells {
            stat.trade_count += 1;
            match trade.return_pct {
                Some(r) if r > 0.0 => stat.winning_trades += 1,
                Some(r) if r < 0.0 => stat.losing_trades += 1,
                _ => {}
            }
        }
        if stat.trade_count > 0 {
            stat.win_rate = f64::from(stat.winning_trades) / f64::from(stat.trade_count) * 100.0;
        }
    }
    out
}

pub fn yearly_breakdown(history: &[DailySnapshot], trades: &[Trade]) -> Vec<YearlyStat> {
    let mut out: Vec<YearlyStat> = Vec::new();
    for snap in history {
        let year = snap.date.year();
        match out.last_mut() {
            Some(current) if current.year == year => {
                current.yearly_return =
                    snap.cumulative_return + current.yearly_return - current.cumulative_return;
                current.cumulative_return = snap.cumulative_return;
            }
            _ => out.push(YearlyStat {
                year,
                yearly_return: 0.0,
                cumulative_return: snap.cumulative_return,
                trade_count: 0,
                win_rate: 0.0,
            }),
        }
    }
    for stat in &mut out {
        let mut wins = 0u32;
        for trade in trades
            .iter()
            .filter(|t| t.side == TradeSide::Sell && t.date.year() == stat.year)
        {
            stat.trade_count += 1;
            if trade.return_pct.is_some_and(|r| r > 0.0) {
                wins += 1;
            }
        }
        if stat.trade_count > 0 {
            stat.win_rate = f64::from(wins) / f64::from(stat.trade_count) * 100.0;
        }
    }
    out
}

/// Contiguous runs where drawdown > 0, with trough and recovery detail.
pub fn drawdown_periods(history: &[DailySnapshot]) -> Vec<DrawdownPeriod> {
    let mut out = Vec::new();
    let mut peak = f64::MIN;
    let mut open: Option<DrawdownPeriod> = None;

    for snap in history {
        let value = decimal_to_f64(snap.portfolio_value);
        if value > peak {
            peak = value;
        }
        let dd = if peak > 0.0 { (peak - value) / peak * 100.0 } else { 0.0 };

        if dd > 0.0 {
            match &mut open {
                Some(period) => {
                    if value < period.trough_value {
                        period.trough_value = value;
                        period.trough_date = snap.date;
                    }
                    period.drawdown_pct = period.drawdown_pct.max(dd);
                }
                None => {
                    open = Some(DrawdownPeriod {
                        start_date: snap.date,
                        trough_date: snap.date,
                        end_date: None,
                        peak_value: peak,
                        trough_value: value,
                        drawdown_pct: dd,
                        recovered: false,
                        duration_days: 0,
                    });
                }
            }
        } else if let Some(mut period) = open.take() {
            period.end_date = Some(snap.date);
            period.recovered = true;
            period.duration_days = (snap.date - period.start_date).num_days();
            out.push(period);
        }
    }

    if let Some(mut period) = open.take() {
        if let Some(last) = history.last() {
            period.duration_days = (last.date - period.start_date).num_days();
        }
        out.push(period);
    }
    out
}

/// Per-factor attribution over closed trades carrying the factor in their
/// entry snapshot. `contribution_score = win_rate x avg_return`, ranked
/// descending into `importance_rank`.
pub fn factor_contributions(trades: &[Trade], factors: &[String]) -> Vec<FactorContribution> {
    let mut out: Vec<FactorContribution> = Vec::new();
    for factor in factors {
        let closed: Vec<&Trade> = trades
            .iter()
            .filter(|t| t.side == TradeSide::Sell && t.factors.contains_key(factor.as_str()))
            .collect();
        if closed.is_empty() {
            continue;
        }
        let wins = closed
            .iter()
            .filter(|t| t.return_pct.is_some_and(|r| r > 0.0))
            .count() as u32;
        let avg_return = closed
            .iter()
            .filter_map(|t| t.return_pct)
            .sum::<f64>()
            / closed.len() as f64;
        let win_rate = f64::from(wins) / closed.len() as f64 * 100.0;
        out.push(FactorContribution {
            factor_name: factor.clone(),
            total_trades: closed.len() as u32,
            winning_trades: wins,
            win_rate,
            avg_return,
            contribution_score: win_rate * avg_return,
            importance_rank: 0,
        });
    }

    out.sort_by(|a, b| {
        b.contribution_score
            .partial_cmp(&a.contribution_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.factor_name.cmp(&b.factor_name))
    });
    for (i, contribution) in out.iter_mut().enumerate() {
        contribution.importance_rank = i as u32 + 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal::prelude::FromPrimitive;
    use rust_decimal::Decimal;

    fn snapshot(date: NaiveDate, value: f64, initial: f64) -> DailySnapshot {
        DailySnapshot {
            date,
            portfolio_value: Decimal::from_f64(value).unwrap(),
            cash: Decimal::from_f64(value).unwrap(),
            invested: Decimal::ZERO,
            daily_return: 0.0,
            cumulative_return: (value - initial) / initial * 100.0,
            drawdown: 0.0,
            trade_count: 0,
        }
    }

    fn history(values: &[f64], initial: f64) -> Vec<DailySnapshot> {
        let start = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let mut out: Vec<DailySnapshot> = Vec::new();
        let mut date = start;
        let mut prev = initial;
        for &v in values {
            let mut snap = snapshot(date, v, initial);
            snap.daily_return = (v - prev) / prev * 100.0;
            prev = v;
            out.push(snap);
            date = date + chrono::Days::new(1);
        }
        out
    }

    fn sell(date: NaiveDate, return_pct: f64, factors: &[&str]) -> Trade {
        Trade {
            date,
            side: TradeSide::Sell,
            stock: "AAA".into(),
            quantity: 1,
            price: Decimal::ONE,
            amount: Decimal::ONE,
            commission: Decimal::ZERO,
            tax: Decimal::ZERO,
            realized_pnl: Some(Decimal::from_f64(return_pct).unwrap()),
            return_pct: Some(return_pct),
            hold_days: Some(1),
            sell_reason: Some(super::super::types::SellReason::Final),
            factors: factors.iter().map(|f| ((*f).to_string(), 1.0f32)).collect(),
            note: String::new(),
        }
    }

    #[test]
    fn total_and_annualised_return() {
        let h = history(&[1_010_000.0, 1_020_000.0, 1_050_000.0], 1_000_000.0);
        let s = compute_statistics(&h, &[], 1_000_000.0);
        assert!((s.total_return - 5.0).abs() < 1e-9);
        let expected = ((1.05f64).powf(252.0 / 3.0) - 1.0) * 100.0;
        assert!((s.annualized_return - expected).abs() < 1e-6);
        assert_eq!(s.trading_days, 3);
        assert!((s.peak_capital - 1_050_000.0).abs() < 1e-9);
    }

    #[test]
    fn empty_history_zeroes_everything() {
        let s = compute_statistics(&[], &[], 1_000_000.0);
        assert_eq!(s.total_return, 0.0);
        assert_eq!(s.sharpe_ratio, 0.0);
        assert_eq!(s.trading_days, 0);
    }

    #[test]
    fn max_drawdown_from_running_peak() {
        let h = history(&[1_000_000.0, 1_200_000.0, 900_000.0, 1_100_000.0], 1_000_000.0);
        let s = compute_statistics(&h, &[], 1_000_000.0);
        let expected = (1_200_000.0 - 900_000.0) / 1_200_000.0 * 100.0;
        assert!((s.max_drawdown - expected).abs() < 1e-9);
    }

    #[test]
    fn ratios_zero_on_zero_denominator() {
        // Flat path: volatility 0, MDD 0.
        let h = history(&[1_000_000.0, 1_000_000.0, 1_000_000.0], 1_000_000.0);
        let s = compute_statistics(&h, &[], 1_000_000.0);
        assert_eq!(s.sharpe_ratio, 0.0);
        assert_eq!(s.sortino_ratio, 0.0);
        assert_eq!(s.calmar_ratio, 0.0);
    }

    #[test]
    fn win_rate_and_profit_loss_ratio() {
        let d = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let trades = vec![
            sell(d, 10.0, &[]),
            sell(d, 4.0, &[]),
            sell(d, -7.0, &[]),
        ];
        let h = history(&[1_000_000.0, 1_010_000.0], 1_000_000.0);
        let s = compute_statistics(&h, &trades, 1_000_000.0);
        assert!((s.win_rate - 200.0 / 3.0).abs() < 1e-9);
        assert!((s.avg_win - 7.0).abs() < 1e-9);
        assert!((s.avg_loss - (-7.0)).abs() < 1e-9);
        assert!((s.profit_loss_ratio - 1.0).abs() < 1e-9);
    }

    #[test]
    fn monthly_breakdown_splits_on_month_edges() {
        let jan = NaiveDate::from_ymd_opt(2024, 1, 30).unwrap();
        let mut h = vec![
            snapshot(jan, 1_020_000.0, 1_000_000.0),
            snapshot(jan.succ_opt().unwrap(), 1_030_000.0, 1_000_000.0),
            snapshot(NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(), 1_050_000.0, 1_000_000.0),
            snapshot(NaiveDate::from_ymd_opt(2024, 2, 2).unwrap(), 1_040_000.0, 1_000_000.0),
        ];
        h[0].cumulative_return = 2.0;
        h[1].cumulative_return = 3.0;
        h[2].cumulative_return = 5.0;
        h[3].cumulative_return = 4.0;

        let months = monthly_breakdown(&h, &[]);
        assert_eq!(months.len(), 2);
        assert!((months[0].monthly_return - 1.0).abs() < 1e-9); // 3 - 2
        assert!((months[1].monthly_return - (-1.0)).abs() < 1e-9); // 4 - 5
        assert_eq!(months[1].month, 2);
    }

    #[test]
    fn drawdown_periods_track_recovery() {
        let h = history(
            &[1_000_000.0, 1_100_000.0, 1_000_000.0, 950_000.0, 1_150_000.0, 1_100_000.0],
            1_000_000.0,
        );
        let periods = drawdown_periods(&h);
        assert_eq!(periods.len(), 2);

        let first = &periods[0];
        assert!(first.recovered);
        assert!((first.trough_value - 950_000.0).abs() < 1e-9);
        assert!((first.peak_value - 1_100_000.0).abs() < 1e-9);

        let second = &periods[1];
        assert!(!second.recovered, "open drawdown at end of window");
        assert!(second.end_date.is_none());
    }

    #[test]
    fn factor_attribution_ranks_by_score() {
        let d = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let trades = vec![
            sell(d, 10.0, &["PER", "ROE"]),
            sell(d, 6.0, &["PER"]),
            sell(d, -5.0, &["ROE"]),
        ];
        let factors = vec!["PER".to_string(), "ROE".to_string(), "PBR".to_string()];
        let contributions = factor_contributions(&trades, &factors);

        // PBR has no trades and is omitted.
        assert_eq!(contributions.len(), 2);
        assert_eq!(contributions[0].factor_name, "PER");
        assert_eq!(contributions[0].importance_rank, 1);
        assert_eq!(contributions[0].total_trades, 2);
        assert!((contributions[0].win_rate - 100.0).abs() < 1e-9);
        assert_eq!(contributions[1].factor_name, "ROE");
        assert_eq!(contributions[1].importance_rank, 2);
    }
}
