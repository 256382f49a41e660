//! Polars expression builders for the price families.
//!
//! Both polars backends stage these expressions over the (stock, date)
//! sorted price frame; every formula mirrors the scalar kernels exactly so
//! the backends stay pointwise-equal. Each stage is a `with_columns` batch
//! whose expressions carry a single window operation partitioned by stock;
//! later stages may reference the helper columns (`__`-prefixed) of earlier
//! ones.

use polars::prelude::*;

use super::kernels::ANNUALISATION;
use super::registry::{ComputeMask, Family};
use crate::data::columns as c;

fn over_stock(expr: Expr) -> Expr {
    expr.over([col(c::STOCK)])
}

fn rolling(window: usize) -> RollingOptionsFixedWindow {
    RollingOptionsFixedWindow {
        window_size: window,
        min_periods: window,
        ..Default::default()
    }
}

fn ewm(alpha: f64) -> EWMOptions {
    EWMOptions {
        alpha,
        adjust: false,
        bias: false,
        min_periods: 1,
        ignore_nulls: true,
    }
}

fn span_alpha(span: f64) -> f64 {
    2.0 / (span + 1.0)
}

/// Percent change vs `n` rows back, base clamped to the group's first row.
fn pct_change(n: i64) -> Expr {
    (col(c::CLOSE) / col(c::CLOSE).shift(lit(n)).fill_null(col(c::CLOSE).first()) - lit(1.0))
        * lit(100.0)
}

/// Ordered stages of window expressions for one family. Returns an empty
/// list when the mask selects nothing from the family.
pub fn family_stages(family: Family, mask: &ComputeMask) -> Vec<Vec<Expr>> {
    if !mask.wants_family(family) {
        return vec![];
    }
    match family {
        Family::Momentum => momentum_stages(mask),
        Family::Volatility => volatility_stages(mask),
        Family::Liquidity => liquidity_stages(mask),
        Family::Technical => technical_stages(mask),
        _ => vec![],
    }
}

fn momentum_stages(mask: &ComputeMask) -> Vec<Vec<Expr>> {
    let mut stage = Vec::new();
    for (name, n) in [
        ("MOMENTUM_1M", 20i64),
        ("MOMENTUM_3M", 60),
        ("MOMENTUM_6M", 120),
        ("MOMENTUM_12M", 240),
        ("CHANGE_RATE", 1),
    ] {
        if mask.wants(name) {
            stage.push(over_stock(pct_change(n)).alias(name));
        }
    }
    if mask.wants("DISTANCE_FROM_52W_HIGH") {
        stage.push(
            over_stock(
                (col(c::CLOSE) / col(c::CLOSE).rolling_max(rolling(252)) - lit(1.0)) * lit(100.0),
            )
            .alias("DISTANCE_FROM_52W_HIGH"),
        );
    }
    if mask.wants("DISTANCE_FROM_52W_LOW") {
        stage.push(
            over_stock(
                (col(c::CLOSE) / col(c::CLOSE).rolling_min(rolling(252)) - lit(1.0)) * lit(100.0),
            )
            .alias("DISTANCE_FROM_52W_LOW"),
        );
    }
    if mask.wants("VOLUME_MOMENTUM") {
        stage.push(
            over_stock(
                (col(c::VOLUME).rolling_mean(rolling(20))
                    / col(c::VOLUME).rolling_mean(rolling(60))
                    - lit(1.0))
                    * lit(100.0),
            )
            .alias("VOLUME_MOMENTUM"),
        );
    }
    vec![stage]
}

fn volatility_stages(mask: &ComputeMask) -> Vec<Vec<Expr>> {
    let annualise = ANNUALISATION.sqrt() * 100.0;
    let returns = over_stock(col(c::CLOSE) / col(c::CLOSE).shift(lit(1)) - lit(1.0)).alias("__ret");

    let mut second = Vec::new();
    for (name, window) in [
        ("VOLATILITY", 60usize),
        ("VOLATILITY_20D", 20),
        ("VOLATILITY_90D", 90),
    ] {
        if mask.wants(name) {
            second.push(
                over_stock(col("__ret").rolling_std(rolling(window)) * lit(annualise)).alias(name),
            );
        }
    }
    if mask.wants("DOWNSIDE_VOLATILITY") {
        // min(ret, 0) expressed arithmetically: (ret - |ret|) / 2.
        let neg = (col("__ret") - col("__ret").abs()) / lit(2.0);
        second.push(
            over_stock(
                ((neg.clone() * neg).rolling_sum(rolling(60)) / lit(60.0)).sqrt()
                    * lit(annualise),
            )
            .alias("DOWNSIDE_VOLATILITY"),
        );
    }
    vec![vec![returns], second]
}

fn liquidity_stages(mask: &ComputeMask) -> Vec<Vec<Expr>> {
    let mut stage = Vec::new();
    if mask.wants("AVG_TRADING_VALUE") {
        stage.push(
            over_stock(col(c::TRADING_VALUE).rolling_mean(rolling(20))).alias("AVG_TRADING_VALUE"),
        );
    }
    if mask.wants("TURNOVER_RATE") {
        stage.push(
            over_stock(col(c::VOLUME).rolling_mean(rolling(20)) / col(c::SHARES) * lit(100.0))
                .alias("TURNOVER_RATE"),
        );
    }
    if mask.wants("MARKET_CAP") {
        stage.push(col(c::MARKET_CAP).alias("MARKET_CAP"));
    }
    vec![stage]
}

fn technical_stages(mask: &ComputeMask) -> Vec<Vec<Expr>> {
    let mut first = Vec::new();
    let mut second = Vec::new();
    let mut third = Vec::new();

    for (name, window) in [
        ("MA_5", 5usize),
        ("MA_10", 10),
        ("MA_20", 20),
        ("MA_50", 50),
        ("MA_60", 60),
        ("MA_120", 120),
        ("MA_200", 200),
        ("MA_250", 250),
    ] {
        if mask.wants(name) {
            first.push(over_stock(col(c::CLOSE).rolling_mean(rolling(window))).alias(name));
        }
    }

    let wants_bollinger = mask.wants("BOLLINGER_POSITION") || mask.wants("BOLLINGER_WIDTH");
    if wants_bollinger {
        first.push(over_stock(col(c::CLOSE).rolling_mean(rolling(20))).alias("__ma20"));
        first.push(over_stock(col(c::CLOSE).rolling_std(rolling(20))).alias("__std20"));
        if mask.wants("BOLLINGER_POSITION") {
            second.push(
                ((col(c::CLOSE) - col("__ma20")) / (lit(2.0) * col("__std20")))
                    .alias("BOLLINGER_POSITION"),
            );
        }
        if mask.wants("BOLLINGER_WIDTH") {
            second.push(
                (lit(4.0) * col("__std20") / col("__ma20") * lit(100.0)).alias("BOLLINGER_WIDTH"),
            );
        }
    }

    if mask.wants("RSI_14") {
        first.push(
            over_stock((col(c::CLOSE) - col(c::CLOSE).shift(lit(1))).fill_null(lit(0.0)))
                .alias("__chg"),
        );
        // max(chg, 0) and max(-chg, 0) without a conditional.
        second.push(
            over_stock(((col("__chg") + col("__chg").abs()) / lit(2.0)).ewm_mean(ewm(1.0 / 14.0)))
                .alias("__avg_gain"),
        );
        second.push(
            over_stock(((col("__chg").abs() - col("__chg")) / lit(2.0)).ewm_mean(ewm(1.0 / 14.0)))
                .alias("__avg_loss"),
        );
        third.push(
            (lit(100.0) - lit(100.0) / (lit(1.0) + col("__avg_gain") / col("__avg_loss")))
                .alias("RSI_14"),
        );
    }

    let wants_macd =
        mask.wants("MACD") || mask.wants("MACD_SIGNAL") || mask.wants("MACD_HISTOGRAM");
    let mut fourth = Vec::new();
    if wants_macd {
        first.push(over_stock(col(c::CLOSE).ewm_mean(ewm(span_alpha(12.0)))).alias("__ema12"));
        first.push(over_stock(col(c::CLOSE).ewm_mean(ewm(span_alpha(26.0)))).alias("__ema26"));
        second.push((col("__ema12") - col("__ema26")).alias("__macd"));
        third.push(over_stock(col("__macd").ewm_mean(ewm(span_alpha(9.0)))).alias("__macd_signal"));
        if mask.wants("MACD") {
            fourth.push(col("__macd").alias("MACD"));
        }
        if mask.wants("MACD_SIGNAL") {
            fourth.push(col("__macd_signal").alias("MACD_SIGNAL"));
        }
        if mask.wants("MACD_HISTOGRAM") {
            fourth.push((col("__macd") - col("__macd_signal")).alias("MACD_HISTOGRAM"));
        }
    }

    if mask.wants("STOCHASTIC_14") {
        first.push(over_stock(col(c::CLOSE).rolling_min(rolling(14))).alias("__lo14"));
        first.push(over_stock(col(c::CLOSE).rolling_max(rolling(14))).alias("__hi14"));
        second.push(
            ((col(c::CLOSE) - col("__lo14")) / (col("__hi14") - col("__lo14")) * lit(100.0))
                .alias("STOCHASTIC_14"),
        );
    }

    vec![first, second, third, fourth]
}

/// The factor column names a set of stages will materialise (helper
/// columns excluded).
pub fn output_names(stages: &[Vec<Expr>]) -> Vec<String> {
    let mut names = Vec::new();
    for stage in stages {
        for expr in stage {
            if let Expr::Alias(_, name) = expr {
                if !name.starts_with("__") {
                    names.push(name.to_string());
                }
            }
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashSet;

    #[test]
    fn masked_family_produces_no_stages() {
        let mut required = FxHashSet::default();
        required.insert("PER".to_string());
        let mask = ComputeMask::from_required(required);
        assert!(family_stages(Family::Momentum, &mask).is_empty());
        assert!(family_stages(Family::Technical, &mask).is_empty());
    }

    #[test]
    fn momentum_outputs_follow_mask() {
        let mut required = FxHashSet::default();
        required.insert("MOMENTUM_1M".to_string());
        required.insert("CHANGE_RATE".to_string());
        let mask = ComputeMask::from_required(required);
        let stages = family_stages(Family::Momentum, &mask);
        let names = output_names(&stages);
        assert!(names.contains(&"MOMENTUM_1M".to_string()));
        assert!(names.contains(&"CHANGE_RATE".to_string()));
        assert!(!names.contains(&"MOMENTUM_12M".to_string()));
    }

    #[test]
    fn full_technical_stage_set() {
        let mask = ComputeMask::all();
        let stages = family_stages(Family::Technical, &mask);
        let names = output_names(&stages);
        for expected in [
            "MA_20",
            "BOLLINGER_POSITION",
            "BOLLINGER_WIDTH",
            "RSI_14",
            "MACD",
            "MACD_SIGNAL",
            "MACD_HISTOGRAM",
            "STOCHASTIC_14",
        ] {
            assert!(names.iter().any(|n| n == expected), "{expected} missing");
        }
    }
}
