//! Native backend: the shared scalar kernels applied per stock over
//! contiguous slices, parallelised with rayon. Fastest path and the
//! default selection.

use chrono::NaiveDate;
use rayon::prelude::*;
use rustc_hash::FxHashMap;

use super::engine::{ComputeContext, FactorBackend};
use super::kernels::{self, finite32};
use super::registry::Family;
use super::table::FactorTable;
use crate::error::Result;

pub struct NativeBackend;

impl FactorBackend for NativeBackend {
    fn name(&self) -> &'static str {
        "native"
    }

    fn compute_price_families(
        &self,
        ctx: &ComputeContext<'_>,
        calc_date: NaiveDate,
        table: &mut FactorTable,
    ) -> Result<()> {
        let n = table.len();
        let per_stock: Vec<Vec<(&'static str, f64)>> = table
            .stocks
            .par_iter()
            .map(|stock| stock_values(ctx, calc_date, stock))
            .collect();

        let mut columns: FxHashMap<&'static str, Vec<Option<f32>>> = FxHashMap::default();
        for (i, values) in per_stock.iter().enumerate() {
            for (name, value) in values {
                columns.entry(name).or_insert_with(|| vec![None; n])[i] = finite32(*value);
            }
        }
        for (name, col) in columns {
            table.insert_column(name, col);
        }
        Ok(())
    }
}

fn stock_values(
    ctx: &ComputeContext<'_>,
    calc_date: NaiveDate,
    stock: &str,
) -> Vec<(&'static str, f64)> {
    let mut out = Vec::new();
    let Some(s) = ctx.data.series.get(stock) else {
        return out;
    };
    let rows = s.rows_through(calc_date);
    if rows == 0 {
        return out;
    }
    let closes = &s.close[..rows];
    let volumes = &s.volume[..rows];
    let trading_values = &s.trading_value[..rows];
    let mask = ctx.mask;
    let mut put = |name: &'static str, value: f64| {
        if mask.wants(name) {
            out.push((name, value));
        }
    };

    if mask.wants_family(Family::Momentum) {
        put("MOMENTUM_1M", kernels::pct_change_last(closes, 20));
        put("MOMENTUM_3M", kernels::pct_change_last(closes, 60));
        put("MOMENTUM_6M", kernels::pct_change_last(closes, 120));
        put("MOMENTUM_12M", kernels::pct_change_last(closes, 240));
        put("CHANGE_RATE", kernels::pct_change_last(closes, 1));
        put(
            "DISTANCE_FROM_52W_HIGH",
            (closes[rows - 1] / kernels::max_last(closes, 252) - 1.0) * 100.0,
        );
        put(
            "DISTANCE_FROM_52W_LOW",
            (closes[rows - 1] / kernels::min_last(closes, 252) - 1.0) * 100.0,
        );
        put(
            "VOLUME_MOMENTUM",
            (kernels::sma_last(volumes, 20) / kernels::sma_last(volumes, 60) - 1.0) * 100.0,
        );
    }

    if mask.wants_family(Family::Volatility) {
        put("VOLATILITY", kernels::volatility_last(closes, 60));
        put("VOLATILITY_20D", kernels::volatility_last(closes, 20));
        put("VOLATILITY_90D", kernels::volatility_last(closes, 90));
        put(
            "DOWNSIDE_VOLATILITY",
            kernels::downside_volatility_last(closes, 60),
        );
    }

    if mask.wants_family(Family::Liquidity) {
        put("AVG_TRADING_VALUE", kernels::sma_last(trading_values, 20));
        let shares = s.shares[rows - 1];
        put(
            "TURNOVER_RATE",
            if shares > 0.0 {
                kernels::sma_last(volumes, 20) / shares * 100.0
            } else {
                f64::NAN
            },
        );
        put("MARKET_CAP", s.market_cap[rows - 1]);
    }

    if mask.wants_family(Family::Technical) {
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
            put(name, kernels::sma_last(closes, window));
        }
        let ma20 = kernels::sma_last(closes, 20);
        let std20 = kernels::std_last(closes, 20);
        put("BOLLINGER_POSITION", (closes[rows - 1] - ma20) / (2.0 * std20));
        put("BOLLINGER_WIDTH", 4.0 * std20 / ma20 * 100.0);
        put("RSI_14", kernels::rsi_wilder_last(closes, 14));
        let (macd, signal, histogram) = kernels::macd_last(closes);
        put("MACD", macd);
        put("MACD_SIGNAL", signal);
        put("MACD_HISTOGRAM", histogram);
        put("STOCHASTIC_14", kernels::stochastic_last(closes, 14));
    }

    out
}
