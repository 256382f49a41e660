//! Factor computation backends.
//!
//! Three interchangeable implementations with identical outputs:
//! the straightforward frame backend (eager polars, one family at a time),
//! the columnar backend (one lazy window-expression pass) and the native
//! backend (shared scalar kernels, rayon across stocks). The price families
//! are where they differ; fundamental families, cross-sectional factors and
//! the trailing-window risk factors are computed by shared code so the
//! equivalence gate concentrates on the vectorised math.

use std::sync::Arc;

use chrono::NaiveDate;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use super::fundamentals::compute_fundamental_factors;
use super::kernels;
use super::registry::{alias_of, ComputeMask, Family, CATALOG};
use super::table::FactorTable;
use crate::data::loader::MarketData;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Frame,
    Columnar,
    Native,
}

pub trait FactorBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Compute the price-family columns for one calc date into `table`.
    /// The shared families are layered on by [`compute_table`].
    fn compute_price_families(
        &self,
        ctx: &ComputeContext<'_>,
        calc_date: NaiveDate,
        table: &mut FactorTable,
    ) -> Result<()>;
}

pub fn create_backend(kind: BackendKind) -> Box<dyn FactorBackend> {
    match kind {
        BackendKind::Frame => Box::new(super::frame_backend::FrameBackend),
        BackendKind::Columnar => Box::new(super::columnar_backend::ColumnarBackend),
        BackendKind::Native => Box::new(super::native_backend::NativeBackend),
    }
}

/// Immutable inputs shared by every calc date of one backtest.
pub struct ComputeContext<'a> {
    pub data: &'a MarketData,
    pub mask: &'a ComputeMask,
    /// Equal-weight universe daily return per calendar date.
    pub market_returns: FxHashMap<NaiveDate, f64>,
}

impl<'a> ComputeContext<'a> {
    pub fn new(data: &'a MarketData, mask: &'a ComputeMask) -> Self {
        let market_returns = equal_weight_market_returns(data);
        Self {
            data,
            mask,
            market_returns,
        }
    }

    /// Market return series aligned to one stock's trading dates, for beta.
    pub fn aligned_market_returns(&self, dates: &[NaiveDate]) -> Vec<f64> {
        dates
            .iter()
            .map(|d| self.market_returns.get(d).copied().unwrap_or(f64::NAN))
            .collect()
    }
}

/// Mean daily return across all stocks trading on each calendar date.
fn equal_weight_market_returns(data: &MarketData) -> FxHashMap<NaiveDate, f64> {
    let mut sums: FxHashMap<NaiveDate, (f64, u32)> = FxHashMap::default();
    for s in data.series.values() {
        for i in 1..s.len() {
            let prev = s.close[i - 1];
            if prev > 0.0 {
                let entry = sums.entry(s.dates[i]).or_insert((0.0, 0));
                entry.0 += s.close[i] / prev - 1.0;
                entry.1 += 1;
            }
        }
    }
    sums.into_iter()
        .map(|(d, (sum, n))| (d, sum / f64::from(n)))
        .collect()
}

/// Stocks with a bar on the calc date, sorted; the factor-table universe.
pub fn table_stocks(data: &MarketData, calc_date: NaiveDate) -> Vec<String> {
    let mut stocks: Vec<String> = data
        .series
        .iter()
        .filter(|(_, s)| s.index_of(calc_date).is_some())
        .map(|(stock, _)| stock.clone())
        .collect();
    stocks.sort_unstable();
    stocks
}

/// Full factor table for one calc date: backend price families plus the
/// shared families, minimum-history enforcement and alias columns.
pub fn compute_table(
    backend: &dyn FactorBackend,
    ctx: &ComputeContext<'_>,
    calc_date: NaiveDate,
) -> Result<FactorTable> {
    let stocks = table_stocks(ctx.data, calc_date);
    let mut table = FactorTable::new(calc_date, stocks);
    if table.is_empty() {
        return Ok(table);
    }

    backend.compute_price_families(ctx, calc_date, &mut table)?;
    enforce_min_history(ctx, calc_date, &mut table);
    compute_shared_families(ctx, calc_date, &mut table);
    add_alias_columns(ctx, &mut table);
    Ok(table)
}

/// The ewm-based indicators have no implicit window in the polars
/// expressions; null them out below the history the kernels require so
/// every backend reports the identical defined region.
fn enforce_min_history(ctx: &ComputeContext<'_>, calc_date: NaiveDate, table: &mut FactorTable) {
    let thresholds: [(&str, usize); 4] = [
        ("RSI_14", 15),
        ("MACD", 26),
        ("MACD_SIGNAL", 26),
        ("MACD_HISTOGRAM", 26),
    ];
    let rows: Vec<usize> = table
        .stocks
        .iter()
        .map(|stock| {
            ctx.data
                .series
                .get(stock)
                .map_or(0, |s| s.rows_through(calc_date))
        })
        .collect();
    for (name, min_rows) in thresholds {
        if let Some(col) = table.columns.get_mut(name) {
            for (i, v) in col.iter_mut().enumerate() {
                if rows[i] < min_rows {
                    *v = None;
                }
            }
        }
    }
}

/// Risk factors with no rolling-expression form, the cross-sectional
/// factor and all fundamental families. Identical in every backend.
fn compute_shared_families(ctx: &ComputeContext<'_>, calc_date: NaiveDate, table: &mut FactorTable) {
    let mask = ctx.mask;
    let n = table.len();

    // Trailing-window risk factors via the kernels.
    if mask.wants("MAX_DRAWDOWN") || mask.wants("SHARPE_RATIO") || mask.wants("BETA") {
        let mut mdd = vec![None; n];
        let mut sharpe = vec![None; n];
        let mut beta = vec![None; n];
        for (i, stock) in table.stocks.iter().enumerate() {
            let Some(s) = ctx.data.series.get(stock) else { continue };
            let rows = s.rows_through(calc_date);
            let closes = &s.close[..rows];
            if mask.wants("MAX_DRAWDOWN") {
                mdd[i] = kernels::finite32(kernels::max_drawdown_last(closes, 252));
            }
            if mask.wants("SHARPE_RATIO") && rows >= 253 {
                sharpe[i] = kernels::finite32(kernels::sharpe_last(closes, 252));
            }
            if mask.wants("BETA") {
                let market = ctx.aligned_market_returns(&s.dates[..rows]);
                beta[i] = kernels::finite32(kernels::beta_last(closes, &market, 60));
            }
        }
        if mask.wants("MAX_DRAWDOWN") {
            table.insert_column("MAX_DRAWDOWN", mdd);
        }
        if mask.wants("SHARPE_RATIO") {
            table.insert_column("SHARPE_RATIO", sharpe);
        }
        if mask.wants("BETA") {
            table.insert_column("BETA", beta);
        }
    }

    // RELATIVE_STRENGTH = MOMENTUM_3M minus its cross-sectional mean.
    if mask.wants("RELATIVE_STRENGTH") {
        let momentum: Vec<Option<f32>> = match table.column("MOMENTUM_3M") {
            Some(col) => col.to_vec(),
            None => table
                .stocks
                .iter()
                .map(|stock| {
                    ctx.data.series.get(stock).and_then(|s| {
                        let rows = s.rows_through(calc_date);
                        kernels::finite32(kernels::pct_change_last(&s.close[..rows], 60))
                    })
                })
                .collect(),
        };
        let defined: Vec<f32> = momentum.iter().copied().flatten().collect();
        let col = if defined.is_empty() {
            vec![None; n]
        } else {
            let mean = defined.iter().sum::<f32>() / defined.len() as f32;
            momentum.iter().map(|v| v.map(|m| m - mean)).collect()
        };
        table.insert_column("RELATIVE_STRENGTH", col);
    }

    // Fundamental families, joined per stock at the calc-date market cap.
    let wants_fundamentals = Family::ALL
        .iter()
        .any(|f| f.needs_fundamentals() && mask.wants_family(*f));
    if wants_fundamentals && !ctx.data.fundamentals.is_empty() {
        let mut columns: FxHashMap<&'static str, Vec<Option<f32>>> = FxHashMap::default();
        let mut scratch: Vec<(&'static str, f64)> = Vec::new();
        for (i, stock) in table.stocks.iter().enumerate() {
            let market_cap = ctx
                .data
                .series
                .get(stock)
                .and_then(|s| s.bar_on(calc_date))
                .map_or(f64::NAN, |bar| bar.market_cap);
            scratch.clear();
            compute_fundamental_factors(
                &ctx.data.fundamentals,
                stock,
                calc_date,
                market_cap,
                mask,
                &mut scratch,
            );
            for &(name, value) in &scratch {
                columns.entry(name).or_insert_with(|| vec![None; n])[i] =
                    kernels::finite32(value);
            }
        }
        for (name, col) in columns {
            table.insert_column(name, col);
        }
    }
}

/// Copy canonical columns into requested alias names.
fn add_alias_columns(ctx: &ComputeContext<'_>, table: &mut FactorTable) {
    for info in CATALOG {
        if !ctx.mask.wants(info.name) {
            continue;
        }
        if let Some(canonical) = alias_of(info.name) {
            if let Some(col) = table.columns.get(canonical).cloned() {
                table.insert_column(info.name, col);
            }
        }
    }
}

/// The engine: a chosen backend plus rayon fan-out across calc dates.
pub struct FactorEngine {
    backend: Box<dyn FactorBackend>,
}

impl FactorEngine {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            backend: create_backend(kind),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn compute_one(
        &self,
        ctx: &ComputeContext<'_>,
        calc_date: NaiveDate,
    ) -> Result<FactorTable> {
        compute_table(self.backend.as_ref(), ctx, calc_date)
    }

    /// Compute independent calc dates in parallel; results in input order.
    pub fn compute_dates(
        &self,
        ctx: &ComputeContext<'_>,
        dates: &[NaiveDate],
    ) -> Result<Vec<Arc<FactorTable>>> {
        dates
            .par_iter()
            .map(|&d| compute_table(self.backend.as_ref(), ctx, d).map(Arc::new))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::registry::ComputeMask;

    #[test]
    fn backend_kinds_construct() {
        assert_eq!(create_backend(BackendKind::Frame).name(), "frame");
        assert_eq!(create_backend(BackendKind::Columnar).name(), "columnar");
        assert_eq!(create_backend(BackendKind::Native).name(), "native");
    }

    #[tokio::test]
    async fn market_returns_are_equal_weight_means() {
        use crate::testutil;

        let start = chrono::NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();
        let store = testutil::store_of(&[
            ("AAA", start, &[100.0, 110.0]),
            ("BBB", start, &[100.0, 90.0]),
        ]);
        let req = testutil::sample_request(
            start,
            chrono::NaiveDate::from_ymd_opt(2024, 6, 5).unwrap(),
        );
        let data = testutil::load(&store, &req).await;

        let mask = ComputeMask::all();
        let ctx = ComputeContext::new(&data, &mask);
        let d2 = chrono::NaiveDate::from_ymd_opt(2024, 6, 4).unwrap();
        // (+10% + -10%) / 2 = 0
        assert!(ctx.market_returns[&d2].abs() < 1e-12);
    }
}
