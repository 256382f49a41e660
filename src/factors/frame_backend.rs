//! Frame backend: the straightforward implementation. Each family is
//! staged and collected eagerly on its own, one polars query per family,
//! mirroring how the factor math reads on paper. Slower than the columnar
//! single-pass plan but trivially auditable.

use chrono::NaiveDate;
use polars::prelude::*;

use super::engine::{ComputeContext, FactorBackend};
use super::exprs::{family_stages, output_names};
use super::registry::Family;
use super::table::FactorTable;
use crate::data::columns as c;
use crate::error::Result;

pub struct FrameBackend;

const PRICE_FAMILIES: [Family; 4] = [
    Family::Momentum,
    Family::Volatility,
    Family::Liquidity,
    Family::Technical,
];

impl FactorBackend for FrameBackend {
    fn name(&self) -> &'static str {
        "frame"
    }

    fn compute_price_families(
        &self,
        ctx: &ComputeContext<'_>,
        calc_date: NaiveDate,
        table: &mut FactorTable,
    ) -> Result<()> {
        for family in PRICE_FAMILIES {
            let stages = family_stages(family, ctx.mask);
            if stages.is_empty() {
                continue;
            }
            let names = output_names(&stages);

            let mut lf = ctx.data.frame.clone().lazy();
            for stage in &stages {
                lf = lf.with_columns(stage.clone());
            }
            let mut select: Vec<Expr> = vec![col(c::STOCK)];
            select.extend(names.iter().map(|n| col(n.as_str())));
            let collected = lf
                .filter(col(c::DATE).eq(lit(calc_date)))
                .select(select)
                .collect()?;

            fill_table_from_frame(&collected, table, &names)?;
        }
        Ok(())
    }
}

/// Scatter the one-row-per-stock result frame into table columns, aligned
/// by stock code.
pub(super) fn fill_table_from_frame(
    collected: &DataFrame,
    table: &mut FactorTable,
    names: &[String],
) -> Result<()> {
    let stocks = collected.column(c::STOCK)?.str()?;
    let mut row_of = vec![None; table.len()];
    for i in 0..collected.height() {
        if let Some(stock) = stocks.get(i) {
            if let Some(idx) = table.stock_index(stock) {
                row_of[idx] = Some(i);
            }
        }
    }

    for name in names {
        let values = collected.column(name)?.f64()?;
        let column: Vec<Option<f32>> = row_of
            .iter()
            .map(|row| {
                row.and_then(|i| values.get(i))
                    .and_then(super::kernels::finite32)
            })
            .collect();
        table.insert_column(name.clone(), column);
    }
    Ok(())
}
