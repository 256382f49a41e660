//! Columnar backend: every masked price family staged into one lazy query
//! so polars fuses the whole computation into a single pass over the
//! (stock, date) sorted frame.

use chrono::NaiveDate;
use polars::prelude::*;

use super::engine::{ComputeContext, FactorBackend};
use super::exprs::{family_stages, output_names};
use super::frame_backend::fill_table_from_frame;
use super::registry::Family;
use super::table::FactorTable;
use crate::data::columns as c;
use crate::error::Result;

pub struct ColumnarBackend;

const PRICE_FAMILIES: [Family; 4] = [
    Family::Momentum,
    Family::Volatility,
    Family::Liquidity,
    Family::Technical,
];

impl FactorBackend for ColumnarBackend {
    fn name(&self) -> &'static str {
        "columnar"
    }

    fn compute_price_families(
        &self,
        ctx: &ComputeContext<'_>,
        calc_date: NaiveDate,
        table: &mut FactorTable,
    ) -> Result<()> {
        let mut all_names = Vec::new();
        let mut lf = ctx.data.frame.clone().lazy();
        let mut any = false;

        for family in PRICE_FAMILIES {
            let stages = family_stages(family, ctx.mask);
            if stages.is_empty() {
                continue;
            }
            any = true;
            all_names.extend(output_names(&stages));
            for stage in stages {
                lf = lf.with_columns(stage);
            }
        }
        if !any {
            return Ok(());
        }

        let mut select: Vec<Expr> = vec![col(c::STOCK)];
        select.extend(all_names.iter().map(|n| col(n.as_str())));
        let collected = lf
            .filter(col(c::DATE).eq(lit(calc_date)))
            .select(select)
            .collect()?;

        fill_table_from_frame(&collected, table, &all_names)
    }
}
