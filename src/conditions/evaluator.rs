//! Vectorised condition evaluation over a per-date factor table, plus
//! candidate ranking and selection.

use ordered_float::OrderedFloat;
use rustc_hash::{FxHashMap, FxHashSet};

use super::parser::{self, ExprNode};
use super::ConditionSpec;
use crate::error::{BacktestError, Result};
use crate::factors::table::FactorTable;
use crate::strategy::{PriorityOrder, BacktestRequest};

/// A buy or sell rule compiled to an expression tree over labelled atomic
/// conditions. Compilation validates the expression once; evaluation is a
/// boolean-column reduction per date.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    expr: ExprNode,
    conditions: FxHashMap<String, ConditionSpec>,
}

impl CompiledRule {
    /// Compile an explicit expression over its condition list.
    pub fn from_expression(expression: &str, conditions: &[ConditionSpec]) -> Result<Self> {
        let expr = parser::parse(expression)
            .map_err(|e| BacktestError::Validation(format!("invalid expression: {e}")))?;
        let map: FxHashMap<String, ConditionSpec> = conditions
            .iter()
            .map(|c| (c.id.clone(), c.clone()))
            .collect();
        for ident in expr.idents() {
            if !map.contains_key(ident) {
                return Err(BacktestError::Validation(format!(
                    "expression references undefined condition '{ident}'"
                )));
            }
        }
        Ok(Self {
            expr,
            conditions: map,
        })
    }

    /// Compile a flat condition list as the conjunction of all entries.
    pub fn all_of(conditions: &[ConditionSpec]) -> Result<Self> {
        if conditions.is_empty() {
            return Err(BacktestError::Validation(
                "at least one condition is required".into(),
            ));
        }
        let expression = conditions
            .iter()
            .map(|c| c.id.as_str())
            .collect::<Vec<_>>()
            .join(" and ");
        Self::from_expression(&expression, conditions)
    }

    /// The buy rule of a request: expression form wins over the flat list.
    pub fn buy_rule(req: &BacktestRequest) -> Result<Self> {
        match &req.buy_expression {
            Some(expr) => Self::from_expression(&expr.expression, &expr.conditions),
            None => Self::all_of(&req.buy_conditions),
        }
    }

    pub fn factor_names(&self) -> Vec<&str> {
        self.conditions.values().map(|c| c.factor.as_str()).collect()
    }

    /// One boolean per table row: does the stock satisfy the rule? Null
    /// factor values fail their atomic condition.
    pub fn evaluate(&self, table: &FactorTable) -> Vec<bool> {
        let n = table.len();

        // Atomic predicate columns, vectorised per condition.
        let mut predicate_columns: FxHashMap<&str, Vec<bool>> = FxHashMap::default();
        for (id, cond) in &self.conditions {
            let column = match table.column(&cond.factor) {
                Some(values) => values.iter().map(|v| cond.matches(*v)).collect(),
                None => vec![false; n],
            };
            predicate_columns.insert(id.as_str(), column);
        }

        (0..n)
            .map(|row| {
                self.expr.eval(&|ident| {
                    predicate_columns
                        .get(ident)
                        .is_some_and(|column| column[row])
                })
            })
            .collect()
    }

    /// Rule check for one held stock (sell-condition path).
    pub fn matches_stock(&self, table: &FactorTable, stock: &str) -> bool {
        let Some(row) = table.stock_index(stock) else {
            return false;
        };
        self.expr.eval(&|ident| {
            self.conditions.get(ident).is_some_and(|cond| {
                let value = table
                    .column(&cond.factor)
                    .and_then(|col| col.get(row).copied().flatten());
                cond.matches(value)
            })
        })
    }
}

/// Ranked candidate list for a date: rows satisfying the rule, minus
/// exclusions, ordered by the priority factor (nulls last, ties by stock
/// code ascending).
pub fn ranked_candidates(
    table: &FactorTable,
    satisfied: &[bool],
    priority_factor: Option<&str>,
    priority_order: PriorityOrder,
    excluded: &FxHashSet<String>,
) -> Vec<String> {
    let priority_column = priority_factor.and_then(|f| table.column(f));

    let mut rows: Vec<usize> = (0..table.len())
        .filter(|&i| satisfied[i] && !excluded.contains(&table.stocks[i]))
        .collect();

    rows.sort_by_key(|&i| {
        let value = priority_column.and_then(|col| col[i]);
        let rank_key = match value {
            // Nulls always rank last regardless of direction.
            None => (1u8, OrderedFloat(0.0f32)),
            Some(v) => {
                let directed = match priority_order {
                    PriorityOrder::Asc => v,
                    PriorityOrder::Desc => -v,
                };
                (0u8, OrderedFloat(directed))
            }
        };
        (rank_key, table.stocks[i].clone())
    });

    rows.into_iter().map(|i| table.stocks[i].clone()).collect()
}

/// Top-`slots` selection from the ranked list.
pub fn select_top(ranked: Vec<String>, slots: usize) -> Vec<String> {
    ranked.into_iter().take(slots).collect()
}
