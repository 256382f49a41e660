//! Dependency analysis: which factors do the user's conditions actually
//! reference? Only those families are computed.

use rustc_hash::FxHashSet;

use super::registry::ComputeMask;
use crate::conditions::{BuyExpression, ConditionSpec};

const BOOLEAN_KEYWORDS: [&str; 5] = ["AND", "OR", "NOT", "TRUE", "FALSE"];

/// Extract the set of factor names referenced by the request. Unknown
/// uppercase identifiers are included too: a factor we cannot compute
/// simply stays null, which is safer than silently dropping a condition.
pub fn extract_required_factors(
    conditions: &[ConditionSpec],
    buy_expression: Option<&BuyExpression>,
    sell_conditions: &[ConditionSpec],
    priority_factor: Option<&str>,
) -> FxHashSet<String> {
    let mut required = FxHashSet::default();

    for cond in conditions.iter().chain(sell_conditions) {
        collect_from_condition(cond, &mut required);
    }

    if let Some(expr) = buy_expression {
        for cond in &expr.conditions {
            collect_from_condition(cond, &mut required);
        }
        // Condition ids are single letters in practice, but free-form
        // expressions may name factors directly; harvest those as well.
        for token in uppercase_identifiers(&expr.expression) {
            required.insert(token);
        }
    }

    if let Some(factor) = priority_factor {
        required.insert(factor.to_ascii_uppercase());
    }

    required
}

fn collect_from_condition(cond: &ConditionSpec, out: &mut FxHashSet<String>) {
    if !cond.factor.is_empty() {
        out.insert(cond.factor.to_ascii_uppercase());
    } else if let Some(left) = &cond.exp_left_side {
        // Genport-style conditions carry "label({FACTOR})" left sides.
        if let Some(name) = braced_factor(left) {
            out.insert(name);
        }
    }
}

/// First `{FACTOR_NAME}` marker inside a free-form left side.
fn braced_factor(text: &str) -> Option<String> {
    let open = text.find('{')?;
    let close = text[open + 1..].find('}')? + open + 1;
    let inner = text[open + 1..close].trim();
    if inner.is_empty() {
        None
    } else {
        Some(inner.to_ascii_uppercase())
    }
}

/// Uppercase identifiers in an expression that are neither Boolean keywords
/// nor numeric literals.
fn uppercase_identifiers(expression: &str) -> Vec<String> {
    let mut out = Vec::new();
    let upper = expression.to_ascii_uppercase();
    let mut chars = upper.char_indices().peekable();
    while let Some((start, c)) = chars.next() {
        if !c.is_ascii_uppercase() {
            continue;
        }
        let mut end = start + 1;
        while let Some(&(i, c)) = chars.peek() {
            if c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_' {
                end = i + 1;
                chars.next();
            } else {
                break;
            }
        }
        let token = &upper[start..end];
        if token.len() < 2 {
            // Single letters are condition ids, not factor names.
            continue;
        }
        if BOOLEAN_KEYWORDS.contains(&token) {
            continue;
        }
        if token.chars().all(|c| c.is_ascii_digit() || c == '.') {
            continue;
        }
        out.push(token.to_string());
    }
    out
}

/// Build the compute mask for a request.
pub fn compute_mask(
    conditions: &[ConditionSpec],
    buy_expression: Option<&BuyExpression>,
    sell_conditions: &[ConditionSpec],
    priority_factor: Option<&str>,
) -> ComputeMask {
    let required =
        extract_required_factors(conditions, buy_expression, sell_conditions, priority_factor);
    if required.is_empty() {
        tracing::warn!("no factors extracted from conditions; computing the full vocabulary");
    }
    ComputeMask::from_required(required)
}
