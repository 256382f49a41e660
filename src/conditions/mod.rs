pub mod evaluator;
pub mod parser;

use serde::{Deserialize, Serialize};

/// Comparison operator of an atomic condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CondOp {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "BETWEEN")]
    Between,
    #[serde(rename = "IN")]
    In,
    #[serde(rename = "NOT_IN")]
    NotIn,
}

/// Condition threshold: a scalar for the comparison operators, a list for
/// BETWEEN (two elements, inclusive) and IN/NOT_IN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CondValue {
    Scalar(f64),
    List(Vec<f64>),
}

/// An atomic labelled condition, `factor op value`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionSpec {
    pub id: String,
    pub factor: String,
    pub operator: CondOp,
    pub value: CondValue,
    /// Free-form left side carried by some clients; may contain a
    /// `{FACTOR_NAME}` marker which the dependency analyser extracts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp_left_side: Option<String>,
}

impl ConditionSpec {
    /// Evaluate against one factor value. Null factor values fail the
    /// condition regardless of operator.
    pub fn matches(&self, value: Option<f32>) -> bool {
        let Some(v) = value else { return false };
        if !v.is_finite() {
            return false;
        }
        let v = f64::from(v);
        match (&self.operator, &self.value) {
            (CondOp::Lt, CondValue::Scalar(t)) => v < *t,
            (CondOp::Le, CondValue::Scalar(t)) => v <= *t,
            (CondOp::Gt, CondValue::Scalar(t)) => v > *t,
            (CondOp::Ge, CondValue::Scalar(t)) => v >= *t,
            (CondOp::Eq, CondValue::Scalar(t)) => (v - *t).abs() < f64::EPSILON,
            (CondOp::Ne, CondValue::Scalar(t)) => (v - *t).abs() >= f64::EPSILON,
            (CondOp::Between, CondValue::List(bounds)) if bounds.len() == 2 => {
                bounds[0] <= v && v <= bounds[1]
            }
            (CondOp::In, CondValue::List(items)) => {
                items.iter().any(|t| (v - *t).abs() < f64::EPSILON)
            }
            (CondOp::NotIn, CondValue::List(items)) => {
                items.iter().all(|t| (v - *t).abs() >= f64::EPSILON)
            }
            _ => false,
        }
    }
}

/// A Boolean expression over labelled sub-conditions,
/// e.g. `{"expression": "(A and B) or C", "conditions": [...]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuyExpression {
    pub expression: String,
    pub conditions: Vec<ConditionSpec>,
}
