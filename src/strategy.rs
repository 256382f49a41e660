use chrono::{Datelike, NaiveDate, Weekday};
use garde::Validate;
use md5::{Digest, Md5};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::conditions::{BuyExpression, ConditionSpec};
use crate::error::{BacktestError, Result};
use crate::factors::registry;

pub const FIXED_TAX_RATE: f64 = 0.0023;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RebalanceFrequency {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
}

impl RebalanceFrequency {
    /// Whether `day` opens a new rebalance window. The first trading day of
    /// the backtest always does; afterwards WEEKLY fires on Mondays, MONTHLY
    /// on the first trading day of a month, QUARTERLY on the first trading
    /// day of a quarter.
    pub fn is_rebalance_day(self, day: NaiveDate, prev_trading_day: Option<NaiveDate>) -> bool {
        let Some(prev) = prev_trading_day else {
            return true;
        };
        match self {
            RebalanceFrequency::Daily => true,
            RebalanceFrequency::Weekly => day.weekday() == Weekday::Mon,
            RebalanceFrequency::Monthly => (prev.year(), prev.month()) != (day.year(), day.month()),
            RebalanceFrequency::Quarterly => {
                (prev.year(), quarter(prev)) != (day.year(), quarter(day))
            }
        }
    }
}

fn quarter(d: NaiveDate) -> u32 {
    (d.month() - 1) / 3
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionSizing {
    EqualWeight,
    MarketCap,
    RiskParity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityOrder {
    Asc,
    #[default]
    Desc,
}

/// Price basis used when a sell rule fires. The source vocabulary was
/// inconsistently cased and occasionally Korean; [`SellPriceBasis::parse`]
/// canonicalises every observed variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SellPriceBasis {
    #[default]
    Current,
    Open,
    PrevClose,
    Entry,
}

impl SellPriceBasis {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "CURRENT" | "CLOSE" => Some(SellPriceBasis::Current),
            "OPEN" => Some(SellPriceBasis::Open),
            "PREV_CLOSE" | "PREVCLOSE" => Some(SellPriceBasis::PrevClose),
            "ENTRY" => Some(SellPriceBasis::Entry),
            _ => {
                if raw.trim() == "전일 종가" {
                    Some(SellPriceBasis::PrevClose)
                } else {
                    None
                }
            }
        }
    }
}

/// Size buckets within KOSPI/KOSDAQ, bounded by market cap in KRW.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UniverseId {
    KospiMega,
    KospiLarge,
    KospiMid,
    KospiSmall,
    KosdaqMega,
    KosdaqLarge,
    KosdaqMid,
    KosdaqSmall,
}

impl UniverseId {
    pub const ALL: [UniverseId; 8] = [
        UniverseId::KospiMega,
        UniverseId::KospiLarge,
        UniverseId::KospiMid,
        UniverseId::KospiSmall,
        UniverseId::KosdaqMega,
        UniverseId::KosdaqLarge,
        UniverseId::KosdaqMid,
        UniverseId::KosdaqSmall,
    ];

    pub fn market(self) -> &'static str {
        match self {
            UniverseId::KospiMega
            | UniverseId::KospiLarge
            | UniverseId::KospiMid
            | UniverseId::KospiSmall => "KOSPI",
            _ => "KOSDAQ",
        }
    }

    /// (min_cap, max_cap) bounds in KRW; `None` means unbounded above.
    pub fn cap_bounds(self) -> (f64, Option<f64>) {
        const T: f64 = 1_000_000_000_000.0;
        match self {
            UniverseId::KospiMega => (10.0 * T, None),
            UniverseId::KospiLarge => (2.0 * T, Some(10.0 * T)),
            UniverseId::KospiMid => (0.5 * T, Some(2.0 * T)),
            UniverseId::KospiSmall => (0.0, Some(0.5 * T)),
            UniverseId::KosdaqMega => (2.0 * T, None),
            UniverseId::KosdaqLarge => (0.5 * T, Some(2.0 * T)),
            UniverseId::KosdaqMid => (0.2 * T, Some(0.5 * T)),
            UniverseId::KosdaqSmall => (0.0, Some(0.2 * T)),
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            UniverseId::KospiMega => "KOSPI Mega Cap",
            UniverseId::KospiLarge => "KOSPI Large Cap",
            UniverseId::KospiMid => "KOSPI Mid Cap",
            UniverseId::KospiSmall => "KOSPI Small Cap",
            UniverseId::KosdaqMega => "KOSDAQ Mega Cap",
            UniverseId::KosdaqLarge => "KOSDAQ Large Cap",
            UniverseId::KosdaqMid => "KOSDAQ Mid Cap",
            UniverseId::KosdaqSmall => "KOSDAQ Small Cap",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct TargetAndLoss {
    /// Take-profit threshold in percent (e.g. 20.0 = +20%).
    #[garde(inner(range(min = 0.0)))]
    pub target_gain: Option<f64>,
    /// Stop-loss threshold in percent (e.g. 3.0 = −3%).
    #[garde(inner(range(min = 0.0)))]
    pub stop_loss: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct HoldDaysRule {
    #[serde(default)]
    #[garde(skip)]
    pub min_hold_days: u32,
    #[serde(default = "default_max_hold_days")]
    #[garde(range(min = 1))]
    pub max_hold_days: u32,
    #[serde(default)]
    #[garde(skip)]
    pub sell_price_basis: SellPriceBasis,
    /// Percent offset applied to the basis price (e.g. 1.0 = +1%).
    #[garde(inner(range(min = -50.0, max = 50.0)))]
    pub sell_price_offset: Option<f64>,
}

fn default_max_hold_days() -> u32 {
    999
}

impl Default for HoldDaysRule {
    fn default() -> Self {
        Self {
            min_hold_days: 0,
            max_hold_days: 999,
            sell_price_basis: SellPriceBasis::default(),
            sell_price_offset: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ConditionSell {
    #[garde(skip)]
    pub sell_conditions: Vec<ConditionSpec>,
    /// Boolean expression over the sell-condition ids, e.g. `"A and B"`.
    #[garde(length(min = 1))]
    pub sell_logic: String,
    #[serde(default)]
    #[garde(skip)]
    pub sell_price_basis: SellPriceBasis,
    #[garde(inner(range(min = -50.0, max = 50.0)))]
    pub sell_price_offset: Option<f64>,
}

/// A complete backtest request. The caller owns this; the engine clones what
/// it needs and never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BacktestRequest {
    #[serde(default)]
    #[garde(length(max = 200))]
    pub name: String,

    /// Flat buy conditions, implicitly AND-ed. Ignored when
    /// `buy_expression` is present.
    #[serde(default)]
    #[garde(skip)]
    pub buy_conditions: Vec<ConditionSpec>,
    #[garde(skip)]
    pub buy_expression: Option<BuyExpression>,

    #[serde(default)]
    #[garde(skip)]
    pub sell_conditions: Vec<ConditionSpec>,
    #[garde(dive)]
    pub condition_sell: Option<ConditionSell>,

    #[serde(default)]
    #[garde(dive)]
    pub target_and_loss: TargetAndLoss,
    #[serde(default)]
    #[garde(dive)]
    pub hold_days: HoldDaysRule,

    #[garde(skip)]
    pub start_date: NaiveDate,
    #[garde(skip)]
    pub end_date: NaiveDate,
    #[garde(skip)]
    #[serde(with = "rust_decimal::serde::float")]
    pub initial_capital: Decimal,

    #[garde(skip)]
    pub rebalance_frequency: RebalanceFrequency,
    #[garde(range(min = 1, max = 100))]
    pub max_positions: u32,
    #[garde(skip)]
    pub position_sizing: PositionSizing,

    #[garde(range(min = 0.0, max = 0.01))]
    pub commission_rate: f64,
    /// Korean securities transaction tax; fixed by the exchange.
    #[serde(default = "default_tax_rate")]
    #[garde(range(min = 0.0, max = 0.01))]
    pub tax_rate: f64,
    #[garde(range(min = 0.0, max = 0.1))]
    pub slippage: f64,

    #[garde(skip)]
    pub target_themes: Option<Vec<String>>,
    #[garde(skip)]
    pub target_stocks: Option<Vec<String>>,
    #[garde(skip)]
    pub target_universes: Option<Vec<UniverseId>>,

    #[garde(skip)]
    pub priority_factor: Option<String>,
    #[serde(default)]
    #[garde(skip)]
    pub priority_order: PriorityOrder,
}

fn default_tax_rate() -> f64 {
    FIXED_TAX_RATE
}

impl BacktestRequest {
    /// Full request validation. Garde field checks plus the cross-field
    /// rules garde cannot express (date ordering, expression parse, known
    /// factor names in structured conditions).
    pub fn validate_request(&self) -> Result<()> {
        if let Err(report) = self.validate() {
            return Err(BacktestError::Validation(report.to_string()));
        }
        if self.start_date >= self.end_date {
            return Err(BacktestError::Validation(format!(
                "start_date {} must precede end_date {}",
                self.start_date, self.end_date
            )));
        }
        if self.initial_capital <= Decimal::ZERO {
            return Err(BacktestError::Validation(
                "initial_capital must be positive".into(),
            ));
        }
        if self.buy_conditions.is_empty() && self.buy_expression.is_none() {
            return Err(BacktestError::Validation(
                "either buy_conditions or buy_expression is required".into(),
            ));
        }
        if self.hold_days.min_hold_days > self.hold_days.max_hold_days {
            return Err(BacktestError::Validation(format!(
                "min_hold_days {} exceeds max_hold_days {}",
                self.hold_days.min_hold_days, self.hold_days.max_hold_days
            )));
        }

        for cond in self.structured_conditions() {
            if !registry::is_known_factor(&cond.factor) {
                return Err(BacktestError::Validation(format!(
                    "unknown factor '{}' in condition '{}'",
                    cond.factor, cond.id
                )));
            }
        }
        if let Some(factor) = &self.priority_factor {
            if !registry::is_known_factor(factor) {
                return Err(BacktestError::Validation(format!(
                    "unknown priority_factor '{factor}'"
                )));
            }
        }

        // Expressions must parse against their declared condition ids.
        if let Some(expr) = &self.buy_expression {
            crate::conditions::parser::parse(&expr.expression)
                .map_err(|e| BacktestError::Validation(format!("buy_expression: {e}")))?;
        }
        if let Some(cs) = &self.condition_sell {
            crate::conditions::parser::parse(&cs.sell_logic)
                .map_err(|e| BacktestError::Validation(format!("condition_sell: {e}")))?;
        }
        Ok(())
    }

    fn structured_conditions(&self) -> impl Iterator<Item = &ConditionSpec> {
        self.buy_conditions
            .iter()
            .chain(self.buy_expression.iter().flat_map(|e| e.conditions.iter()))
            .chain(self.sell_conditions.iter())
            .chain(
                self.condition_sell
                    .iter()
                    .flat_map(|c| c.sell_conditions.iter()),
            )
    }

    /// Sorted comma-joined theme list, or `all`. Part of every factor cache
    /// key so distinct universes never share tables.
    pub fn universe_key(&self) -> String {
        match &self.target_themes {
            Some(themes) if !themes.is_empty() => {
                let mut sorted: Vec<&str> = themes.iter().map(String::as_str).collect();
                sorted.sort_unstable();
                sorted.join(",")
            }
            _ => "all".to_string(),
        }
    }

    /// 8-hex-char fingerprint of the normalised request.
    pub fn strategy_hash(&self) -> String {
        let value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        strategy_hash_of_value(&value)
    }
}

/// MD5 over the canonical JSON form, first 8 hex chars. Numeric fields are
/// coerced to a single float form first so decimal, integer and float
/// spellings of the same quantity hash identically.
pub fn strategy_hash_of_value(value: &serde_json::Value) -> String {
    let normalised = normalise_for_hash(value);
    let encoded = serde_json::to_string(&normalised).unwrap_or_default();
    let digest = Md5::digest(encoded.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..8].to_string()
}

fn normalise_for_hash(value: &serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::Number(n) => {
            let f = n.as_f64().unwrap_or(0.0);
            // Format through a fixed notation so 15, 15.0 and Decimal("15")
            // all normalise to the same token.
            Value::String(canonical_float(f))
        }
        Value::Array(items) => Value::Array(items.iter().map(normalise_for_hash).collect()),
        Value::Object(map) => {
            // serde_json's default map is a BTreeMap, so key order is
            // already canonical.
            Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), normalise_for_hash(v)))
                    .collect(),
            )
        }
        other => other.clone(),
    }
}

fn canonical_float(f: f64) -> String {
    if f == f.trunc() && f.abs() < 1e15 {
        format!("{:.1}", f)
    } else {
        format!("{f}")
    }
}

/// Convenience used by the cache warmer and live adapter when hashing a
/// conditions-only strategy (no full request available).
pub fn hash_conditions(conditions: &serde_json::Value, rules: &serde_json::Value) -> String {
    let combined = serde_json::json!({
        "buy_conditions": conditions,
        "trading_rules": rules,
    });
    strategy_hash_of_value(&combined)
}

/// Decimal → f64 for boundary maths that tolerates rounding (weights,
/// percentages). Cash arithmetic itself stays in `Decimal`.
pub fn decimal_to_f64(d: Decimal) -> f64 {
    d.to_f64().unwrap_or(0.0)
}
