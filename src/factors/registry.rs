//! The factor vocabulary: families, catalogue metadata and compute masks.

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

/// Factor family. Families are the unit of computation skipping: a family
/// whose factors are all absent from the compute mask is never evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Valuation,
    Profitability,
    Growth,
    Momentum,
    Volatility,
    Liquidity,
    Technical,
    Quality,
    Dividend,
}

impl Family {
    pub const ALL: [Family; 9] = [
        Family::Valuation,
        Family::Profitability,
        Family::Growth,
        Family::Momentum,
        Family::Volatility,
        Family::Liquidity,
        Family::Technical,
        Family::Quality,
        Family::Dividend,
    ];

    /// Families that join fundamental records; the rest are price-only.
    pub fn needs_fundamentals(self) -> bool {
        matches!(
            self,
            Family::Valuation
                | Family::Profitability
                | Family::Growth
                | Family::Quality
                | Family::Dividend
        )
    }
}

/// Catalogue metadata for one factor, served by the factor-catalogue
/// endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct FactorInfo {
    pub name: &'static str,
    pub family: Family,
    pub description: &'static str,
    pub recommended_operator: &'static str,
    pub typical_range: &'static str,
}

macro_rules! factor {
    ($name:literal, $family:ident, $desc:literal, $op:literal, $range:literal) => {
        FactorInfo {
            name: $name,
            family: Family::$family,
            description: $desc,
            recommended_operator: $op,
            typical_range: $range,
        }
    };
}

pub const CATALOG: &[FactorInfo] = &[
    // -- Valuation --
    factor!("PER", Valuation, "Price to earnings: market cap / trailing net income.", "<", "0..50"),
    factor!("PBR", Valuation, "Price to book: market cap / total equity.", "<", "0..10"),
    factor!("PSR", Valuation, "Price to sales: market cap / trailing revenue.", "<", "0..10"),
    factor!("PCR", Valuation, "Price to operating cash flow.", "<", "0..30"),
    factor!("PEG", Valuation, "PER divided by 1-year earnings growth.", "<", "0..3"),
    factor!("EV", Valuation, "Enterprise value: market cap + liabilities - cash (KRW).", "<", ">0"),
    factor!("EV_EBITDA", Valuation, "Enterprise value / EBITDA.", "<", "0..20"),
    factor!("EV_SALES", Valuation, "Enterprise value / revenue.", "<", "0..10"),
    factor!("DIVIDEND_YIELD", Valuation, "Dividends paid / market cap, percent.", ">", "0..10"),
    factor!("EARNINGS_YIELD", Valuation, "Net income / market cap, percent (inverse PER).", ">", "0..20"),
    factor!("FCF_YIELD", Valuation, "Free cash flow (OCF - capex) / market cap, percent.", ">", "-10..20"),
    factor!("BOOK_TO_MARKET", Valuation, "Total equity / market cap (inverse PBR).", ">", "0..5"),
    factor!("PTBV", Valuation, "Price to tangible book value.", "<", "0..10"),
    factor!("CAPE_RATIO", Valuation, "Market cap over multi-year average net income.", "<", "0..60"),
    // -- Profitability --
    factor!("ROE", Profitability, "Return on equity: net income / equity, percent.", ">", "-50..50"),
    factor!("ROA", Profitability, "Return on assets: net income / assets, percent.", ">", "-30..30"),
    factor!("ROIC", Profitability, "After-tax operating income over invested capital, percent.", ">", "-30..40"),
    factor!("GPM", Profitability, "Gross profit margin, percent.", ">", "0..100"),
    factor!("OPM", Profitability, "Operating margin, percent.", ">", "-50..50"),
    factor!("NPM", Profitability, "Net margin, percent.", ">", "-50..50"),
    factor!("OPERATING_MARGIN", Profitability, "Alias of OPM.", ">", "-50..50"),
    factor!("NET_MARGIN", Profitability, "Alias of NPM.", ">", "-50..50"),
    // -- Growth --
    factor!("REVENUE_GROWTH_1Y", Growth, "Latest annual revenue vs prior annual, percent.", ">", "-50..100"),
    factor!("REVENUE_GROWTH_3Y", Growth, "Three-year revenue CAGR, percent.", ">", "-30..60"),
    factor!("REVENUE_GROWTH_YOY", Growth, "Same fiscal period vs one year earlier, percent.", ">", "-50..100"),
    factor!("REVENUE_GROWTH_QOQ", Growth, "Adjacent fiscal periods, percent.", ">", "-50..100"),
    factor!("EARNINGS_GROWTH_1Y", Growth, "Latest annual net income vs prior annual, percent.", ">", "-100..200"),
    factor!("EARNINGS_GROWTH_3Y", Growth, "Three-year net income CAGR, percent.", ">", "-50..100"),
    factor!("EARNINGS_GROWTH_YOY", Growth, "Net income vs same period last year, percent.", ">", "-100..200"),
    factor!("OCF_GROWTH_1Y", Growth, "Operating cash flow growth, annual, percent.", ">", "-100..200"),
    factor!("ASSET_GROWTH_1Y", Growth, "Total asset growth, annual, percent.", ">", "-30..60"),
    factor!("BOOK_VALUE_GROWTH_1Y", Growth, "Total equity growth, annual, percent.", ">", "-30..60"),
    factor!("SUSTAINABLE_GROWTH_RATE", Growth, "ROE times retention ratio, percent.", ">", "-30..40"),
    // -- Momentum --
    factor!("MOMENTUM_1M", Momentum, "Close vs 20 trading days ago, percent.", ">", "-30..30"),
    factor!("MOMENTUM_3M", Momentum, "Close vs 60 trading days ago, percent.", ">", "-40..40"),
    factor!("MOMENTUM_6M", Momentum, "Close vs 120 trading days ago, percent.", ">", "-50..60"),
    factor!("MOMENTUM_12M", Momentum, "Close vs 240 trading days ago, percent.", ">", "-60..100"),
    factor!("RETURN_1M", Momentum, "Alias of MOMENTUM_1M.", ">", "-30..30"),
    factor!("RETURN_3M", Momentum, "Alias of MOMENTUM_3M.", ">", "-40..40"),
    factor!("RETURN_6M", Momentum, "Alias of MOMENTUM_6M.", ">", "-50..60"),
    factor!("RETURN_12M", Momentum, "Alias of MOMENTUM_12M.", ">", "-60..100"),
    factor!("DISTANCE_FROM_52W_HIGH", Momentum, "Close vs trailing 252-day high, percent (<= 0).", ">", "-80..0"),
    factor!("DISTANCE_FROM_52W_LOW", Momentum, "Close vs trailing 252-day low, percent (>= 0).", ">", "0..200"),
    factor!("RELATIVE_STRENGTH", Momentum, "3-month return minus the universe mean, percentage points.", ">", "-50..50"),
    factor!("VOLUME_MOMENTUM", Momentum, "20-day vs 60-day average volume, percent.", ">", "-80..200"),
    factor!("CHANGE_RATE", Momentum, "Day-over-day close change, percent.", ">", "-30..30"),
    // -- Volatility / risk --
    factor!("VOLATILITY", Volatility, "Annualised 60-day return stdev, percent.", "<", "0..150"),
    factor!("VOLATILITY_20D", Volatility, "Annualised 20-day return stdev, percent.", "<", "0..150"),
    factor!("VOLATILITY_60D", Volatility, "Alias of VOLATILITY.", "<", "0..150"),
    factor!("VOLATILITY_90D", Volatility, "Annualised 90-day return stdev, percent.", "<", "0..150"),
    factor!("DOWNSIDE_VOLATILITY", Volatility, "Annualised stdev of negative daily returns, 60-day window.", "<", "0..100"),
    factor!("BETA", Volatility, "60-day beta against the equal-weight universe return.", "<", "-1..3"),
    factor!("MAX_DRAWDOWN", Volatility, "Worst peak-to-trough of the trailing year, percent.", "<", "0..90"),
    factor!("SHARPE_RATIO", Volatility, "Trailing-year annualised return over volatility.", ">", "-3..5"),
    // -- Liquidity --
    factor!("AVG_TRADING_VALUE", Liquidity, "20-day mean daily traded value (KRW).", ">", ">0"),
    factor!("TURNOVER_RATE", Liquidity, "20-day average volume over shares outstanding, percent.", ">", "0..50"),
    factor!("MARKET_CAP", Liquidity, "Market capitalisation on the calc date (KRW).", ">", ">0"),
    // -- Technical --
    factor!("BOLLINGER_POSITION", Technical, "(close - MA20) / (2 x 20-day stdev).", "<", "-2..2"),
    factor!("BOLLINGER_WIDTH", Technical, "4 x 20-day stdev / MA20, percent.", "<", "0..50"),
    factor!("RSI", Technical, "Alias of RSI_14.", "<", "0..100"),
    factor!("RSI_14", Technical, "14-day Wilder relative strength index.", "<", "0..100"),
    factor!("MACD", Technical, "EMA12 - EMA26 of close.", ">", "unbounded"),
    factor!("MACD_SIGNAL", Technical, "9-day EMA of MACD.", ">", "unbounded"),
    factor!("MACD_HISTOGRAM", Technical, "MACD - signal line.", ">", "unbounded"),
    factor!("MA_5", Technical, "5-day simple moving average of close.", ">", ">0"),
    factor!("MA_10", Technical, "10-day simple moving average of close.", ">", ">0"),
    factor!("MA_20", Technical, "20-day simple moving average of close.", ">", ">0"),
    factor!("MA_50", Technical, "50-day simple moving average of close.", ">", ">0"),
    factor!("MA_60", Technical, "60-day simple moving average of close.", ">", ">0"),
    factor!("MA_120", Technical, "120-day simple moving average of close.", ">", ">0"),
    factor!("MA_200", Technical, "200-day simple moving average of close.", ">", ">0"),
    factor!("MA_250", Technical, "250-day simple moving average of close.", ">", ">0"),
    factor!("STOCHASTIC_14", Technical, "14-day stochastic %K.", "<", "0..100"),
    // -- Quality / stability --
    factor!("CURRENT_RATIO", Quality, "Current assets / current liabilities, percent.", ">", "50..500"),
    factor!("QUICK_RATIO", Quality, "(Current assets - inventory) / current liabilities, percent.", ">", "30..400"),
    factor!("CASH_RATIO", Quality, "Cash / current liabilities, percent.", ">", "0..300"),
    factor!("DEBT_TO_EQUITY", Quality, "Total liabilities / equity, percent.", "<", "0..400"),
    factor!("DEBT_RATIO", Quality, "Total liabilities / assets, percent.", "<", "0..100"),
    factor!("INTEREST_COVERAGE", Quality, "Operating income / interest expense.", ">", "0..50"),
    factor!("PIOTROSKI_F_SCORE", Quality, "Count of passing quality signals vs prior annual record.", ">", "0..8"),
    factor!("ALTMAN_Z_SCORE", Quality, "Bankruptcy-distance composite.", ">", "-2..10"),
    factor!("EARNINGS_QUALITY", Quality, "Operating cash flow / net income.", ">", "0..3"),
    factor!("ACCRUALS_RATIO", Quality, "(Net income - OCF) / assets, percent.", "<", "-20..20"),
    // -- Dividend --
    factor!("DIVIDEND_PAYOUT", Dividend, "Dividends paid / net income, percent.", ">", "0..100"),
];

/// Alias -> canonical factor whose values it shares.
pub fn alias_of(name: &str) -> Option<&'static str> {
    match name {
        "RETURN_1M" => Some("MOMENTUM_1M"),
        "RETURN_3M" => Some("MOMENTUM_3M"),
        "RETURN_6M" => Some("MOMENTUM_6M"),
        "RETURN_12M" => Some("MOMENTUM_12M"),
        "RSI" => Some("RSI_14"),
        "VOLATILITY_60D" => Some("VOLATILITY"),
        "OPERATING_MARGIN" => Some("OPM"),
        "NET_MARGIN" => Some("NPM"),
        _ => None,
    }
}

pub fn family_of(name: &str) -> Option<Family> {
    CATALOG.iter().find(|f| f.name == name).map(|f| f.family)
}

pub fn is_known_factor(name: &str) -> bool {
    CATALOG.iter().any(|f| f.name == name)
}

pub fn all_factor_names() -> Vec<&'static str> {
    CATALOG.iter().map(|f| f.name).collect()
}

/// Per-factor boolean selector over the vocabulary. Built by the dependency
/// analyser; families with no selected factor are skipped entirely.
#[derive(Debug, Clone)]
pub struct ComputeMask {
    required: FxHashSet<String>,
    /// Empty required set means "compute everything".
    compute_all: bool,
}

impl ComputeMask {
    pub fn all() -> Self {
        Self {
            required: FxHashSet::default(),
            compute_all: true,
        }
    }

    pub fn from_required(required: FxHashSet<String>) -> Self {
        if required.is_empty() {
            return Self::all();
        }
        // An alias requires its canonical factor too.
        let mut expanded = required.clone();
        for name in &required {
            if let Some(canon) = alias_of(name) {
                expanded.insert(canon.to_string());
            }
        }
        Self {
            required: expanded,
            compute_all: false,
        }
    }

    pub fn wants(&self, factor: &str) -> bool {
        self.compute_all || self.required.contains(factor)
    }

    pub fn wants_family(&self, family: Family) -> bool {
        if self.compute_all {
            return true;
        }
        CATALOG
            .iter()
            .any(|f| f.family == family && self.required.contains(f.name))
            // Unknown factors carry no family; they never enable one.
    }

    pub fn is_all(&self) -> bool {
        self.compute_all
    }

    /// Stable key fragment for cache isolation of differently-masked tables.
    /// The strategy hash already isolates strategies; this is informative
    /// only and intentionally not part of the cache key format.
    pub fn required_sorted(&self) -> Vec<&str> {
        let mut v: Vec<&str> = self.required.iter().map(String::as_str).collect();
        v.sort_unstable();
        v
    }

    /// Map `{factor -> bool}` over the whole vocabulary.
    pub fn as_map(&self) -> Vec<(&'static str, bool)> {
        CATALOG.iter().map(|f| (f.name, self.wants(f.name))).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_names_unique() {
        let mut names: Vec<&str> = CATALOG.iter().map(|f| f.name).collect();
        let before = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(before, names.len());
    }

    #[test]
    fn core_screen_factors_present() {
        for name in ["MOMENTUM_1M", "ROE", "PER", "VOLATILITY", "RSI_14"] {
            assert!(is_known_factor(name), "{name} missing from catalogue");
        }
    }

    #[test]
    fn aliases_resolve_to_known_factors() {
        for info in CATALOG {
            if let Some(canon) = alias_of(info.name) {
                assert!(is_known_factor(canon));
            }
        }
    }

    #[test]
    fn mask_family_skipping() {
        let mut required = FxHashSet::default();
        required.insert("MOMENTUM_1M".to_string());
        let mask = ComputeMask::from_required(required);
        assert!(mask.wants_family(Family::Momentum));
        assert!(!mask.wants_family(Family::Valuation));
        assert!(!mask.wants("PER"));
        assert!(mask.wants("MOMENTUM_1M"));
    }

    #[test]
    fn empty_mask_computes_everything() {
        let mask = ComputeMask::from_required(FxHashSet::default());
        assert!(mask.is_all());
        assert!(mask.wants("PER"));
        assert!(mask.wants_family(Family::Dividend));
    }

    #[test]
    fn alias_pulls_canonical() {
        let mut required = FxHashSet::default();
        required.insert("RETURN_3M".to_string());
        let mask = ComputeMask::from_required(required);
        assert!(mask.wants("MOMENTUM_3M"));
    }
}
