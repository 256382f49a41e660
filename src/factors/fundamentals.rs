//! Fundamental records, publication-delay accounting and the shared
//! arithmetic for every fundamental-derived factor.
//!
//! All three factor backends call [`compute_fundamental_factors`]; they only
//! differ in how the price families are vectorised. The anti-look-ahead
//! invariant lives here: every record consulted for a simulated day `d` has
//! `available_date <= d`.

use chrono::{Datelike, Days, NaiveDate};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use super::registry::ComputeMask;

// Canonical account names produced by the price-store adapter.
pub const ACC_REVENUE: &str = "revenue";
pub const ACC_COGS: &str = "cost_of_goods_sold";
pub const ACC_OPERATING_INCOME: &str = "operating_income";
pub const ACC_NET_INCOME: &str = "net_income";
pub const ACC_TOTAL_ASSETS: &str = "total_assets";
pub const ACC_TOTAL_EQUITY: &str = "total_equity";
pub const ACC_TOTAL_LIABILITIES: &str = "total_liabilities";
pub const ACC_CURRENT_ASSETS: &str = "current_assets";
pub const ACC_CURRENT_LIABILITIES: &str = "current_liabilities";
pub const ACC_CASH: &str = "cash_and_equivalents";
pub const ACC_INVENTORY: &str = "inventory";
pub const ACC_OCF: &str = "operating_cash_flow";
pub const ACC_CAPEX: &str = "capital_expenditure";
pub const ACC_DEPRECIATION: &str = "depreciation";
pub const ACC_DIVIDENDS: &str = "dividends_paid";
pub const ACC_INTEREST: &str = "interest_expense";
pub const ACC_RETAINED: &str = "retained_earnings";
pub const ACC_INTANGIBLES: &str = "intangible_assets";

pub const ALL_ACCOUNTS: [&str; 18] = [
    ACC_REVENUE,
    ACC_COGS,
    ACC_OPERATING_INCOME,
    ACC_NET_INCOME,
    ACC_TOTAL_ASSETS,
    ACC_TOTAL_EQUITY,
    ACC_TOTAL_LIABILITIES,
    ACC_CURRENT_ASSETS,
    ACC_CURRENT_LIABILITIES,
    ACC_CASH,
    ACC_INVENTORY,
    ACC_OCF,
    ACC_CAPEX,
    ACC_DEPRECIATION,
    ACC_DIVIDENDS,
    ACC_INTEREST,
    ACC_RETAINED,
    ACC_INTANGIBLES,
];

/// DART report codes with their fiscal period ends and publication delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportCode {
    /// 11011: annual report, published within 90 days.
    Annual,
    /// 11012: semi-annual, 60 days.
    SemiAnnual,
    /// 11013: Q1, 45 days.
    Q1,
    /// 11014: Q3, 45 days.
    Q3,
}

impl ReportCode {
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "11011" => Some(ReportCode::Annual),
            "11012" => Some(ReportCode::SemiAnnual),
            "11013" => Some(ReportCode::Q1),
            "11014" => Some(ReportCode::Q3),
            _ => None,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            ReportCode::Annual => "11011",
            ReportCode::SemiAnnual => "11012",
            ReportCode::Q1 => "11013",
            ReportCode::Q3 => "11014",
        }
    }

    /// Fiscal period end for a fiscal year.
    pub fn report_date(self, fiscal_year: i32) -> NaiveDate {
        let (m, d) = match self {
            ReportCode::Annual => (12, 31),
            ReportCode::SemiAnnual => (6, 30),
            ReportCode::Q1 => (3, 31),
            ReportCode::Q3 => (9, 30),
        };
        NaiveDate::from_ymd_opt(fiscal_year, m, d).expect("valid fiscal period end")
    }

    pub fn publication_delay_days(self) -> u64 {
        match self {
            ReportCode::Annual => 90,
            ReportCode::SemiAnnual => 60,
            ReportCode::Q1 | ReportCode::Q3 => 45,
        }
    }

    /// `available_date = report_date + publication_delay`.
    pub fn available_date(self, fiscal_year: i32) -> NaiveDate {
        self.report_date(fiscal_year) + Days::new(self.publication_delay_days())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundamentalRecord {
    pub stock: String,
    pub fiscal_year: i32,
    pub report_code: ReportCode,
    pub report_date: NaiveDate,
    pub available_date: NaiveDate,
    pub accounts: FxHashMap<String, f64>,
}

impl FundamentalRecord {
    pub fn new(
        stock: impl Into<String>,
        fiscal_year: i32,
        report_code: ReportCode,
        accounts: FxHashMap<String, f64>,
    ) -> Self {
        Self {
            stock: stock.into(),
            fiscal_year,
            report_code,
            report_date: report_code.report_date(fiscal_year),
            available_date: report_code.available_date(fiscal_year),
            accounts,
        }
    }

    pub fn account(&self, name: &str) -> f64 {
        self.accounts.get(name).copied().unwrap_or(f64::NAN)
    }
}

/// Per-stock fundamental record history, sorted by report date.
#[derive(Debug, Default, Clone)]
pub struct FundamentalHistory {
    by_stock: FxHashMap<String, Vec<FundamentalRecord>>,
}

impl FundamentalHistory {
    pub fn from_records(records: Vec<FundamentalRecord>) -> Self {
        let mut by_stock: FxHashMap<String, Vec<FundamentalRecord>> = FxHashMap::default();
        for record in records {
            by_stock.entry(record.stock.clone()).or_default().push(record);
        }
        for list in by_stock.values_mut() {
            list.sort_by_key(|r| (r.report_date, r.available_date));
        }
        Self { by_stock }
    }

    pub fn is_empty(&self) -> bool {
        self.by_stock.is_empty()
    }

    /// Records usable on day `d`: `available_date <= d`, report-date order.
    fn available(&self, stock: &str, d: NaiveDate) -> impl Iterator<Item = &FundamentalRecord> {
        self.by_stock
            .get(stock)
            .into_iter()
            .flatten()
            .filter(move |r| r.available_date <= d)
    }

    /// The latest record usable on day `d`.
    pub fn latest(&self, stock: &str, d: NaiveDate) -> Option<&FundamentalRecord> {
        self.available(stock, d).max_by_key(|r| r.report_date)
    }

    /// Annual records usable on day `d`, ascending by fiscal year.
    pub fn annuals(&self, stock: &str, d: NaiveDate) -> Vec<&FundamentalRecord> {
        self.available(stock, d)
            .filter(|r| r.report_code == ReportCode::Annual)
            .collect()
    }

    /// Same report code, previous fiscal year (YOY base).
    pub fn year_over_year_base(
        &self,
        stock: &str,
        latest: &FundamentalRecord,
        d: NaiveDate,
    ) -> Option<&FundamentalRecord> {
        self.available(stock, d).find(|r| {
            r.report_code == latest.report_code && r.fiscal_year == latest.fiscal_year - 1
        })
    }

    /// Immediately preceding report by report date (QOQ base).
    pub fn previous_period(
        &self,
        stock: &str,
        latest: &FundamentalRecord,
        d: NaiveDate,
    ) -> Option<&FundamentalRecord> {
        self.available(stock, d)
            .filter(|r| r.report_date < latest.report_date)
            .max_by_key(|r| r.report_date)
    }
}

/// num / den, undefined for non-positive denominators.
fn ratio(num: f64, den: f64) -> f64 {
    if den > 0.0 {
        num / den
    } else {
        f64::NAN
    }
}

/// Percent growth; undefined for a non-positive base.
fn growth_pct(current: f64, base: f64) -> f64 {
    if base > 0.0 {
        (current / base - 1.0) * 100.0
    } else {
        f64::NAN
    }
}

const ROIC_TAX_RATE: f64 = 0.25;

/// All fundamental-derived factor values for one stock on one day.
/// `market_cap` is the calc-date market cap. NaN values are filtered to
/// null at the table boundary.
#[allow(clippy::too_many_lines)]
pub fn compute_fundamental_factors(
    history: &FundamentalHistory,
    stock: &str,
    d: NaiveDate,
    market_cap: f64,
    mask: &ComputeMask,
    out: &mut Vec<(&'static str, f64)>,
) {
    let Some(latest) = history.latest(stock, d) else {
        return;
    };

    let revenue = latest.account(ACC_REVENUE);
    let cogs = latest.account(ACC_COGS);
    let op = latest.account(ACC_OPERATING_INCOME);
    let ni = latest.account(ACC_NET_INCOME);
    let assets = latest.account(ACC_TOTAL_ASSETS);
    let equity = latest.account(ACC_TOTAL_EQUITY);
    let liabilities = latest.account(ACC_TOTAL_LIABILITIES);
    let ca = latest.account(ACC_CURRENT_ASSETS);
    let cl = latest.account(ACC_CURRENT_LIABILITIES);
    let cash = latest.account(ACC_CASH);
    let inventory = latest.account(ACC_INVENTORY);
    let ocf = latest.account(ACC_OCF);
    let capex = latest.account(ACC_CAPEX);
    let depreciation = latest.account(ACC_DEPRECIATION);
    let dividends = latest.account(ACC_DIVIDENDS);
    let interest = latest.account(ACC_INTEREST);
    let retained = latest.account(ACC_RETAINED);
    let intangibles = latest.account(ACC_INTANGIBLES);

    let ev = market_cap + liabilities - cash;

    let mut put = |name: &'static str, value: f64| {
        if mask.wants(name) {
            out.push((name, value));
        }
    };

    // Valuation
    put("PER", ratio(market_cap, ni));
    put("PBR", ratio(market_cap, equity));
    put("PSR", ratio(market_cap, revenue));
    put("PCR", ratio(market_cap, ocf));
    put("EV", ev);
    put("EV_EBITDA", ratio(ev, op + depreciation));
    put("EV_SALES", ratio(ev, revenue));
    put("DIVIDEND_YIELD", ratio(dividends, market_cap) * 100.0);
    put("EARNINGS_YIELD", ratio(ni, market_cap) * 100.0);
    put("FCF_YIELD", ratio(ocf - capex, market_cap) * 100.0);
    put("BOOK_TO_MARKET", ratio(equity, market_cap));
    put("PTBV", ratio(market_cap, equity - intangibles));

    // Profitability
    let roe = ratio(ni, equity) * 100.0;
    put("ROE", roe);
    put("ROA", ratio(ni, assets) * 100.0);
    put(
        "ROIC",
        ratio(op * (1.0 - ROIC_TAX_RATE), equity + liabilities - cash) * 100.0,
    );
    put("GPM", ratio(revenue - cogs, revenue) * 100.0);
    let opm = ratio(op, revenue) * 100.0;
    let npm = ratio(ni, revenue) * 100.0;
    put("OPM", opm);
    put("NPM", npm);
    put("OPERATING_MARGIN", opm);
    put("NET_MARGIN", npm);

    // Quality
    put("CURRENT_RATIO", ratio(ca, cl) * 100.0);
    put("QUICK_RATIO", ratio(ca - inventory, cl) * 100.0);
    put("CASH_RATIO", ratio(cash, cl) * 100.0);
    put("DEBT_TO_EQUITY", ratio(liabilities, equity) * 100.0);
    put("DEBT_RATIO", ratio(liabilities, assets) * 100.0);
    put("INTEREST_COVERAGE", ratio(op, interest));
    put("EARNINGS_QUALITY", if ni > 0.0 { ocf / ni } else { f64::NAN });
    put("ACCRUALS_RATIO", ratio(ni - ocf, assets) * 100.0);
    put(
        "ALTMAN_Z_SCORE",
        1.2 * ratio(ca - cl, assets)
            + 1.4 * ratio(retained, assets)
            + 3.3 * ratio(op, assets)
            + 0.6 * ratio(market_cap, liabilities)
            + ratio(revenue, assets),
    );

    // Dividend
    put("DIVIDEND_PAYOUT", if ni > 0.0 { dividends / ni * 100.0 } else { f64::NAN });
    put(
        "SUSTAINABLE_GROWTH_RATE",
        if ni > 0.0 {
            roe * (1.0 - dividends / ni)
        } else {
            f64::NAN
        },
    );

    // Growth vs annual records
    let annuals = history.annuals(stock, d);
    if let [.., prev, last] = annuals.as_slice() {
        put(
            "REVENUE_GROWTH_1Y",
            growth_pct(last.account(ACC_REVENUE), prev.account(ACC_REVENUE)),
        );
        put(
            "EARNINGS_GROWTH_1Y",
            growth_pct(last.account(ACC_NET_INCOME), prev.account(ACC_NET_INCOME)),
        );
        put(
            "OCF_GROWTH_1Y",
            growth_pct(last.account(ACC_OCF), prev.account(ACC_OCF)),
        );
        put(
            "ASSET_GROWTH_1Y",
            growth_pct(last.account(ACC_TOTAL_ASSETS), prev.account(ACC_TOTAL_ASSETS)),
        );
        put(
            "BOOK_VALUE_GROWTH_1Y",
            growth_pct(last.account(ACC_TOTAL_EQUITY), prev.account(ACC_TOTAL_EQUITY)),
        );
        put(
            "PEG",
            ratio(
                ratio(market_cap, ni),
                growth_pct(last.account(ACC_NET_INCOME), prev.account(ACC_NET_INCOME)),
            ),
        );
        put("PIOTROSKI_F_SCORE", piotroski_score(last, prev));
    }
    if annuals.len() >= 4 {
        let last = annuals[annuals.len() - 1];
        let base = annuals[annuals.len() - 4];
        put(
            "REVENUE_GROWTH_3Y",
            cagr_pct(last.account(ACC_REVENUE), base.account(ACC_REVENUE), 3.0),
        );
        put(
            "EARNINGS_GROWTH_3Y",
            cagr_pct(last.account(ACC_NET_INCOME), base.account(ACC_NET_INCOME), 3.0),
        );
    }
    if !annuals.is_empty() {
        let take = annuals.len().min(3);
        let mean_ni: f64 = annuals[annuals.len() - take..]
            .iter()
            .map(|r| r.account(ACC_NET_INCOME))
            .sum::<f64>()
            / take as f64;
        put("CAPE_RATIO", ratio(market_cap, mean_ni));
    }

    // YOY / QOQ against the latest record's own cadence
    if let Some(base) = history.year_over_year_base(stock, latest, d) {
        put(
            "REVENUE_GROWTH_YOY",
            growth_pct(revenue, base.account(ACC_REVENUE)),
        );
        put(
            "EARNINGS_GROWTH_YOY",
            growth_pct(ni, base.account(ACC_NET_INCOME)),
        );
    }
    if let Some(base) = history.previous_period(stock, latest, d) {
        put(
            "REVENUE_GROWTH_QOQ",
            growth_pct(revenue, base.account(ACC_REVENUE)),
        );
    }
}

/// CAGR in percent; undefined when either endpoint is non-positive.
fn cagr_pct(current: f64, base: f64, years: f64) -> f64 {
    if current > 0.0 && base > 0.0 {
        ((current / base).powf(1.0 / years) - 1.0) * 100.0
    } else {
        f64::NAN
    }
}

/// Piotroski-style quality score over the signals computable from the
/// account set, compared against the prior annual record. Range 0..=8.
fn piotroski_score(last: &FundamentalRecord, prev: &FundamentalRecord) -> f64 {
    let mut score = 0.0;
    let roa = |r: &FundamentalRecord| ratio(r.account(ACC_NET_INCOME), r.account(ACC_TOTAL_ASSETS));
    let leverage =
        |r: &FundamentalRecord| ratio(r.account(ACC_TOTAL_LIABILITIES), r.account(ACC_TOTAL_ASSETS));
    let current = |r: &FundamentalRecord| {
        ratio(r.account(ACC_CURRENT_ASSETS), r.account(ACC_CURRENT_LIABILITIES))
    };
    let gross_margin = |r: &FundamentalRecord| {
        ratio(
            r.account(ACC_REVENUE) - r.account(ACC_COGS),
            r.account(ACC_REVENUE),
        )
    };
    let turnover =
        |r: &FundamentalRecord| ratio(r.account(ACC_REVENUE), r.account(ACC_TOTAL_ASSETS));

    if last.account(ACC_NET_INCOME) > 0.0 {
        score += 1.0;
    }
    if last.account(ACC_OCF) > 0.0 {
        score += 1.0;
    }
    if last.account(ACC_OCF) > last.account(ACC_NET_INCOME) {
        score += 1.0;
    }
    if roa(last) > roa(prev) {
        score += 1.0;
    }
    if leverage(last) < leverage(prev) {
        score += 1.0;
    }
    if current(last) > current(prev) {
        score += 1.0;
    }
    if gross_margin(last) > gross_margin(prev) {
        score += 1.0;
    }
    if turnover(last) > turnover(prev) {
        score += 1.0;
    }
    score
}
