use chrono::NaiveDate;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Per-date factor values for a stock universe.
///
/// Column-major: one `Vec<Option<f32>>` per factor, indexed by the position
/// of the stock in `stocks`. `None` means "undefined for this stock on this
/// day" and fails every condition it feeds. This is the unit the cache
/// stores (postcard + LZ4) and the condition evaluator consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorTable {
    pub date: NaiveDate,
    pub stocks: Vec<String>,
    pub columns: FxHashMap<String, Vec<Option<f32>>>,
    #[serde(skip)]
    index: FxHashMap<String, usize>,
}

impl FactorTable {
    pub fn new(date: NaiveDate, stocks: Vec<String>) -> Self {
        let index = stocks
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i))
            .collect();
        Self {
            date,
            stocks,
            columns: FxHashMap::default(),
            index,
        }
    }

    /// Rebuild the stock index after deserialisation (the index itself is
    /// not serialised).
    pub fn reindex(&mut self) {
        self.index = self
            .stocks
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i))
            .collect();
    }

    pub fn len(&self) -> usize {
        self.stocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stocks.is_empty()
    }

    pub fn stock_index(&self, stock: &str) -> Option<usize> {
        self.index.get(stock).copied()
    }

    /// Insert a full column. Length must match the universe.
    pub fn insert_column(&mut self, name: impl Into<String>, values: Vec<Option<f32>>) {
        debug_assert_eq!(values.len(), self.stocks.len());
        self.columns.insert(name.into(), values);
    }

    pub fn column(&self, name: &str) -> Option<&[Option<f32>]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    pub fn value(&self, stock: &str, factor: &str) -> Option<f32> {
        let idx = self.stock_index(stock)?;
        self.columns.get(factor)?.get(idx).copied().flatten()
    }

    /// The full factor row for one stock, retained on positions for trade
    /// attribution. Ordered so snapshots serialise identically whether the
    /// table was computed fresh or decoded from cache.
    pub fn row(&self, stock: &str) -> std::collections::BTreeMap<String, f32> {
        let mut out = std::collections::BTreeMap::new();
        if let Some(idx) = self.stock_index(stock) {
            for (name, col) in &self.columns {
                if let Some(Some(v)) = col.get(idx) {
                    out.insert(name.clone(), *v);
                }
            }
        }
        out
    }

    pub fn factor_names(&self) -> Vec<&str> {
        self.columns.keys().map(String::as_str).collect()
    }

    /// Merge columns from another table over the same universe; existing
    /// columns are kept (cache-hit data wins over recomputation).
    pub fn absorb(&mut self, other: FactorTable) {
        for (name, col) in other.columns {
            self.columns.entry(name).or_insert(col);
        }
    }
}
