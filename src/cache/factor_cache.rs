//! Two-tier cache of factor tables and price windows.
//!
//! Tier 1 is a bounded in-process LRU of decompressed tables; tier 2 is the
//! remote KV store holding LZ4-compressed postcard payloads with a 30-day
//! TTL. Remote failures are logged and treated as misses; nothing in this
//! module ever propagates an error to the engine.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use lru::LruCache;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{de::DeserializeOwned, Serialize};

use super::KvStore;
use crate::data::SeriesMap;
use crate::factors::table::FactorTable;

const LRU_CAPACITY: usize = 500;
pub const FACTOR_PREFIX: &str = "backtest_optimized";
pub const PRICE_PREFIX: &str = "price_data";

/// `backtest_optimized:factors:{YYYY-MM-DD}:{sorted-themes-or-all}:{hash8}`
pub fn factor_key(date: NaiveDate, universe_key: &str, strategy_hash: &str) -> String {
    format!("{FACTOR_PREFIX}:factors:{date}:{universe_key}:{strategy_hash}")
}

/// `price_data:{start}:{end}:{themes-csv}:{stocks-csv}`
pub fn price_key(start: NaiveDate, end: NaiveDate, themes_csv: &str, stocks_csv: &str) -> String {
    format!("{PRICE_PREFIX}:{start}:{end}:{themes_csv}:{stocks_csv}")
}

pub struct FactorCache {
    remote: Option<Arc<dyn KvStore>>,
    lru: Mutex<LruCache<String, Arc<FactorTable>>>,
    ttl: Duration,
    remote_errors: AtomicU64,
}

impl FactorCache {
    pub fn new(remote: Option<Arc<dyn KvStore>>, ttl: Duration) -> Self {
        Self {
            remote,
            lru: Mutex::new(LruCache::new(
                NonZeroUsize::new(LRU_CAPACITY).expect("nonzero"),
            )),
            ttl,
            remote_errors: AtomicU64::new(0),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, Duration::from_secs(0))
    }

    pub fn remote_error_count(&self) -> u64 {
        self.remote_errors.load(Ordering::Relaxed)
    }

    fn note_remote_error(&self, context: &str, err: &anyhow::Error) {
        self.remote_errors.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(%context, error = %err, "remote cache error; treating as miss");
    }

    /// Batch factor-table lookup: LRU first, remaining keys via one MGET,
    /// payloads decompressed on the blocking pool so deserialisation
    /// overlaps network I/O.
    pub async fn get_factors_batch(
        &self,
        dates: &[NaiveDate],
        universe_key: &str,
        strategy_hash: &str,
    ) -> FxHashMap<NaiveDate, Arc<FactorTable>> {
        let mut found: FxHashMap<NaiveDate, Arc<FactorTable>> = FxHashMap::default();
        let mut miss_dates: Vec<NaiveDate> = Vec::new();
        let mut miss_keys: Vec<String> = Vec::new();

        {
            let mut lru = self.lru.lock();
            for &date in dates {
                let key = factor_key(date, universe_key, strategy_hash);
                if let Some(table) = lru.get(&key) {
                    found.insert(date, Arc::clone(table));
                } else {
                    miss_dates.push(date);
                    miss_keys.push(key);
                }
            }
        }
        let memory_hits = found.len();

        if let (Some(remote), false) = (&self.remote, miss_keys.is_empty()) {
            match remote.mget(&miss_keys).await {
                Ok(payloads) => {
                    // Decompress on the blocking pool, all payloads in
                    // flight at once so deserialisation overlaps I/O.
                    let tasks = payloads.into_iter().map(|payload| {
                        tokio::task::spawn_blocking(move || {
                            payload.and_then(|bytes| decode::<FactorTable>(&bytes))
                        })
                    });
                    let decoded = futures::future::join_all(tasks).await;
                    for (i, task) in decoded.into_iter().enumerate() {
                        if let Ok(Some(mut table)) = task {
                            table.reindex();
                            let table = Arc::new(table);
                            found.insert(miss_dates[i], Arc::clone(&table));
                            self.lru.lock().put(miss_keys[i].clone(), table);
                        }
                    }
                }
                Err(err) => self.note_remote_error("get_factors_batch", &err),
            }
        }

        tracing::debug!(
            requested = dates.len(),
            memory_hits,
            total_hits = found.len(),
            "factor cache batch read"
        );
        found
    }

    /// Write tables to both tiers. Serialisation and compression run on the
    /// blocking pool; the remote write is one MSET plus batched EXPIRE.
    pub async fn set_factors_batch(
        &self,
        tables: &[Arc<FactorTable>],
        universe_key: &str,
        strategy_hash: &str,
    ) {
        if tables.is_empty() {
            return;
        }

        let mut pairs = Vec::with_capacity(tables.len());
        {
            let mut lru = self.lru.lock();
            for table in tables {
                let key = factor_key(table.date, universe_key, strategy_hash);
                lru.put(key.clone(), Arc::clone(table));
                pairs.push((key, Arc::clone(table)));
            }
        }

        let Some(remote) = &self.remote else { return };

        let encoded = tokio::task::spawn_blocking(move || {
            pairs
                .into_iter()
                .filter_map(|(key, table)| encode(table.as_ref()).map(|bytes| (key, bytes)))
                .collect::<Vec<_>>()
        })
        .await
        .unwrap_or_default();

        if let Err(err) = remote.mset(encoded, self.ttl).await {
            self.note_remote_error("set_factors_batch", &err);
        }
    }

    /// Cached raw price window (pre corporate-action filtering).
    pub async fn get_price_window(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        themes_csv: &str,
        stocks_csv: &str,
    ) -> Option<SeriesMap> {
        let remote = self.remote.as_ref()?;
        let key = price_key(start, end, themes_csv, stocks_csv);
        match remote.get(&key).await {
            Ok(Some(bytes)) => {
                tokio::task::spawn_blocking(move || decode::<SeriesMap>(&bytes))
                    .await
                    .ok()
                    .flatten()
            }
            Ok(None) => None,
            Err(err) => {
                self.note_remote_error("get_price_window", &err);
                None
            }
        }
    }

    pub async fn set_price_window(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        themes_csv: &str,
        stocks_csv: &str,
        series: &SeriesMap,
    ) {
        let Some(remote) = &self.remote else { return };
        let key = price_key(start, end, themes_csv, stocks_csv);
        let owned = series.clone();
        let Some(bytes) = tokio::task::spawn_blocking(move || encode(&owned))
            .await
            .ok()
            .flatten()
        else {
            return;
        };
        let ratio = bytes.len() as f64;
        tracing::debug!(key = %key, compressed_bytes = ratio, "price window cached");
        if let Err(err) = remote.set(&key, bytes, self.ttl).await {
            self.note_remote_error("set_price_window", &err);
        }
    }

    /// Drop every remote entry under `prefix` and clear the in-process tier.
    pub async fn invalidate(&self, prefix: &str) -> u64 {
        self.lru.lock().clear();
        match &self.remote {
            Some(remote) => match remote.del_prefix(prefix).await {
                Ok(count) => count,
                Err(err) => {
                    self.note_remote_error("invalidate", &err);
                    0
                }
            },
            None => 0,
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Option<Vec<u8>> {
    match postcard::to_allocvec(value) {
        Ok(raw) => Some(lz4_flex::compress_prepend_size(&raw)),
        Err(err) => {
            tracing::warn!(error = %err, "cache serialisation failed");
            None
        }
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Option<T> {
    let raw = lz4_flex::decompress_size_prepended(bytes).ok()?;
    match postcard::from_bytes(&raw) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(error = %err, "cache deserialisation failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryKv;

    fn table(date: NaiveDate) -> Arc<FactorTable> {
        let mut t = FactorTable::new(date, vec!["005930".into(), "000660".into()]);
        t.insert_column("PER", vec![Some(9.5), None]);
        Arc::new(t)
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    #[tokio::test]
    async fn round_trip_through_both_tiers() {
        let kv = Arc::new(InMemoryKv::new());
        let cache = FactorCache::new(Some(kv.clone()), Duration::from_secs(60));

        cache
            .set_factors_batch(&[table(day(4)), table(day(5))], "all", "abcd1234")
            .await;

        // Warm LRU hit.
        let got = cache.get_factors_batch(&[day(4), day(5), day(6)], "all", "abcd1234").await;
        assert_eq!(got.len(), 2);
        assert_eq!(got[&day(4)].value("005930", "PER"), Some(9.5));

        // Cold path: fresh cache instance, same remote.
        let cold = FactorCache::new(Some(kv), Duration::from_secs(60));
        let got = cold.get_factors_batch(&[day(4)], "all", "abcd1234").await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[&day(4)].value("005930", "PER"), Some(9.5));
        assert_eq!(got[&day(4)].value("000660", "PER"), None);
    }

    #[tokio::test]
    async fn strategy_hash_isolates_entries() {
        let kv = Arc::new(InMemoryKv::new());
        let cache = FactorCache::new(Some(kv), Duration::from_secs(60));

        cache.set_factors_batch(&[table(day(4))], "all", "aaaaaaaa").await;

        let other = cache.get_factors_batch(&[day(4)], "all", "bbbbbbbb").await;
        assert!(other.is_empty(), "strategy B must not hit strategy A's entries");
        let same = cache.get_factors_batch(&[day(4)], "all", "aaaaaaaa").await;
        assert_eq!(same.len(), 1);
    }

    #[tokio::test]
    async fn universe_key_isolates_entries() {
        let kv = Arc::new(InMemoryKv::new());
        let cache = FactorCache::new(Some(kv), Duration::from_secs(60));
        cache.set_factors_batch(&[table(day(4))], "auto,semis", "aaaaaaaa").await;
        assert!(cache
            .get_factors_batch(&[day(4)], "all", "aaaaaaaa")
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn works_without_remote() {
        let cache = FactorCache::new(None, Duration::from_secs(60));
        cache.set_factors_batch(&[table(day(4))], "all", "aaaaaaaa").await;
        // In-process tier still serves.
        let got = cache.get_factors_batch(&[day(4)], "all", "aaaaaaaa").await;
        assert_eq!(got.len(), 1);
        assert_eq!(cache.remote_error_count(), 0);
    }

    #[tokio::test]
    async fn price_window_round_trip() {
        let kv = Arc::new(InMemoryKv::new());
        let cache = FactorCache::new(Some(kv), Duration::from_secs(60));

        let rows = crate::data::frame::rows_from_closes("AAA", day(4), &[100.0, 101.0], 1000.0);
        let refs: Vec<&crate::data::frame::PriceRow> = rows.iter().collect();
        let mut series = SeriesMap::default();
        for row in &refs {
            let entry = series.entry(row.stock.clone()).or_default();
            entry.dates.push(row.date);
            entry.open.push(row.bar.open);
            entry.high.push(row.bar.high);
            entry.low.push(row.bar.low);
            entry.close.push(row.bar.close);
            entry.volume.push(row.bar.volume);
            entry.trading_value.push(row.bar.trading_value);
            entry.market_cap.push(row.bar.market_cap);
            entry.shares.push(row.bar.shares_outstanding);
        }

        cache.set_price_window(day(1), day(29), "all", "", &series).await;
        let got = cache.get_price_window(day(1), day(29), "all", "").await.unwrap();
        assert_eq!(got["AAA"].close, vec![100.0, 101.0]);
        assert!(cache.get_price_window(day(1), day(28), "all", "").await.is_none());
    }

    #[test]
    fn key_formats() {
        assert_eq!(
            factor_key(day(4), "all", "ab12cd34"),
            "backtest_optimized:factors:2024-03-04:all:ab12cd34"
        );
        assert_eq!(
            price_key(day(1), day(29), "auto,semis", "005930"),
            "price_data:2024-03-01:2024-03-29:auto,semis:005930"
        );
    }

    #[tokio::test]
    async fn invalidate_clears_both_tiers() {
        let kv = Arc::new(InMemoryKv::new());
        let cache = FactorCache::new(Some(kv), Duration::from_secs(60));
        cache.set_factors_batch(&[table(day(4))], "all", "aaaaaaaa").await;
        let removed = cache.invalidate(FACTOR_PREFIX).await;
        assert_eq!(removed, 1);
        assert!(cache
            .get_factors_batch(&[day(4)], "all", "aaaaaaaa")
            .await
            .is_empty());
    }
}
