//! Offline cache warmer.
//!
//! Usage: `warm-cache <prices.parquet> [strategies.toml]`
//!
//! Loads the price export, connects the remote cache from the environment
//! and precomputes factor tables for the famous strategies over the
//! trailing year.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use factorlab::cache::factor_cache::FactorCache;
use factorlab::cache::redis::RedisKv;
use factorlab::cache::{InMemoryKv, KvStore};
use factorlab::config::Config;
use factorlab::data::frame::FrameStore;
use factorlab::warmer;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let Some(parquet_path) = args.next() else {
        bail!("usage: warm-cache <prices.parquet> [strategies.toml]");
    };
    let strategies = match args.next() {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {path}"))?;
            warmer::strategies_from_toml(&text)?
        }
        None => warmer::builtin_strategies(),
    };

    let config = Config::from_env();
    let remote: Arc<dyn KvStore> = match &config.redis_url {
        Some(url) => Arc::new(RedisKv::connect(url).await?),
        None => {
            tracing::warn!("REDIS_URL unset; warming an in-process cache only");
            Arc::new(InMemoryKv::new())
        }
    };
    let cache = FactorCache::new(Some(remote), config.cache_ttl);

    let store = Arc::new(FrameStore::from_parquet(&parquet_path, vec![])?);
    let today = chrono::Utc::now().date_naive();

    let bar = ProgressBar::new(strategies.len() as u64);
    bar.set_style(
        ProgressStyle::with_template("{bar:40} {pos}/{len} {msg}")
            .expect("valid progress template"),
    );

    let report = warmer::warm_all(store, &cache, &config, &strategies, today, |strategy| {
        bar.set_message(strategy.name.clone());
        bar.inc(1);
    })
    .await;
    bar.finish_with_message("done");

    println!(
        "warmed {} strategies, {} factor tables written",
        report.strategies_warmed, report.tables_written
    );
    Ok(())
}
