use std::path::PathBuf;
use std::time::Duration;

use crate::factors::engine::BackendKind;

/// Runtime configuration.
///
/// Built from environment variables (a `.env` file is honoured via
/// `dotenvy`).
///
/// | Env Var | Default | Purpose |
/// |---------|---------|---------|
/// | `REDIS_URL` | (none) | Remote KV cache; if unset, remote tier disabled |
/// | `RESULT_DB_PATH` | `~/.factorlab/results.db` | SQLite result store |
/// | `FACTOR_BACKEND` | `native` | `frame` / `columnar` / `native` |
/// | `CACHE_TTL_DAYS` | `30` | Remote cache TTL |
/// | `CORPORATE_ACTION_THRESHOLD` | `50.0` | One-day % move that flags a split/merge |
/// | `ENABLE_CACHE_WARMING` | `false` | Schedule the 03:00 KST warm job |
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: Option<String>,
    pub result_db_path: PathBuf,
    pub factor_backend: BackendKind,
    pub cache_ttl: Duration,
    pub corporate_action_threshold: f64,
    pub enable_cache_warming: bool,
    pub db_timeout: Duration,
    pub cache_timeout: Duration,
    pub broker_timeout: Duration,
    pub max_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: None,
            result_db_path: default_db_path(),
            factor_backend: BackendKind::Native,
            cache_ttl: Duration::from_secs(30 * 24 * 3600),
            corporate_action_threshold: 50.0,
            enable_cache_warming: false,
            db_timeout: Duration::from_secs(60),
            cache_timeout: Duration::from_secs(5),
            broker_timeout: Duration::from_secs(10),
            max_retries: 3,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let mut cfg = Self::default();

        if let Ok(url) = std::env::var("REDIS_URL") {
            if !url.is_empty() {
                cfg.redis_url = Some(url);
            }
        }
        if let Ok(path) = std::env::var("RESULT_DB_PATH") {
            cfg.result_db_path = PathBuf::from(path);
        }
        if let Ok(backend) = std::env::var("FACTOR_BACKEND") {
            cfg.factor_backend = match backend.to_ascii_lowercase().as_str() {
                "frame" => BackendKind::Frame,
                "columnar" => BackendKind::Columnar,
                _ => BackendKind::Native,
            };
        }
        if let Ok(days) = std::env::var("CACHE_TTL_DAYS") {
            if let Ok(days) = days.parse::<u64>() {
                cfg.cache_ttl = Duration::from_secs(days * 24 * 3600);
            }
        }
        if let Ok(threshold) = std::env::var("CORPORATE_ACTION_THRESHOLD") {
            if let Ok(threshold) = threshold.parse::<f64>() {
                cfg.corporate_action_threshold = threshold;
            }
        }
        if let Ok(flag) = std::env::var("ENABLE_CACHE_WARMING") {
            cfg.enable_cache_warming = matches!(flag.as_str(), "1" | "true" | "yes");
        }

        cfg
    }
}

fn default_db_path() -> PathBuf {
    let home = std::env::var("HOME").map_or_else(|_| PathBuf::from("/tmp"), PathBuf::from);
    home.join(".factorlab").join("results.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert!(cfg.redis_url.is_none());
        assert_eq!(cfg.corporate_action_threshold, 50.0);
        assert_eq!(cfg.cache_ttl, Duration::from_secs(30 * 24 * 3600));
        assert_eq!(cfg.max_retries, 3);
    }
}
