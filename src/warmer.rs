//! Cache pre-warming for the popular ("famous") strategies: precompute and
//! cache factor tables over the trailing one-year window so interactive
//! backtests of well-known condition sets start hot. Keys use the same
//! strategy hash as live requests, so warmed entries are actually hit.

use chrono::{Days, NaiveDate};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;

use crate::cache::factor_cache::FactorCache;
use crate::conditions::ConditionSpec;
use crate::config::Config;
use crate::data::loader::load_market_data;
use crate::data::PriceStore;
use crate::factors::deps;
use crate::factors::engine::{ComputeContext, FactorEngine};
use crate::strategy::{
    BacktestRequest, HoldDaysRule, PositionSizing, PriorityOrder, RebalanceFrequency,
    TargetAndLoss, FIXED_TAX_RATE,
};
use crate::util::retry::RetryPolicy;

pub const WARM_WINDOW_DAYS: u64 = 365;

#[derive(Debug, Clone, Deserialize)]
pub struct FamousStrategy {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub conditions: Vec<ConditionSpec>,
    #[serde(default)]
    pub priority_factor: Option<String>,
    #[serde(default = "default_max_positions")]
    pub max_positions: u32,
}

fn default_max_positions() -> u32 {
    20
}

#[derive(Debug, Deserialize)]
struct StrategyFile {
    strategies: Vec<FamousStrategy>,
}

pub fn strategies_from_toml(text: &str) -> anyhow::Result<Vec<FamousStrategy>> {
    let file: StrategyFile = toml::from_str(text)?;
    Ok(file.strategies)
}

/// The built-in warm set, modelled on the classic screens users run most.
pub fn builtin_strategies() -> Vec<FamousStrategy> {
    fn cond(id: &str, factor: &str, op: &str, value: f64) -> ConditionSpec {
        serde_json::from_value(serde_json::json!({
            "id": id, "factor": factor, "operator": op, "value": value
        }))
        .expect("valid builtin condition")
    }

    vec![
        FamousStrategy {
            name: "value_low_per_high_roe".into(),
            description: "Cheap earners: PER under 10 with ROE above 10".into(),
            conditions: vec![cond("A", "PER", "<", 10.0), cond("B", "ROE", ">", 10.0)],
            priority_factor: Some("PER".into()),
            max_positions: 20,
        },
        FamousStrategy {
            name: "lynch_low_peg".into(),
            description: "Growth at a reasonable price: PEG under 1 with growing revenue".into(),
            conditions: vec![
                cond("A", "PEG", "<", 1.0),
                cond("B", "REVENUE_GROWTH_1Y", ">", 0.0),
            ],
            priority_factor: Some("PEG".into()),
            max_positions: 20,
        },
        FamousStrategy {
            name: "dividend_low_pbr".into(),
            description: "Yield with a floor: dividend yield above 3% and PBR under 1".into(),
            conditions: vec![
                cond("A", "DIVIDEND_YIELD", ">", 3.0),
                cond("B", "PBR", "<", 1.0),
            ],
            priority_factor: Some("DIVIDEND_YIELD".into()),
            max_positions: 30,
        },
        FamousStrategy {
            name: "quality_low_debt".into(),
            description: "Balance-sheet quality: debt ratio under 50% with current ratio above 150%".into(),
            conditions: vec![
                cond("A", "DEBT_RATIO", "<", 50.0),
                cond("B", "CURRENT_RATIO", ">", 150.0),
            ],
            priority_factor: Some("ROE".into()),
            max_positions: 25,
        },
    ]
}

fn request_for(strategy: &FamousStrategy, today: NaiveDate) -> BacktestRequest {
    BacktestRequest {
        name: strategy.name.clone(),
        buy_conditions: strategy.conditions.clone(),
        buy_expression: None,
        sell_conditions: vec![],
        condition_sell: None,
        target_and_loss: TargetAndLoss::default(),
        hold_days: HoldDaysRule::default(),
        start_date: today - Days::new(WARM_WINDOW_DAYS),
        end_date: today,
        initial_capital: Decimal::from(100_000_000u64),
        rebalance_frequency: RebalanceFrequency::Monthly,
        max_positions: strategy.max_positions,
        position_sizing: PositionSizing::EqualWeight,
        commission_rate: 0.0015,
        tax_rate: FIXED_TAX_RATE,
        slippage: 0.001,
        target_themes: None,
        target_stocks: None,
        target_universes: None,
        priority_factor: strategy.priority_factor.clone(),
        priority_order: PriorityOrder::Asc,
    }
}

#[derive(Debug, Default)]
pub struct WarmReport {
    pub strategies_warmed: usize,
    pub tables_written: usize,
}

/// Warm one strategy: load the trailing year, compute the masked factor
/// tables for every trading day not already cached, and write them back.
pub async fn warm_strategy(
    store: &dyn PriceStore,
    cache: &FactorCache,
    config: &Config,
    strategy: &FamousStrategy,
    today: NaiveDate,
) -> anyhow::Result<usize> {
    let request = request_for(strategy, today);
    let hash = request.strategy_hash();
    let universe_key = request.universe_key();

    let policy = RetryPolicy::db(config.db_timeout, config.max_retries);
    let data = load_market_data(
        store,
        cache,
        &request,
        config.corporate_action_threshold,
        &policy,
    )
    .await?;
    let days = data.trading_days(request.start_date, request.end_date);

    let cached = cache.get_factors_batch(&days, &universe_key, &hash).await;
    let missing: Vec<NaiveDate> = days
        .iter()
        .copied()
        .filter(|d| !cached.contains_key(d))
        .collect();
    if missing.is_empty() {
        tracing::info!(strategy = %strategy.name, "already fully warm");
        return Ok(0);
    }

    let mask = deps::compute_mask(
        &request.buy_conditions,
        None,
        &[],
        request.priority_factor.as_deref(),
    );
    let ctx = ComputeContext::new(&data, &mask);
    let engine = FactorEngine::new(config.factor_backend);
    let tables = engine.compute_dates(&ctx, &missing)?;
    cache.set_factors_batch(&tables, &universe_key, &hash).await;

    tracing::info!(
        strategy = %strategy.name,
        written = tables.len(),
        "strategy warmed"
    );
    Ok(tables.len())
}

/// Warm the whole strategy set; `on_progress` fires after each strategy
/// (the CLI renders a progress bar through it).
pub async fn warm_all(
    store: Arc<dyn PriceStore>,
    cache: &FactorCache,
    config: &Config,
    strategies: &[FamousStrategy],
    today: NaiveDate,
    mut on_progress: impl FnMut(&FamousStrategy),
) -> WarmReport {
    let mut report = WarmReport::default();
    for strategy in strategies {
        match warm_strategy(store.as_ref(), cache, config, strategy, today).await {
            Ok(written) => {
                report.strategies_warmed += 1;
                report.tables_written += written;
            }
            Err(err) => {
                tracing::error!(strategy = %strategy.name, error = %err, "warming failed");
            }
        }
        on_progress(strategy);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryKv;
    use crate::testutil;

    #[test]
    fn builtin_strategies_are_valid() {
        let today = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
        for strategy in builtin_strategies() {
            let request = request_for(&strategy, today);
            request.validate_request().expect("builtin must validate");
        }
    }

    #[test]
    fn toml_round_trip() {
        let text = r#"
            [[strategies]]
            name = "custom"
            description = "demo"
            max_positions = 15
            priority_factor = "PBR"

            [[strategies.conditions]]
            id = "A"
            factor = "PBR"
            operator = "<"
            value = 1.5
        "#;
        let strategies = strategies_from_toml(text).unwrap();
        assert_eq!(strategies.len(), 1);
        assert_eq!(strategies[0].max_positions, 15);
        assert_eq!(strategies[0].conditions[0].factor, "PBR");
    }

    #[tokio::test]
    async fn warming_populates_cache_for_the_same_hash() {
        let start = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + f64::from(i)).collect();
        let store = testutil::store_of(&[("AAA", start, &closes)]);
        let cache = FactorCache::new(
            Some(Arc::new(InMemoryKv::new())),
            std::time::Duration::from_secs(60),
        );
        let config = Config::default();

        let strategy = FamousStrategy {
            name: "momo".into(),
            description: String::new(),
            conditions: vec![testutil::always_true_condition()],
            priority_factor: None,
            max_positions: 5,
        };
        let today = start + Days::new(40);

        let written = warm_strategy(&store, &cache, &config, &strategy, today)
            .await
            .unwrap();
        assert!(written > 0);

        // A second pass finds everything warm.
        let again = warm_strategy(&store, &cache, &config, &strategy, today)
            .await
            .unwrap();
        assert_eq!(again, 0);
    }
}
