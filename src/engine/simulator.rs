//! The daily portfolio simulation loop.
//!
//! Strict per-day ordering: hold-day advance, corporate-action forced
//! liquidation, the exit ladder (first match wins), the rebalance gate,
//! rebalance exits, then ranked entries. All cash arithmetic is `Decimal`;
//! market prices enter as `Decimal` conversions of the bar values.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rustc_hash::FxHashSet;

use super::types::{DailySnapshot, Position, SellReason, Trade, TradeSide};
use crate::conditions::evaluator::{ranked_candidates, select_top, CompiledRule};
use crate::data::corporate::ActionMap;
use crate::data::loader::MarketData;
use crate::data::StockSeries;
use crate::error::{BacktestError, Result};
use crate::factors::table::FactorTable;
use crate::strategy::{BacktestRequest, PositionSizing, SellPriceBasis};

/// What one simulated day produced.
pub struct DayOutcome {
    pub snapshot: DailySnapshot,
    pub buy_count: u32,
    pub sell_count: u32,
    /// Indices into the simulator's trade log for this day's fills.
    pub trade_range: std::ops::Range<usize>,
}

pub struct Simulator {
    cash: Decimal,
    initial_capital: Decimal,
    holdings: BTreeMap<String, Position>,
    trades: Vec<Trade>,
    daily_history: Vec<DailySnapshot>,
    blocked_stocks: FxHashSet<String>,
    applied_actions: FxHashSet<String>,
    peak_value: Decimal,
    prev_trading_day: Option<NaiveDate>,

    buy_rule: CompiledRule,
    sell_rule: Option<CompiledRule>,
    config: SimConfig,
}

/// Trading rules lowered from the request.
struct SimConfig {
    commission_rate: Decimal,
    tax_rate: Decimal,
    slippage: Decimal,
    target_gain: Option<f64>,
    stop_loss: Option<f64>,
    min_hold_days: u32,
    max_hold_days: u32,
    sell_basis: SellPriceBasis,
    sell_offset: Option<f64>,
    condition_basis: SellPriceBasis,
    condition_offset: Option<f64>,
    rebalance: crate::strategy::RebalanceFrequency,
    sizing: PositionSizing,
    max_positions: usize,
    priority_factor: Option<String>,
    priority_order: crate::strategy::PriorityOrder,
}

impl Simulator {
    pub fn new(req: &BacktestRequest, buy_rule: CompiledRule) -> Result<Self> {
        let sell_rule = match &req.condition_sell {
            Some(cs) => Some(CompiledRule::from_expression(
                &cs.sell_logic,
                &cs.sell_conditions,
            )?),
            None => {
                if req.sell_conditions.is_empty() {
                    None
                } else {
                    Some(CompiledRule::all_of(&req.sell_conditions)?)
                }
            }
        };

        let config = SimConfig {
            commission_rate: decimal(req.commission_rate),
            tax_rate: decimal(req.tax_rate),
            slippage: decimal(req.slippage),
            target_gain: req.target_and_loss.target_gain,
            stop_loss: req.target_and_loss.stop_loss,
            min_hold_days: req.hold_days.min_hold_days,
            max_hold_days: req.hold_days.max_hold_days,
            sell_basis: req.hold_days.sell_price_basis,
            sell_offset: req.hold_days.sell_price_offset,
            condition_basis: req
                .condition_sell
                .as_ref()
                .map_or(SellPriceBasis::Current, |cs| cs.sell_price_basis),
            condition_offset: req.condition_sell.as_ref().and_then(|cs| cs.sell_price_offset),
            rebalance: req.rebalance_frequency,
            sizing: req.position_sizing,
            max_positions: req.max_positions as usize,
            priority_factor: req.priority_factor.clone(),
            priority_order: req.priority_order,
        };

        Ok(Self {
            cash: req.initial_capital,
            initial_capital: req.initial_capital,
            holdings: BTreeMap::new(),
            trades: Vec::new(),
            daily_history: Vec::new(),
            blocked_stocks: FxHashSet::default(),
            applied_actions: FxHashSet::default(),
            peak_value: req.initial_capital,
            prev_trading_day: None,
            buy_rule,
            sell_rule,
            config,
        })
    }

    pub fn holdings(&self) -> &BTreeMap<String, Position> {
        &self.holdings
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn daily_history(&self) -> &[DailySnapshot] {
        &self.daily_history
    }

    pub fn into_parts(self) -> (Vec<Trade>, Vec<DailySnapshot>, BTreeMap<String, Position>) {
        (self.trades, self.daily_history, self.holdings)
    }

    /// Process one trading day. `actions` is the corporate-action map from
    /// loading; `table` carries this day's factor values.
    pub fn step(
        &mut self,
        day: NaiveDate,
        data: &MarketData,
        actions: &ActionMap,
        table: &FactorTable,
    ) -> Result<DayOutcome> {
        let trades_before = self.trades.len();

        // 1. Advance hold days.
        for position in self.holdings.values_mut() {
            position.hold_days += 1;
        }

        // 2. Forced liquidation for corporate actions reaching today.
        self.apply_forced_liquidations(day, actions)?;

        // 3. Exit ladder, first match wins per position.
        self.apply_exit_ladder(day, data, table)?;

        // 4-6. Rebalance gate, rebalance exits, ranked entries.
        if self
            .config
            .rebalance
            .is_rebalance_day(day, self.prev_trading_day)
        {
            self.apply_rebalance_exits(day, data, table)?;
            self.apply_entries(day, data, actions, table)?;
        }

        // 7. Mark to market.
        let snapshot = self.mark_to_market(day, data)?;
        self.daily_history.push(snapshot.clone());
        self.prev_trading_day = Some(day);

        let trade_range = trades_before..self.trades.len();
        let buy_count = self.trades[trade_range.clone()]
            .iter()
            .filter(|t| t.side == TradeSide::Buy)
            .count() as u32;
        let sell_count = (trade_range.len() as u32) - buy_count;

        Ok(DayOutcome {
            snapshot,
            buy_count,
            sell_count,
            trade_range,
        })
    }

    /// Liquidate any remaining positions at the close of the final day.
    pub fn finalize(&mut self, last_day: NaiveDate, data: &MarketData) -> Result<()> {
        let stocks: Vec<String> = self.holdings.keys().cloned().collect();
        for stock in stocks {
            let Some(series) = data.series.get(&stock) else {
                continue;
            };
            if let Some((_, close)) = series.close_on_or_before(last_day) {
                self.execute_sell(&stock, decimal(close), last_day, SellReason::Final)?;
            }
        }
        // Refresh the last snapshot so FINAL proceeds are reflected.
        if self.daily_history.last().is_some_and(|s| s.date == last_day) {
            let snapshot = self.mark_to_market(last_day, data)?;
            if let Some(slot) = self.daily_history.last_mut() {
                *slot = snapshot;
            }
        }
        Ok(())
    }

    fn apply_forced_liquidations(&mut self, day: NaiveDate, actions: &ActionMap) -> Result<()> {
        let held: Vec<String> = self.holdings.keys().cloned().collect();
        for stock in held {
            let Some(action) = actions.get(&stock) else {
                continue;
            };
            if action.event_date > day || self.applied_actions.contains(&stock) {
                continue;
            }
            // The last clean bar's close (the series was truncated at the
            // event date during loading).
            let price = decimal(action.prev_close);
            self.execute_sell(&stock, price, day, SellReason::CorporateAction)?;
            self.applied_actions.insert(stock.clone());
            self.blocked_stocks.insert(stock);
        }
        Ok(())
    }

    fn apply_exit_ladder(
        &mut self,
        day: NaiveDate,
        data: &MarketData,
        table: &FactorTable,
    ) -> Result<()> {
        let mut pending: Vec<(String, Decimal, SellReason)> = Vec::new();

        for (stock, position) in &self.holdings {
            let Some(series) = data.series.get(stock) else {
                continue;
            };
            let Some(bar) = series.bar_on(day) else {
                // Not trading today; nothing can fill.
                continue;
            };

            // Min-hold suppresses every rule below (forced liquidation has
            // already run above this ladder).
            if position.hold_days < self.config.min_hold_days {
                continue;
            }

            let entry = decimal_to_f64(position.avg_price);
            let return_pct = (bar.close - entry) / entry * 100.0;

            let exit = if self
                .config
                .stop_loss
                .is_some_and(|sl| return_pct <= -sl)
            {
                Some((
                    self.resolve_sell_price(
                        self.config.sell_basis,
                        self.config.sell_offset,
                        day,
                        series,
                        position,
                    ),
                    SellReason::StopLoss,
                ))
            } else if self
                .config
                .target_gain
                .is_some_and(|tg| return_pct >= tg)
            {
                Some((
                    self.resolve_sell_price(
                        self.config.sell_basis,
                        self.config.sell_offset,
                        day,
                        series,
                        position,
                    ),
                    SellReason::TargetGain,
                ))
            } else if position.hold_days >= self.config.max_hold_days {
                Some((
                    self.resolve_sell_price(
                        self.config.sell_basis,
                        self.config.sell_offset,
                        day,
                        series,
                        position,
                    ),
                    SellReason::MaxHold,
                ))
            } else if self
                .sell_rule
                .as_ref()
                .is_some_and(|rule| rule.matches_stock(table, stock))
            {
                Some((
                    self.resolve_sell_price(
                        self.config.condition_basis,
                        self.config.condition_offset,
                        day,
                        series,
                        position,
                    ),
                    SellReason::Condition,
                ))
            } else {
                None
            };

            if let Some((Some(price), reason)) = exit {
                pending.push((stock.clone(), price, reason));
            }
        }

        for (stock, price, reason) in pending {
            self.execute_sell(&stock, price, day, reason)?;
        }
        Ok(())
    }

    fn apply_rebalance_exits(
        &mut self,
        day: NaiveDate,
        data: &MarketData,
        table: &FactorTable,
    ) -> Result<()> {
        let mut pending: Vec<(String, Decimal)> = Vec::new();
        for (stock, position) in &self.holdings {
            if position.hold_days < self.config.min_hold_days {
                continue;
            }
            let Some(bar) = data.series.get(stock).and_then(|s| s.bar_on(day)) else {
                continue;
            };
            // Stocks absent from today's table cannot satisfy the rule.
            if !self.buy_rule.matches_stock(table, stock) {
                pending.push((stock.clone(), decimal(bar.close)));
            }
        }
        for (stock, price) in pending {
            self.execute_sell(&stock, price, day, SellReason::Rebalance)?;
        }
        Ok(())
    }

    fn apply_entries(
        &mut self,
        day: NaiveDate,
        data: &MarketData,
        actions: &ActionMap,
        table: &FactorTable,
    ) -> Result<()> {
        let open_slots = self
            .config
            .max_positions
            .saturating_sub(self.holdings.len());
        if open_slots == 0 {
            return Ok(());
        }

        let mut excluded: FxHashSet<String> = self.holdings.keys().cloned().collect();
        excluded.extend(self.blocked_stocks.iter().cloned());
        for (stock, action) in actions {
            if action.event_date <= day {
                excluded.insert(stock.clone());
            }
        }
        // A stock sold today is not re-entered until the next rebalance day.
        for trade in self.trades.iter().rev() {
            if trade.date != day {
                break;
            }
            if trade.side == TradeSide::Sell {
                excluded.insert(trade.stock.clone());
            }
        }

        let satisfied = self.buy_rule.evaluate(table);
        let ranked = ranked_candidates(
            table,
            &satisfied,
            self.config.priority_factor.as_deref(),
            self.config.priority_order,
            &excluded,
        );
        let selected = select_top(ranked, open_slots);
        if selected.is_empty() {
            return Ok(());
        }

        let budgets = self.position_budgets(&selected, day, data, table);

        for (rank, stock) in selected.iter().enumerate() {
            let Some(series) = data.series.get(stock) else {
                continue;
            };
            let Some(bar) = series.bar_on(day) else {
                continue;
            };
            let budget = budgets[rank];
            let exec_price = decimal(bar.open) * (Decimal::ONE + self.config.slippage);
            if exec_price <= Decimal::ZERO {
                continue;
            }

            let mut quantity = (budget / exec_price).floor();
            // Never let commission take cash negative: clamp to affordable.
            let affordable = (self.cash
                / (exec_price * (Decimal::ONE + self.config.commission_rate)))
                .floor();
            if affordable < quantity {
                quantity = affordable;
            }
            let Some(quantity) = quantity.to_u64() else { continue };
            if quantity < 1 {
                continue;
            }

            let qty_dec = Decimal::from(quantity);
            let amount = exec_price * qty_dec;
            let commission = amount * self.config.commission_rate;
            self.cash -= amount + commission;
            if self.cash < Decimal::ZERO {
                return Err(BacktestError::Internal(format!(
                    "cash went negative buying {stock} on {day}"
                )));
            }

            let factors = table.row(stock);
            let note = format!("ranked #{} of {} candidates", rank + 1, selected.len());
            self.trades.push(Trade {
                date: day,
                side: TradeSide::Buy,
                stock: stock.clone(),
                quantity,
                price: exec_price,
                amount,
                commission,
                tax: Decimal::ZERO,
                realized_pnl: None,
                return_pct: None,
                hold_days: None,
                sell_reason: None,
                factors: factors.clone(),
                note: note.clone(),
            });

            match self.holdings.get_mut(stock) {
                Some(existing) => {
                    // FIFO average across lots.
                    let total_qty = Decimal::from(existing.quantity + quantity);
                    existing.avg_price = (existing.avg_price
                        * Decimal::from(existing.quantity)
                        + amount)
                        / total_qty;
                    existing.quantity += quantity;
                }
                None => {
                    self.holdings.insert(
                        stock.clone(),
                        Position {
                            stock: stock.clone(),
                            entry_date: day,
                            avg_price: exec_price,
                            quantity,
                            hold_days: 0,
                            entry_factors: factors,
                            buy_reason: note,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    /// Per-candidate cash budgets in ranked order.
    fn position_budgets(
        &self,
        selected: &[String],
        day: NaiveDate,
        data: &MarketData,
        table: &FactorTable,
    ) -> Vec<Decimal> {
        let n = selected.len();
        let equal = vec![self.cash / Decimal::from(n as u64); n];
        match self.config.sizing {
            PositionSizing::EqualWeight => equal,
            PositionSizing::MarketCap => {
                let caps: Vec<f64> = selected
                    .iter()
                    .map(|s| {
                        data.series
                            .get(s)
                            .and_then(|series| series.bar_on(day))
                            .map_or(0.0, |bar| bar.market_cap.max(0.0))
                    })
                    .collect();
                weights_to_budgets(self.cash, &caps).unwrap_or(equal)
            }
            PositionSizing::RiskParity => {
                let inverse_vol: Vec<f64> = selected
                    .iter()
                    .map(|s| {
                        table
                            .value(s, "VOLATILITY")
                            .map(f64::from)
                            .filter(|v| *v > 0.0)
                            .map_or(0.0, |v| 1.0 / v)
                    })
                    .collect();
                // Candidates with unknown volatility take the mean weight
                // of the rest rather than dropping to zero.
                let known: Vec<f64> = inverse_vol.iter().copied().filter(|w| *w > 0.0).collect();
                if known.is_empty() {
                    return equal;
                }
                let mean = known.iter().sum::<f64>() / known.len() as f64;
                let filled: Vec<f64> = inverse_vol
                    .iter()
                    .map(|w| if *w > 0.0 { *w } else { mean })
                    .collect();
                weights_to_budgets(self.cash, &filled).unwrap_or(equal)
            }
        }
    }

    fn resolve_sell_price(
        &self,
        basis: SellPriceBasis,
        offset: Option<f64>,
        day: NaiveDate,
        series: &StockSeries,
        position: &Position,
    ) -> Option<Decimal> {
        let bar = series.bar_on(day)?;
        let base = match basis {
            SellPriceBasis::Current => decimal(bar.close),
            SellPriceBasis::Open => decimal(bar.open),
            SellPriceBasis::PrevClose => decimal(series.prev_close(day)?),
            SellPriceBasis::Entry => position.avg_price,
        };
        let adjusted = match offset {
            Some(pct) => base * (Decimal::ONE + decimal(pct / 100.0)),
            None => base,
        };
        (adjusted > Decimal::ZERO).then_some(adjusted)
    }

    fn execute_sell(
        &mut self,
        stock: &str,
        price: Decimal,
        day: NaiveDate,
        reason: SellReason,
    ) -> Result<()> {
        let Some(position) = self.holdings.remove(stock) else {
            return Err(BacktestError::Internal(format!(
                "sell of unheld stock {stock} on {day}"
            )));
        };

        let qty = Decimal::from(position.quantity);
        let amount = price * qty;
        let commission = amount * self.config.commission_rate;
        let tax = amount * self.config.tax_rate;
        let net_proceeds = amount - commission - tax;
        let cost_basis = position.avg_price * qty;
        // Realised PnL includes costs; the gross price difference would
        // systematically overstate returns.
        let realized = net_proceeds - cost_basis;
        let return_pct = if cost_basis > Decimal::ZERO {
            decimal_to_f64(realized / cost_basis) * 100.0
        } else {
            0.0
        };

        self.cash += net_proceeds;
        self.trades.push(Trade {
            date: day,
            side: TradeSide::Sell,
            stock: stock.to_string(),
            quantity: position.quantity,
            price,
            amount,
            commission,
            tax,
            realized_pnl: Some(realized),
            return_pct: Some(return_pct),
            hold_days: Some(position.hold_days),
            sell_reason: Some(reason),
            factors: position.entry_factors,
            note: String::new(),
        });
        Ok(())
    }

    fn mark_to_market(&mut self, day: NaiveDate, data: &MarketData) -> Result<DailySnapshot> {
        let mut invested = Decimal::ZERO;
        for (stock, position) in &self.holdings {
            // Forward-filled close, valuation only.
            let close = data
                .series
                .get(stock)
                .and_then(|s| s.close_on_or_before(day))
                .map(|(_, c)| c)
                .unwrap_or_else(|| decimal_to_f64(position.avg_price));
            invested += decimal(close) * Decimal::from(position.quantity);
        }
        let portfolio_value = self.cash + invested;

        if self.cash < Decimal::ZERO {
            return Err(BacktestError::Internal(format!(
                "negative cash balance on {day}"
            )));
        }

        if portfolio_value > self.peak_value {
            self.peak_value = portfolio_value;
        }
        let drawdown = if self.peak_value > Decimal::ZERO {
            decimal_to_f64((self.peak_value - portfolio_value) / self.peak_value) * 100.0
        } else {
            0.0
        };

        let prev_value = self
            .daily_history
            .last()
            .map_or(self.initial_capital, |s| s.portfolio_value);
        let daily_return = if prev_value > Decimal::ZERO {
            decimal_to_f64((portfolio_value - prev_value) / prev_value) * 100.0
        } else {
            0.0
        };
        let cumulative_return = if self.initial_capital > Decimal::ZERO {
            decimal_to_f64((portfolio_value - self.initial_capital) / self.initial_capital) * 100.0
        } else {
            0.0
        };

        let trade_count = self.trades.iter().filter(|t| t.date == day).count() as u32;

        Ok(DailySnapshot {
            date: day,
            portfolio_value,
            cash: self.cash,
            invested,
            daily_return,
            cumulative_return,
            drawdown,
            trade_count,
        })
    }
}

fn decimal(v: f64) -> Decimal {
    Decimal::from_f64(v).unwrap_or(Decimal::ZERO)
}

fn decimal_to_f64(d: Decimal) -> f64 {
    d.to_f64().unwrap_or(0.0)
}

fn weights_to_budgets(cash: Decimal, weights: &[f64]) -> Option<Vec<Decimal>> {
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return None;
    }
    Some(
        weights
            .iter()
            .map(|w| cash * decimal(w / total))
            .collect(),
    )
}
