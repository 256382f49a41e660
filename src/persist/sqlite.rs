//! SQLite result store. WAL mode, a schema-version table, and one
//! transaction per saved session (bulk insert, no per-row round trips).

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::ResultStore;
use crate::engine::types::{BacktestResult, Statistics};
use crate::strategy::{decimal_to_f64, BacktestRequest};

const SCHEMA_VERSION: u32 = 1;

pub struct SqliteResultStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteResultStore {
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;
        let current: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?;

        match current {
            None => {
                create_schema(&conn)?;
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?)",
                    [SCHEMA_VERSION],
                )?;
                tracing::info!("created result store schema v{SCHEMA_VERSION}");
            }
            Some(v) if v == SCHEMA_VERSION => {}
            Some(v) => {
                tracing::warn!("result store schema version mismatch: expected {SCHEMA_VERSION}, got {v}");
            }
        }
        Ok(())
    }
}

fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE backtest_sessions (
            backtest_id TEXT PRIMARY KEY,
            backtest_name TEXT NOT NULL,
            status TEXT NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            initial_capital REAL NOT NULL,
            rebalance_frequency TEXT NOT NULL,
            max_positions INTEGER NOT NULL,
            position_sizing TEXT NOT NULL,
            buy_expression TEXT,
            buy_conditions_json TEXT NOT NULL,
            sell_conditions_json TEXT NOT NULL,
            trading_rules_json TEXT NOT NULL,
            commission_rate REAL NOT NULL,
            tax_rate REAL NOT NULL,
            slippage REAL NOT NULL,
            strategy_hash TEXT NOT NULL,
            error_code TEXT,
            error_message TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            completed_at TEXT
        );
        CREATE INDEX idx_sessions_status ON backtest_sessions(status);

        CREATE TABLE backtest_conditions (
            condition_pk INTEGER PRIMARY KEY AUTOINCREMENT,
            backtest_id TEXT NOT NULL REFERENCES backtest_sessions(backtest_id) ON DELETE CASCADE,
            condition_type TEXT NOT NULL,
            condition_id TEXT NOT NULL,
            factor TEXT NOT NULL,
            operator TEXT NOT NULL,
            value_json TEXT NOT NULL
        );
        CREATE INDEX idx_conditions_backtest ON backtest_conditions(backtest_id);

        CREATE TABLE backtest_statistics (
            backtest_id TEXT PRIMARY KEY REFERENCES backtest_sessions(backtest_id) ON DELETE CASCADE,
            total_return REAL NOT NULL,
            annualized_return REAL NOT NULL,
            volatility REAL NOT NULL,
            downside_volatility REAL NOT NULL,
            max_drawdown REAL NOT NULL,
            sharpe_ratio REAL NOT NULL,
            sortino_ratio REAL NOT NULL,
            calmar_ratio REAL NOT NULL,
            total_trades INTEGER NOT NULL,
            winning_trades INTEGER NOT NULL,
            losing_trades INTEGER NOT NULL,
            win_rate REAL NOT NULL,
            avg_win REAL NOT NULL,
            avg_loss REAL NOT NULL,
            profit_loss_ratio REAL NOT NULL,
            initial_capital REAL NOT NULL,
            final_capital REAL NOT NULL,
            peak_capital REAL NOT NULL,
            trading_days INTEGER NOT NULL
        );

        CREATE TABLE backtest_daily_snapshots (
            snapshot_pk INTEGER PRIMARY KEY AUTOINCREMENT,
            backtest_id TEXT NOT NULL REFERENCES backtest_sessions(backtest_id) ON DELETE CASCADE,
            snapshot_date TEXT NOT NULL,
            portfolio_value REAL NOT NULL,
            cash_balance REAL NOT NULL,
            invested_amount REAL NOT NULL,
            daily_return REAL NOT NULL,
            cumulative_return REAL NOT NULL,
            drawdown REAL NOT NULL,
            trade_count INTEGER NOT NULL,
            UNIQUE (backtest_id, snapshot_date)
        );

        CREATE TABLE backtest_trades (
            trade_pk INTEGER PRIMARY KEY AUTOINCREMENT,
            backtest_id TEXT NOT NULL REFERENCES backtest_sessions(backtest_id) ON DELETE CASCADE,
            trade_date TEXT NOT NULL,
            side TEXT NOT NULL,
            stock_code TEXT NOT NULL,
            quantity INTEGER NOT NULL,
            price REAL NOT NULL,
            amount REAL NOT NULL,
            commission REAL NOT NULL,
            tax REAL NOT NULL,
            realized_pnl REAL,
            return_pct REAL,
            hold_days INTEGER,
            sell_reason TEXT,
            factors_json TEXT,
            note TEXT
        );
        CREATE INDEX idx_trades_backtest_date ON backtest_trades(backtest_id, trade_date);

        CREATE TABLE backtest_holdings (
            holding_pk INTEGER PRIMARY KEY AUTOINCREMENT,
            backtest_id TEXT NOT NULL REFERENCES backtest_sessions(backtest_id) ON DELETE CASCADE,
            stock_code TEXT NOT NULL,
            quantity INTEGER NOT NULL,
            avg_price REAL NOT NULL,
            current_price REAL NOT NULL,
            value REAL NOT NULL,
            profit REAL NOT NULL,
            profit_rate REAL NOT NULL,
            weight REAL NOT NULL,
            buy_date TEXT NOT NULL,
            hold_days INTEGER NOT NULL,
            factors_json TEXT,
            UNIQUE (backtest_id, stock_code)
        );

        CREATE TABLE backtest_drawdown_periods (
            period_pk INTEGER PRIMARY KEY AUTOINCREMENT,
            backtest_id TEXT NOT NULL REFERENCES backtest_sessions(backtest_id) ON DELETE CASCADE,
            start_date TEXT NOT NULL,
            trough_date TEXT NOT NULL,
            end_date TEXT,
            peak_value REAL NOT NULL,
            trough_value REAL NOT NULL,
            drawdown_pct REAL NOT NULL,
            is_recovered INTEGER NOT NULL,
            duration_days INTEGER NOT NULL
        );

        CREATE TABLE backtest_factor_contributions (
            contribution_pk INTEGER PRIMARY KEY AUTOINCREMENT,
            backtest_id TEXT NOT NULL REFERENCES backtest_sessions(backtest_id) ON DELETE CASCADE,
            factor_name TEXT NOT NULL,
            total_trades INTEGER NOT NULL,
            winning_trades INTEGER NOT NULL,
            win_rate REAL NOT NULL,
            avg_return REAL NOT NULL,
            contribution_score REAL NOT NULL,
            importance_rank INTEGER NOT NULL
        );",
    )
}

fn insert_session(
    conn: &Connection,
    backtest_id: Uuid,
    request: &BacktestRequest,
    status: &str,
    error: Option<(&str, &str)>,
) -> anyhow::Result<()> {
    let buy_expression = request
        .buy_expression
        .as_ref()
        .map(|e| e.expression.clone());
    let buy_conditions = match &request.buy_expression {
        Some(e) => serde_json::to_string(&e.conditions)?,
        None => serde_json::to_string(&request.buy_conditions)?,
    };
    let sell_conditions = serde_json::to_string(&request.condition_sell)?;
    let trading_rules = serde_json::to_string(&serde_json::json!({
        "target_and_loss": request.target_and_loss,
        "hold_days": request.hold_days,
    }))?;

    conn.execute(
        "INSERT INTO backtest_sessions (
            backtest_id, backtest_name, status, start_date, end_date,
            initial_capital, rebalance_frequency, max_positions,
            position_sizing, buy_expression, buy_conditions_json,
            sell_conditions_json, trading_rules_json, commission_rate,
            tax_rate, slippage, strategy_hash, error_code, error_message,
            completed_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                  ?14, ?15, ?16, ?17, ?18, ?19, datetime('now'))
        ON CONFLICT(backtest_id) DO UPDATE SET
            status = excluded.status,
            error_code = excluded.error_code,
            error_message = excluded.error_message,
            completed_at = excluded.completed_at",
        params![
            backtest_id.to_string(),
            request.name,
            status,
            request.start_date.to_string(),
            request.end_date.to_string(),
            decimal_to_f64(request.initial_capital),
            serde_json::to_string(&request.rebalance_frequency)?.trim_matches('"'),
            request.max_positions,
            serde_json::to_string(&request.position_sizing)?.trim_matches('"'),
            buy_expression,
            buy_conditions,
            sell_conditions,
            trading_rules,
            request.commission_rate,
            request.tax_rate,
            request.slippage,
            request.strategy_hash(),
            error.map(|(code, _)| code),
            error.map(|(_, message)| message),
        ],
    )?;
    Ok(())
}

impl ResultStore for SqliteResultStore {
    fn save_result(
        &self,
        request: &BacktestRequest,
        result: &BacktestResult,
    ) -> anyhow::Result<()> {
        let mut guard = self.conn.lock();
        let tx = guard.transaction()?;
        let id = result.backtest_id;

        insert_session(&tx, id, request, "COMPLETED", None)?;

        for (kind, conditions) in [
            (
                "BUY",
                request
                    .buy_expression
                    .as_ref()
                    .map_or(&request.buy_conditions, |e| &e.conditions),
            ),
            ("SELL", &request.sell_conditions),
        ] {
            for cond in conditions {
                tx.execute(
                    "INSERT INTO backtest_conditions
                     (backtest_id, condition_type, condition_id, factor, operator, value_json)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        id.to_string(),
                        kind,
                        cond.id,
                        cond.factor,
                        serde_json::to_string(&cond.operator)?.trim_matches('"'),
                        serde_json::to_string(&cond.value)?,
                    ],
                )?;
            }
        }

        let s = &result.statistics;
        tx.execute(
            "INSERT INTO backtest_statistics (
                backtest_id, total_return, annualized_return, volatility,
                downside_volatility, max_drawdown, sharpe_ratio, sortino_ratio,
                calmar_ratio, total_trades, winning_trades, losing_trades,
                win_rate, avg_win, avg_loss, profit_loss_ratio,
                initial_capital, final_capital, peak_capital, trading_days
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                      ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
            params![
                id.to_string(),
                s.total_return,
                s.annualized_return,
                s.volatility,
                s.downside_volatility,
                s.max_drawdown,
                s.sharpe_ratio,
                s.sortino_ratio,
                s.calmar_ratio,
                s.total_trades,
                s.winning_trades,
                s.losing_trades,
                s.win_rate,
                s.avg_win,
                s.avg_loss,
                s.profit_loss_ratio,
                s.initial_capital,
                s.final_capital,
                s.peak_capital,
                s.trading_days,
            ],
        )?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO backtest_daily_snapshots
                 (backtest_id, snapshot_date, portfolio_value, cash_balance,
                  invested_amount, daily_return, cumulative_return, drawdown, trade_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for snap in &result.daily_performance {
                stmt.execute(params![
                    id.to_string(),
                    snap.date.to_string(),
                    decimal_to_f64(snap.portfolio_value),
                    decimal_to_f64(snap.cash),
                    decimal_to_f64(snap.invested),
                    snap.daily_return,
                    snap.cumulative_return,
                    snap.drawdown,
                    snap.trade_count,
                ])?;
            }

            let mut stmt = tx.prepare(
                "INSERT INTO backtest_trades
                 (backtest_id, trade_date, side, stock_code, quantity, price, amount,
                  commission, tax, realized_pnl, return_pct, hold_days, sell_reason,
                  factors_json, note)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            )?;
            for trade in &result.trades {
                stmt.execute(params![
                    id.to_string(),
                    trade.date.to_string(),
                    serde_json::to_string(&trade.side)?.trim_matches('"'),
                    trade.stock,
                    trade.quantity,
                    decimal_to_f64(trade.price),
                    decimal_to_f64(trade.amount),
                    decimal_to_f64(trade.commission),
                    decimal_to_f64(trade.tax),
                    trade.realized_pnl.map(decimal_to_f64),
                    trade.return_pct,
                    trade.hold_days,
                    trade
                        .sell_reason
                        .map(|r| serde_json::to_string(&r).unwrap_or_default())
                        .map(|s| s.trim_matches('"').to_string()),
                    serde_json::to_string(&trade.factors)?,
                    trade.note,
                ])?;
            }

            let mut stmt = tx.prepare(
                "INSERT INTO backtest_holdings
                 (backtest_id, stock_code, quantity, avg_price, current_price, value,
                  profit, profit_rate, weight, buy_date, hold_days, factors_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            for holding in &result.current_holdings {
                stmt.execute(params![
                    id.to_string(),
                    holding.stock,
                    holding.quantity,
                    decimal_to_f64(holding.avg_price),
                    holding.current_price,
                    holding.value,
                    holding.profit,
                    holding.profit_rate,
                    holding.weight,
                    holding.buy_date.to_string(),
                    holding.hold_days,
                    serde_json::to_string(&holding.factors)?,
                ])?;
            }

            let mut stmt = tx.prepare(
                "INSERT INTO backtest_drawdown_periods
                 (backtest_id, start_date, trough_date, end_date, peak_value,
                  trough_value, drawdown_pct, is_recovered, duration_days)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for period in &result.drawdown_periods {
                stmt.execute(params![
                    id.to_string(),
                    period.start_date.to_string(),
                    period.trough_date.to_string(),
                    period.end_date.map(|d| d.to_string()),
                    period.peak_value,
                    period.trough_value,
                    period.drawdown_pct,
                    period.recovered,
                    period.duration_days,
                ])?;
            }

            let mut stmt = tx.prepare(
                "INSERT INTO backtest_factor_contributions
                 (backtest_id, factor_name, total_trades, winning_trades, win_rate,
                  avg_return, contribution_score, importance_rank)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for contribution in &result.factor_contributions {
                stmt.execute(params![
                    id.to_string(),
                    contribution.factor_name,
                    contribution.total_trades,
                    contribution.winning_trades,
                    contribution.win_rate,
                    contribution.avg_return,
                    contribution.contribution_score,
                    contribution.importance_rank,
                ])?;
            }
        }

        tx.commit()?;
        tracing::info!(backtest_id = %id, trades = result.trades.len(), "session persisted");
        Ok(())
    }

    fn mark_failed(
        &self,
        backtest_id: Uuid,
        request: &BacktestRequest,
        code: &str,
        message: &str,
    ) -> anyhow::Result<()> {
        let guard = self.conn.lock();
        insert_session(&guard, backtest_id, request, "FAILED", Some((code, message)))
    }

    fn load_statistics(&self, backtest_id: Uuid) -> anyhow::Result<Option<Statistics>> {
        let guard = self.conn.lock();
        let row = guard
            .query_row(
                "SELECT total_return, annualized_return, volatility, downside_volatility,
                        max_drawdown, sharpe_ratio, sortino_ratio, calmar_ratio,
                        total_trades, winning_trades, losing_trades, win_rate,
                        avg_win, avg_loss, profit_loss_ratio, initial_capital,
                        final_capital, peak_capital, trading_days
                 FROM backtest_statistics WHERE backtest_id = ?1",
                [backtest_id.to_string()],
                |row| {
                    Ok(Statistics {
                        total_return: row.get(0)?,
                        annualized_return: row.get(1)?,
                        volatility: row.get(2)?,
                        downside_volatility: row.get(3)?,
                        max_drawdown: row.get(4)?,
                        sharpe_ratio: row.get(5)?,
                        sortino_ratio: row.get(6)?,
                        calmar_ratio: row.get(7)?,
                        total_trades: row.get(8)?,
                        winning_trades: row.get(9)?,
                        losing_trades: row.get(10)?,
                        win_rate: row.get(11)?,
                        avg_win: row.get(12)?,
                        avg_loss: row.get(13)?,
                        profit_loss_ratio: row.get(14)?,
                        initial_capital: row.get(15)?,
                        final_capital: row.get(16)?,
                        peak_capital: row.get(17)?,
                        trading_days: row.get(18)?,
                        start_date: None,
                        end_date: None,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn session_status(&self, backtest_id: Uuid) -> anyhow::Result<Option<String>> {
        let guard = self.conn.lock();
        let status = guard
            .query_row(
                "SELECT status FROM backtest_sessions WHERE backtest_id = ?1",
                [backtest_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{BacktestResult, ChartData, DailySnapshot, Trade, TradeSide};
    use crate::testutil;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    fn result(id: Uuid) -> BacktestResult {
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        BacktestResult {
            backtest_id: id,
            statistics: Statistics {
                total_return: 5.0,
                final_capital: 1_050_000.0,
                initial_capital: 1_000_000.0,
                total_trades: 2,
                trading_days: 1,
                ..Statistics::default()
            },
            daily_performance: vec![DailySnapshot {
                date,
                portfolio_value: Decimal::from(1_050_000u64),
                cash: Decimal::from(1_050_000u64),
                invested: Decimal::ZERO,
                daily_return: 0.0,
                cumulative_return: 5.0,
                drawdown: 0.0,
                trade_count: 2,
            }],
            monthly_performance: vec![],
            yearly_performance: vec![],
            trades: vec![Trade {
                date,
                side: TradeSide::Buy,
                stock: "005930".into(),
                quantity: 10,
                price: Decimal::from(100u64),
                amount: Decimal::from(1000u64),
                commission: Decimal::from(2u64),
                tax: Decimal::ZERO,
                realized_pnl: None,
                return_pct: None,
                hold_days: None,
                sell_reason: None,
                factors: std::collections::BTreeMap::new(),
                note: "ranked #1 of 1 candidates".into(),
            }],
            current_holdings: vec![],
            drawdown_periods: vec![],
            factor_contributions: vec![],
            chart_data: ChartData::default(),
        }
    }

    #[test]
    fn save_and_load_round_trip() {
        let store = SqliteResultStore::in_memory().unwrap();
        let start = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let req = testutil::sample_request(start, NaiveDate::from_ymd_opt(2024, 6, 28).unwrap());
        let id = Uuid::new_v4();

        store.save_result(&req, &result(id)).unwrap();

        assert_eq!(store.session_status(id).unwrap().as_deref(), Some("COMPLETED"));
        let stats = store.load_statistics(id).unwrap().unwrap();
        assert!((stats.total_return - 5.0).abs() < 1e-9);
        assert_eq!(stats.total_trades, 2);
        assert_eq!(stats.trading_days, 1);
    }

    #[test]
    fn mark_failed_writes_error_marker() {
        let store = SqliteResultStore::in_memory().unwrap();
        let start = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let req = testutil::sample_request(start, NaiveDate::from_ymd_opt(2024, 6, 28).unwrap());
        let id = Uuid::new_v4();

        store
            .mark_failed(id, &req, "DATA_UNAVAILABLE", "no prices")
            .unwrap();
        assert_eq!(store.session_status(id).unwrap().as_deref(), Some("FAILED"));
        assert!(store.load_statistics(id).unwrap().is_none());
    }

    #[test]
    fn opens_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.db");
        let store = SqliteResultStore::open(&path).unwrap();
        let id = Uuid::new_v4();
        assert!(store.session_status(id).unwrap().is_none());
        // Re-open against the existing schema.
        drop(store);
        let store = SqliteResultStore::open(&path).unwrap();
        assert!(store.session_status(id).unwrap().is_none());
    }
}
