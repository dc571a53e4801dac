use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};

use crate::data::{PriceHistoryProvider, ResultSink, SignalSource};
use crate::engine::{OutcomeRow, RunStatistics, SignalStatus};
use crate::error::BacktestError;
use crate::types::{Candle, CloseReason, Direction, Signal, SignalFilter, TimeFrame};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Initialize database with schema
    pub async fn new(db_url: &str) -> Result<Self> {
        info!("Initializing SQLite database at: {}", db_url);

        // Create database file if it doesn't exist
        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.create_schema().await?;

        info!("Database initialized successfully");
        Ok(db)
    }

    /// Private in-memory database. A single connection, since every
    /// connection to `:memory:` sees its own empty database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let db = Self { pool };
        db.create_schema().await?;
        Ok(db)
    }

    /// Create database schema
    async fn create_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS candles (
                symbol TEXT NOT NULL,
                bar TEXT NOT NULL,
                ts TEXT NOT NULL,
                open TEXT NOT NULL,
                high TEXT NOT NULL,
                low TEXT NOT NULL,
                close TEXT NOT NULL,
                PRIMARY KEY (symbol, bar, ts)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS signals (
                id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                direction TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                score TEXT NOT NULL,
                strength TEXT,
                regime TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_signals_timestamp ON signals(timestamp)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS signal_outcomes (
                run_id TEXT NOT NULL,
                signal_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                direction TEXT NOT NULL,
                signal_time TEXT NOT NULL,
                status TEXT NOT NULL,
                detail TEXT,
                entry_price TEXT,
                entry_time TEXT,
                close_price TEXT,
                close_time TEXT,
                close_reason TEXT,
                close_detail TEXT,
                pnl_pct TEXT,
                realized_pnl TEXT,
                fees TEXT,
                max_potential_profit TEXT,
                best_price TEXT,
                absolute_max_price TEXT,
                absolute_min_price TEXT,
                trailing_activated INTEGER NOT NULL DEFAULT 0,
                trailing_activated_at TEXT,
                candles_evaluated INTEGER,
                PRIMARY KEY (run_id, signal_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS run_statistics (
                run_id TEXT PRIMARY KEY,
                policy TEXT NOT NULL,
                signals_total INTEGER NOT NULL,
                signals_skipped INTEGER NOT NULL,
                signals_failed INTEGER NOT NULL,
                opened INTEGER NOT NULL,
                wins INTEGER NOT NULL,
                losses INTEGER NOT NULL,
                win_rate_pct TEXT NOT NULL,
                take_profit_count INTEGER NOT NULL,
                stop_loss_count INTEGER NOT NULL,
                trailing_stop_count INTEGER NOT NULL,
                timeout_count INTEGER NOT NULL,
                realized_pnl TEXT NOT NULL,
                max_potential_pnl TEXT NOT NULL,
                final_capital TEXT NOT NULL,
                max_drawdown_pct TEXT NOT NULL,
                payload TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn insert_candles(&self, symbol: &str, bar: TimeFrame, candles: &[Candle]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for candle in candles {
            sqlx::query(
                r#"
                INSERT INTO candles (symbol, bar, ts, open, high, low, close)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(symbol, bar, ts) DO UPDATE SET
                    open = excluded.open,
                    high = excluded.high,
                    low = excluded.low,
                    close = excluded.close
                "#,
            )
            .bind(symbol)
            .bind(bar.as_str())
            .bind(ts(candle.timestamp))
            .bind(candle.open.to_string())
            .bind(candle.high.to_string())
            .bind(candle.low.to_string())
            .bind(candle.close.to_string())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!("Stored {} {} candle(s) for {}", candles.len(), bar, symbol);
        Ok(())
    }

    pub async fn insert_signals(&self, signals: &[Signal]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for signal in signals {
            sqlx::query(
                r#"
                INSERT INTO signals (id, symbol, direction, timestamp, score, strength, regime)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    symbol = excluded.symbol,
                    direction = excluded.direction,
                    timestamp = excluded.timestamp,
                    score = excluded.score,
                    strength = excluded.strength,
                    regime = excluded.regime
                "#,
            )
            .bind(&signal.id)
            .bind(&signal.symbol)
            .bind(signal.direction.as_str())
            .bind(ts(signal.timestamp))
            .bind(signal.score.to_string())
            .bind(signal.strength.map(|s| s.to_string()))
            .bind(&signal.regime)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn load_candles(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        bar: TimeFrame,
    ) -> Result<Vec<Candle>> {
        let rows = sqlx::query(
            r#"
            SELECT ts, open, high, low, close
            FROM candles
            WHERE symbol = ? AND bar = ? AND ts >= ? AND ts <= ?
            ORDER BY ts ASC
            "#,
        )
        .bind(symbol)
        .bind(bar.as_str())
        .bind(ts(start))
        .bind(ts(end))
        .fetch_all(&self.pool)
        .await?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            candles.push(Candle {
                timestamp: parse_ts(row.get("ts"))?,
                open: Decimal::from_str(row.get("open"))?,
                high: Decimal::from_str(row.get("high"))?,
                low: Decimal::from_str(row.get("low"))?,
                close: Decimal::from_str(row.get("close"))?,
            });
        }
        Ok(candles)
    }

    pub async fn load_signals(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &SignalFilter,
    ) -> Result<Vec<Signal>> {
        let min_score = filter.min_score.map(|s| s.to_string());
        let rows = sqlx::query(
            r#"
            SELECT id, symbol, direction, timestamp, score, strength, regime
            FROM signals
            WHERE timestamp >= ? AND timestamp < ?
              AND (? IS NULL OR CAST(score AS REAL) >= CAST(? AS REAL))
            ORDER BY timestamp ASC, id ASC
            "#,
        )
        .bind(ts(start))
        .bind(ts(end))
        .bind(&min_score)
        .bind(&min_score)
        .fetch_all(&self.pool)
        .await?;

        let mut signals = Vec::with_capacity(rows.len());
        for row in rows {
            let signal = parse_signal(&row)?;
            // Exact decimal threshold and the hour buckets are applied here.
            if filter.accepts(&signal) {
                signals.push(signal);
            }
        }
        Ok(signals)
    }

    pub async fn store_outcomes(&self, run_id: &str, rows: &[OutcomeRow]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            let outcome = row.outcome.as_ref();
            sqlx::query(
                r#"
                INSERT INTO signal_outcomes (
                    run_id, signal_id, symbol, direction, signal_time, status, detail,
                    entry_price, entry_time, close_price, close_time, close_reason, close_detail,
                    pnl_pct, realized_pnl, fees, max_potential_profit, best_price,
                    absolute_max_price, absolute_min_price, trailing_activated,
                    trailing_activated_at, candles_evaluated
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(run_id, signal_id) DO UPDATE SET
                    status = excluded.status,
                    detail = excluded.detail,
                    entry_price = excluded.entry_price,
                    entry_time = excluded.entry_time,
                    close_price = excluded.close_price,
                    close_time = excluded.close_time,
                    close_reason = excluded.close_reason,
                    close_detail = excluded.close_detail,
                    pnl_pct = excluded.pnl_pct,
                    realized_pnl = excluded.realized_pnl,
                    fees = excluded.fees,
                    max_potential_profit = excluded.max_potential_profit,
                    best_price = excluded.best_price,
                    absolute_max_price = excluded.absolute_max_price,
                    absolute_min_price = excluded.absolute_min_price,
                    trailing_activated = excluded.trailing_activated,
                    trailing_activated_at = excluded.trailing_activated_at,
                    candles_evaluated = excluded.candles_evaluated
                "#,
            )
            .bind(run_id)
            .bind(&row.signal_id)
            .bind(&row.symbol)
            .bind(row.direction.as_str())
            .bind(ts(row.signal_time))
            .bind(row.status.as_str())
            .bind(&row.detail)
            .bind(row.entry_price.map(|p| p.to_string()))
            .bind(row.entry_time.map(ts))
            .bind(outcome.map(|o| o.close_price.to_string()))
            .bind(outcome.map(|o| ts(o.close_time)))
            .bind(outcome.map(|o| o.reason.as_str()))
            .bind(outcome.and_then(|o| reason_detail(&o.reason)))
            .bind(outcome.map(|o| o.pnl.pnl_pct.to_string()))
            .bind(outcome.map(|o| o.pnl.realized_pnl.to_string()))
            .bind(outcome.map(|o| o.pnl.total_fees().to_string()))
            .bind(outcome.map(|o| o.max_potential_profit.to_string()))
            .bind(outcome.map(|o| o.best_price_reached.to_string()))
            .bind(outcome.map(|o| o.absolute_max_price.to_string()))
            .bind(outcome.map(|o| o.absolute_min_price.to_string()))
            .bind(outcome.map(|o| o.trailing_activated).unwrap_or(false))
            .bind(outcome.and_then(|o| o.trailing_activated_at).map(ts))
            .bind(outcome.map(|o| o.candles_evaluated as i64))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(rows.len())
    }

    pub async fn store_run_statistics(&self, run_id: &str, stats: &RunStatistics) -> Result<()> {
        let payload = serde_json::to_string(stats)?;
        sqlx::query(
            r#"
            INSERT INTO run_statistics (
                run_id, policy, signals_total, signals_skipped, signals_failed, opened,
                wins, losses, win_rate_pct, take_profit_count, stop_loss_count,
                trailing_stop_count, timeout_count, realized_pnl, max_potential_pnl,
                final_capital, max_drawdown_pct, payload
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(run_id) DO UPDATE SET
                policy = excluded.policy,
                signals_total = excluded.signals_total,
                signals_skipped = excluded.signals_skipped,
                signals_failed = excluded.signals_failed,
                opened = excluded.opened,
                wins = excluded.wins,
                losses = excluded.losses,
                win_rate_pct = excluded.win_rate_pct,
                take_profit_count = excluded.take_profit_count,
                stop_loss_count = excluded.stop_loss_count,
                trailing_stop_count = excluded.trailing_stop_count,
                timeout_count = excluded.timeout_count,
                realized_pnl = excluded.realized_pnl,
                max_potential_pnl = excluded.max_potential_pnl,
                final_capital = excluded.final_capital,
                max_drawdown_pct = excluded.max_drawdown_pct,
                payload = excluded.payload
            "#,
        )
        .bind(run_id)
        .bind(&stats.policy)
        .bind(stats.signals_total as i64)
        .bind(stats.signals_skipped as i64)
        .bind(stats.signals_failed as i64)
        .bind(stats.opened as i64)
        .bind(stats.wins as i64)
        .bind(stats.losses as i64)
        .bind(stats.win_rate_pct.to_string())
        .bind(stats.reason_count("take_profit") as i64)
        .bind(stats.reason_count("stop_loss") as i64)
        .bind(stats.reason_count("trailing_stop") as i64)
        .bind(stats.reason_count("timeout") as i64)
        .bind(stats.realized_pnl.to_string())
        .bind(stats.max_potential_pnl.to_string())
        .bind(stats.final_capital.to_string())
        .bind(stats.max_drawdown_pct.to_string())
        .bind(payload)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_run_statistics(&self, run_id: &str) -> Result<Option<RunStatistics>> {
        let row = sqlx::query("SELECT payload FROM run_statistics WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(serde_json::from_str(row.get("payload"))?)),
            None => Ok(None),
        }
    }

    pub async fn get_outcomes(&self, run_id: &str) -> Result<Vec<StoredOutcome>> {
        let rows = sqlx::query(
            r#"
            SELECT signal_id, status, close_reason, realized_pnl
            FROM signal_outcomes
            WHERE run_id = ?
            ORDER BY signal_id ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        let mut outcomes = Vec::with_capacity(rows.len());
        for row in rows {
            outcomes.push(StoredOutcome {
                signal_id: row.get("signal_id"),
                status: SignalStatus::from_str(row.get("status")).map_err(anyhow::Error::msg)?,
                close_reason: row.get("close_reason"),
                realized_pnl: row
                    .get::<Option<String>, _>("realized_pnl")
                    .map(|s| Decimal::from_str(&s))
                    .transpose()?,
            });
        }
        Ok(outcomes)
    }
}

/// A persisted outcome row, as read back for reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredOutcome {
    pub signal_id: String,
    pub status: SignalStatus,
    pub close_reason: Option<String>,
    pub realized_pnl: Option<Decimal>,
}

#[async_trait]
impl PriceHistoryProvider for Database {
    async fn get_candles(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        bar: TimeFrame,
    ) -> crate::error::Result<Vec<Candle>> {
        self.load_candles(symbol, start, end, bar).await.map_err(storage_error)
    }
}

#[async_trait]
impl SignalSource for Database {
    async fn get_signals(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &SignalFilter,
    ) -> crate::error::Result<Vec<Signal>> {
        self.load_signals(start, end, filter).await.map_err(storage_error)
    }
}

#[async_trait]
impl ResultSink for Database {
    async fn upsert_outcomes(&self, run_id: &str, rows: &[OutcomeRow]) -> crate::error::Result<usize> {
        self.store_outcomes(run_id, rows).await.map_err(storage_error)
    }

    async fn upsert_run_statistics(&self, run_id: &str, stats: &RunStatistics) -> crate::error::Result<()> {
        self.store_run_statistics(run_id, stats).await.map_err(storage_error)
    }
}

/// Keeps driver errors as they are; anything else failed while decoding
/// stored text.
fn storage_error(e: anyhow::Error) -> BacktestError {
    match e.downcast::<sqlx::Error>() {
        Ok(db) => BacktestError::Database(db),
        Err(other) => BacktestError::Database(sqlx::Error::Decode(other.into())),
    }
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

fn reason_detail(reason: &CloseReason) -> Option<String> {
    match reason {
        CloseReason::StopLoss { trigger } | CloseReason::TrailingStop { trigger } => Some(trigger.to_string()),
        CloseReason::Liquidation { adverse_pct } => Some(adverse_pct.to_string()),
        _ => None,
    }
}

fn parse_signal(row: &SqliteRow) -> Result<Signal> {
    Ok(Signal {
        id: row.get("id"),
        symbol: row.get("symbol"),
        direction: Direction::from_str(row.get("direction")).map_err(anyhow::Error::msg)?,
        timestamp: parse_ts(row.get("timestamp"))?,
        score: Decimal::from_str(row.get("score"))?,
        strength: row
            .get::<Option<String>, _>("strength")
            .map(|s| Decimal::from_str(&s))
            .transpose()?,
        regime: row.get("regime"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::MarginModel;
    use crate::types::ExitOutcome;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn t(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 10, h, m, 0).unwrap()
    }

    fn outcome() -> ExitOutcome {
        let model = MarginModel::new(dec!(100), dec!(10), dec!(0.0005));
        ExitOutcome {
            close_price: dec!(96.9515),
            close_time: t(2, 0),
            reason: CloseReason::StopLoss { trigger: dec!(97) },
            pnl: model.settle(Direction::Long, dec!(100), dec!(96.9515)),
            max_potential_profit: dec!(12),
            best_price_reached: dec!(101.2),
            absolute_max_price: dec!(103),
            absolute_min_price: dec!(95),
            trailing_activated: false,
            trailing_activated_at: None,
            candles_evaluated: 8,
        }
    }

    #[tokio::test]
    async fn test_candle_range_query() {
        let db = Database::in_memory().await.unwrap();
        let candles: Vec<Candle> = (0..8)
            .map(|i| {
                let ts = t(0, 0) + Duration::minutes(15 * i);
                Candle::new(ts, dec!(100), dec!(101), dec!(99), dec!(100.5))
            })
            .collect();
        db.insert_candles("BTCUSDT", TimeFrame::M15, &candles).await.unwrap();
        db.insert_candles("BTCUSDT", TimeFrame::M15, &candles[..2]).await.unwrap();

        let window = db
            .get_candles("BTCUSDT", t(0, 30), t(1, 15), TimeFrame::M15)
            .await
            .unwrap();
        assert_eq!(window.len(), 4);
        assert_eq!(window[0].timestamp, t(0, 30));
        assert_eq!(window[3].close, dec!(100.5));

        let other_bar = db
            .get_candles("BTCUSDT", t(0, 0), t(2, 0), TimeFrame::H1)
            .await
            .unwrap();
        assert!(other_bar.is_empty());

        let quote = db
            .get_entry_price("BTCUSDT", t(0, 20), TimeFrame::M15, &[15])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(quote.actual_time, t(0, 15));
    }

    #[tokio::test]
    async fn test_signal_filters() {
        let db = Database::in_memory().await.unwrap();
        db.insert_signals(&[
            Signal::new("s1", "BTCUSDT", Direction::Long, t(1, 0), dec!(0.75)).with_strength(dec!(0.1)),
            Signal::new("s2", "ETHUSDT", Direction::Short, t(2, 0), dec!(0.4)),
            Signal::new("s3", "SOLUSDT", Direction::Long, t(3, 0), dec!(0.9)).with_regime("trend"),
        ])
        .await
        .unwrap();

        let filter = SignalFilter {
            min_score: Some(dec!(0.5)),
            allowed_hours: vec![],
        };
        let signals = db.get_signals(t(0, 0), t(23, 0), &filter).await.unwrap();
        let ids: Vec<&str> = signals.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s3"]);
        assert_eq!(signals[0].strength, Some(dec!(0.1)));
        assert_eq!(signals[1].regime.as_deref(), Some("trend"));

        let by_hour = SignalFilter {
            min_score: None,
            allowed_hours: vec![2],
        };
        let signals = db.get_signals(t(0, 0), t(23, 0), &by_hour).await.unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].direction, Direction::Short);
    }

    #[tokio::test]
    async fn test_outcome_upsert_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        let signal = Signal::new("s1", "BTCUSDT", Direction::Long, t(1, 0), dec!(0.8));
        let skipped = Signal::new("s2", "ETHUSDT", Direction::Long, t(1, 0), dec!(0.8));
        let rows = vec![
            OutcomeRow::new(&signal, SignalStatus::Opened)
                .with_entry(dec!(100), t(1, 0))
                .with_outcome(outcome()),
            OutcomeRow::new(&skipped, SignalStatus::Skipped).with_detail("no candles"),
        ];

        db.upsert_outcomes("run-a", &rows).await.unwrap();
        db.upsert_outcomes("run-a", &rows).await.unwrap();
        db.upsert_outcomes("run-b", &rows[..1]).await.unwrap();

        let stored = db.get_outcomes("run-a").await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].status, SignalStatus::Opened);
        assert_eq!(stored[0].close_reason.as_deref(), Some("stop_loss"));
        assert_eq!(stored[0].realized_pnl, Some(outcome().pnl.realized_pnl));
        assert_eq!(stored[1].realized_pnl, None);
        assert_eq!(db.get_outcomes("run-b").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_statistics_round_trip() {
        let db = Database::in_memory().await.unwrap();
        let mut stats = RunStatistics {
            run_id: "run-a".to_string(),
            policy: "fixed_tp_sl".to_string(),
            wins: 3,
            realized_pnl: dec!(12.5),
            ..Default::default()
        };
        stats.close_reasons.insert("take_profit".to_string(), 3);

        db.upsert_run_statistics("run-a", &stats).await.unwrap();
        stats.wins = 4;
        db.upsert_run_statistics("run-a", &stats).await.unwrap();

        let loaded = db.get_run_statistics("run-a").await.unwrap().unwrap();
        assert_eq!(loaded, stats);
        assert!(db.get_run_statistics("missing").await.unwrap().is_none());
    }
}
