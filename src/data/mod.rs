//! Collaborator seams: where candles and signals come from and where results go.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use crate::engine::{OutcomeRow, RunStatistics};
use crate::error::Result;
use crate::risk::PriceLookup;
use crate::types::{Candle, Signal, SignalFilter, TimeFrame};

/// A price found near a requested instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryQuote {
    pub price: Decimal,
    pub actual_time: DateTime<Utc>,
}

/// Picks the candle closest to `near`, earlier candle on ties. A candle at or
/// before `near` quotes its close; a later one quotes its open.
pub fn nearest_quote(candles: &[Candle], near: DateTime<Utc>) -> Option<EntryQuote> {
    candles
        .iter()
        .min_by_key(|c| ((c.timestamp - near).num_seconds().abs(), c.timestamp))
        .map(|c| EntryQuote {
            price: if c.timestamp <= near { c.close } else { c.open },
            actual_time: c.timestamp,
        })
}

#[async_trait]
pub trait PriceHistoryProvider: Send + Sync {
    /// Candles with `start <= timestamp <= end`, ascending.
    async fn get_candles(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        bar: TimeFrame,
    ) -> Result<Vec<Candle>>;

    /// Searches successively wider windows around `near` for a usable price.
    async fn get_entry_price(
        &self,
        symbol: &str,
        near: DateTime<Utc>,
        bar: TimeFrame,
        windows_minutes: &[u32],
    ) -> Result<Option<EntryQuote>> {
        for &window in windows_minutes {
            let half = Duration::minutes(window as i64);
            let candles = self.get_candles(symbol, near - half, near + half, bar).await?;
            if let Some(quote) = nearest_quote(&candles, near) {
                return Ok(Some(quote));
            }
        }
        Ok(None)
    }
}

#[async_trait]
pub trait SignalSource: Send + Sync {
    /// Signals with `start <= timestamp < end` that pass `filter`, ordered by
    /// timestamp then id.
    async fn get_signals(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &SignalFilter,
    ) -> Result<Vec<Signal>>;
}

/// Durable storage for run results. Both writes are upserts: submitting the
/// same rows again under the same run id leaves the stored set unchanged.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn upsert_outcomes(&self, run_id: &str, rows: &[OutcomeRow]) -> Result<usize>;

    async fn upsert_run_statistics(&self, run_id: &str, stats: &RunStatistics) -> Result<()>;
}

/// Candle history held in memory, keyed by symbol.
#[derive(Debug, Default, Clone)]
pub struct InMemoryPriceHistory {
    candles: HashMap<String, Vec<Candle>>,
}

impl InMemoryPriceHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, symbol: impl Into<String>, mut candles: Vec<Candle>) {
        candles.sort_by_key(|c| c.timestamp);
        candles.dedup_by_key(|c| c.timestamp);
        self.candles.insert(symbol.into(), candles);
    }
}

#[async_trait]
impl PriceHistoryProvider for InMemoryPriceHistory {
    async fn get_candles(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        _bar: TimeFrame,
    ) -> Result<Vec<Candle>> {
        Ok(self
            .candles
            .get(symbol)
            .map(|series| {
                series
                    .iter()
                    .filter(|c| c.timestamp >= start && c.timestamp <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[derive(Debug, Default, Clone)]
pub struct InMemorySignalSource {
    signals: Vec<Signal>,
}

impl InMemorySignalSource {
    pub fn new(signals: Vec<Signal>) -> Self {
        Self { signals }
    }
}

#[async_trait]
impl SignalSource for InMemorySignalSource {
    async fn get_signals(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &SignalFilter,
    ) -> Result<Vec<Signal>> {
        let mut signals: Vec<Signal> = self
            .signals
            .iter()
            .filter(|s| s.timestamp >= start && s.timestamp < end && filter.accepts(s))
            .cloned()
            .collect();
        signals.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(signals)
    }
}

/// Result sink backed by ordered maps, for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryResultSink {
    outcomes: RwLock<BTreeMap<(String, String), OutcomeRow>>,
    statistics: RwLock<BTreeMap<String, RunStatistics>>,
}

impl InMemoryResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn outcomes(&self, run_id: &str) -> Vec<OutcomeRow> {
        self.outcomes
            .read()
            .await
            .iter()
            .filter(|((run, _), _)| run == run_id)
            .map(|(_, row)| row.clone())
            .collect()
    }

    pub async fn statistics(&self, run_id: &str) -> Option<RunStatistics> {
        self.statistics.read().await.get(run_id).cloned()
    }
}

#[async_trait]
impl ResultSink for InMemoryResultSink {
    async fn upsert_outcomes(&self, run_id: &str, rows: &[OutcomeRow]) -> Result<usize> {
        let mut outcomes = self.outcomes.write().await;
        for row in rows {
            outcomes.insert((run_id.to_string(), row.signal_id.clone()), row.clone());
        }
        Ok(rows.len())
    }

    async fn upsert_run_statistics(&self, run_id: &str, stats: &RunStatistics) -> Result<()> {
        self.statistics
            .write()
            .await
            .insert(run_id.to_string(), stats.clone());
        Ok(())
    }
}

/// A bar's close, keyed by the bar's open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkPrice {
    pub timestamp: DateTime<Utc>,
    pub close: Decimal,
}

impl From<&Candle> for MarkPrice {
    fn from(candle: &Candle) -> Self {
        Self {
            timestamp: candle.timestamp,
            close: candle.close,
        }
    }
}

/// Read-only closes per symbol used to mark open positions.
///
/// A lookup at `at` only sees bars that open strictly before `at`, the same
/// rule the exit simulator applies when it closes a position at period end.
#[derive(Debug, Default, Clone)]
pub struct PriceBook {
    series: HashMap<String, BTreeMap<DateTime<Utc>, Decimal>>,
}

impl PriceBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds closes for `symbol`. Bars already present are kept once.
    pub fn extend(&mut self, symbol: &str, marks: impl IntoIterator<Item = MarkPrice>) {
        let series = self.series.entry(symbol.to_string()).or_default();
        series.extend(marks.into_iter().map(|m| (m.timestamp, m.close)));
    }
}

impl PriceLookup for PriceBook {
    fn price_at(&self, symbol: &str, at: DateTime<Utc>) -> Option<Decimal> {
        self.series
            .get(symbol)?
            .range(..at)
            .next_back()
            .map(|(_, close)| *close)
    }
}
