use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

use crate::config::SimulationConfig;
use crate::error::{BacktestError, Result};
use crate::risk::{CapitalLedger, OpenDecision, PriceLookup};
use crate::types::{ExitOutcome, Signal};

use super::controller::RunController;
use super::results::SignalStatus;

/// Signals sharing one fixed-width time bucket.
#[derive(Debug, Clone)]
pub struct Wave {
    pub start: DateTime<Utc>,
    /// Ranked, at most `max_entries_per_wave` long.
    pub signals: Vec<Signal>,
    /// Ranked out by the entry budget.
    pub truncated: Vec<Signal>,
}

/// A signal whose exit has already been simulated.
#[derive(Debug, Clone)]
pub struct PreparedEntry {
    pub entry_price: Decimal,
    pub entry_time: DateTime<Utc>,
    pub outcome: ExitOutcome,
}

/// Per-signal decisions and counters from one pass over the waves.
#[derive(Debug, Default, Clone)]
pub struct WaveReport {
    pub decisions: HashMap<String, SignalStatus>,
    pub waves_processed: u64,
    pub settled_immediately: u64,
}

pub struct WaveScheduler {
    width: Duration,
    max_entries: usize,
    mark_to_market: bool,
}

impl WaveScheduler {
    pub fn new(width: Duration, max_entries: usize) -> Self {
        Self {
            width,
            max_entries,
            mark_to_market: false,
        }
    }

    pub fn from_config(config: &SimulationConfig) -> Self {
        Self {
            width: config.wave_width(),
            max_entries: config.schedule.max_entries_per_wave,
            mark_to_market: config.schedule.mark_to_market,
        }
    }

    pub fn with_mark_to_market(mut self, enabled: bool) -> Self {
        self.mark_to_market = enabled;
        self
    }

    /// Start of the bucket containing `ts`, aligned to the Unix epoch.
    pub fn bucket_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let width = self.width.num_seconds().max(1);
        let secs = ts.timestamp();
        let floored = secs - secs.rem_euclid(width);
        DateTime::from_timestamp(floored, 0).unwrap_or(ts)
    }

    /// Buckets signals in time order. Within a bucket, signals rank by
    /// priority (highest first), then timestamp, then id.
    pub fn group(&self, signals: Vec<Signal>) -> Vec<Wave> {
        let mut buckets: BTreeMap<DateTime<Utc>, Vec<Signal>> = BTreeMap::new();
        for signal in signals {
            buckets
                .entry(self.bucket_start(signal.timestamp))
                .or_default()
                .push(signal);
        }

        buckets
            .into_iter()
            .map(|(start, mut signals)| {
                signals.sort_by(|a, b| {
                    b.priority()
                        .cmp(&a.priority())
                        .then_with(|| a.timestamp.cmp(&b.timestamp))
                        .then_with(|| a.id.cmp(&b.id))
                });
                let truncated = if signals.len() > self.max_entries {
                    signals.split_off(self.max_entries)
                } else {
                    Vec::new()
                };
                Wave {
                    start,
                    signals,
                    truncated,
                }
            })
            .collect()
    }

    /// Drives the ledger wave by wave: settle what is due, then try the
    /// wave's opens in rank order. Signals missing from `prepared` were
    /// skipped upstream and are ignored here.
    ///
    /// Cancellation is honoured only between waves, so a wave's opens are
    /// applied completely or not at all.
    pub fn run(
        &self,
        waves: &[Wave],
        prepared: &HashMap<String, PreparedEntry>,
        ledger: &mut CapitalLedger,
        prices: &impl PriceLookup,
        controller: &RunController,
    ) -> Result<WaveReport> {
        let mut report = WaveReport::default();

        for wave in waves {
            if controller.is_cancelled() {
                info!(
                    "Run cancelled before wave {} ({} of {} processed)",
                    wave.start, report.waves_processed, waves.len()
                );
                return Err(BacktestError::Cancelled);
            }

            let released = ledger.close_due(wave.start)?;
            debug!(
                "Wave {}: {} candidate(s), {} truncated, {} position(s) settled",
                wave.start,
                wave.signals.len(),
                wave.truncated.len(),
                released.len()
            );

            for signal in &wave.truncated {
                if prepared.contains_key(&signal.id) {
                    report.decisions.insert(signal.id.clone(), SignalStatus::Truncated);
                }
            }

            for signal in &wave.signals {
                let Some(entry) = prepared.get(&signal.id) else {
                    continue;
                };
                let decision = ledger.open_with_outcome(
                    signal,
                    entry.entry_price,
                    entry.entry_time,
                    entry.outcome.clone(),
                )?;
                let status = match decision {
                    OpenDecision::Opened { settled } => {
                        if settled {
                            report.settled_immediately += 1;
                        }
                        SignalStatus::Opened
                    }
                    OpenDecision::Rejected(reason) => SignalStatus::from_rejection(reason),
                };
                report.decisions.insert(signal.id.clone(), status);
            }

            if self.mark_to_market {
                ledger.mark_to_market(wave.start + self.width, prices);
            }

            ledger.check_invariants()?;
            report.waves_processed += 1;
            controller.record_wave();
        }

        Ok(report)
    }
}
