use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::config::SimulationConfig;
use crate::data::{EntryQuote, MarkPrice, PriceBook, PriceHistoryProvider, ResultSink};
use crate::error::{BacktestError, Result};
use crate::risk::CapitalLedger;
use crate::types::{ClosedTrade, ExitOutcome, Signal};

use super::controller::RunController;
use super::results::{LedgerTotals, MetricsCalculator, OutcomeRow, RunStatistics, SignalStatus};
use super::simulator::ExitSimulator;
use super::waves::{PreparedEntry, WaveScheduler};

/// Rows are written to the sink in chunks of this size.
const OUTCOME_BATCH_SIZE: usize = 500;

/// What one worker produced for one signal.
#[derive(Debug, Clone)]
pub enum SimulationResult {
    Simulated {
        entry: EntryQuote,
        entry_time: DateTime<Utc>,
        outcome: ExitOutcome,
        /// Closes from entry up to the exit bar, for marking the open position.
        marks: Vec<MarkPrice>,
    },
    /// Missing price history.
    Skipped { reason: String },
    Failed { reason: String },
}

#[derive(Debug, Clone)]
pub struct SignalReport {
    pub signal: Signal,
    pub result: SimulationResult,
}

/// Fans per-signal price fetches and simulations out over a bounded pool.
/// Workers share nothing mutable: each gets its own handle to the read-only
/// provider and a copy of the simulator.
pub struct BatchOrchestrator<P> {
    provider: Arc<P>,
    config: Arc<SimulationConfig>,
    simulator: ExitSimulator,
    workers: usize,
}

impl<P: PriceHistoryProvider + 'static> BatchOrchestrator<P> {
    pub fn new(provider: Arc<P>, config: Arc<SimulationConfig>) -> Self {
        let simulator = ExitSimulator::from_config(&config);
        let workers = config.worker_count();
        Self {
            provider,
            config,
            simulator,
            workers,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Simulates every signal and returns one report per signal, in input
    /// order. Failures stay local to their signal.
    pub async fn simulate_batch(
        &self,
        signals: &[Signal],
        simulation_end: Option<DateTime<Utc>>,
    ) -> Vec<SignalReport> {
        let start_time = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut handles = Vec::with_capacity(signals.len());

        for signal in signals {
            let semaphore = Arc::clone(&semaphore);
            let provider = Arc::clone(&self.provider);
            let config = Arc::clone(&self.config);
            let simulator = self.simulator.clone();
            let task_signal = signal.clone();

            let handle = tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        return SimulationResult::Failed {
                            reason: format!("worker pool closed: {}", e),
                        }
                    }
                };
                simulate_signal(provider, config, simulator, task_signal, simulation_end).await
            });
            handles.push((signal.clone(), handle));
        }

        let mut reports = Vec::with_capacity(handles.len());
        for (signal, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    let err = BacktestError::WorkerFailure {
                        signal_id: signal.id.clone(),
                        reason: e.to_string(),
                    };
                    error!("{}", err);
                    SimulationResult::Failed {
                        reason: e.to_string(),
                    }
                }
            };
            reports.push(SignalReport { signal, result });
        }

        info!(
            "Simulated {} signal(s) on {} worker(s) in {:?}",
            reports.len(),
            self.workers,
            start_time.elapsed()
        );
        reports
    }
}

async fn simulate_signal<P: PriceHistoryProvider>(
    provider: Arc<P>,
    config: Arc<SimulationConfig>,
    simulator: ExitSimulator,
    signal: Signal,
    simulation_end: Option<DateTime<Utc>>,
) -> SimulationResult {
    let bar = config.schedule.bar_size;
    let entry = match provider
        .get_entry_price(
            &signal.symbol,
            signal.timestamp,
            bar,
            &config.workers.entry_price_windows_minutes,
        )
        .await
    {
        Ok(Some(entry)) => entry,
        Ok(None) => {
            let err = BacktestError::data_gap(&signal.id, &signal.symbol, "no entry price near signal time");
            warn!("{}", err);
            return SimulationResult::Skipped {
                reason: "no entry price near signal time".to_string(),
            };
        }
        Err(e) => {
            error!("[{}] entry price lookup failed for {}: {}", signal.symbol, signal.id, e);
            return SimulationResult::Failed { reason: e.to_string() };
        }
    };

    let entry_time = signal.timestamp;
    // One extra bar so the horizon is observable.
    let fetch_end = entry_time + config.max_holding() + bar.duration();
    let candles = match provider.get_candles(&signal.symbol, entry_time, fetch_end, bar).await {
        Ok(candles) => candles,
        Err(e) => {
            error!("[{}] candle fetch failed for {}: {}", signal.symbol, signal.id, e);
            return SimulationResult::Failed { reason: e.to_string() };
        }
    };

    if let Some(bad) = candles.iter().find(|c| !c.is_well_formed()) {
        let reason = format!("malformed candle at {}", bad.timestamp);
        warn!("{}", BacktestError::data_gap(&signal.id, &signal.symbol, reason.clone()));
        return SimulationResult::Skipped { reason };
    }

    let policy = config.exit.policy.clone();
    let direction = signal.direction;
    let joined = tokio::task::spawn_blocking(move || {
        simulator
            .simulate(entry.price, direction, &candles, &policy, entry_time, simulation_end)
            .map(|outcome| {
                let marks = candles
                    .iter()
                    .take_while(|c| c.timestamp <= outcome.close_time)
                    .map(MarkPrice::from)
                    .collect::<Vec<_>>();
                (outcome, marks)
            })
    })
    .await;

    match joined {
        Ok(Ok((outcome, marks))) => {
            debug!(
                "[{}] {} simulated: {} @ {} ({})",
                signal.symbol, signal.id, outcome.reason, outcome.close_price, outcome.close_time
            );
            SimulationResult::Simulated {
                entry,
                entry_time,
                outcome,
                marks,
            }
        }
        Ok(Err(e)) => {
            warn!("{}", BacktestError::data_gap(&signal.id, &signal.symbol, e.to_string()));
            SimulationResult::Skipped { reason: e.to_string() }
        }
        Err(e) => {
            error!("[{}] simulation task for {} failed: {}", signal.symbol, signal.id, e);
            SimulationResult::Failed { reason: e.to_string() }
        }
    }
}

/// Stable run id: the same configuration and the same signal ids always map
/// to the same id, whatever order the signals arrive in.
pub fn compute_run_id(config: &SimulationConfig, signals: &[Signal]) -> Result<String> {
    let config_json = serde_json::to_string(config)
        .map_err(|e| BacktestError::Config(format!("cannot serialize config: {}", e)))?;
    let mut ids: Vec<&str> = signals.iter().map(|s| s.id.as_str()).collect();
    ids.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(config_json.as_bytes());
    for id in ids {
        hasher.update(b"\n");
        hasher.update(id.as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    Ok(format!("run-{}", &digest[..16]))
}

/// Everything a finished run produced.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub statistics: RunStatistics,
    pub rows: Vec<OutcomeRow>,
    pub trades: Vec<ClosedTrade>,
}

/// The full pipeline: parallel simulation, wave scheduling on a single
/// ledger, forced close at the end, statistics and persistence.
pub struct Backtester<P, R> {
    config: Arc<SimulationConfig>,
    orchestrator: BatchOrchestrator<P>,
    sink: Arc<R>,
    controller: Arc<RunController>,
}

impl<P, R> Backtester<P, R>
where
    P: PriceHistoryProvider + 'static,
    R: ResultSink,
{
    pub fn new(config: SimulationConfig, provider: Arc<P>, sink: Arc<R>) -> Self {
        let config = Arc::new(config);
        Self {
            orchestrator: BatchOrchestrator::new(provider, Arc::clone(&config)),
            config,
            sink,
            controller: Arc::new(RunController::new()),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.orchestrator = self.orchestrator.with_workers(workers);
        self
    }

    pub fn controller(&self) -> Arc<RunController> {
        Arc::clone(&self.controller)
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub async fn run(
        &self,
        signals: Vec<Signal>,
        run_id: Option<String>,
        simulation_end: Option<DateTime<Utc>>,
    ) -> Result<RunReport> {
        let signals = dedup_signals(signals);
        let run_id = match run_id {
            Some(id) => id,
            None => compute_run_id(&self.config, &signals)?,
        };
        info!(
            "Starting run {} with {} signal(s), policy {}",
            run_id,
            signals.len(),
            self.config.exit.policy.name()
        );

        let reports = self.orchestrator.simulate_batch(&signals, simulation_end).await;

        let mut prices = PriceBook::new();
        let mut prepared: HashMap<String, PreparedEntry> = HashMap::new();
        let mut rows: HashMap<String, OutcomeRow> = HashMap::new();

        for report in reports {
            let signal = report.signal;
            match report.result {
                SimulationResult::Simulated {
                    entry,
                    entry_time,
                    outcome,
                    marks,
                } => {
                    prices.extend(&signal.symbol, marks);
                    // Status is provisional until the wave pass decides.
                    rows.insert(
                        signal.id.clone(),
                        OutcomeRow::new(&signal, SignalStatus::Truncated)
                            .with_entry(entry.price, entry_time)
                            .with_outcome(outcome.clone()),
                    );
                    prepared.insert(
                        signal.id.clone(),
                        PreparedEntry {
                            entry_price: entry.price,
                            entry_time,
                            outcome,
                        },
                    );
                }
                SimulationResult::Skipped { reason } => {
                    rows.insert(
                        signal.id.clone(),
                        OutcomeRow::new(&signal, SignalStatus::Skipped).with_detail(reason),
                    );
                }
                SimulationResult::Failed { reason } => {
                    rows.insert(
                        signal.id.clone(),
                        OutcomeRow::new(&signal, SignalStatus::Failed).with_detail(reason),
                    );
                }
            }
        }

        let scheduler = WaveScheduler::from_config(&self.config);
        let waves = scheduler.group(signals.clone());
        let mut ledger = CapitalLedger::new(&self.config);
        let wave_report = scheduler.run(&waves, &prepared, &mut ledger, &prices, &self.controller)?;

        let horizon = prepared.values().map(|p| p.outcome.close_time).max();
        if let Some(horizon) = horizon {
            let end_time = simulation_end.unwrap_or(horizon);
            ledger.force_close_all(end_time, &prices)?;
        }

        let settled: HashMap<&str, &ClosedTrade> = ledger
            .closed_trades()
            .iter()
            .map(|t| (t.position.signal_id.as_str(), t))
            .collect();

        let mut ordered_rows = Vec::with_capacity(signals.len());
        for signal in &signals {
            let Some(mut row) = rows.remove(&signal.id) else {
                continue;
            };
            if let Some(status) = wave_report.decisions.get(&signal.id) {
                row.status = *status;
            }
            if row.status == SignalStatus::Opened {
                if let Some(trade) = settled.get(signal.id.as_str()) {
                    row.outcome = Some(trade.outcome.clone());
                }
            }
            ordered_rows.push(row);
        }

        let totals = LedgerTotals {
            initial_capital: ledger.initial_capital(),
            final_capital: ledger.available_capital(),
            total_commission: ledger.total_commission(),
            min_equity: ledger.min_equity(),
            max_drawdown_pct: ledger.max_drawdown_pct(),
        };
        let statistics = MetricsCalculator::calculate(
            &run_id,
            self.config.exit.policy.name(),
            &ordered_rows,
            ledger.closed_trades(),
            totals,
            wave_report.waves_processed,
        );

        self.persist(&run_id, &ordered_rows, &statistics).await?;
        self.controller.mark_completed();

        info!(
            "Run {} finished: {} opened, {} closed, realized {:.2}, final capital {:.2}",
            run_id,
            statistics.opened,
            ledger.closed_trades().len(),
            statistics.realized_pnl,
            statistics.final_capital
        );

        Ok(RunReport {
            run_id,
            statistics,
            rows: ordered_rows,
            trades: ledger.closed_trades().to_vec(),
        })
    }

    async fn persist(&self, run_id: &str, rows: &[OutcomeRow], statistics: &RunStatistics) -> Result<()> {
        let mut written = 0;
        for chunk in rows.chunks(OUTCOME_BATCH_SIZE) {
            written += self.sink.upsert_outcomes(run_id, chunk).await?;
        }
        self.sink.upsert_run_statistics(run_id, statistics).await?;
        debug!("Persisted {} outcome row(s) for run {}", written, run_id);
        Ok(())
    }
}

/// Keeps the first occurrence of every signal id.
fn dedup_signals(signals: Vec<Signal>) -> Vec<Signal> {
    let mut seen = HashSet::new();
    let total = signals.len();
    let unique: Vec<Signal> = signals
        .into_iter()
        .filter(|s| seen.insert(s.id.clone()))
        .collect();
    if unique.len() < total {
        warn!("Dropped {} duplicate signal id(s)", total - unique.len());
    }
    unique
}
