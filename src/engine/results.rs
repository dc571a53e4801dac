use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::risk::RejectReason;
use crate::types::{ClosedTrade, Direction, ExitOutcome, Signal};

/// What happened to a signal over the course of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStatus {
    Opened,
    RejectedCapital,
    RejectedDuplicate,
    /// Ranked out of a wave that held more signals than its entry budget.
    Truncated,
    /// No usable price history.
    Skipped,
    /// The simulation task itself failed.
    Failed,
}

impl SignalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalStatus::Opened => "opened",
            SignalStatus::RejectedCapital => "rejected_capital",
            SignalStatus::RejectedDuplicate => "rejected_duplicate",
            SignalStatus::Truncated => "truncated",
            SignalStatus::Skipped => "skipped",
            SignalStatus::Failed => "failed",
        }
    }

    pub fn from_rejection(reason: RejectReason) -> Self {
        match reason {
            RejectReason::InsufficientCapital => SignalStatus::RejectedCapital,
            RejectReason::DuplicatePair => SignalStatus::RejectedDuplicate,
        }
    }
}

impl std::fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SignalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "opened" => Ok(SignalStatus::Opened),
            "rejected_capital" => Ok(SignalStatus::RejectedCapital),
            "rejected_duplicate" => Ok(SignalStatus::RejectedDuplicate),
            "truncated" => Ok(SignalStatus::Truncated),
            "skipped" => Ok(SignalStatus::Skipped),
            "failed" => Ok(SignalStatus::Failed),
            _ => Err(format!("Unknown signal status: {}", s)),
        }
    }
}

/// One persisted row per signal, keyed by `(run_id, signal_id)`.
///
/// `outcome` holds the simulated exit for every signal that reached the
/// simulator. For opened signals it is the outcome the ledger actually
/// settled, which differs from the simulated one after a forced close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRow {
    pub signal_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub signal_time: DateTime<Utc>,
    pub status: SignalStatus,
    pub detail: Option<String>,
    pub entry_price: Option<Decimal>,
    pub entry_time: Option<DateTime<Utc>>,
    pub outcome: Option<ExitOutcome>,
}

impl OutcomeRow {
    pub fn new(signal: &Signal, status: SignalStatus) -> Self {
        Self {
            signal_id: signal.id.clone(),
            symbol: signal.symbol.clone(),
            direction: signal.direction,
            signal_time: signal.timestamp,
            status,
            detail: None,
            entry_price: None,
            entry_time: None,
            outcome: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_entry(mut self, price: Decimal, time: DateTime<Utc>) -> Self {
        self.entry_price = Some(price);
        self.entry_time = Some(time);
        self
    }

    pub fn with_outcome(mut self, outcome: ExitOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }
}

/// Aggregate statistics for one run, keyed by run id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStatistics {
    pub run_id: String,
    pub policy: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub initial_capital: Decimal,
    pub final_capital: Decimal,

    // Signals
    pub signals_total: u64,
    pub signals_processed: u64,
    pub signals_skipped: u64,
    pub signals_failed: u64,
    pub waves: u64,

    // Ledger decisions
    pub opened: u64,
    pub rejected_capital: u64,
    pub rejected_duplicate: u64,
    pub truncated: u64,

    // Trades
    pub wins: u64,
    pub losses: u64,
    pub win_rate_pct: Decimal,
    pub close_reasons: BTreeMap<String, u64>,
    pub trailing_activations: u64,

    // P&L
    pub realized_pnl: Decimal,
    pub max_potential_pnl: Decimal,
    pub gross_profit: Decimal,
    pub gross_loss: Decimal,
    pub total_commission: Decimal,
    pub profit_factor: Decimal,
    pub average_win: Decimal,
    pub average_loss: Decimal,
    pub largest_win: Decimal,
    pub largest_loss: Decimal,

    // Risk
    pub min_equity: Decimal,
    pub max_drawdown_pct: Decimal,
}

impl RunStatistics {
    pub fn reason_count(&self, reason: &str) -> u64 {
        self.close_reasons.get(reason).copied().unwrap_or(0)
    }

    /// Pretty print results to console
    pub fn print_summary(&self) {
        println!("\n{}", "=".repeat(60));
        println!("                    BACKTEST RESULTS");
        println!("{}", "=".repeat(60));
        println!("Run:                {}", self.run_id);
        if let (Some(start), Some(end)) = (self.start, self.end) {
            println!("Period:             {} to {}", start, end);
        }
        println!("Exit Policy:        {}", self.policy);
        println!("Initial Capital:    ${:.2}", self.initial_capital);
        println!("Final Capital:      ${:.2}", self.final_capital);
        println!("{}", "-".repeat(60));
        println!("SIGNALS");
        println!("  Total:              {}", self.signals_total);
        println!("  Processed:          {}", self.signals_processed);
        println!("  Skipped (no data):  {}", self.signals_skipped);
        println!("  Failed:             {}", self.signals_failed);
        println!("  Waves:              {}", self.waves);
        println!("  Opened:             {}", self.opened);
        println!("  Rejected (capital): {}", self.rejected_capital);
        println!("  Rejected (dup):     {}", self.rejected_duplicate);
        println!("  Truncated:          {}", self.truncated);
        println!("{}", "-".repeat(60));
        println!("TRADES");
        println!("  Winning Trades:     {} ({:.1}%)", self.wins, self.win_rate_pct);
        println!("  Losing Trades:      {}", self.losses);
        println!("  Profit Factor:      {:.2}", self.profit_factor);
        println!("  Average Win:        ${:.2}", self.average_win);
        println!("  Average Loss:       ${:.2}", self.average_loss);
        println!("  Largest Win:        ${:.2}", self.largest_win);
        println!("  Largest Loss:       ${:.2}", self.largest_loss);
        println!("  Trailing Activated: {}", self.trailing_activations);
        println!("{}", "-".repeat(60));
        println!("P&L");
        println!("  Realized:           ${:.2}", self.realized_pnl);
        println!("  Max Potential:      ${:.2}", self.max_potential_pnl);
        println!("  Commission:         ${:.2}", self.total_commission);
        println!("  Min Equity:         ${:.2}", self.min_equity);
        println!("  Max Drawdown:       {:.2}%", self.max_drawdown_pct);
        println!("{}", "-".repeat(60));
        println!("BY CLOSE REASON");
        for (reason, count) in &self.close_reasons {
            println!("  {:<20}{}", reason, count);
        }
        println!("{}", "=".repeat(60));
    }
}

/// Ledger-level figures the calculator cannot derive from trades alone.
#[derive(Debug, Clone, Copy)]
pub struct LedgerTotals {
    pub initial_capital: Decimal,
    pub final_capital: Decimal,
    pub total_commission: Decimal,
    pub min_equity: Decimal,
    pub max_drawdown_pct: Decimal,
}

/// Calculator for run statistics
pub struct MetricsCalculator;

impl MetricsCalculator {
    /// Builds statistics from the per-signal rows and the ledger's closed trades.
    pub fn calculate(
        run_id: &str,
        policy: &str,
        rows: &[OutcomeRow],
        trades: &[ClosedTrade],
        totals: LedgerTotals,
        waves: u64,
    ) -> RunStatistics {
        let mut stats = RunStatistics {
            run_id: run_id.to_string(),
            policy: policy.to_string(),
            initial_capital: totals.initial_capital,
            final_capital: totals.final_capital,
            total_commission: totals.total_commission,
            min_equity: totals.min_equity,
            max_drawdown_pct: totals.max_drawdown_pct,
            signals_total: rows.len() as u64,
            waves,
            ..Default::default()
        };

        for row in rows {
            match row.status {
                SignalStatus::Skipped => stats.signals_skipped += 1,
                SignalStatus::Failed => stats.signals_failed += 1,
                status => {
                    stats.signals_processed += 1;
                    match status {
                        SignalStatus::Opened => stats.opened += 1,
                        SignalStatus::RejectedCapital => stats.rejected_capital += 1,
                        SignalStatus::RejectedDuplicate => stats.rejected_duplicate += 1,
                        SignalStatus::Truncated => stats.truncated += 1,
                        SignalStatus::Skipped | SignalStatus::Failed => {}
                    }
                }
            }
        }

        let (won, lost): (Vec<&ClosedTrade>, Vec<&ClosedTrade>) =
            trades.iter().partition(|t| t.outcome.is_win());
        let winners: Vec<Decimal> = won.iter().map(|t| t.outcome.realized_pnl()).collect();
        let losers: Vec<Decimal> = lost
            .iter()
            .map(|t| t.outcome.realized_pnl())
            .filter(|p| *p < Decimal::ZERO)
            .collect();

        stats.wins = winners.len() as u64;
        stats.losses = losers.len() as u64;
        stats.gross_profit = winners.iter().copied().sum();
        stats.gross_loss = losers.iter().map(|p| p.abs()).sum();
        stats.realized_pnl = trades.iter().map(|t| t.outcome.realized_pnl()).sum();
        stats.max_potential_pnl = trades.iter().map(|t| t.outcome.max_potential_profit).sum();

        for trade in trades {
            *stats
                .close_reasons
                .entry(trade.outcome.reason.as_str().to_string())
                .or_insert(0) += 1;
            if trade.outcome.trailing_activated {
                stats.trailing_activations += 1;
            }
            let entry = trade.position.entry_time;
            let exit = trade.outcome.close_time;
            stats.start = Some(stats.start.map_or(entry, |s| s.min(entry)));
            stats.end = Some(stats.end.map_or(exit, |e| e.max(exit)));
        }

        if !trades.is_empty() {
            stats.win_rate_pct = Decimal::from(stats.wins) / Decimal::from(trades.len() as u64) * dec!(100);
        }

        // Profit factor
        stats.profit_factor = if !stats.gross_loss.is_zero() {
            stats.gross_profit / stats.gross_loss
        } else if stats.gross_profit > Decimal::ZERO {
            dec!(100)
        } else {
            Decimal::ONE
        };

        if stats.wins > 0 {
            stats.average_win = stats.gross_profit / Decimal::from(stats.wins);
        }
        if stats.losses > 0 {
            stats.average_loss = stats.gross_loss / Decimal::from(stats.losses);
        }
        stats.largest_win = winners.iter().copied().max().unwrap_or(Decimal::ZERO);
        stats.largest_loss = losers.iter().map(|p| p.abs()).max().unwrap_or(Decimal::ZERO);

        stats
    }
}
