use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::ExitPolicy;
use crate::risk::PnlBreakdown;

use super::{Direction, Signal};

/// Why a simulated position closed. Variants carry the data that only makes
/// sense for that exit path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum CloseReason {
    TakeProfit,
    /// `trigger` is the stop level before slippage.
    StopLoss { trigger: Decimal },
    TrailingStop { trigger: Decimal },
    Timeout,
    Liquidation { adverse_pct: Decimal },
    PeriodEnd,
    DataEnd,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::TakeProfit => "take_profit",
            CloseReason::StopLoss { .. } => "stop_loss",
            CloseReason::TrailingStop { .. } => "trailing_stop",
            CloseReason::Timeout => "timeout",
            CloseReason::Liquidation { .. } => "liquidation",
            CloseReason::PeriodEnd => "period_end",
            CloseReason::DataEnd => "data_end",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Terminal result of simulating one position. Built once by the simulator
/// (or by a forced close) and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitOutcome {
    pub close_price: Decimal,
    pub close_time: DateTime<Utc>,
    pub reason: CloseReason,
    pub pnl: PnlBreakdown,
    pub max_potential_profit: Decimal,
    /// Most favorable price seen while the position was open.
    pub best_price_reached: Decimal,
    /// Extremes over the whole candle sequence, including bars after the exit.
    pub absolute_max_price: Decimal,
    pub absolute_min_price: Decimal,
    pub trailing_activated: bool,
    pub trailing_activated_at: Option<DateTime<Utc>>,
    pub candles_evaluated: usize,
}

impl ExitOutcome {
    pub fn realized_pnl(&self) -> Decimal {
        self.pnl.realized_pnl
    }

    pub fn is_win(&self) -> bool {
        self.pnl.realized_pnl > Decimal::ZERO
    }
}

/// An opened position as tracked by the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub signal_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: Decimal,
    pub entry_time: DateTime<Utc>,
    /// Margin posted for the position.
    pub size: Decimal,
    pub leverage: Decimal,
    /// Capital held back at open: margin plus the round-trip commission.
    pub reserved: Decimal,
    pub policy: ExitPolicy,
}

impl Position {
    pub fn from_signal(
        signal: &Signal,
        entry_price: Decimal,
        entry_time: DateTime<Utc>,
        size: Decimal,
        leverage: Decimal,
        reserved: Decimal,
        policy: ExitPolicy,
    ) -> Self {
        Self {
            signal_id: signal.id.clone(),
            symbol: signal.symbol.clone(),
            direction: signal.direction,
            entry_price,
            entry_time,
            size,
            leverage,
            reserved,
            policy,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub position: Position,
    pub outcome: ExitOutcome,
}
