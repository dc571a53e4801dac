use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::config::{ExitPolicy, SimulationConfig};
use crate::engine::ExitSimulator;
use crate::error::{BacktestError, Result};
use crate::types::{Candle, ClosedTrade, CloseReason, ExitOutcome, Position, Signal};

use super::margin::MarginModel;

/// Source of mark prices for open positions.
pub trait PriceLookup {
    fn price_at(&self, symbol: &str, at: DateTime<Utc>) -> Option<Decimal>;
}

impl<F> PriceLookup for F
where
    F: Fn(&str, DateTime<Utc>) -> Option<Decimal>,
{
    fn price_at(&self, symbol: &str, at: DateTime<Utc>) -> Option<Decimal> {
        self(symbol, at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    InsufficientCapital,
    DuplicatePair,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::InsufficientCapital => "insufficient_capital",
            RejectReason::DuplicatePair => "duplicate_pair",
        }
    }
}

/// Result of the open gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenCheck {
    Ok,
    Rejected(RejectReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum OpenDecision {
    /// `settled` is true when the exit happened at the entry instant and the
    /// position went straight to the closed set.
    Opened { settled: bool },
    Rejected(RejectReason),
}

/// A position whose simulated exit lies in the future of the wave clock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenPosition {
    pub position: Position,
    pub scheduled: ExitOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquitySnapshot {
    pub timestamp: DateTime<Utc>,
    pub equity: Decimal,
    pub floating_pnl: Decimal,
    pub drawdown_pct: Decimal,
    pub open_positions: usize,
}

/// The run's single capital ledger. Every mutation goes through `&mut self`,
/// so callers get single-writer access by construction.
#[derive(Debug)]
pub struct CapitalLedger {
    margin: MarginModel,
    simulator: ExitSimulator,
    policy: ExitPolicy,
    floating_loss_cap_pct: Decimal,
    initial_capital: Decimal,
    available_capital: Decimal,
    open_positions: BTreeMap<String, OpenPosition>,
    closed_trades: Vec<ClosedTrade>,
    total_pnl: Decimal,
    total_commission: Decimal,
    min_equity: Decimal,
    peak_equity: Decimal,
    max_drawdown_pct: Decimal,
    equity_curve: Vec<EquitySnapshot>,
}

impl CapitalLedger {
    pub fn new(config: &SimulationConfig) -> Self {
        let initial = config.capital.initial_capital;
        Self {
            margin: MarginModel::from_settings(&config.capital),
            simulator: ExitSimulator::from_config(config),
            policy: config.exit.policy.clone(),
            floating_loss_cap_pct: config.capital.floating_loss_cap_pct,
            initial_capital: initial,
            available_capital: initial,
            open_positions: BTreeMap::new(),
            closed_trades: Vec::new(),
            total_pnl: Decimal::ZERO,
            total_commission: Decimal::ZERO,
            min_equity: initial,
            peak_equity: initial,
            max_drawdown_pct: Decimal::ZERO,
            equity_curve: Vec::new(),
        }
    }

    pub fn margin(&self) -> &MarginModel {
        &self.margin
    }

    pub fn initial_capital(&self) -> Decimal {
        self.initial_capital
    }

    pub fn available_capital(&self) -> Decimal {
        self.available_capital
    }

    pub fn total_pnl(&self) -> Decimal {
        self.total_pnl
    }

    pub fn total_commission(&self) -> Decimal {
        self.total_commission
    }

    pub fn min_equity(&self) -> Decimal {
        self.min_equity
    }

    pub fn max_drawdown_pct(&self) -> Decimal {
        self.max_drawdown_pct
    }

    pub fn open_positions(&self) -> impl Iterator<Item = &OpenPosition> {
        self.open_positions.values()
    }

    pub fn open_count(&self) -> usize {
        self.open_positions.len()
    }

    pub fn has_open_position(&self, symbol: &str) -> bool {
        self.open_positions.contains_key(symbol)
    }

    pub fn closed_trades(&self) -> &[ClosedTrade] {
        &self.closed_trades
    }

    pub fn equity_curve(&self) -> &[EquitySnapshot] {
        &self.equity_curve
    }

    pub fn can_open(&self, symbol: &str) -> OpenCheck {
        if self.has_open_position(symbol) {
            return OpenCheck::Rejected(RejectReason::DuplicatePair);
        }
        if self.available_capital < self.margin.reserved_capital() {
            return OpenCheck::Rejected(RejectReason::InsufficientCapital);
        }
        OpenCheck::Ok
    }

    /// Reserves capital, simulates the exit over `candles` and tracks the
    /// position. A simulation failure releases the reservation and surfaces
    /// as a data gap.
    pub fn open(
        &mut self,
        signal: &Signal,
        entry_price: Decimal,
        entry_time: DateTime<Utc>,
        candles: &[Candle],
        simulation_end: Option<DateTime<Utc>>,
    ) -> Result<OpenDecision> {
        if let OpenCheck::Rejected(reason) = self.can_open(&signal.symbol) {
            debug!("[{}] {} rejected: {}", signal.symbol, signal.id, reason.as_str());
            return Ok(OpenDecision::Rejected(reason));
        }

        let position = self.reserve(signal, entry_price, entry_time)?;
        let simulated = self.simulator.simulate(
            entry_price,
            signal.direction,
            candles,
            &self.policy,
            entry_time,
            simulation_end,
        );

        match simulated {
            Ok(outcome) => self.track(position, outcome),
            Err(e) => {
                self.release_reservation(&position)?;
                Err(BacktestError::data_gap(&signal.id, &signal.symbol, e.to_string()))
            }
        }
    }

    /// Same as [`CapitalLedger::open`] for an outcome simulated elsewhere.
    pub fn open_with_outcome(
        &mut self,
        signal: &Signal,
        entry_price: Decimal,
        entry_time: DateTime<Utc>,
        outcome: ExitOutcome,
    ) -> Result<OpenDecision> {
        if let OpenCheck::Rejected(reason) = self.can_open(&signal.symbol) {
            debug!("[{}] {} rejected: {}", signal.symbol, signal.id, reason.as_str());
            return Ok(OpenDecision::Rejected(reason));
        }

        let position = self.reserve(signal, entry_price, entry_time)?;
        self.track(position, outcome)
    }

    /// Net P&L after fees, floored at the posted margin plus fees.
    pub fn cap_loss_to_margin(&self, gross_pnl: Decimal, entry_fee: Decimal, exit_fee: Decimal) -> Decimal {
        self.margin.cap_loss_to_margin(gross_pnl, entry_fee, exit_fee)
    }

    /// Settles every open position whose simulated exit is at or before
    /// `wave_time`, in exit-time order.
    pub fn close_due(&mut self, wave_time: DateTime<Utc>) -> Result<Vec<ClosedTrade>> {
        let mut due: Vec<(DateTime<Utc>, String)> = self
            .open_positions
            .iter()
            .filter(|(_, open)| open.scheduled.close_time <= wave_time)
            .map(|(symbol, open)| (open.scheduled.close_time, symbol.clone()))
            .collect();
        due.sort();

        let mut closed = Vec::with_capacity(due.len());
        for (_, symbol) in due {
            if let Some(open) = self.open_positions.remove(&symbol) {
                closed.push(self.settle(open.position, open.scheduled)?);
            }
        }
        Ok(closed)
    }

    /// Marks open positions at `prices` and records an equity point. Floating
    /// losses are clamped to the configured share of posted margin.
    pub fn mark_to_market(&mut self, wave_time: DateTime<Utc>, prices: &impl PriceLookup) -> EquitySnapshot {
        let floating_pnl: Decimal = self
            .open_positions
            .values()
            .map(|open| {
                let p = &open.position;
                let price = prices.price_at(&p.symbol, wave_time).unwrap_or(p.entry_price);
                self.margin
                    .floating_pnl(p.direction, p.entry_price, price, self.floating_loss_cap_pct)
            })
            .sum();

        let equity = self.initial_capital + self.total_pnl + floating_pnl;
        self.observe_equity(equity);

        let snapshot = EquitySnapshot {
            timestamp: wave_time,
            equity,
            floating_pnl,
            drawdown_pct: self.drawdown_from_peak(equity),
            open_positions: self.open_positions.len(),
        };
        self.equity_curve.push(snapshot.clone());
        snapshot
    }

    /// Closes everything still open at `end_time`. Positions whose simulated
    /// exit is already due settle as simulated; the rest close at the last
    /// price at or before `end_time` with `PeriodEnd`.
    pub fn force_close_all(&mut self, end_time: DateTime<Utc>, prices: &impl PriceLookup) -> Result<Vec<ClosedTrade>> {
        let mut closed = self.close_due(end_time)?;

        let symbols: Vec<String> = self.open_positions.keys().cloned().collect();
        if !symbols.is_empty() {
            info!("Force-closing {} position(s) at {}", symbols.len(), end_time);
        }

        for symbol in symbols {
            let Some(open) = self.open_positions.remove(&symbol) else {
                continue;
            };
            let p = &open.position;
            let price = match prices.price_at(&p.symbol, end_time) {
                Some(price) => price,
                None => {
                    warn!("[{}] no price at {} for forced close, using entry price", p.symbol, end_time);
                    p.entry_price
                }
            };

            let outcome = ExitOutcome {
                close_price: price,
                close_time: end_time,
                reason: CloseReason::PeriodEnd,
                pnl: self.margin.settle(p.direction, p.entry_price, price),
                ..open.scheduled
            };
            closed.push(self.settle(open.position, outcome)?);
        }

        let realized_equity = self.initial_capital + self.total_pnl;
        self.observe_equity(realized_equity);
        self.check_invariants()?;
        Ok(closed)
    }

    /// Verifies the ledger-wide invariants. Violations are programming errors.
    pub fn check_invariants(&self) -> Result<()> {
        if self.available_capital < Decimal::ZERO {
            return Err(BacktestError::PolicyViolation(format!(
                "available capital is negative: {}",
                self.available_capital
            )));
        }
        let held: Decimal = self.open_positions.values().map(|o| o.position.reserved).sum();
        let expected = self.initial_capital + self.total_pnl - held;
        if expected != self.available_capital {
            return Err(BacktestError::PolicyViolation(format!(
                "capital does not reconcile: available {} vs expected {}",
                self.available_capital, expected
            )));
        }
        Ok(())
    }

    fn reserve(&mut self, signal: &Signal, entry_price: Decimal, entry_time: DateTime<Utc>) -> Result<Position> {
        let reserved = self.margin.reserved_capital();
        if self.available_capital < reserved {
            return Err(BacktestError::PolicyViolation(format!(
                "reservation of {} exceeds available capital {}",
                reserved, self.available_capital
            )));
        }
        self.available_capital -= reserved;
        Ok(Position::from_signal(
            signal,
            entry_price,
            entry_time,
            self.margin.position_size,
            self.margin.leverage,
            reserved,
            self.policy.clone(),
        ))
    }

    fn release_reservation(&mut self, position: &Position) -> Result<()> {
        self.available_capital += position.reserved;
        self.check_invariants()
    }

    fn track(&mut self, position: Position, outcome: ExitOutcome) -> Result<OpenDecision> {
        if outcome.close_time <= position.entry_time {
            self.settle(position, outcome)?;
            return Ok(OpenDecision::Opened { settled: true });
        }

        debug!(
            "[{}] opened {} {} @ {} (exit {} at {})",
            position.symbol, position.signal_id, position.direction, position.entry_price,
            outcome.reason, outcome.close_time
        );
        let symbol = position.symbol.clone();
        let previous = self.open_positions.insert(
            symbol.clone(),
            OpenPosition {
                position,
                scheduled: outcome,
            },
        );
        if previous.is_some() {
            return Err(BacktestError::PolicyViolation(format!(
                "second open position for {}",
                symbol
            )));
        }
        Ok(OpenDecision::Opened { settled: false })
    }

    fn settle(&mut self, position: Position, outcome: ExitOutcome) -> Result<ClosedTrade> {
        let pnl = &outcome.pnl;
        let capped = self.cap_loss_to_margin(pnl.gross_pnl, pnl.entry_fee, pnl.exit_fee);
        if pnl.realized_pnl != capped {
            return Err(BacktestError::PolicyViolation(format!(
                "{} realized {} but the margin-capped P&L is {}",
                position.signal_id, pnl.realized_pnl, capped
            )));
        }

        self.available_capital += position.reserved + pnl.realized_pnl;
        if self.available_capital < Decimal::ZERO {
            return Err(BacktestError::PolicyViolation(format!(
                "closing {} drove available capital to {}",
                position.signal_id, self.available_capital
            )));
        }
        self.total_pnl += pnl.realized_pnl;
        self.total_commission += pnl.total_fees();

        debug!(
            "[{}] closed {} via {} @ {}: {:.2}",
            position.symbol, position.signal_id, outcome.reason, outcome.close_price, pnl.realized_pnl
        );

        Ok(self.record_close(position, outcome))
    }

    fn record_close(&mut self, position: Position, outcome: ExitOutcome) -> ClosedTrade {
        let trade = ClosedTrade { position, outcome };
        self.closed_trades.push(trade.clone());
        trade
    }

    fn observe_equity(&mut self, equity: Decimal) {
        self.min_equity = self.min_equity.min(equity);
        self.peak_equity = self.peak_equity.max(equity);
        self.max_drawdown_pct = self.max_drawdown_pct.max(self.drawdown_from_peak(equity));
    }

    fn drawdown_from_peak(&self, equity: Decimal) -> Decimal {
        if self.peak_equity <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        ((self.peak_equity - equity) / self.peak_equity * dec!(100)).max(Decimal::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::PnlBreakdown;
    use crate::types::Direction;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn config(initial: Decimal) -> SimulationConfig {
        let mut config = SimulationConfig::default();
        config.capital.initial_capital = initial;
        config.capital.position_size = dec!(100);
        config.capital.leverage = dec!(10);
        config.capital.commission_rate = dec!(0.001);
        config
    }

    fn signal(id: &str, symbol: &str, minutes: i64) -> Signal {
        Signal::new(id, symbol, Direction::Long, t0() + Duration::minutes(minutes), dec!(1))
    }

    fn outcome(model: &MarginModel, close: Decimal, close_time: DateTime<Utc>, reason: CloseReason) -> ExitOutcome {
        ExitOutcome {
            close_price: close,
            close_time,
            reason,
            pnl: model.settle(Direction::Long, dec!(100), close),
            max_potential_profit: Decimal::ZERO,
            best_price_reached: dec!(100),
            absolute_max_price: dec!(100),
            absolute_min_price: close,
            trailing_activated: false,
            trailing_activated_at: None,
            candles_evaluated: 1,
        }
    }

    fn no_prices(_: &str, _: DateTime<Utc>) -> Option<Decimal> {
        None
    }

    #[test]
    fn test_duplicate_symbol_is_rejected_not_overwritten() {
        let mut ledger = CapitalLedger::new(&config(dec!(1000)));
        let m = *ledger.margin();
        let exit = outcome(&m, dec!(104), t0() + Duration::hours(2), CloseReason::TakeProfit);

        let first = ledger.open_with_outcome(&signal("a", "BTCUSDT", 0), dec!(100), t0(), exit.clone()).unwrap();
        assert_eq!(first, OpenDecision::Opened { settled: false });
        let second = ledger.open_with_outcome(&signal("b", "BTCUSDT", 5), dec!(100), t0(), exit).unwrap();
        assert_eq!(second, OpenDecision::Rejected(RejectReason::DuplicatePair));
        assert_eq!(ledger.open_count(), 1);
        assert_eq!(ledger.open_positions().next().unwrap().position.signal_id, "a");
    }

    #[test]
    fn test_capital_reserved_at_open_and_released_at_close() {
        let mut ledger = CapitalLedger::new(&config(dec!(1000)));
        let m = *ledger.margin();
        let exit = outcome(&m, dec!(104), t0() + Duration::hours(1), CloseReason::TakeProfit);

        ledger.open_with_outcome(&signal("a", "ETHUSDT", 0), dec!(100), t0(), exit).unwrap();
        assert_eq!(ledger.available_capital(), dec!(1000) - dec!(102));

        assert!(ledger.close_due(t0() + Duration::minutes(30)).unwrap().is_empty());
        let closed = ledger.close_due(t0() + Duration::hours(1)).unwrap();
        assert_eq!(closed.len(), 1);
        // 40 gross minus 2 commission
        assert_eq!(ledger.available_capital(), dec!(1038));
        assert_eq!(ledger.total_pnl(), dec!(38));
        assert_eq!(ledger.total_commission(), dec!(2));
        assert!(ledger.check_invariants().is_ok());
    }

    #[test]
    fn test_insufficient_capital_gate() {
        let mut ledger = CapitalLedger::new(&config(dec!(150)));
        let m = *ledger.margin();
        let exit = outcome(&m, dec!(101), t0() + Duration::hours(1), CloseReason::DataEnd);

        assert!(matches!(
            ledger.open_with_outcome(&signal("a", "BTCUSDT", 0), dec!(100), t0(), exit.clone()).unwrap(),
            OpenDecision::Opened { .. }
        ));
        assert_eq!(ledger.can_open("ETHUSDT"), OpenCheck::Rejected(RejectReason::InsufficientCapital));
        assert_eq!(
            ledger.open_with_outcome(&signal("b", "ETHUSDT", 0), dec!(100), t0(), exit).unwrap(),
            OpenDecision::Rejected(RejectReason::InsufficientCapital)
        );
    }

    #[test]
    fn test_full_margin_loss_never_drives_capital_negative() {
        // Exactly enough for two positions, both lose everything.
        let mut ledger = CapitalLedger::new(&config(dec!(204)));
        let m = *ledger.margin();
        let wipe = outcome(&m, dec!(1), t0() + Duration::hours(1), CloseReason::Liquidation { adverse_pct: dec!(99) });
        assert!(wipe.pnl.capped);

        ledger.open_with_outcome(&signal("a", "BTCUSDT", 0), dec!(100), t0(), wipe.clone()).unwrap();
        ledger.open_with_outcome(&signal("b", "ETHUSDT", 0), dec!(100), t0(), wipe).unwrap();
        assert_eq!(ledger.available_capital(), Decimal::ZERO);

        ledger.close_due(t0() + Duration::hours(2)).unwrap();
        assert_eq!(ledger.available_capital(), Decimal::ZERO);
        assert_eq!(ledger.total_pnl(), dec!(-204));
        assert!(ledger.check_invariants().is_ok());
    }

    #[test]
    fn test_settling_below_margin_floor_is_a_policy_violation() {
        let mut ledger = CapitalLedger::new(&config(dec!(1000)));
        let m = *ledger.margin();
        let mut bogus = outcome(&m, dec!(50), t0() + Duration::hours(1), CloseReason::StopLoss { trigger: dec!(97) });
        bogus.pnl = PnlBreakdown {
            pnl_pct: dec!(-50),
            gross_pnl: dec!(-500),
            entry_fee: dec!(1),
            exit_fee: dec!(1),
            realized_pnl: dec!(-502),
            capped: false,
        };
        ledger.open_with_outcome(&signal("a", "BTCUSDT", 0), dec!(100), t0(), bogus).unwrap();
        let err = ledger.close_due(t0() + Duration::hours(1)).unwrap_err();
        assert!(matches!(err, BacktestError::PolicyViolation(_)));
    }

    #[test]
    fn test_irregular_prices_reconcile_exactly() {
        let mut cfg = config(dec!(10000));
        cfg.capital.commission_rate = dec!(0.0007);
        let mut ledger = CapitalLedger::new(&cfg);
        let m = *ledger.margin();
        let symbols = ["AUSDT", "BUSDT", "CUSDT", "DUSDT", "EUSDT", "FUSDT", "GUSDT", "HUSDT"];
        let entries = [dec!(3), dec!(7), dec!(0.0123), dec!(61234.7), dec!(1.1), dec!(13), dec!(0.37), dec!(977.77)];

        for round in 0..50i64 {
            let opened_at = t0() + Duration::hours(round);
            for (i, (symbol, entry)) in symbols.iter().zip(entries).enumerate() {
                let k = round + i as i64;
                let close = entry * (Decimal::ONE + Decimal::from(k % 11 - 5) / dec!(97));
                let direction = if k % 2 == 0 { Direction::Long } else { Direction::Short };
                let exit = ExitOutcome {
                    close_price: close,
                    close_time: opened_at + Duration::minutes(20),
                    reason: CloseReason::DataEnd,
                    pnl: m.settle(direction, entry, close),
                    max_potential_profit: Decimal::ZERO,
                    best_price_reached: entry,
                    absolute_max_price: entry.max(close),
                    absolute_min_price: entry.min(close),
                    trailing_activated: false,
                    trailing_activated_at: None,
                    candles_evaluated: 2,
                };
                let sig = Signal::new(format!("{}-{}", symbol, round), *symbol, direction, opened_at, dec!(1));
                ledger.open_with_outcome(&sig, entry, opened_at, exit).unwrap();
                ledger.check_invariants().unwrap();
            }
            ledger.close_due(opened_at + Duration::minutes(30)).unwrap();
            ledger.check_invariants().unwrap();
        }

        assert_eq!(ledger.closed_trades().len(), 400);
        assert_eq!(ledger.open_count(), 0);
        assert_eq!(ledger.available_capital(), ledger.initial_capital() + ledger.total_pnl());
    }

    #[test]
    fn test_exit_at_entry_instant_settles_synchronously() {
        let mut ledger = CapitalLedger::new(&config(dec!(1000)));
        let m = *ledger.margin();
        let instant = outcome(&m, dec!(97), t0(), CloseReason::StopLoss { trigger: dec!(97) });
        let decision = ledger.open_with_outcome(&signal("a", "BTCUSDT", 0), dec!(100), t0(), instant).unwrap();
        assert_eq!(decision, OpenDecision::Opened { settled: true });
        assert_eq!(ledger.open_count(), 0);
        assert_eq!(ledger.closed_trades().len(), 1);
    }

    #[test]
    fn test_open_runs_simulation_and_releases_on_data_gap() {
        let mut ledger = CapitalLedger::new(&config(dec!(1000)));
        let err = ledger
            .open(&signal("a", "BTCUSDT", 0), dec!(100), t0(), &[], None)
            .unwrap_err();
        assert!(matches!(err, BacktestError::DataGap { .. }));
        assert_eq!(ledger.available_capital(), dec!(1000));

        let candles = vec![
            Candle::new(t0(), dec!(100), dec!(101), dec!(99.5), dec!(100.5)),
            Candle::new(t0() + Duration::minutes(15), dec!(100.5), dec!(104.5), dec!(100), dec!(104)),
        ];
        let decision = ledger.open(&signal("b", "BTCUSDT", 0), dec!(100), t0(), &candles, None).unwrap();
        assert_eq!(decision, OpenDecision::Opened { settled: false });
        let scheduled = &ledger.open_positions().next().unwrap().scheduled;
        assert_eq!(scheduled.reason, CloseReason::TakeProfit);
    }

    #[test]
    fn test_mark_to_market_clamps_floating_loss_and_tracks_drawdown() {
        let mut ledger = CapitalLedger::new(&config(dec!(1000)));
        let m = *ledger.margin();
        let later = outcome(&m, dec!(101), t0() + Duration::days(1), CloseReason::DataEnd);
        ledger.open_with_outcome(&signal("a", "BTCUSDT", 0), dec!(100), t0(), later).unwrap();

        let crash = |_: &str, _: DateTime<Utc>| Some(dec!(50));
        let snap = ledger.mark_to_market(t0() + Duration::hours(1), &crash);
        assert_eq!(snap.floating_pnl, dec!(-95));
        assert_eq!(snap.equity, dec!(905));
        assert_eq!(ledger.min_equity(), dec!(905));
        assert_eq!(ledger.max_drawdown_pct(), dec!(9.5));
        assert_eq!(ledger.equity_curve().len(), 1);
    }

    #[test]
    fn test_force_close_all_leaves_nothing_open() {
        let mut ledger = CapitalLedger::new(&config(dec!(1000)));
        let m = *ledger.margin();
        let early = outcome(&m, dec!(104), t0() + Duration::hours(1), CloseReason::TakeProfit);
        let late = outcome(&m, dec!(110), t0() + Duration::days(3), CloseReason::Timeout);
        ledger.open_with_outcome(&signal("a", "BTCUSDT", 0), dec!(100), t0(), early).unwrap();
        ledger.open_with_outcome(&signal("b", "ETHUSDT", 0), dec!(100), t0(), late).unwrap();

        let prices = |symbol: &str, _: DateTime<Utc>| (symbol == "ETHUSDT").then(|| dec!(102));
        let closed = ledger.force_close_all(t0() + Duration::hours(6), &prices).unwrap();

        assert_eq!(closed.len(), 2);
        assert_eq!(ledger.open_count(), 0);
        let forced = closed.iter().find(|t| t.position.symbol == "ETHUSDT").unwrap();
        assert_eq!(forced.outcome.reason, CloseReason::PeriodEnd);
        assert_eq!(forced.outcome.close_price, dec!(102));
        assert_eq!(forced.outcome.realized_pnl(), dec!(18));
        assert_eq!(ledger.available_capital(), dec!(1000) + dec!(38) + dec!(18));
    }

    #[test]
    fn test_force_close_without_price_uses_entry() {
        let mut ledger = CapitalLedger::new(&config(dec!(1000)));
        let m = *ledger.margin();
        let late = outcome(&m, dec!(110), t0() + Duration::days(3), CloseReason::Timeout);
        ledger.open_with_outcome(&signal("a", "BTCUSDT", 0), dec!(100), t0(), late).unwrap();
        let closed = ledger.force_close_all(t0() + Duration::hours(1), &no_prices).unwrap();
        assert_eq!(closed[0].outcome.realized_pnl(), dec!(-2));
    }
}
