use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::config::ExitPolicy;
use crate::types::{Candle, Direction};

/// A level crossed inside a candle, before slippage is applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExitTrigger {
    TakeProfit(Decimal),
    StopLoss(Decimal),
    TrailingStop(Decimal),
}

/// Price `pct` percent away from `base` in the favorable direction.
fn favorable_offset(direction: Direction, base: Decimal, pct: Decimal) -> Decimal {
    base * (Decimal::ONE + direction.sign() * pct / dec!(100))
}

/// Price `pct` percent away from `base` in the adverse direction.
fn adverse_offset(direction: Direction, base: Decimal, pct: Decimal) -> Decimal {
    base * (Decimal::ONE - direction.sign() * pct / dec!(100))
}

fn adverse_crossed(direction: Direction, candle: &Candle, level: Decimal) -> bool {
    match direction {
        Direction::Long => candle.low <= level,
        Direction::Short => candle.high >= level,
    }
}

fn favorable_crossed(direction: Direction, candle: &Candle, level: Decimal) -> bool {
    match direction {
        Direction::Long => candle.high >= level,
        Direction::Short => candle.low <= level,
    }
}

/// Fixed take-profit / stop-loss levels, computed once from the entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedLevels {
    pub direction: Direction,
    pub take_profit: Decimal,
    pub stop_loss: Decimal,
}

impl FixedLevels {
    pub fn new(direction: Direction, entry: Decimal, tp_pct: Decimal, sl_pct: Decimal) -> Self {
        Self {
            direction,
            take_profit: favorable_offset(direction, entry, tp_pct),
            stop_loss: adverse_offset(direction, entry, sl_pct),
        }
    }

    /// When one bar spans both levels the stop wins: the bar's path is
    /// unknown, so the loss is assumed to have come first.
    pub fn check(&self, candle: &Candle) -> Option<ExitTrigger> {
        let hit_sl = adverse_crossed(self.direction, candle, self.stop_loss);
        let hit_tp = favorable_crossed(self.direction, candle, self.take_profit);
        if hit_sl {
            Some(ExitTrigger::StopLoss(self.stop_loss))
        } else if hit_tp {
            Some(ExitTrigger::TakeProfit(self.take_profit))
        } else {
            None
        }
    }
}

/// Activating trailing stop. Before activation only the insurance stop can
/// close the position; after activation the insurance stop is gone and the
/// trailing level ratchets behind the best price.
#[derive(Debug, Clone, PartialEq)]
pub struct TrailingStop {
    direction: Direction,
    activation_price: Decimal,
    distance_pct: Decimal,
    insurance_stop: Decimal,
    best_price: Decimal,
    stop_level: Option<Decimal>,
    activated_at: Option<DateTime<Utc>>,
}

impl TrailingStop {
    pub fn new(
        direction: Direction,
        entry: Decimal,
        activation_pct: Decimal,
        distance_pct: Decimal,
        insurance_sl_pct: Decimal,
    ) -> Self {
        Self {
            direction,
            activation_price: favorable_offset(direction, entry, activation_pct),
            distance_pct,
            insurance_stop: adverse_offset(direction, entry, insurance_sl_pct),
            best_price: entry,
            stop_level: None,
            activated_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.stop_level.is_some()
    }

    pub fn stop_level(&self) -> Option<Decimal> {
        self.stop_level
    }

    pub fn best_price(&self) -> Decimal {
        self.best_price
    }

    pub fn insurance_stop(&self) -> Decimal {
        self.insurance_stop
    }

    pub fn activated_at(&self) -> Option<DateTime<Utc>> {
        self.activated_at
    }

    /// Checks `candle` against the levels carried over from earlier candles.
    /// Must be called before [`TrailingStop::advance`] for the same candle, so a
    /// stop armed on this candle cannot fire on it.
    pub fn check(&self, candle: &Candle) -> Option<ExitTrigger> {
        match self.stop_level {
            Some(level) if adverse_crossed(self.direction, candle, level) => {
                Some(ExitTrigger::TrailingStop(level))
            }
            Some(_) => None,
            None if adverse_crossed(self.direction, candle, self.insurance_stop) => {
                Some(ExitTrigger::StopLoss(self.insurance_stop))
            }
            None => None,
        }
    }

    /// Folds the candle's favorable extreme into the best price, activates the
    /// trail once the activation level is reached and tightens the stop.
    pub fn advance(&mut self, candle: &Candle) {
        let extreme = candle.favorable_extreme(self.direction);
        self.best_price = match self.direction {
            Direction::Long => self.best_price.max(extreme),
            Direction::Short => self.best_price.min(extreme),
        };

        if self.stop_level.is_none() && favorable_crossed(self.direction, candle, self.activation_price) {
            self.activated_at = Some(candle.timestamp);
            self.stop_level = Some(self.trail_from_best());
            return;
        }

        if let Some(current) = self.stop_level {
            let candidate = self.trail_from_best();
            // Ratchet: the level only ever moves in the position's favor.
            self.stop_level = Some(match self.direction {
                Direction::Long => current.max(candidate),
                Direction::Short => current.min(candidate),
            });
        }
    }

    fn trail_from_best(&self) -> Decimal {
        adverse_offset(self.direction, self.best_price, self.distance_pct)
    }
}

/// Per-position exit rule state derived from the run's [`ExitPolicy`].
#[derive(Debug, Clone, PartialEq)]
pub enum ExitRule {
    Fixed(FixedLevels),
    Trailing(TrailingStop),
}

impl ExitRule {
    pub fn from_policy(policy: &ExitPolicy, direction: Direction, entry: Decimal) -> Self {
        match policy {
            ExitPolicy::FixedTpSl { tp_pct, sl_pct } => {
                ExitRule::Fixed(FixedLevels::new(direction, entry, *tp_pct, *sl_pct))
            }
            ExitPolicy::TrailingStop {
                activation_pct,
                distance_pct,
                insurance_sl_pct,
            } => ExitRule::Trailing(TrailingStop::new(
                direction,
                entry,
                *activation_pct,
                *distance_pct,
                *insurance_sl_pct,
            )),
        }
    }

    /// Evaluates one candle and updates trailing state when nothing fired.
    pub fn on_candle(&mut self, candle: &Candle) -> Option<ExitTrigger> {
        match self {
            ExitRule::Fixed(levels) => levels.check(candle),
            ExitRule::Trailing(trail) => {
                let trigger = trail.check(candle);
                if trigger.is_none() {
                    trail.advance(candle);
                }
                trigger
            }
        }
    }

    pub fn trailing(&self) -> Option<&TrailingStop> {
        match self {
            ExitRule::Trailing(trail) => Some(trail),
            ExitRule::Fixed(_) => None,
        }
    }
}
