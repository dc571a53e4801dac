use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use thiserror::Error;

use crate::config::{ExitPolicy, SimulationConfig};
use crate::risk::{pnl_pct, MarginModel};
use crate::types::{Candle, CloseReason, Direction, ExitOutcome};

use super::exits::{ExitRule, ExitTrigger};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimulationError {
    #[error("no candles at or after entry time")]
    NoCandles,
    #[error("entry price must be positive")]
    InvalidEntryPrice,
}

/// Run-wide parameters of the exit simulation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulationParams {
    pub margin: MarginModel,
    pub liquidation_threshold: Decimal,
    pub stop_slippage_pct: Decimal,
    pub max_holding: Duration,
}

impl SimulationParams {
    pub fn from_config(config: &SimulationConfig) -> Self {
        Self {
            margin: MarginModel::from_settings(&config.capital),
            liquidation_threshold: config.capital.liquidation_threshold,
            stop_slippage_pct: config.exit.stop_slippage_pct,
            max_holding: config.max_holding(),
        }
    }
}

/// Pure exit simulator. Holds no mutable state, so one instance can be shared
/// by every worker.
#[derive(Debug, Clone)]
pub struct ExitSimulator {
    params: SimulationParams,
}

struct Fill {
    price: Decimal,
    time: DateTime<Utc>,
    reason: CloseReason,
}

impl ExitSimulator {
    pub fn new(params: SimulationParams) -> Self {
        Self { params }
    }

    pub fn from_config(config: &SimulationConfig) -> Self {
        Self::new(SimulationParams::from_config(config))
    }

    pub fn params(&self) -> &SimulationParams {
        &self.params
    }

    /// Walks `candles` (ascending) from `entry_time` and returns the first exit.
    ///
    /// Per candle, liquidation is checked first, then the policy's levels. If
    /// nothing fires the position closes at the last evaluated close with
    /// `Timeout` once the holding horizon has been reached, `PeriodEnd` when
    /// `simulation_end` arrives first, and `DataEnd` otherwise.
    pub fn simulate(
        &self,
        entry_price: Decimal,
        direction: Direction,
        candles: &[Candle],
        policy: &ExitPolicy,
        entry_time: DateTime<Utc>,
        simulation_end: Option<DateTime<Utc>>,
    ) -> Result<ExitOutcome, SimulationError> {
        if entry_price <= Decimal::ZERO {
            return Err(SimulationError::InvalidEntryPrice);
        }

        let start = candles.partition_point(|c| c.timestamp < entry_time);
        let candles = &candles[start..];
        if candles.is_empty() {
            return Err(SimulationError::NoCandles);
        }

        let deadline = entry_time + self.params.max_holding;
        let liquidation_pct = self.params.margin.liquidation_pct(self.params.liquidation_threshold);

        let mut rule = ExitRule::from_policy(policy, direction, entry_price);
        let mut absolute_max = candles[0].high;
        let mut absolute_min = candles[0].low;
        let mut best_while_open = entry_price;
        let mut last_evaluated: Option<&Candle> = None;
        let mut evaluated = 0usize;
        let mut horizon_reached = false;
        let mut fill: Option<Fill> = None;

        for candle in candles {
            // Reporting extremes cover the whole sequence, exit or not.
            absolute_max = absolute_max.max(candle.high);
            absolute_min = absolute_min.min(candle.low);

            if fill.is_some() || horizon_reached {
                continue;
            }

            if let Some(end) = simulation_end {
                if candle.timestamp >= end {
                    fill = Some(Fill {
                        price: last_evaluated.map(|c| c.close).unwrap_or(entry_price),
                        time: end,
                        reason: CloseReason::PeriodEnd,
                    });
                    continue;
                }
            }

            if candle.timestamp > deadline {
                horizon_reached = true;
                continue;
            }

            evaluated += 1;
            best_while_open = better_price(direction, best_while_open, candle.favorable_extreme(direction));

            let adverse = candle.adverse_extreme(direction);
            let adverse_pct = -pnl_pct(direction, entry_price, adverse);
            if adverse_pct >= liquidation_pct {
                fill = Some(Fill {
                    price: adverse,
                    time: candle.timestamp,
                    reason: CloseReason::Liquidation { adverse_pct },
                });
                continue;
            }

            if let Some(trigger) = rule.on_candle(candle) {
                fill = Some(self.fill_trigger(direction, trigger, candle.timestamp));
                continue;
            }

            last_evaluated = Some(candle);
            if candle.timestamp >= deadline {
                horizon_reached = true;
            }
        }

        let fill = match fill {
            Some(fill) => fill,
            None => {
                let last = last_evaluated.ok_or(SimulationError::NoCandles)?;
                Fill {
                    price: last.close,
                    time: last.timestamp,
                    reason: if horizon_reached {
                        CloseReason::Timeout
                    } else {
                        CloseReason::DataEnd
                    },
                }
            }
        };

        let absolute_best = match direction {
            Direction::Long => absolute_max,
            Direction::Short => absolute_min,
        };
        let margin = &self.params.margin;
        let trailing = rule.trailing();

        Ok(ExitOutcome {
            close_price: fill.price,
            close_time: fill.time,
            pnl: margin.settle(direction, entry_price, fill.price),
            reason: fill.reason,
            max_potential_profit: margin.gross_pnl(pnl_pct(direction, entry_price, absolute_best)),
            best_price_reached: trailing.map(|t| t.best_price()).unwrap_or(best_while_open),
            absolute_max_price: absolute_max,
            absolute_min_price: absolute_min,
            trailing_activated: trailing.map(|t| t.is_active()).unwrap_or(false),
            trailing_activated_at: trailing.and_then(|t| t.activated_at()),
            candles_evaluated: evaluated,
        })
    }

    fn fill_trigger(&self, direction: Direction, trigger: ExitTrigger, time: DateTime<Utc>) -> Fill {
        match trigger {
            ExitTrigger::TakeProfit(level) => Fill {
                price: level,
                time,
                reason: CloseReason::TakeProfit,
            },
            ExitTrigger::StopLoss(level) => Fill {
                price: self.slipped(direction, level),
                time,
                reason: CloseReason::StopLoss { trigger: level },
            },
            ExitTrigger::TrailingStop(level) => Fill {
                price: self.slipped(direction, level),
                time,
                reason: CloseReason::TrailingStop { trigger: level },
            },
        }
    }

    /// Stop fills execute a constant slippage worse than the trigger.
    fn slipped(&self, direction: Direction, level: Decimal) -> Decimal {
        level * (Decimal::ONE - direction.sign() * self.params.stop_slippage_pct / dec!(100))
    }
}

fn better_price(direction: Direction, current: Decimal, candidate: Decimal) -> Decimal {
    match direction {
        Direction::Long => current.max(candidate),
        Direction::Short => current.min(candidate),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
    }

    fn bar(i: i64, high: Decimal, low: Decimal, close: Decimal) -> Candle {
        Candle::new(t0() + Duration::minutes(15 * i), close, high, low, close)
    }

    fn params(leverage: Decimal, commission: Decimal, slippage: Decimal) -> SimulationParams {
        SimulationParams {
            margin: MarginModel::new(dec!(100), leverage, commission),
            liquidation_threshold: dec!(0.9),
            stop_slippage_pct: slippage,
            max_holding: Duration::hours(48),
        }
    }

    fn frictionless() -> ExitSimulator {
        ExitSimulator::new(params(dec!(10), Decimal::ZERO, Decimal::ZERO))
    }

    #[test]
    fn test_take_profit_fills_at_level_and_reports_absolute_max() {
        let candles = vec![
            bar(0, dec!(101), dec!(99), dec!(100)),
            bar(1, dec!(104.5), dec!(102), dec!(104)),
            bar(2, dec!(106), dec!(103), dec!(105)),
        ];
        let outcome = frictionless()
            .simulate(dec!(100), Direction::Long, &candles, &ExitPolicy::fixed(dec!(4), dec!(3)), t0(), None)
            .unwrap();

        assert_eq!(outcome.reason, CloseReason::TakeProfit);
        assert_eq!(outcome.close_price, dec!(104));
        assert_eq!(outcome.close_time, candles[1].timestamp);
        // position_size x leverage x 4%
        assert_eq!(outcome.realized_pnl(), dec!(100) * dec!(10) * dec!(0.04));
        assert_eq!(outcome.absolute_max_price, dec!(106));
        assert_eq!(outcome.max_potential_profit, dec!(60));
        assert_eq!(outcome.candles_evaluated, 2);
    }

    #[test]
    fn test_stop_loss_priority_on_wide_candle() {
        // Stop-loss takes priority when one candle crosses both levels.
        let sim = frictionless();
        let policy = ExitPolicy::fixed(dec!(4), dec!(3));
        let long_bar = vec![bar(0, dec!(105), dec!(96.5), dec!(100))];
        let long = sim.simulate(dec!(100), Direction::Long, &long_bar, &policy, t0(), None).unwrap();
        assert_eq!(long.reason, CloseReason::StopLoss { trigger: dec!(97) });

        let short_bar = vec![bar(0, dec!(103.5), dec!(95), dec!(100))];
        let short = sim.simulate(dec!(100), Direction::Short, &short_bar, &policy, t0(), None).unwrap();
        assert_eq!(short.reason, CloseReason::StopLoss { trigger: dec!(103) });
    }

    #[test]
    fn test_stop_fill_includes_adverse_slippage() {
        let sim = ExitSimulator::new(params(dec!(10), Decimal::ZERO, dec!(0.05)));
        let candles = vec![bar(0, dec!(100.5), dec!(96), dec!(97))];
        let long = sim
            .simulate(dec!(100), Direction::Long, &candles, &ExitPolicy::fixed(dec!(4), dec!(3)), t0(), None)
            .unwrap();
        assert_eq!(long.close_price, dec!(96.9515));

        let up = vec![bar(0, dec!(104), dec!(99.5), dec!(103))];
        let short = sim
            .simulate(dec!(100), Direction::Short, &up, &ExitPolicy::fixed(dec!(4), dec!(3)), t0(), None)
            .unwrap();
        assert_eq!(short.close_price, dec!(103.0515));

        // Take-profit fills are exact.
        let tp = vec![bar(0, dec!(104.2), dec!(99.5), dec!(104))];
        let tp_outcome = sim
            .simulate(dec!(100), Direction::Long, &tp, &ExitPolicy::fixed(dec!(4), dec!(3)), t0(), None)
            .unwrap();
        assert_eq!(tp_outcome.close_price, dec!(104));
    }

    #[test]
    fn test_short_trailing_stop_example() {
        let sim = ExitSimulator::new(params(dec!(10), dec!(0.0005), dec!(0.05)));
        let policy = ExitPolicy::trailing(dec!(2), dec!(1), dec!(5));
        let candles = vec![
            bar(0, dec!(100.2), dec!(99), dec!(99.2)),
            bar(1, dec!(99.3), dec!(97.5), dec!(97.8)),
            bar(2, dec!(98.6), dec!(97.8), dec!(98.5)),
        ];
        let outcome = sim.simulate(dec!(100), Direction::Short, &candles, &policy, t0(), None).unwrap();

        assert!(outcome.trailing_activated);
        assert_eq!(outcome.trailing_activated_at, Some(candles[1].timestamp));
        assert_eq!(outcome.best_price_reached, dec!(97.5));
        assert_eq!(outcome.reason, CloseReason::TrailingStop { trigger: dec!(98.475) });
        assert_eq!(outcome.close_time, candles[2].timestamp);
        assert!(outcome.realized_pnl() > Decimal::ZERO);
    }

    #[test]
    fn test_trailing_cannot_trigger_on_activation_candle() {
        // One wide bar reaches the activation level and swings back through
        // what would be the stop. It must not close as a trailing stop.
        let sim = frictionless();
        let policy = ExitPolicy::trailing(dec!(2), dec!(1), dec!(5));
        let candles = vec![
            bar(0, dec!(103), dec!(99), dec!(100)),
            bar(1, dec!(100.5), dec!(99.8), dec!(100.2)),
        ];
        let outcome = sim.simulate(dec!(100), Direction::Long, &candles, &policy, t0(), None).unwrap();

        assert!(outcome.trailing_activated);
        assert_eq!(outcome.trailing_activated_at, Some(candles[0].timestamp));
        assert_eq!(outcome.reason, CloseReason::TrailingStop { trigger: dec!(101.97) });
        assert_ne!(outcome.close_time, candles[0].timestamp);
    }

    #[test]
    fn test_insurance_stop_before_activation() {
        let sim = frictionless();
        let policy = ExitPolicy::trailing(dec!(2), dec!(1), dec!(3));
        let candles = vec![
            bar(0, dec!(101), dec!(99), dec!(100)),
            bar(1, dec!(100), dec!(96.5), dec!(97)),
        ];
        let outcome = sim.simulate(dec!(100), Direction::Long, &candles, &policy, t0(), None).unwrap();
        assert!(!outcome.trailing_activated);
        assert_eq!(outcome.reason, CloseReason::StopLoss { trigger: dec!(97) });
        assert_eq!(outcome.close_price, dec!(97));
    }

    #[test]
    fn test_liquidation_overrides_stop_and_respects_margin_cap() {
        // Price gaps more than 100% against a short in one candle.
        let sim = ExitSimulator::new(params(dec!(20), dec!(0.0005), dec!(0.05)));
        let candles = vec![bar(0, dec!(230), dec!(100), dec!(220))];
        let outcome = sim
            .simulate(dec!(100), Direction::Short, &candles, &ExitPolicy::fixed(dec!(4), dec!(3)), t0(), None)
            .unwrap();

        assert!(matches!(outcome.reason, CloseReason::Liquidation { .. }));
        assert_eq!(outcome.close_price, dec!(230));
        assert!(outcome.pnl.capped);
        assert_eq!(outcome.realized_pnl(), -(dec!(100) + outcome.pnl.total_fees()));
    }

    #[test]
    fn test_liquidation_threshold_scales_with_leverage() {
        // 10x with 0.9 threshold liquidates at a 9% adverse move.
        let sim = frictionless();
        let policy = ExitPolicy::fixed(dec!(20), dec!(15));
        let shallow = vec![bar(0, dec!(100), dec!(91.5), dec!(95))];
        let outcome = sim.simulate(dec!(100), Direction::Long, &shallow, &policy, t0(), None).unwrap();
        assert_eq!(outcome.reason, CloseReason::DataEnd);

        let deep = vec![bar(0, dec!(100), dec!(90.5), dec!(95))];
        let outcome = sim.simulate(dec!(100), Direction::Long, &deep, &policy, t0(), None).unwrap();
        assert!(matches!(outcome.reason, CloseReason::Liquidation { .. }));
        assert_eq!(outcome.close_price, dec!(90.5));
    }

    #[test]
    fn test_timeout_versus_data_end() {
        let mut p = params(dec!(10), Decimal::ZERO, Decimal::ZERO);
        p.max_holding = Duration::minutes(30);
        let sim = ExitSimulator::new(p);
        let policy = ExitPolicy::fixed(dec!(10), dec!(10));

        let flat: Vec<Candle> = (0..5).map(|i| bar(i, dec!(100.5), dec!(99.5), dec!(100.1))).collect();
        let outcome = sim.simulate(dec!(100), Direction::Long, &flat, &policy, t0(), None).unwrap();
        assert_eq!(outcome.reason, CloseReason::Timeout);
        assert_eq!(outcome.close_time, flat[2].timestamp);
        assert_eq!(outcome.candles_evaluated, 3);

        let short_history = &flat[..2];
        let outcome = sim.simulate(dec!(100), Direction::Long, short_history, &policy, t0(), None).unwrap();
        assert_eq!(outcome.reason, CloseReason::DataEnd);
        assert_eq!(outcome.close_price, dec!(100.1));
    }

    #[test]
    fn test_period_end_closes_at_last_price_before_end() {
        let sim = frictionless();
        let candles = vec![
            bar(0, dec!(100.5), dec!(99.5), dec!(100.2)),
            bar(1, dec!(101), dec!(100), dec!(100.8)),
            bar(2, dec!(103), dec!(100), dec!(102)),
        ];
        let end = candles[2].timestamp;
        let outcome = sim
            .simulate(dec!(100), Direction::Long, &candles, &ExitPolicy::fixed(dec!(4), dec!(3)), t0(), Some(end))
            .unwrap();
        assert_eq!(outcome.reason, CloseReason::PeriodEnd);
        assert_eq!(outcome.close_price, dec!(100.8));
        assert_eq!(outcome.close_time, end);
        assert_eq!(outcome.absolute_max_price, dec!(103));
    }

    #[test]
    fn test_candles_before_entry_are_ignored() {
        let sim = frictionless();
        let candles = vec![
            bar(0, dec!(120), dec!(80), dec!(100)),
            bar(1, dec!(100.5), dec!(99.5), dec!(100)),
        ];
        let outcome = sim
            .simulate(dec!(100), Direction::Long, &candles, &ExitPolicy::fixed(dec!(4), dec!(3)), candles[1].timestamp, None)
            .unwrap();
        assert_eq!(outcome.reason, CloseReason::DataEnd);
        assert_eq!(outcome.absolute_max_price, dec!(100.5));
    }

    #[test]
    fn test_errors_on_missing_data() {
        let sim = frictionless();
        let policy = ExitPolicy::fixed(dec!(4), dec!(3));
        assert_eq!(
            sim.simulate(dec!(100), Direction::Long, &[], &policy, t0(), None),
            Err(SimulationError::NoCandles)
        );
        let candles = vec![bar(0, dec!(101), dec!(99), dec!(100))];
        assert_eq!(
            sim.simulate(Decimal::ZERO, Direction::Long, &candles, &policy, t0(), None),
            Err(SimulationError::InvalidEntryPrice)
        );
    }

    #[test]
    fn test_simulation_is_deterministic() {
        let sim = ExitSimulator::new(params(dec!(10), dec!(0.0005), dec!(0.05)));
        let policy = ExitPolicy::trailing(dec!(1), dec!(0.5), dec!(2));
        let candles: Vec<Candle> = (0..40)
            .map(|i| {
                let base = dec!(100) + Decimal::from(i % 7) - dec!(3);
                bar(i, base + dec!(1.2), base - dec!(0.9), base)
            })
            .collect();
        let a = sim.simulate(dec!(100), Direction::Long, &candles, &policy, t0(), None).unwrap();
        let b = sim.simulate(dec!(100), Direction::Long, &candles, &policy, t0(), None).unwrap();
        assert_eq!(a, b);
    }
}
