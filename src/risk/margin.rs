use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::config::CapitalSettings;
use crate::types::Direction;

/// Decimal places kept on every settled money amount. Ledger sums of values
/// at this scale stay exact.
pub const MONEY_SCALE: u32 = 8;

/// Settlement figures of one closed position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PnlBreakdown {
    /// Leverage-free price move in percent, signed for the position's direction.
    pub pnl_pct: Decimal,
    pub gross_pnl: Decimal,
    pub entry_fee: Decimal,
    pub exit_fee: Decimal,
    /// Net P&L after fees and after the isolated-margin floor.
    pub realized_pnl: Decimal,
    /// True when the margin floor clipped the loss.
    pub capped: bool,
}

impl PnlBreakdown {
    pub fn total_fees(&self) -> Decimal {
        self.entry_fee + self.exit_fee
    }
}

/// Lowest net P&L an isolated-margin position may realize:
/// the posted margin plus both commissions.
pub fn margin_loss_floor(position_size: Decimal, entry_fee: Decimal, exit_fee: Decimal) -> Decimal {
    -(position_size + entry_fee + exit_fee)
}

/// Net P&L after fees, never below the isolated-margin floor.
pub fn cap_loss_to_margin(
    position_size: Decimal,
    gross_pnl: Decimal,
    entry_fee: Decimal,
    exit_fee: Decimal,
) -> Decimal {
    (gross_pnl - entry_fee - exit_fee).max(margin_loss_floor(position_size, entry_fee, exit_fee))
}

/// Signed percent move from `entry` to `price` for a position in `direction`.
pub fn pnl_pct(direction: Direction, entry: Decimal, price: Decimal) -> Decimal {
    if entry.is_zero() {
        return Decimal::ZERO;
    }
    (price - entry) / entry * dec!(100) * direction.sign()
}

/// Per-position sizing and fee model. Every close path settles through
/// [`MarginModel::settle`], which routes through [`cap_loss_to_margin`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarginModel {
    pub position_size: Decimal,
    pub leverage: Decimal,
    pub commission_rate: Decimal,
}

impl MarginModel {
    pub fn new(position_size: Decimal, leverage: Decimal, commission_rate: Decimal) -> Self {
        Self {
            position_size,
            leverage,
            commission_rate,
        }
    }

    pub fn from_settings(settings: &CapitalSettings) -> Self {
        Self::new(settings.position_size, settings.leverage, settings.commission_rate)
    }

    pub fn notional(&self) -> Decimal {
        self.position_size * self.leverage
    }

    /// Commission for one leg, charged on the entry notional.
    pub fn fee_per_leg(&self) -> Decimal {
        (self.notional() * self.commission_rate).round_dp(MONEY_SCALE)
    }

    /// Capital held back when a position opens: margin plus round-trip commission.
    pub fn reserved_capital(&self) -> Decimal {
        self.position_size + self.fee_per_leg() * dec!(2)
    }

    /// Adverse move (in percent of entry) that liquidates the position.
    pub fn liquidation_pct(&self, threshold: Decimal) -> Decimal {
        if self.leverage.is_zero() {
            return dec!(100);
        }
        dec!(100) / self.leverage * threshold
    }

    pub fn gross_pnl(&self, pnl_pct: Decimal) -> Decimal {
        (self.notional() * pnl_pct / dec!(100)).round_dp(MONEY_SCALE)
    }

    pub fn cap_loss_to_margin(&self, gross_pnl: Decimal, entry_fee: Decimal, exit_fee: Decimal) -> Decimal {
        cap_loss_to_margin(self.position_size, gross_pnl, entry_fee, exit_fee)
    }

    pub fn settle(&self, direction: Direction, entry: Decimal, close: Decimal) -> PnlBreakdown {
        let pnl_pct = pnl_pct(direction, entry, close);
        let gross_pnl = self.gross_pnl(pnl_pct);
        let fee = self.fee_per_leg();
        let realized_pnl = self.cap_loss_to_margin(gross_pnl, fee, fee);
        PnlBreakdown {
            pnl_pct,
            gross_pnl,
            entry_fee: fee,
            exit_fee: fee,
            realized_pnl,
            capped: realized_pnl > gross_pnl - fee - fee,
        }
    }

    /// Unrealized P&L at `price`, with the loss clamped to `cap_pct` percent of
    /// the posted margin. Fees are not included.
    pub fn floating_pnl(&self, direction: Direction, entry: Decimal, price: Decimal, cap_pct: Decimal) -> Decimal {
        let gross = self.gross_pnl(pnl_pct(direction, entry, price));
        let floor = -(self.position_size * cap_pct / dec!(100));
        gross.max(floor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> MarginModel {
        MarginModel::new(dec!(100), dec!(10), dec!(0.001))
    }

    #[test]
    fn test_fee_and_reservation() {
        let m = model();
        assert_eq!(m.notional(), dec!(1000));
        assert_eq!(m.fee_per_leg(), dec!(1));
        assert_eq!(m.reserved_capital(), dec!(102));
        assert_eq!(m.liquidation_pct(dec!(0.9)), dec!(9));
    }

    #[test]
    fn test_cap_loss_to_margin_clips_only_beyond_margin() {
        assert_eq!(cap_loss_to_margin(dec!(100), dec!(50), dec!(1), dec!(1)), dec!(48));
        assert_eq!(cap_loss_to_margin(dec!(100), dec!(-60), dec!(1), dec!(1)), dec!(-62));
        assert_eq!(cap_loss_to_margin(dec!(100), dec!(-5000), dec!(1), dec!(1)), dec!(-102));
    }

    #[test]
    fn test_settle_long_and_short() {
        let m = model();
        let long = m.settle(Direction::Long, dec!(100), dec!(104));
        assert_eq!(long.pnl_pct, dec!(4));
        assert_eq!(long.gross_pnl, dec!(40));
        assert_eq!(long.realized_pnl, dec!(38));
        assert!(!long.capped);

        let short = m.settle(Direction::Short, dec!(100), dec!(104));
        assert_eq!(short.pnl_pct, dec!(-4));
        assert_eq!(short.realized_pnl, dec!(-42));
    }

    #[test]
    fn test_settle_caps_price_gap_beyond_entry() {
        // Short squeezed 150% in a single bar: gross loss is 15x the margin.
        let settled = model().settle(Direction::Short, dec!(100), dec!(250));
        assert!(settled.capped);
        assert_eq!(settled.realized_pnl, dec!(-102));
        assert!(settled.realized_pnl >= margin_loss_floor(dec!(100), settled.entry_fee, settled.exit_fee));
    }

    #[test]
    fn test_settled_amounts_have_fixed_scale() {
        let m = MarginModel::new(dec!(100), dec!(10), dec!(0.0007));
        for (entry, close) in [(dec!(3), dec!(3.1)), (dec!(61234.7), dec!(60001.3)), (dec!(0.0123), dec!(0.0119))] {
            let settled = m.settle(Direction::Long, entry, close);
            assert!(settled.gross_pnl.scale() <= MONEY_SCALE);
            assert!(settled.realized_pnl.scale() <= MONEY_SCALE);
            assert!(settled.entry_fee.scale() <= MONEY_SCALE);
            assert_eq!(settled.realized_pnl, settled.gross_pnl - settled.total_fees());
        }
    }

    #[test]
    fn test_floating_pnl_clamped_to_buffer() {
        let m = model();
        assert_eq!(m.floating_pnl(Direction::Long, dec!(100), dec!(102), dec!(95)), dec!(20));
        assert_eq!(m.floating_pnl(Direction::Long, dec!(100), dec!(80), dec!(95)), dec!(-95));
    }
}
