use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Direction;

/// One OHLC bar. `timestamp` is the bar's open time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
}

impl Candle {
    pub fn new(
        timestamp: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
        }
    }

    /// Best price this bar offered to a position in `direction`.
    pub fn favorable_extreme(&self, direction: Direction) -> Decimal {
        match direction {
            Direction::Long => self.high,
            Direction::Short => self.low,
        }
    }

    /// Worst price this bar offered to a position in `direction`.
    pub fn adverse_extreme(&self, direction: Direction) -> Decimal {
        match direction {
            Direction::Long => self.low,
            Direction::Short => self.high,
        }
    }

    /// Low at or below open and close, high at or above, prices positive.
    pub fn is_well_formed(&self) -> bool {
        self.low <= self.high
            && self.low <= self.open.min(self.close)
            && self.high >= self.open.max(self.close)
            && self.low > Decimal::ZERO
    }
}
