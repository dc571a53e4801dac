use chrono::{DateTime, Timelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Direction;

/// A trading signal produced by the upstream scoring system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub symbol: String,
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
    pub score: Decimal,
    #[serde(default)]
    pub strength: Option<Decimal>,
    #[serde(default)]
    pub regime: Option<String>,
}

impl Signal {
    pub fn new(
        id: impl Into<String>,
        symbol: impl Into<String>,
        direction: Direction,
        timestamp: DateTime<Utc>,
        score: Decimal,
    ) -> Self {
        Self {
            id: id.into(),
            symbol: symbol.into(),
            direction,
            timestamp,
            score,
            strength: None,
            regime: None,
        }
    }

    pub fn with_strength(mut self, strength: Decimal) -> Self {
        self.strength = Some(strength);
        self
    }

    pub fn with_regime(mut self, regime: impl Into<String>) -> Self {
        self.regime = Some(regime.into());
        self
    }

    /// Ranking key used when a wave holds more signals than it may open.
    pub fn priority(&self) -> Decimal {
        self.score + self.strength.unwrap_or(Decimal::ZERO)
    }

    pub fn hour_of_day(&self) -> u32 {
        self.timestamp.hour()
    }
}

/// Filters accepted by a signal source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalFilter {
    pub min_score: Option<Decimal>,
    /// Allowed UTC hours (0-23). Empty means every hour.
    #[serde(default)]
    pub allowed_hours: Vec<u32>,
}

impl SignalFilter {
    pub fn accepts(&self, signal: &Signal) -> bool {
        if let Some(min) = self.min_score {
            if signal.score < min {
                return false;
            }
        }
        self.allowed_hours.is_empty() || self.allowed_hours.contains(&signal.hour_of_day())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn test_filter_by_score_and_hour() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 14, 30, 0).unwrap();
        let signal = Signal::new("s1", "BTCUSDT", Direction::Long, ts, dec!(0.7));

        assert!(SignalFilter::default().accepts(&signal));
        let strict = SignalFilter { min_score: Some(dec!(0.8)), allowed_hours: vec![] };
        assert!(!strict.accepts(&signal));
        let hours = SignalFilter { min_score: Some(dec!(0.5)), allowed_hours: vec![13, 14] };
        assert!(hours.accepts(&signal));
        let wrong_hour = SignalFilter { min_score: None, allowed_hours: vec![2] };
        assert!(!wrong_hour.accepts(&signal));
    }

    #[test]
    fn test_priority_includes_strength() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let plain = Signal::new("a", "ETHUSDT", Direction::Short, ts, dec!(0.6));
        let strong = plain.clone().with_strength(dec!(0.2)).with_regime("trend");
        assert_eq!(plain.priority(), dec!(0.6));
        assert_eq!(strong.priority(), dec!(0.8));
        assert_eq!(strong.regime.as_deref(), Some("trend"));
    }
}
