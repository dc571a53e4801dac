use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Exit rule applied uniformly to every signal of a run. Percent fields are in
/// percent units (`4` means 4%).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExitPolicy {
    FixedTpSl {
        tp_pct: Decimal,
        sl_pct: Decimal,
    },
    TrailingStop {
        activation_pct: Decimal,
        distance_pct: Decimal,
        insurance_sl_pct: Decimal,
    },
}

impl ExitPolicy {
    pub fn fixed(tp_pct: Decimal, sl_pct: Decimal) -> Self {
        ExitPolicy::FixedTpSl { tp_pct, sl_pct }
    }

    pub fn trailing(activation_pct: Decimal, distance_pct: Decimal, insurance_sl_pct: Decimal) -> Self {
        ExitPolicy::TrailingStop {
            activation_pct,
            distance_pct,
            insurance_sl_pct,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExitPolicy::FixedTpSl { .. } => "fixed_tp_sl",
            ExitPolicy::TrailingStop { .. } => "trailing_stop",
        }
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        match self {
            ExitPolicy::FixedTpSl { tp_pct, sl_pct } => {
                if *tp_pct <= Decimal::ZERO {
                    errors.push("tp_pct must be > 0".to_string());
                }
                if *sl_pct <= Decimal::ZERO || *sl_pct >= dec!(100) {
                    errors.push("sl_pct must be between 0 and 100".to_string());
                }
            }
            ExitPolicy::TrailingStop {
                activation_pct,
                distance_pct,
                insurance_sl_pct,
            } => {
                if *activation_pct <= Decimal::ZERO {
                    errors.push("activation_pct must be > 0".to_string());
                }
                if *distance_pct <= Decimal::ZERO || *distance_pct >= dec!(100) {
                    errors.push("distance_pct must be between 0 and 100".to_string());
                }
                if *insurance_sl_pct <= Decimal::ZERO || *insurance_sl_pct >= dec!(100) {
                    errors.push("insurance_sl_pct must be between 0 and 100".to_string());
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
