use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::{ExitPolicy, SimulationConfig};

/// Named exit-policy presets selectable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyProfile {
    /// Tight fixed levels on a short horizon.
    Scalp,
    /// Wider fixed levels held up to two days.
    Swing,
    /// Trailing stop with an insurance stop before activation.
    Trailing,
}

impl PolicyProfile {
    pub fn name(&self) -> &str {
        match self {
            Self::Scalp => "Scalp (fixed 1.5% / 1%)",
            Self::Swing => "Swing (fixed 4% / 3%)",
            Self::Trailing => "Trailing (2% activation, 1% distance)",
        }
    }

    pub fn policy(&self) -> ExitPolicy {
        match self {
            Self::Scalp => ExitPolicy::fixed(dec!(1.5), dec!(1)),
            Self::Swing => ExitPolicy::fixed(dec!(4), dec!(3)),
            Self::Trailing => ExitPolicy::trailing(dec!(2), dec!(1), dec!(3)),
        }
    }

    pub fn max_holding_hours(&self) -> u32 {
        match self {
            Self::Scalp => 12,
            Self::Swing => 48,
            Self::Trailing => 72,
        }
    }

    /// Overwrites the exit section of `config` with this preset.
    pub fn apply(&self, config: &mut SimulationConfig) {
        config.exit.policy = self.policy();
        config.exit.max_holding_hours = self.max_holding_hours();
    }
}

impl FromStr for PolicyProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "scalp" => Ok(Self::Scalp),
            "swing" => Ok(Self::Swing),
            "trailing" => Ok(Self::Trailing),
            other => Err(format!("unknown profile: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profiles_produce_valid_configs() {
        for profile in [PolicyProfile::Scalp, PolicyProfile::Swing, PolicyProfile::Trailing] {
            let mut config = SimulationConfig::default();
            profile.apply(&mut config);
            assert!(config.validate().is_ok(), "{} should be valid", profile.name());
        }
    }

    #[test]
    fn test_profile_parsing() {
        assert_eq!("Trailing".parse::<PolicyProfile>().unwrap(), PolicyProfile::Trailing);
        assert!("yolo".parse::<PolicyProfile>().is_err());
    }
}
