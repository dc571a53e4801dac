use chrono::Duration;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::types::TimeFrame;

use super::ExitPolicy;

/// The single configuration object of a simulation run. Shared read-only for
/// the whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub capital: CapitalSettings,
    pub exit: ExitSettings,
    pub schedule: ScheduleSettings,
    pub workers: WorkerSettings,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            capital: CapitalSettings::default(),
            exit: ExitSettings::default(),
            schedule: ScheduleSettings::default(),
            workers: WorkerSettings::default(),
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        // Capital validation
        let capital = &self.capital;
        if capital.initial_capital <= Decimal::ZERO {
            errors.push("initial_capital must be > 0".to_string());
        }
        if capital.position_size <= Decimal::ZERO {
            errors.push("position_size must be > 0".to_string());
        }
        if capital.position_size > capital.initial_capital {
            errors.push("position_size must not exceed initial_capital".to_string());
        }
        if capital.leverage < Decimal::ONE || capital.leverage > dec!(125) {
            errors.push("leverage must be between 1 and 125".to_string());
        }
        if capital.commission_rate < Decimal::ZERO || capital.commission_rate >= dec!(0.1) {
            errors.push("commission_rate must be between 0 and 0.1".to_string());
        }
        if capital.liquidation_threshold <= Decimal::ZERO || capital.liquidation_threshold > Decimal::ONE {
            errors.push("liquidation_threshold must be in (0, 1]".to_string());
        }
        if capital.floating_loss_cap_pct <= Decimal::ZERO || capital.floating_loss_cap_pct > dec!(100) {
            errors.push("floating_loss_cap_pct must be in (0, 100]".to_string());
        }

        // Exit validation
        if let Err(policy_errors) = self.exit.policy.validate() {
            errors.extend(policy_errors);
        }
        if self.exit.stop_slippage_pct < Decimal::ZERO || self.exit.stop_slippage_pct >= dec!(5) {
            errors.push("stop_slippage_pct must be between 0 and 5".to_string());
        }
        if self.exit.max_holding_hours == 0 {
            errors.push("max_holding_hours must be > 0".to_string());
        }

        // Schedule validation
        if self.schedule.wave_width_minutes == 0 {
            errors.push("wave_width_minutes must be > 0".to_string());
        }
        if self.schedule.max_entries_per_wave == 0 {
            errors.push("max_entries_per_wave must be > 0".to_string());
        }

        // Worker validation
        if self.workers.max_workers == 0 {
            errors.push("max_workers must be > 0".to_string());
        }
        if self.workers.entry_price_windows_minutes.is_empty() {
            errors.push("entry_price_windows_minutes must not be empty".to_string());
        }
        if self.workers.entry_price_windows_minutes.windows(2).any(|w| w[0] >= w[1]) {
            errors.push("entry_price_windows_minutes must be strictly increasing".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn max_holding(&self) -> Duration {
        Duration::hours(self.exit.max_holding_hours as i64)
    }

    pub fn wave_width(&self) -> Duration {
        Duration::minutes(self.schedule.wave_width_minutes as i64)
    }

    /// Worker pool size: available cores minus two, at least one, capped.
    pub fn worker_count(&self) -> usize {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        cores.saturating_sub(2).max(1).min(self.workers.max_workers)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapitalSettings {
    pub initial_capital: Decimal,
    /// Margin posted per position.
    pub position_size: Decimal,
    pub leverage: Decimal,
    /// Commission per leg as a fraction of notional (0.0005 = 0.05%).
    pub commission_rate: Decimal,
    /// Fraction of the margin that may be lost before liquidation.
    pub liquidation_threshold: Decimal,
    /// Floating losses are marked at no more than this percent of margin.
    pub floating_loss_cap_pct: Decimal,
}

impl Default for CapitalSettings {
    fn default() -> Self {
        Self {
            initial_capital: dec!(10000),
            position_size: dec!(100),
            leverage: dec!(10),
            commission_rate: dec!(0.0005),
            liquidation_threshold: dec!(0.9),
            floating_loss_cap_pct: dec!(95),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitSettings {
    pub policy: ExitPolicy,
    /// Adverse slippage applied to stop-loss and trailing-stop fills, in percent.
    pub stop_slippage_pct: Decimal,
    pub max_holding_hours: u32,
}

impl Default for ExitSettings {
    fn default() -> Self {
        Self {
            policy: ExitPolicy::fixed(dec!(4), dec!(3)),
            stop_slippage_pct: dec!(0.05),
            max_holding_hours: 48,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSettings {
    pub bar_size: TimeFrame,
    pub wave_width_minutes: u32,
    pub max_entries_per_wave: usize,
    /// Mark open positions to market after every wave to track drawdown.
    pub mark_to_market: bool,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            bar_size: TimeFrame::M15,
            wave_width_minutes: 15,
            max_entries_per_wave: 10,
            mark_to_market: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub max_workers: usize,
    /// Half-widths of the successive windows searched for an entry price.
    pub entry_price_windows_minutes: Vec<u32>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_workers: 16,
            entry_price_windows_minutes: vec![15, 60, 240, 1440],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SimulationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_holding(), Duration::hours(48));
        assert_eq!(config.wave_width(), Duration::minutes(15));
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut config = SimulationConfig::default();
        config.capital.leverage = dec!(0.5);
        config.schedule.max_entries_per_wave = 0;
        config.workers.entry_price_windows_minutes = vec![60, 15];
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_worker_count_is_bounded() {
        let mut config = SimulationConfig::default();
        config.workers.max_workers = 1;
        assert_eq!(config.worker_count(), 1);
        config.workers.max_workers = 64;
        let count = config.worker_count();
        assert!(count >= 1 && count <= 64);
    }
}
