use config::{Config, Environment, File};
use tracing::{debug, info};

use crate::error::{BacktestError, Result};

use super::SimulationConfig;

const ENV_PREFIX: &str = "BACKTEST";

/// Builds the run configuration from defaults, an optional TOML file and
/// `BACKTEST__SECTION__KEY` environment variables, in that order.
pub fn load_config(path: Option<&str>) -> Result<SimulationConfig> {
    let defaults = Config::try_from(&SimulationConfig::default())
        .map_err(|e| BacktestError::Config(e.to_string()))?;

    let mut builder = Config::builder().add_source(defaults);
    if let Some(path) = path {
        info!("Loading configuration from {}", path);
        builder = builder.add_source(File::with_name(path).required(true));
    }
    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true),
    );

    let config: SimulationConfig = builder
        .build()
        .and_then(|c| c.try_deserialize())
        .map_err(|e| BacktestError::Config(e.to_string()))?;

    config
        .validate()
        .map_err(|errors| BacktestError::Config(errors.join(", ")))?;

    debug!("Effective configuration: {:?}", config);
    Ok(config)
}

pub fn to_toml(config: &SimulationConfig) -> anyhow::Result<String> {
    Ok(toml::to_string_pretty(config)?)
}
