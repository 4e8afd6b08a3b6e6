//! Layered settings: defaults, an optional TOML file, then environment.
//!
//! Environment keys use `TRADEPILOT__<SECTION>__<KEY>`, for example
//! `TRADEPILOT__TRADING__AUTO_EXECUTE=false`.

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::analysis::{SentimentConfig, TechnicalConfig};
use crate::engine::TradingConfig;
use crate::error::TradingError;
use crate::execution::{OrderManagerConfig, SlippageConfig};
use crate::gateway::paper::{PaperConfig, PortfolioSettings};
use crate::risk::{CircuitBreakers, RiskConfig};

pub const DEFAULT_CONFIG_PATH: &str = "tradepilot.toml";
pub const ENV_PREFIX: &str = "TRADEPILOT";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub technical: TechnicalConfig,
    pub sentiment: SentimentConfig,
    pub risk: RiskConfig,
    pub circuit_breakers: CircuitBreakers,
    pub slippage: SlippageConfig,
    pub orders: OrderManagerConfig,
    pub trading: TradingConfig,
    pub paper: PaperConfig,
    pub portfolios: Vec<PortfolioSettings>,
    /// Event journal; disabled when unset
    pub redis_url: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            technical: TechnicalConfig::default(),
            sentiment: SentimentConfig::default(),
            risk: RiskConfig::default(),
            circuit_breakers: CircuitBreakers::default(),
            slippage: SlippageConfig::default(),
            orders: OrderManagerConfig::default(),
            trading: TradingConfig::default(),
            paper: PaperConfig::default(),
            portfolios: vec![PortfolioSettings::default()],
            redis_url: None,
        }
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

impl Settings {
    /// Load from `path` (required) or `tradepilot.toml` (optional), then
    /// apply environment overrides and validate
    pub fn load(path: Option<&Path>) -> Result<Self, TradingError> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_PATH).required(false),
        };
        let settings = Self::build(Config::builder().add_source(file), environment())?;
        tracing::info!(
            "✓ Settings loaded ({} portfolios, journal {})",
            settings.portfolios.len(),
            if settings.redis_url.is_some() { "on" } else { "off" }
        );
        Ok(settings)
    }

    /// Parse TOML text without consulting the process environment
    pub fn from_toml_str(toml: &str) -> Result<Self, TradingError> {
        let builder = Config::builder().add_source(File::from_str(toml, FileFormat::Toml));
        Self::build(builder, environment().source(Some(Default::default())))
    }

    fn build(builder: ConfigBuilder<DefaultState>, env: Environment) -> Result<Self, TradingError> {
        let settings: Settings = builder.add_source(env).build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), TradingError> {
        self.technical.validate()?;
        self.sentiment.validate()?;
        self.risk.validate()?;
        self.circuit_breakers.validate()?;
        self.slippage.validate()?;
        self.orders.validate()?;
        self.trading.validate()?;
        self.paper.validate()?;

        let mut seen = HashSet::new();
        for portfolio in &self.portfolios {
            if portfolio.id.trim().is_empty() {
                return Err(TradingError::Config("portfolio id is required".to_string()));
            }
            if !portfolio.budget.is_finite() || portfolio.budget <= 0.0 {
                return Err(TradingError::Config(format!(
                    "portfolio {} budget must be positive",
                    portfolio.id
                )));
            }
            if !seen.insert(portfolio.id.as_str()) {
                return Err(TradingError::Config(format!("duplicate portfolio {}", portfolio.id)));
            }
        }
        Ok(())
    }

    pub fn portfolio(&self, id: &str) -> Option<&PortfolioSettings> {
        self.portfolios.iter().find(|p| p.id == id)
    }
}
