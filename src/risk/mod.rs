// Risk management module
pub mod circuit_breakers;
pub mod position_risk;

pub use circuit_breakers::{CircuitBreakerRegistry, CircuitBreakerTrip, CircuitBreakers, TradingState};
pub use position_risk::{
    PortfolioRisk, PositionRisk, PositionRiskEngine, PositionSizing, PositionValidation,
    RiskConfig, RiskLevel, RiskLevelCutoffs, RiskWeights, SizingMethod, POSITION_RISK_EXCEEDED,
};
