// Decision fusion and the trading orchestrator
pub mod decision;
pub mod trading;

pub use decision::{combine_scores, protective_levels, CombinedScore, ScoreWeights, TradeDecision};
pub use trading::{EngineParts, EngineState, TradingConfig, TradingEngine};
