// Market analysis module
// Technical indicator synthesis and multi-source sentiment aggregation

pub mod sentiment;
pub mod technical;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use sentiment::{
    SentimentAnalysis, SentimentAnalysisEngine, SentimentConfig, SentimentDirection,
    SentimentEntry, SentimentPayload, SentimentSources, SentimentTrend, SourceCategory,
};
pub use technical::{
    Signals, TechnicalAnalysis, TechnicalAnalysisEngine, TechnicalConfig, TechnicalIndicators,
};

/// Market direction shared by the technical and sentiment readings
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Bullish,
    Bearish,
    Neutral,
}

impl Trend {
    /// +1 bullish, -1 bearish, 0 neutral
    pub fn sign(&self) -> f64 {
        match self {
            Trend::Bullish => 1.0,
            Trend::Bearish => -1.0,
            Trend::Neutral => 0.0,
        }
    }
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trend::Bullish => write!(f, "bullish"),
            Trend::Bearish => write!(f, "bearish"),
            Trend::Neutral => write!(f, "neutral"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Strength {
    Weak,
    Moderate,
    Strong,
}

impl Strength {
    /// Bucket an absolute magnitude against the moderate/strong thresholds
    pub fn classify(value: f64, moderate: f64, strong: f64) -> Self {
        let value = value.abs();
        if value >= strong {
            Strength::Strong
        } else if value >= moderate {
            Strength::Moderate
        } else {
            Strength::Weak
        }
    }
}

impl fmt::Display for Strength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strength::Weak => write!(f, "weak"),
            Strength::Moderate => write!(f, "moderate"),
            Strength::Strong => write!(f, "strong"),
        }
    }
}
