use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::analysis::{SentimentAnalysis, TechnicalAnalysis};
use crate::models::{OrderSide, TradeAction};
use crate::risk::SizingMethod;

/// Fused trading decision for one symbol of one portfolio
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeDecision {
    pub id: Uuid,
    pub symbol: String,
    pub portfolio_id: String,
    pub action: TradeAction,
    pub confidence: f64,
    pub combined_score: f64,
    pub sentiment_score: f64,
    pub technical_score: f64,
    pub reasoning: String,
    pub sentiment: Option<SentimentAnalysis>,
    pub technical: TechnicalAnalysis,
    pub suggested_quantity: Option<f64>,
    pub suggested_price: Option<f64>,
    pub sizing_method: Option<SizingMethod>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl TradeDecision {
    /// Whether the decision carries everything needed to place an order
    pub fn is_executable(&self) -> bool {
        self.action != TradeAction::Hold
            && self.suggested_quantity.is_some_and(|q| q.is_finite() && q > 0.0)
            && self.suggested_price.is_some_and(|p| p.is_finite() && p > 0.0)
    }
}

/// Weights and gates used to fuse the two analysis scores
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreWeights {
    pub sentiment: f64,
    pub technical: f64,
    pub decision_threshold: f64,
    pub min_confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CombinedScore {
    pub score: f64,
    pub action: TradeAction,
    pub confidence: f64,
}

/// Weighted sum of sentiment and technical conviction
///
/// BUY above `decision_threshold`, SELL below its negative. Confidence is
/// the absolute score and anything under `min_confidence` is held.
pub fn combine_scores(sentiment_score: f64, technical_score: f64, weights: &ScoreWeights) -> CombinedScore {
    let score = (sentiment_score * weights.sentiment + technical_score * weights.technical).clamp(-1.0, 1.0);
    let confidence = score.abs();

    let action = if confidence < weights.min_confidence {
        TradeAction::Hold
    } else if score > weights.decision_threshold {
        TradeAction::Buy
    } else if score < -weights.decision_threshold {
        TradeAction::Sell
    } else {
        TradeAction::Hold
    };

    CombinedScore {
        score,
        action,
        confidence,
    }
}

/// Stop loss and take profit for an entry on `side`
///
/// ATR multiples when the ATR is usable, fixed percentages otherwise.
pub fn protective_levels(
    side: OrderSide,
    price: f64,
    atr: Option<f64>,
    atr_multipliers: (f64, f64),
    fallback_pcts: (f64, f64),
) -> (f64, f64) {
    let (stop_distance, target_distance) = match atr.filter(|a| a.is_finite() && *a > 0.0) {
        Some(atr) => (atr * atr_multipliers.0, atr * atr_multipliers.1),
        None => (price * fallback_pcts.0, price * fallback_pcts.1),
    };

    match side {
        OrderSide::Buy => ((price - stop_distance).max(0.0), price + target_distance),
        OrderSide::Sell => (price + stop_distance, (price - target_distance).max(0.0)),
    }
}

pub(crate) fn build_reasoning(
    combined: &CombinedScore,
    technical: &TechnicalAnalysis,
    sentiment: Option<&SentimentAnalysis>,
    weights: &ScoreWeights,
) -> String {
    let mut parts = vec![format!(
        "Technical {} ({}, {:.2} conviction)",
        technical.trend,
        technical.action(),
        technical.directional_strength()
    )];

    match sentiment {
        Some(s) => parts.push(format!(
            "sentiment {} {:.2} ({} sources)",
            s.trend,
            s.overall_sentiment,
            s.sources.len()
        )),
        None => parts.push("no sentiment data".to_string()),
    }

    parts.push(format!("combined score {:.3}", combined.score));

    if combined.action == TradeAction::Hold {
        if combined.confidence < weights.min_confidence {
            parts.push(format!(
                "confidence {:.2} below minimum {:.2}",
                combined.confidence, weights.min_confidence
            ));
        } else {
            parts.push(format!("within ±{:.2} threshold", weights.decision_threshold));
        }
    }

    parts.join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weights() -> ScoreWeights {
        ScoreWeights {
            sentiment: 0.4,
            technical: 0.6,
            decision_threshold: 0.2,
            min_confidence: 0.3,
        }
    }

    #[test]
    fn test_combine_buy_and_sell() {
        let buy = combine_scores(0.8, 0.6, &weights());
        assert!((buy.score - 0.68).abs() < 1e-9);
        assert_eq!(buy.action, TradeAction::Buy);
        assert!((buy.confidence - 0.68).abs() < 1e-9);

        let sell = combine_scores(-0.5, -0.7, &weights());
        assert_eq!(sell.action, TradeAction::Sell);
        assert!(sell.score < 0.0);
        assert!(sell.confidence > 0.0);
    }

    #[test]
    fn test_low_confidence_forces_hold() {
        // 0.25 clears the 0.2 threshold but not the 0.3 confidence gate
        let combined = combine_scores(0.25, 0.25, &weights());
        assert!((combined.score - 0.25).abs() < 1e-9);
        assert_eq!(combined.action, TradeAction::Hold);
    }

    #[test]
    fn test_threshold_gate() {
        let w = ScoreWeights {
            min_confidence: 0.0,
            ..weights()
        };
        assert_eq!(combine_scores(0.0, 0.3, &w).action, TradeAction::Hold);
        assert_eq!(combine_scores(0.0, 0.4, &w).action, TradeAction::Buy);
        assert_eq!(combine_scores(0.0, -0.4, &w).action, TradeAction::Sell);
    }

    #[test]
    fn test_protective_levels() {
        let (sl, tp) = protective_levels(OrderSide::Buy, 100.0, Some(2.0), (2.0, 3.0), (0.02, 0.04));
        assert_eq!((sl, tp), (96.0, 106.0));

        let (sl, tp) = protective_levels(OrderSide::Sell, 100.0, Some(2.0), (2.0, 3.0), (0.02, 0.04));
        assert_eq!((sl, tp), (104.0, 94.0));

        // Falls back to percentages without a usable ATR
        let (sl, tp) = protective_levels(OrderSide::Buy, 100.0, Some(0.0), (2.0, 3.0), (0.02, 0.04));
        assert!((sl - 98.0).abs() < 1e-9);
        assert!((tp - 104.0).abs() < 1e-9);
    }
}
