//! Sentiment analysis engine
//!
//! Aggregates scored sentiment payloads from news, social and market sources
//! into one confidence-weighted reading per symbol.

use chrono::{DateTime, Duration, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use super::{Strength, Trend};
use crate::error::AnalysisError;
use crate::events::{Event, EventBus};
use crate::history::{SymbolHistory, DEFAULT_HISTORY_CAPACITY};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SentimentConfig {
    /// Only entries younger than this contribute to the overall reading
    pub sentiment_window_hours: i64,
    /// Floor for the reported confidence
    pub min_confidence: f64,
    pub bullish_threshold: f64,
    pub bearish_threshold: f64,
    pub moderate_threshold: f64,
    pub strong_threshold: f64,
    /// Change between first and last reading that counts as a trend
    pub trend_change_threshold: f64,
    pub max_entries_per_source: usize,
    pub history_limit: usize,
    pub news_sources: Vec<String>,
    pub social_sources: Vec<String>,
    pub market_sources: Vec<String>,
}

impl Default for SentimentConfig {
    fn default() -> Self {
        let names = |list: &[&str]| list.iter().map(|s| s.to_string()).collect();
        Self {
            sentiment_window_hours: 24,
            min_confidence: 0.1,
            bullish_threshold: 0.2,
            bearish_threshold: -0.2,
            moderate_threshold: 0.3,
            strong_threshold: 0.6,
            trend_change_threshold: 0.1,
            max_entries_per_source: 100,
            history_limit: DEFAULT_HISTORY_CAPACITY,
            news_sources: names(&["news_api", "news", "rss", "cryptopanic", "coindesk", "bloomberg", "reuters"]),
            social_sources: names(&["twitter", "x", "reddit", "telegram", "discord", "stocktwits"]),
            market_sources: names(&["vix", "fear_greed", "funding_rate", "open_interest", "long_short_ratio"]),
        }
    }
}

impl SentimentConfig {
    pub fn validate(&self) -> Result<(), AnalysisError> {
        if self.sentiment_window_hours <= 0 {
            return Err(AnalysisError::InvalidConfiguration(
                "sentiment_window_hours must be greater than 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(AnalysisError::InvalidConfiguration(
                "min_confidence must be within [0, 1]".to_string(),
            ));
        }
        if self.bearish_threshold >= self.bullish_threshold {
            return Err(AnalysisError::InvalidConfiguration(
                "bearish_threshold must be below bullish_threshold".to_string(),
            ));
        }
        if self.moderate_threshold > self.strong_threshold {
            return Err(AnalysisError::InvalidConfiguration(
                "moderate_threshold must not exceed strong_threshold".to_string(),
            ));
        }
        if self.max_entries_per_source == 0 || self.history_limit == 0 {
            return Err(AnalysisError::InvalidConfiguration(
                "buffer sizes must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Unknown sources fall back to market
    pub fn classify_source(&self, source: &str) -> SourceCategory {
        let source = source.trim().to_lowercase();
        let matches = |list: &[String]| list.iter().any(|s| s.eq_ignore_ascii_case(&source));

        if matches(&self.news_sources) {
            SourceCategory::News
        } else if matches(&self.social_sources) {
            SourceCategory::Social
        } else {
            SourceCategory::Market
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SourceCategory {
    News,
    Social,
    Market,
}

/// Inbound scored sentiment for one symbol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentPayload {
    pub symbol: String,
    pub sentiment: f64,
    pub confidence: f64,
    pub source: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl SentimentPayload {
    pub fn new(symbol: &str, sentiment: f64, confidence: f64, source: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            sentiment,
            confidence,
            source: source.to_string(),
            text: None,
            metadata: None,
            timestamp: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SentimentEntry {
    pub sentiment: f64,
    pub confidence: f64,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SentimentSources {
    pub news: Vec<SentimentEntry>,
    pub social: Vec<SentimentEntry>,
    pub market: Vec<SentimentEntry>,
}

impl SentimentSources {
    /// Entries across all three categories
    pub fn len(&self) -> usize {
        self.news.len() + self.social.len() + self.market.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn iter(&self) -> impl Iterator<Item = &SentimentEntry> {
        self.news.iter().chain(self.social.iter()).chain(self.market.iter())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentAnalysis {
    pub symbol: String,
    /// Confidence-weighted mean in [-1, 1]
    pub overall_sentiment: f64,
    pub confidence: f64,
    pub trend: Trend,
    pub strength: Strength,
    pub sources: SentimentSources,
    pub reasoning: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SentimentDirection {
    Improving,
    Declining,
    Stable,
}

/// How the overall reading moved over a time window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentTrend {
    pub symbol: String,
    pub window_hours: i64,
    pub data_points: usize,
    pub average_sentiment: f64,
    /// Last reading minus first reading
    pub change: f64,
    pub direction: SentimentDirection,
}

#[derive(Clone)]
pub struct SentimentAnalysisEngine {
    config: Arc<RwLock<SentimentConfig>>,
    news: SymbolHistory<SentimentEntry>,
    social: SymbolHistory<SentimentEntry>,
    market: SymbolHistory<SentimentEntry>,
    history: SymbolHistory<SentimentAnalysis>,
    active_symbols: Arc<DashSet<String>>,
    /// Serializes ingestion per symbol so each reading covers every
    /// entry accepted before it
    symbol_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    running: Arc<AtomicBool>,
    events: EventBus,
}

impl SentimentAnalysisEngine {
    pub fn new(config: SentimentConfig, events: EventBus) -> Self {
        let per_source = config.max_entries_per_source.max(1);
        let history = SymbolHistory::new(config.history_limit.max(1));
        Self {
            config: Arc::new(RwLock::new(config)),
            news: SymbolHistory::new(per_source),
            social: SymbolHistory::new(per_source),
            market: SymbolHistory::new(per_source),
            history,
            active_symbols: Arc::new(DashSet::new()),
            symbol_locks: Arc::new(DashMap::new()),
            running: Arc::new(AtomicBool::new(false)),
            events,
        }
    }

    pub fn config(&self) -> SentimentConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update_config(&self, config: SentimentConfig) -> Result<(), AnalysisError> {
        config.validate()?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
        self.events.emit(Event::ConfigUpdated {
            section: "sentiment".to_string(),
        });
        Ok(())
    }

    /// Start tracking `symbols`
    ///
    /// Calling this while already running keeps the active set and all
    /// accumulated state untouched.
    pub fn start_analysis(&self, symbols: &[String]) {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::debug!("Sentiment analysis already running");
            return;
        }
        for symbol in symbols {
            self.active_symbols.insert(symbol.clone());
        }
        tracing::info!("Sentiment analysis started for {} symbols", symbols.len());
    }

    pub fn stop_analysis(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.active_symbols.clear();
            tracing::info!("Sentiment analysis stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn add_symbol(&self, symbol: &str) {
        self.active_symbols.insert(symbol.to_string());
    }

    /// Stop tracking a symbol and drop its buffered entries
    pub fn remove_symbol(&self, symbol: &str) {
        self.active_symbols.remove(symbol);
        self.news.clear(symbol);
        self.social.clear(symbol);
        self.market.clear(symbol);
    }

    pub fn is_tracking(&self, symbol: &str) -> bool {
        self.active_symbols.contains(symbol)
    }

    pub fn active_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.active_symbols.iter().map(|s| s.clone()).collect();
        symbols.sort();
        symbols
    }

    /// Ingest one payload and recompute the symbol's reading
    ///
    /// Returns `None` (without error) for untracked symbols and for payloads
    /// whose scores are not finite numbers.
    pub fn add_sentiment_data(&self, payload: SentimentPayload) -> Option<SentimentAnalysis> {
        if !self.is_tracking(&payload.symbol) {
            tracing::debug!(symbol = %payload.symbol, "Ignoring sentiment for untracked symbol");
            return None;
        }
        if !payload.sentiment.is_finite() || !payload.confidence.is_finite() {
            tracing::warn!(
                symbol = %payload.symbol,
                source = %payload.source,
                "Dropping sentiment payload with non-finite scores"
            );
            return None;
        }

        let config = self.config();
        let source = if payload.source.trim().is_empty() {
            "unknown".to_string()
        } else {
            payload.source.trim().to_lowercase()
        };

        let entry = SentimentEntry {
            sentiment: payload.sentiment.clamp(-1.0, 1.0),
            confidence: payload.confidence.clamp(0.0, 1.0),
            source: source.clone(),
            timestamp: payload.timestamp.unwrap_or_else(Utc::now),
        };

        let bucket = match config.classify_source(&source) {
            SourceCategory::News => &self.news,
            SourceCategory::Social => &self.social,
            SourceCategory::Market => &self.market,
        };

        let lock = self.symbol_lock(&payload.symbol);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        bucket.push(&payload.symbol, entry);

        let analysis = self.recompute(&payload.symbol, &config);
        self.history.push(&payload.symbol, analysis.clone());
        self.events.emit(Event::SentimentAnalysis(analysis.clone()));

        Some(analysis)
    }

    /// Ingest newline-delimited JSON payloads until the reader is exhausted
    ///
    /// Blank lines are skipped and malformed lines are logged and dropped.
    /// Returns how many payloads produced a reading.
    pub async fn ingest_json_lines<R>(&self, reader: R) -> usize
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        let mut ingested = 0;
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Sentiment feed read failed: {}", e);
                    break;
                }
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<SentimentPayload>(line) {
                Ok(payload) => {
                    if self.add_sentiment_data(payload).is_some() {
                        ingested += 1;
                    }
                }
                Err(e) => tracing::warn!("Skipping malformed sentiment line: {}", e),
            }
        }
        ingested
    }

    fn symbol_lock(&self, symbol: &str) -> Arc<Mutex<()>> {
        self.symbol_locks.entry(symbol.to_string()).or_default().clone()
    }

    fn recompute(&self, symbol: &str, config: &SentimentConfig) -> SentimentAnalysis {
        let now = Utc::now();
        let cutoff = now - Duration::hours(config.sentiment_window_hours);
        let recent = |entry: &SentimentEntry| entry.timestamp >= cutoff;

        let sources = SentimentSources {
            news: self.news.filter(symbol, recent),
            social: self.social.filter(symbol, recent),
            market: self.market.filter(symbol, recent),
        };

        let entries: Vec<&SentimentEntry> = sources.iter().collect();
        let (overall, mean_confidence) = if entries.is_empty() {
            (0.0, 0.0)
        } else {
            let weight: f64 = entries.iter().map(|e| e.confidence).sum();
            let overall = if weight > 0.0 {
                entries.iter().map(|e| e.sentiment * e.confidence).sum::<f64>() / weight
            } else {
                entries.iter().map(|e| e.sentiment).sum::<f64>() / entries.len() as f64
            };
            (overall, weight / entries.len() as f64)
        };

        let overall = overall.clamp(-1.0, 1.0);
        let confidence = mean_confidence.max(config.min_confidence).min(1.0);

        let trend = if overall >= config.bullish_threshold {
            Trend::Bullish
        } else if overall <= config.bearish_threshold {
            Trend::Bearish
        } else {
            Trend::Neutral
        };
        let strength = Strength::classify(overall, config.moderate_threshold, config.strong_threshold);

        let reasoning = format!(
            "{} {} sentiment {:.2} from {} entries (news {}, social {}, market {}) in the last {}h",
            strength,
            trend,
            overall,
            entries.len(),
            sources.news.len(),
            sources.social.len(),
            sources.market.len(),
            config.sentiment_window_hours
        );

        SentimentAnalysis {
            symbol: symbol.to_string(),
            overall_sentiment: overall,
            confidence,
            trend,
            strength,
            sources,
            reasoning,
            timestamp: now,
        }
    }

    /// Latest reading; `None` until the symbol's first ingestion
    pub fn get_sentiment_analysis(&self, symbol: &str) -> Option<SentimentAnalysis> {
        self.history.latest(symbol)
    }

    /// Reading built only from entries still inside the window
    ///
    /// This is the latest reading while all of its entries are fresh.
    /// Otherwise the reading is rebuilt from the remaining entries without
    /// being recorded. `None` once no entry remains.
    pub fn current_sentiment(&self, symbol: &str) -> Option<SentimentAnalysis> {
        let latest = self.history.latest(symbol)?;
        let config = self.config();
        let cutoff = Utc::now() - Duration::hours(config.sentiment_window_hours);
        if latest.sources.iter().all(|e| e.timestamp >= cutoff) {
            return (!latest.sources.is_empty()).then_some(latest);
        }

        let lock = self.symbol_lock(symbol);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let analysis = self.recompute(symbol, &config);
        (!analysis.sources.is_empty()).then_some(analysis)
    }

    pub fn get_sentiment_history(&self, symbol: &str, limit: Option<usize>) -> Vec<SentimentAnalysis> {
        match limit {
            Some(n) => self.history.recent(symbol, n),
            None => self.history.all(symbol),
        }
    }

    /// Movement of the overall reading over the last `hours`
    pub fn get_sentiment_trend(&self, symbol: &str, hours: i64) -> Option<SentimentTrend> {
        let cutoff = Utc::now() - Duration::hours(hours.max(0));
        let readings = self.history.filter(symbol, |a| a.timestamp >= cutoff);

        let first = readings.first()?;
        let last = readings.last()?;
        let change = last.overall_sentiment - first.overall_sentiment;
        let average_sentiment =
            readings.iter().map(|a| a.overall_sentiment).sum::<f64>() / readings.len() as f64;

        let threshold = self.config().trend_change_threshold;
        let direction = if change > threshold {
            SentimentDirection::Improving
        } else if change < -threshold {
            SentimentDirection::Declining
        } else {
            SentimentDirection::Stable
        };

        Some(SentimentTrend {
            symbol: symbol.to_string(),
            window_hours: hours,
            data_points: readings.len(),
            average_sentiment,
            change,
            direction,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::drain;

    fn payload(symbol: &str, sentiment: f64, confidence: f64, source: &str) -> SentimentPayload {
        SentimentPayload {
            symbol: symbol.to_string(),
            sentiment,
            confidence,
            source: source.to_string(),
            text: None,
            metadata: None,
            timestamp: None,
        }
    }

    fn tracking(symbols: &[&str]) -> SentimentAnalysisEngine {
        let engine = SentimentAnalysisEngine::new(SentimentConfig::default(), EventBus::default());
        let symbols: Vec<String> = symbols.iter().map(|s| s.to_string()).collect();
        engine.start_analysis(&symbols);
        engine
    }

    #[test]
    fn test_untracked_symbol_is_noop() {
        let engine = tracking(&["BTCUSDT"]);
        assert!(engine
            .add_sentiment_data(payload("DOGEUSDT", 0.9, 0.9, "twitter"))
            .is_none());
        assert!(engine.get_sentiment_analysis("DOGEUSDT").is_none());
    }

    #[test]
    fn test_none_before_first_ingestion() {
        let engine = tracking(&["BTCUSDT"]);
        assert!(engine.get_sentiment_analysis("BTCUSDT").is_none());
    }

    #[test]
    fn test_confidence_weighted_mean() {
        let engine = tracking(&["BTCUSDT"]);
        engine.add_sentiment_data(payload("BTCUSDT", 0.8, 0.9, "news_api"));
        let analysis = engine
            .add_sentiment_data(payload("BTCUSDT", -0.4, 0.3, "reddit"))
            .unwrap();

        // (0.8*0.9 - 0.4*0.3) / 1.2 = 0.5
        assert!((analysis.overall_sentiment - 0.5).abs() < 1e-9);
        assert!((analysis.confidence - 0.6).abs() < 1e-9);
        assert_eq!(analysis.trend, Trend::Bullish);
        assert_eq!(analysis.strength, Strength::Moderate);
        assert_eq!(analysis.sources.news.len(), 1);
        assert_eq!(analysis.sources.social.len(), 1);
    }

    #[test]
    fn test_source_classification() {
        let config = SentimentConfig::default();
        assert_eq!(config.classify_source("news_api"), SourceCategory::News);
        assert_eq!(config.classify_source("RSS"), SourceCategory::News);
        assert_eq!(config.classify_source("twitter"), SourceCategory::Social);
        assert_eq!(config.classify_source("fear_greed"), SourceCategory::Market);
        assert_eq!(config.classify_source("carrier_pigeon"), SourceCategory::Market);
    }

    #[test]
    fn test_payload_ranges_are_clamped() {
        let engine = tracking(&["BTCUSDT"]);
        let analysis = engine
            .add_sentiment_data(payload("BTCUSDT", 3.0, 7.0, "twitter"))
            .unwrap();

        assert_eq!(analysis.overall_sentiment, 1.0);
        assert_eq!(analysis.confidence, 1.0);
        assert_eq!(analysis.strength, Strength::Strong);

        assert!(engine
            .add_sentiment_data(payload("BTCUSDT", f64::NAN, 0.5, "twitter"))
            .is_none());
    }

    #[test]
    fn test_confidence_floor() {
        let engine = tracking(&["BTCUSDT"]);
        let analysis = engine
            .add_sentiment_data(payload("BTCUSDT", -0.5, 0.0, "vix"))
            .unwrap();

        assert_eq!(analysis.confidence, 0.1);
        assert_eq!(analysis.overall_sentiment, -0.5);
        assert_eq!(analysis.trend, Trend::Bearish);
    }

    #[test]
    fn test_stale_entries_are_excluded() {
        let engine = tracking(&["BTCUSDT"]);
        let mut old = payload("BTCUSDT", -1.0, 1.0, "news");
        old.timestamp = Some(Utc::now() - Duration::hours(48));
        engine.add_sentiment_data(old);

        let analysis = engine
            .add_sentiment_data(payload("BTCUSDT", 0.4, 0.5, "news"))
            .unwrap();
        assert!((analysis.overall_sentiment - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_restart_keeps_active_set() {
        let engine = tracking(&["BTCUSDT"]);
        engine.add_sentiment_data(payload("BTCUSDT", 0.3, 0.5, "news"));

        engine.start_analysis(&["ETHUSDT".to_string()]);

        assert_eq!(engine.active_symbols(), vec!["BTCUSDT".to_string()]);
        assert!(engine.get_sentiment_analysis("BTCUSDT").is_some());
    }

    #[test]
    fn test_history_cap_and_event() {
        let bus = EventBus::default();
        let engine = SentimentAnalysisEngine::new(SentimentConfig::default(), bus.clone());
        engine.start_analysis(&["BTCUSDT".to_string()]);

        let mut rx = bus.subscribe();
        engine.add_sentiment_data(payload("BTCUSDT", 0.1, 0.5, "news"));
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "sentiment_analysis");

        for i in 0..150 {
            engine.add_sentiment_data(payload("BTCUSDT", (i % 10) as f64 / 10.0, 0.5, "news"));
        }
        assert_eq!(engine.get_sentiment_history("BTCUSDT", None).len(), 100);
        assert_eq!(engine.get_sentiment_history("BTCUSDT", Some(10)).len(), 10);
    }

    #[test]
    fn test_sentiment_trend() {
        let engine = tracking(&["BTCUSDT"]);
        assert!(engine.get_sentiment_trend("BTCUSDT", 24).is_none());

        engine.add_sentiment_data(payload("BTCUSDT", -0.6, 1.0, "news"));
        engine.add_sentiment_data(payload("BTCUSDT", 0.9, 1.0, "news"));
        engine.add_sentiment_data(payload("BTCUSDT", 0.9, 1.0, "news"));

        let trend = engine.get_sentiment_trend("BTCUSDT", 24).unwrap();
        assert_eq!(trend.data_points, 3);
        assert!(trend.change > 0.1);
        assert_eq!(trend.direction, SentimentDirection::Improving);
    }

    #[test]
    fn test_concurrent_ingestion_keeps_latest_complete() {
        for _ in 0..50 {
            let engine = tracking(&["BTCUSDT"]);
            std::thread::scope(|scope| {
                for _ in 0..8 {
                    scope.spawn(|| {
                        for _ in 0..10 {
                            engine.add_sentiment_data(payload("BTCUSDT", 0.5, 0.8, "news"));
                        }
                    });
                }
            });

            let latest = engine.get_sentiment_analysis("BTCUSDT").unwrap();
            assert_eq!(latest.sources.news.len(), 80);
            assert_eq!(engine.get_sentiment_history("BTCUSDT", None).len(), 80);
        }
    }

    #[test]
    fn test_current_sentiment_drops_expired_reading() {
        let engine = tracking(&["BTCUSDT"]);
        let mut old = payload("BTCUSDT", 0.8, 0.9, "twitter");
        old.timestamp = Some(Utc::now() - Duration::hours(2));
        engine.add_sentiment_data(old).unwrap();
        assert!(engine.current_sentiment("BTCUSDT").is_some());

        engine
            .update_config(SentimentConfig {
                sentiment_window_hours: 1,
                ..Default::default()
            })
            .unwrap();

        assert!(engine.current_sentiment("BTCUSDT").is_none());
        // The recorded reading is left as it was
        assert_eq!(engine.get_sentiment_analysis("BTCUSDT").unwrap().sources.len(), 1);
        assert_eq!(engine.get_sentiment_history("BTCUSDT", None).len(), 1);
    }

    #[test]
    fn test_current_sentiment_keeps_fresh_entries() {
        let engine = tracking(&["BTCUSDT"]);
        let mut old = payload("BTCUSDT", 0.9, 0.9, "twitter");
        old.timestamp = Some(Utc::now() - Duration::hours(3));
        engine.add_sentiment_data(old).unwrap();
        engine.add_sentiment_data(payload("BTCUSDT", -0.4, 0.5, "news")).unwrap();

        engine
            .update_config(SentimentConfig {
                sentiment_window_hours: 2,
                ..Default::default()
            })
            .unwrap();

        let current = engine.current_sentiment("BTCUSDT").unwrap();
        assert_eq!(current.sources.len(), 1);
        assert_eq!(current.sources.news.len(), 1);
        assert!((current.overall_sentiment + 0.4).abs() < 1e-12);
        assert!(engine.current_sentiment("ETHUSDT").is_none());
    }

    #[tokio::test]
    async fn test_ingest_json_lines() {
        let engine = tracking(&["BTCUSDT"]);
        let feed = br#"{"symbol":"BTCUSDT","sentiment":0.6,"confidence":0.9,"source":"reddit"}

not json
{"symbol":"DOGEUSDT","sentiment":0.9,"confidence":0.9,"source":"twitter"}
{"symbol":"BTCUSDT","sentiment":0.2,"confidence":0.5,"source":"news","text":"ETF inflows"}
"#;

        let ingested = engine.ingest_json_lines(tokio::io::BufReader::new(&feed[..])).await;

        assert_eq!(ingested, 2);
        let latest = engine.get_sentiment_analysis("BTCUSDT").unwrap();
        assert_eq!(latest.sources.social.len(), 1);
        assert_eq!(latest.sources.news.len(), 1);
        assert!(engine.get_sentiment_analysis("DOGEUSDT").is_none());
    }
}
