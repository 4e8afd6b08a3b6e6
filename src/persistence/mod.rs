use crate::events::Event;
use crate::Result;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::{timeout, Duration};

/// Key for events that carry no symbol
const ENGINE_STREAM: &str = "engine";

/// One journaled event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub recorded_at: DateTime<Utc>,
    pub event: Event,
}

/// Sorted-set key an event is journaled under
///
/// Symbol events go to `events:{symbol}`, the rest to `events:engine`.
pub fn journal_key(event: &Event) -> String {
    format!("events:{}", event.symbol().unwrap_or(ENGINE_STREAM))
}

/// Redis event journal
///
/// Uses sorted sets with timestamps as scores for time-range queries
pub struct EventJournal {
    conn: ConnectionManager,
}

impl EventJournal {
    /// Connect to Redis
    ///
    /// # Example
    /// ```no_run
    /// # async fn demo() -> tradepilot::Result<()> {
    /// let journal = tradepilot::persistence::EventJournal::new("redis://127.0.0.1:6379").await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;

        // Add 5 second timeout to connection attempt
        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| "Redis connection timeout after 5 seconds")??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self { conn })
    }

    pub async fn record(&mut self, event: &Event) -> Result<()> {
        let entry = JournalEntry {
            recorded_at: Utc::now(),
            event: event.clone(),
        };
        let value = serde_json::to_string(&entry)?;
        let score = entry.recorded_at.timestamp_millis() as f64;

        self.conn
            .zadd::<_, _, _, ()>(journal_key(event), value, score)
            .await?;
        Ok(())
    }

    /// Entries for a stream (symbol or `engine`) from the last `hours_back`
    /// hours, oldest first
    pub async fn load(&mut self, stream: &str, hours_back: u64) -> Result<Vec<JournalEntry>> {
        let key = format!("events:{}", stream);
        let cutoff = Utc::now() - chrono::Duration::hours(hours_back as i64);

        let results: Vec<String> = self
            .conn
            .zrangebyscore(&key, cutoff.timestamp_millis() as f64, "+inf")
            .await?;

        let mut entries = Vec::with_capacity(results.len());
        for json_str in results {
            match serde_json::from_str::<JournalEntry>(&json_str) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!("Skipping unreadable journal entry in {}: {}", key, e),
            }
        }
        Ok(entries)
    }

    /// Remove entries older than `keep_hours`
    pub async fn cleanup_old(&mut self, stream: &str, keep_hours: u64) -> Result<usize> {
        let key = format!("events:{}", stream);
        let cutoff = Utc::now() - chrono::Duration::hours(keep_hours as i64);

        let removed: usize = self
            .conn
            .zrembyscore(&key, "-inf", cutoff.timestamp_millis() as f64)
            .await?;

        if removed > 0 {
            tracing::debug!("Cleaned up {} old journal entries for {}", removed, stream);
        }
        Ok(removed)
    }

    pub async fn count(&mut self, stream: &str) -> Result<usize> {
        let count: usize = self.conn.zcard(format!("events:{}", stream)).await?;
        Ok(count)
    }

    /// Journal every event from the bus until it closes
    ///
    /// Write failures are logged and do not stop the sink.
    pub async fn run(mut self, mut rx: broadcast::Receiver<Event>) {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Err(e) = self.record(&event).await {
                        tracing::warn!("Failed to journal {} event: {}", event.name(), e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event journal lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error_event(symbol: &str) -> Event {
        Event::AnalysisError {
            symbol: symbol.to_string(),
            error: "timeout".to_string(),
        }
    }

    #[test]
    fn test_journal_keys() {
        assert_eq!(journal_key(&error_event("BTCUSDT")), "events:BTCUSDT");
        assert_eq!(
            journal_key(&Event::TradingStopped { portfolio_id: None }),
            "events:engine"
        );
    }

    #[test]
    fn test_entry_serialization() {
        let entry = JournalEntry {
            recorded_at: Utc::now(),
            event: error_event("ETHUSDT"),
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"type\":\"analysis_error\""));

        let parsed: JournalEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event.symbol(), Some("ETHUSDT"));
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_connection_timeout() {
        let result = EventJournal::new("redis://192.0.2.1:6379").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_record_and_load() {
        let mut journal = EventJournal::new("redis://127.0.0.1:6379")
            .await
            .expect("Failed to connect to Redis");

        let _ = journal.cleanup_old("TEST_JOURNAL", 0).await;

        journal.record(&error_event("TEST_JOURNAL")).await.unwrap();
        journal.record(&error_event("TEST_JOURNAL")).await.unwrap();

        let loaded = journal.load("TEST_JOURNAL", 1).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].event.name(), "analysis_error");
        assert_eq!(journal.count("TEST_JOURNAL").await.unwrap(), 2);

        let _ = journal.cleanup_old("TEST_JOURNAL", 0).await;
        assert_eq!(journal.count("TEST_JOURNAL").await.unwrap(), 0);
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_empty_stream() {
        let mut journal = EventJournal::new("redis://127.0.0.1:6379")
            .await
            .expect("Failed to connect to Redis");

        assert!(journal.load("NONEXISTENT_STREAM", 24).await.unwrap().is_empty());
        assert_eq!(journal.count("NONEXISTENT_STREAM").await.unwrap(), 0);
    }
}
