use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use tradepilot::analysis::{SentimentAnalysisEngine, SentimentPayload, TechnicalAnalysisEngine};
use tradepilot::engine::combine_scores;
use tradepilot::events::log_events;
use tradepilot::gateway::paper::{PaperGateway, StaticBudgetProvider};
use tradepilot::gateway::MarketGateway;
use tradepilot::persistence::EventJournal;
use tradepilot::{EventBus, Settings, TradingEngine};

#[derive(Parser)]
#[command(name = "tradepilot", version, about = "Automated trading orchestrator")]
struct Cli {
    /// Settings file (defaults to ./tradepilot.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the trading loop against the paper exchange
    Run {
        #[arg(short, long, default_value = "main")]
        portfolio: String,

        /// Comma-separated symbols; the portfolio's symbols when omitted
        #[arg(short, long, value_delimiter = ',')]
        symbols: Vec<String>,

        /// Newline-delimited JSON sentiment payloads (a file or a named pipe)
        #[arg(long)]
        sentiment_feed: Option<PathBuf>,
    },
    /// One-shot analysis of a symbol
    Analyze {
        symbol: String,

        /// Sentiment score in [-1, 1] to fuse with the technical reading
        #[arg(long, allow_hyphen_values = true)]
        sentiment: Option<f64>,

        #[arg(long, default_value_t = 0.8)]
        confidence: f64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;

    match cli.command {
        Command::Run {
            portfolio,
            symbols,
            sentiment_feed,
        } => run(settings, portfolio, symbols, sentiment_feed).await,
        Command::Analyze {
            symbol,
            sentiment,
            confidence,
        } => analyze(settings, symbol, sentiment, confidence).await,
    }
}

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tradepilot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(
    settings: Settings,
    portfolio: String,
    symbols: Vec<String>,
    sentiment_feed: Option<PathBuf>,
) -> anyhow::Result<()> {
    tracing::info!("🚀 TradePilot starting (paper exchange)");

    let events = EventBus::default();
    let log_task = tokio::spawn(log_events(events.subscribe()));

    if let Some(redis_url) = settings.redis_url.as_deref() {
        match EventJournal::new(redis_url).await {
            Ok(journal) => {
                tokio::spawn(journal.run(events.subscribe()));
            }
            Err(e) => tracing::warn!("Event journal disabled ({}), continuing without it", e),
        }
    }

    let gateway = Arc::new(PaperGateway::new(settings.paper.clone()));
    let budgets = Arc::new(StaticBudgetProvider::new(&settings.portfolios));
    let engine = TradingEngine::from_settings(&settings, gateway, budgets, events.clone())?;

    engine
        .start_trading(&portfolio, symbols)
        .await
        .with_context(|| format!("Failed to start trading portfolio {portfolio}"))?;

    let feed = sentiment_feed.map(|path| {
        let sentiment = engine.sentiment().clone();
        tokio::spawn(async move {
            match tokio::fs::File::open(&path).await {
                Ok(file) => {
                    tracing::info!("📰 Reading sentiment from {}", path.display());
                    let ingested = sentiment.ingest_json_lines(BufReader::new(file)).await;
                    tracing::info!("✓ Sentiment feed {} ended ({} payloads)", path.display(), ingested);
                }
                Err(e) => tracing::warn!("Sentiment feed {} unavailable: {}", path.display(), e),
            }
        })
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let orders = engine.orders().clone();
    let monitor_rx = shutdown_rx.clone();
    let monitor = tokio::spawn(async move { orders.run_monitor(monitor_rx).await });

    let runner = engine.clone();
    let trading = tokio::spawn(async move { runner.run(shutdown_rx).await });

    tokio::signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;
    tracing::info!("Ctrl-C received, shutting down");
    let _ = shutdown_tx.send(true);

    let _ = tokio::join!(trading, monitor);
    if let Some(feed) = feed {
        feed.abort();
        let _ = feed.await;
    }

    for position in engine.get_open_positions(Some(&portfolio)) {
        tracing::info!(
            "Open at exit: {} {} {:.6} @ ${:.2} (unrealized ${:.2})",
            position.side,
            position.symbol,
            position.quantity,
            position.entry_price,
            position.unrealized_pnl
        );
    }

    // Dropping the last bus handle closes the log sink
    drop(engine);
    drop(events);
    let _ = log_task.await;
    Ok(())
}

async fn analyze(settings: Settings, symbol: String, sentiment: Option<f64>, confidence: f64) -> anyhow::Result<()> {
    let events = EventBus::default();
    let gateway = PaperGateway::new(settings.paper.clone());
    let technical_engine = TechnicalAnalysisEngine::new(settings.technical.clone(), events.clone());

    let candles = gateway
        .get_candles(
            &symbol,
            &settings.trading.candle_interval,
            settings.trading.candle_limit,
            None,
            None,
        )
        .await?;
    let technical = technical_engine.perform_technical_analysis(&symbol, &candles)?;

    let sentiment_reading = sentiment.and_then(|score| {
        let engine = SentimentAnalysisEngine::new(settings.sentiment.clone(), events.clone());
        engine.start_analysis(std::slice::from_ref(&symbol));
        engine.add_sentiment_data(SentimentPayload::new(&symbol, score, confidence, "cli"))
    });
    let sentiment_score = sentiment_reading.as_ref().map_or(0.0, |s| s.overall_sentiment);

    let combined = combine_scores(
        sentiment_score,
        technical.directional_strength(),
        &settings.trading.score_weights(),
    );

    let report = serde_json::json!({
        "symbol": symbol,
        "price": technical.price,
        "action": combined.action,
        "confidence": combined.confidence,
        "combined_score": combined.score,
        "technical": technical,
        "sentiment": sentiment_reading,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
