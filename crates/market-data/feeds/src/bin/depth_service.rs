//! Twenty-level depth service
//!
//! - `run`: connect, subscribe and print analyses periodically
//! - `decode`: decode a hex-encoded binary message
//! - `config`: print the effective configuration

use anyhow::{Context, Result, bail};
use chrono::Local;
use clap::{Parser, Subcommand};
use common::{ExchangeSegment, InstrumentId};
use feeds::config::redact;
use feeds::dhan::codec::split_frames;
use feeds::{DepthFeed, DepthFeedConfig, DhanConnector, FeedError, decode_frame};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "depth-service")]
#[command(about = "Dhan twenty-level market depth service")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML config file; `DEPTH_*` environment variables override it
    #[arg(long, global = true)]
    config: Option<String>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream depth and print analyses
    Run {
        /// Dhan client id (overrides config)
        #[arg(long)]
        client_id: Option<String>,

        /// Dhan access token (overrides config)
        #[arg(long)]
        access_token: Option<String>,

        /// Instrument as SEGMENT:SECURITY_ID, e.g. NSE_EQ:1333 (repeatable)
        #[arg(long = "instrument", required = true)]
        instruments: Vec<String>,

        /// Seconds between printed analyses
        #[arg(long, default_value = "5")]
        interval_secs: u64,
    },

    /// Decode a hex-encoded depth message and print it as JSON
    Decode {
        /// Message bytes as hex
        hex: String,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::from_default_env()
            .add_directive("depth_service=debug".parse()?)
            .add_directive("feeds=debug".parse()?)
            .add_directive("lob=debug".parse()?)
    } else {
        EnvFilter::from_default_env()
            .add_directive("depth_service=info".parse()?)
            .add_directive("feeds=info".parse()?)
            .add_directive("lob=info".parse()?)
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();

    match cli.command {
        Commands::Run {
            client_id,
            access_token,
            instruments,
            interval_secs,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(id) = client_id {
                config.connection.client_id = id;
            }
            if let Some(token) = access_token {
                config.connection.access_token = token;
            }
            run(config, &instruments, interval_secs).await?;
        }
        Commands::Decode { hex } => decode(&hex)?,
        Commands::Config => {
            let mut config = load_config(cli.config.as_deref())?;
            config.connection.access_token = redact(&config.connection.access_token);
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn load_config(path: Option<&str>) -> Result<DepthFeedConfig> {
    let config = match path {
        Some(path) => DepthFeedConfig::from_file(path)
            .with_context(|| format!("loading config from {path}"))?,
        None => DepthFeedConfig::from_env().context("loading config from environment")?,
    };
    Ok(config)
}

fn parse_instrument(arg: &str) -> Result<(ExchangeSegment, InstrumentId)> {
    let Some((segment, id)) = arg.split_once(':') else {
        bail!("instrument '{arg}' is not SEGMENT:SECURITY_ID");
    };
    let segment: ExchangeSegment = segment.parse()?;
    let id: InstrumentId = id
        .trim()
        .parse()
        .with_context(|| format!("bad security id in '{arg}'"))?;
    Ok((segment, id))
}

async fn run(config: DepthFeedConfig, instruments: &[String], interval_secs: u64) -> Result<()> {
    if !config.has_credentials() {
        bail!("client id and access token are required (flags or DEPTH_CONNECTION__*)");
    }
    let targets = instruments
        .iter()
        .map(|s| parse_instrument(s))
        .collect::<Result<Vec<_>>>()?;

    info!("Dhan Twenty-Depth Service");
    info!("=========================");
    info!("Time: {}", Local::now().format("%Y-%m-%d %H:%M:%S"));
    info!("Instruments: {}", targets.len());

    let connector = Arc::new(DhanConnector::new(config.connection.clone()));
    let feed = DepthFeed::start(config, connector)?;

    for (segment, id) in &targets {
        match feed.subscribe(*id, *segment).await {
            Ok(()) => info!("Subscribed {}:{}", segment, id),
            Err(e) => error!("Subscribe {}:{} failed: {}", segment, id, e),
        }
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => print_analyses(&feed),
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!("Signal handler failed: {}", e);
                }
                info!("Shutting down");
                break;
            }
        }
    }

    feed.shutdown().await;
    feed.metrics().log();
    Ok(())
}

fn print_analyses(feed: &DepthFeed) {
    let now = Local::now().format("%H:%M:%S");
    for id in feed.list_subscriptions() {
        match feed.get_analysis(id) {
            Ok(a) => {
                let target = a.target_level.map_or_else(|| "-".to_string(), |p| p.to_string());
                let stop = a.stop_level.map_or_else(|| "-".to_string(), |p| p.to_string());
                println!(
                    "[{now}] {id:>8} {:<4} conf {:.2} imb {:+.3} liq {:.2} vol {:.5} target {target} stop {stop} {}{}",
                    a.signal,
                    a.confidence,
                    a.imbalance,
                    a.liquidity_score,
                    a.estimated_volatility,
                    a.time_horizon,
                    if a.stale { " (stale)" } else { "" },
                );
            }
            Err(FeedError::NoDataYet(_)) => println!("[{now}] {id:>8} waiting for depth ({})", feed.state()),
            Err(e) => warn!("Analysis for {} failed: {}", id, e),
        }
    }
}

fn decode(input: &str) -> Result<()> {
    let bytes = hex::decode(input.trim()).context("input is not valid hex")?;
    for frame in split_frames(&bytes) {
        let frame = decode_frame(frame?)?;
        println!("{}", serde_json::to_string_pretty(&frame)?);
    }
    Ok(())
}
