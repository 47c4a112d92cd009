// Hookcast - Main Entry Point
//
// CLI around the webhook delivery library:
// - signing and verifying payloads
// - one-off retried deliveries
// - dispatching an event to a file of subscriptions

use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use hookcast::config::Config;
use hookcast::metrics;
use hookcast::webhooks::{
    signer, EventDispatcher, EventPayload, HttpDeliveryExecutor, InMemoryDeliveryLog,
    InMemoryFailureCounter, InMemorySubscriptionStore, RetryScheduler, WebhookSubscription,
};
use serde_json::json;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, Level};
use tracing_subscriber::EnvFilter;

/// Hookcast: signed webhook delivery
#[derive(Parser, Debug)]
#[command(name = "hookcast")]
#[command(version)]
#[command(about = "Signed webhook delivery with retries and fan-out", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to a config file (defaults to the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print Prometheus metrics after the command finishes
    #[arg(long, global = true)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Payload source: inline string or file
#[derive(ClapArgs, Debug)]
struct PayloadSource {
    /// Payload string
    #[arg(long, conflicts_with = "file")]
    payload: Option<String>,

    /// Read the payload from a file
    #[arg(long)]
    file: Option<PathBuf>,
}

impl PayloadSource {
    fn read(&self) -> Result<String> {
        match (&self.payload, &self.file) {
            (Some(payload), _) => Ok(payload.clone()),
            (None, Some(path)) => fs::read_to_string(path)
                .with_context(|| format!("Failed to read payload from {:?}", path)),
            (None, None) => bail!("Either --payload or --file is required"),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the hex HMAC-SHA256 signature of a payload
    Sign {
        /// Shared secret
        #[arg(long)]
        secret: String,

        #[command(flatten)]
        source: PayloadSource,
    },
    /// Check a signature against a payload
    Verify {
        /// Shared secret
        #[arg(long)]
        secret: String,

        /// Hex signature to check
        #[arg(long)]
        signature: String,

        #[command(flatten)]
        source: PayloadSource,
    },
    /// Deliver one event to one URL with retries
    Send {
        /// Target URL
        #[arg(long)]
        url: String,

        /// Shared secret
        #[arg(long)]
        secret: String,

        /// Event name
        #[arg(long)]
        event: String,

        /// Event body as JSON
        #[arg(long, default_value = "{}")]
        data: String,

        /// Retries after the first attempt (defaults to the config value)
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// Dispatch an event to every matching subscription in a JSON file
    Dispatch {
        /// JSON array of subscriptions
        #[arg(long)]
        subscriptions: PathBuf,

        /// Owner whose subscriptions receive the event
        #[arg(long)]
        owner: String,

        /// Event name
        #[arg(long)]
        event: String,

        /// Event body as JSON
        #[arg(long, default_value = "{}")]
        data: String,

        /// Retries after the first attempt (defaults to the config value)
        #[arg(long)]
        max_retries: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    init_tracing(&config, args.verbose)?;

    if config.metrics.enabled || args.print_metrics {
        metrics::init().context("Failed to initialize metrics")?;
    }

    match args.command {
        Commands::Sign { secret, source } => {
            let payload = source.read()?;
            println!("{}", signer::sign(&payload, &secret));
        }
        Commands::Verify {
            secret,
            signature,
            source,
        } => {
            let payload = source.read()?;
            if signer::verify(&payload, &signature, &secret) {
                println!("valid");
            } else {
                println!("invalid");
                print_metrics(args.print_metrics)?;
                std::process::exit(1);
            }
        }
        Commands::Send {
            url,
            secret,
            event,
            data,
            max_retries,
        } => {
            let data = parse_data(&data)?;
            let scheduler = build_scheduler(&config)?;
            let max_retries = max_retries.unwrap_or(config.delivery.max_retries);

            info!("Delivering {} to {}", event, url);
            let outcome = scheduler
                .deliver_payload(&url, &secret, &EventPayload::new(event, data), max_retries)
                .await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.success {
                print_metrics(args.print_metrics)?;
                std::process::exit(1);
            }
        }
        Commands::Dispatch {
            subscriptions,
            owner,
            event,
            data,
            max_retries,
        } => {
            let data = parse_data(&data)?;
            let content = fs::read_to_string(&subscriptions)
                .with_context(|| format!("Failed to read subscriptions from {:?}", subscriptions))?;
            let loaded: Vec<WebhookSubscription> = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse subscriptions from {:?}", subscriptions))?;
            debug!("Loaded {} subscriptions", loaded.len());

            let log = Arc::new(InMemoryDeliveryLog::new());
            let counter = Arc::new(InMemoryFailureCounter::new());
            let dispatcher = EventDispatcher::new(
                Arc::new(InMemorySubscriptionStore::with_subscriptions(loaded)),
                log.clone(),
                counter.clone(),
                build_scheduler(&config)?,
            )
            .with_max_retries(max_retries.unwrap_or(config.delivery.max_retries));

            let report = dispatcher.trigger_event(&owner, &event, data).await;
            let summary = json!({
                "report": report,
                "failure_counters": counter.snapshot().await,
                "logged_deliveries": log.records().await.len(),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    print_metrics(args.print_metrics)
}

fn init_tracing(config: &Config, verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { config.log_level()? };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    // Logs go to stderr so stdout stays machine-readable.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match config.logging.format.to_lowercase().as_str() {
        "json" => builder.json().init(),
        "pretty" => builder.pretty().init(),
        _ => builder.compact().init(),
    }
    Ok(())
}

fn build_scheduler(config: &Config) -> Result<RetryScheduler> {
    let executor = HttpDeliveryExecutor::new()?;
    Ok(RetryScheduler::new(Arc::new(executor)).with_settings(config.delivery.retry_settings()))
}

fn parse_data(data: &str) -> Result<serde_json::Value> {
    serde_json::from_str(data).context("--data must be valid JSON")
}

fn print_metrics(enabled: bool) -> Result<()> {
    if enabled {
        eprintln!("{}", metrics::gather_metrics()?);
    }
    Ok(())
}
