//! fetchcache - issue cached, coalesced, retrying requests against a JSON API.
//!
//! Responses are printed to stdout as pretty JSON. Logging goes to stderr and
//! is controlled with `RUST_LOG` (e.g. `RUST_LOG=fetchcache_core=debug` shows
//! cache hits and retries).

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use fetchcache_core::{AccessClient, ClientConfig, RequestDescriptor, RequestOptions};
use serde_json::Value;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a JSON config file. Defaults to `~/.config/fetchcache/config.json`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Base URL prepended to relative endpoints.
    #[arg(long, global = true, env = "FETCHCACHE_BASE_URL")]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// GET one endpoint, or several concurrently as a batch.
    Get {
        #[arg(required = true)]
        endpoints: Vec<String>,
        #[command(flatten)]
        opts: CommonOpts,
    },
    /// POST a JSON body.
    Post {
        endpoint: String,
        #[arg(long)]
        data: String,
        #[command(flatten)]
        opts: CommonOpts,
    },
    /// PUT a JSON body.
    Put {
        endpoint: String,
        #[arg(long)]
        data: String,
        #[command(flatten)]
        opts: CommonOpts,
    },
    /// DELETE a resource.
    Delete {
        endpoint: String,
        #[command(flatten)]
        opts: CommonOpts,
    },
    /// Warm the cache for an endpoint; never fails.
    Prefetch {
        endpoint: String,
        #[command(flatten)]
        opts: CommonOpts,
    },
}

#[derive(Args, Debug, Clone)]
struct CommonOpts {
    /// Number of retries after the first attempt.
    #[arg(long)]
    retry: Option<u32>,

    /// Cache lifetime in seconds for this request.
    #[arg(long)]
    ttl: Option<u64>,

    /// Bypass the response cache.
    #[arg(long)]
    no_cache: bool,

    /// Issue the request this many times (repeats are served from cache when possible).
    #[arg(long, default_value_t = 1)]
    repeat: u32,
}

impl CommonOpts {
    fn request_options(&self) -> RequestOptions {
        let mut options = RequestOptions::new().use_cache(!self.no_cache);
        if let Some(retry) = self.retry {
            options = options.retry(retry);
        }
        if let Some(ttl) = self.ttl {
            options = options.cache_ttl(Duration::from_secs(ttl));
        }
        options
    }
}

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

fn load_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => ClientConfig::load_from(path)?,
        None => ClientConfig::load()?,
    };
    config.apply_env()?;
    if let Some(base_url) = &cli.base_url {
        config.base_url = base_url.clone();
    }
    Ok(config)
}

fn parse_body(data: &str) -> Result<Value> {
    serde_json::from_str(data).context("--data must be valid JSON")
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(client: &AccessClient, command: Command) -> Result<()> {
    match command {
        Command::Get { endpoints, opts } => {
            for _ in 0..opts.repeat.max(1) {
                if let [endpoint] = endpoints.as_slice() {
                    let value: Value = client.get(endpoint, opts.request_options()).await?;
                    print_json(&value)?;
                } else {
                    let requests = endpoints
                        .iter()
                        .map(|endpoint| RequestDescriptor::new(endpoint.clone(), opts.request_options()))
                        .collect();
                    let values: Vec<Value> = client.batch(requests).await?;
                    print_json(&Value::Array(values))?;
                }
            }
        }
        Command::Post { endpoint, data, opts } => {
            let body = parse_body(&data)?;
            for _ in 0..opts.repeat.max(1) {
                let value: Value = client.post(&endpoint, &body, opts.request_options()).await?;
                print_json(&value)?;
            }
        }
        Command::Put { endpoint, data, opts } => {
            let body = parse_body(&data)?;
            for _ in 0..opts.repeat.max(1) {
                let value: Value = client.put(&endpoint, &body, opts.request_options()).await?;
                print_json(&value)?;
            }
        }
        Command::Delete { endpoint, opts } => {
            for _ in 0..opts.repeat.max(1) {
                let value: Value = client.delete(&endpoint, opts.request_options()).await?;
                print_json(&value)?;
            }
        }
        Command::Prefetch { endpoint, opts } => {
            client.prefetch(&endpoint, opts.request_options()).await;
            eprintln!("Prefetched {}", endpoint);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    init_tracing();

    let config = load_config(&cli)?;
    info!(base_url = %config.base_url, "fetchcache starting");

    let client = AccessClient::new(config).context("Failed to create HTTP client")?;
    let result = run(&client, cli.command).await;

    let stats = client.cache_stats();
    debug!(
        entries = stats.total_entries,
        valid = stats.valid_entries,
        expired = stats.expired_entries,
        "Cache state at exit"
    );
    client.stop_sweeper();

    result
}
