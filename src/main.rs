use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use redbucket::config::RedbucketConfig;
use redbucket::ratelimit::Request;
use redbucket::store::MemoryStore;
use redbucket::RateLimiter;

/// Ask a configured rate limiter for a permit.
#[derive(Debug, Parser)]
#[command(name = "redbucket", version, about)]
struct Cli {
    /// YAML configuration file; `REDBUCKET__*` variables override it
    #[arg(short, long, env = "REDBUCKET_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Number of times to repeat the request
    #[arg(short = 'n', long, default_value_t = 1)]
    repeat: u32,

    /// Keys to present, as LIMIT=KEY
    #[arg(value_name = "LIMIT=KEY", value_parser = parse_limit_key)]
    keys: Vec<(String, String)>,
}

fn parse_limit_key(arg: &str) -> Result<(String, String), String> {
    match arg.split_once('=') {
        Some((limit, key)) if !limit.is_empty() => Ok((limit.to_string(), key.to_string())),
        _ => Err(format!("expected LIMIT=KEY, got {:?}", arg)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = RedbucketConfig::load(cli.config.as_ref()).context("loading configuration")?;
    info!(
        store = %config.store.url,
        backend = ?config.backend,
        codec = config.codec.name(),
        "Configuration loaded"
    );

    let limiter = build_limiter(&config).await?;
    let request: Request = cli.keys.into_iter().collect();

    for _ in 0..cli.repeat {
        let response = limiter.request(&request).await?;
        if response.accepted {
            println!("accepted delay={:.6}", response.delay);
        } else {
            println!("rejected");
        }
    }

    Ok(())
}

async fn build_limiter(config: &RedbucketConfig) -> anyhow::Result<RateLimiter> {
    let url = config.store.url.as_str();

    if url.starts_with("memory://") {
        warn!("Using an in-process store; counters are not shared with other processes");
        return Ok(config.build_limiter(MemoryStore::new())?);
    }

    #[cfg(feature = "redis-store")]
    if url.starts_with("redis://") || url.starts_with("rediss://") {
        let store = redbucket::store::RedisStore::connect(url).await?;
        return Ok(config.build_limiter(store)?);
    }

    anyhow::bail!("unsupported store url {:?}", url)
}
