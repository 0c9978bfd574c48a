//! `admit`: line-oriented admission decisions.
//!
//! Reads one request per line from stdin:
//!
//! ```text
//! <variant-or-path> <client-id> [timestamp-ms]
//! ```
//!
//! and writes one verdict per line to stdout. A target starting with `/` is
//! resolved through the route table, anything else is parsed as a variant
//! name. Without a timestamp the system clock is used.
//!
//! ```text
//! $ printf 'token-bucket 10.0.0.1\n/sliding-window 10.0.0.1 1000\n' | admit
//! allowed remaining=2 reset_at_ms=1700000005000
//! allowed remaining=3 reset_at_ms=61000
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use admit_ratelimit::storage::current_timestamp_ms;
use admit_ratelimit::{Backend, ClientId, Decision, EngineConfig, MemoryStorage, RateLimiter, Storage};

#[derive(Debug, Parser)]
#[command(name = "admit", version, about = "Per-client admission decisions over a shared store")]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Store backend, overriding the configuration
    #[arg(long, value_enum)]
    backend: Option<BackendArg>,

    /// Redis URL, overriding the configuration
    #[arg(long)]
    redis_url: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Memory,
    Redis,
}

impl From<BackendArg> for Backend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Memory => Backend::Memory,
            BackendArg::Redis => Backend::Redis,
        }
    }
}

/// One parsed input line.
#[derive(Debug, PartialEq)]
struct Request<'a> {
    target: &'a str,
    client: &'a str,
    timestamp_ms: Option<u64>,
}

fn parse_line(line: &str) -> Result<Request<'_>, String> {
    let mut fields = line.split_whitespace();
    let target = fields.next().ok_or("missing variant")?;
    let client = fields.next().ok_or("missing client id")?;
    let timestamp_ms = fields
        .next()
        .map(|raw| raw.parse::<u64>().map_err(|e| format!("invalid timestamp {:?}: {}", raw, e)))
        .transpose()?;

    if fields.next().is_some() {
        return Err("too many fields".to_string());
    }

    Ok(Request {
        target,
        client,
        timestamp_ms,
    })
}

fn format_decision(decision: &Decision) -> String {
    let info = decision.info();
    let mut out = format!(
        "{} remaining={} reset_at_ms={}",
        if decision.is_allowed() { "allowed" } else { "denied" },
        info.remaining,
        info.reset_at_ms
    );
    if let Some(retry_after) = info.retry_after {
        out.push_str(&format!(" retry_after_ms={}", retry_after.as_millis()));
    }
    if decision.is_fallback() {
        out.push_str(" fallback");
    }
    out
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let mut config = EngineConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(backend) = args.backend {
        config.storage.backend = backend.into();
    }
    if let Some(url) = args.redis_url {
        config.storage.url = Some(url);
    }

    info!(
        backend = ?config.storage.backend,
        fail_policy = ?config.engine.fail_policy,
        "Starting admit {}",
        env!("CARGO_PKG_VERSION")
    );

    let backend = config.storage.backend;
    match backend {
        Backend::Memory => serve(Arc::new(MemoryStorage::new()), config).await,
        #[cfg(feature = "redis")]
        Backend::Redis => {
            let redis = config.storage.redis_config()?;
            let storage = admit_ratelimit::RedisStorage::new(redis)
                .await
                .context("connecting to redis")?;
            serve(Arc::new(storage), config).await
        }
        #[cfg(not(feature = "redis"))]
        Backend::Redis => anyhow::bail!("built without the `redis` feature"),
    }
}

async fn serve<S: Storage>(storage: Arc<S>, config: EngineConfig) -> anyhow::Result<()> {
    let limiter = RateLimiter::new(storage, config)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let output = match parse_line(line) {
            Ok(request) => {
                let client = ClientId::from(request.client);
                let now_ms = request.timestamp_ms.unwrap_or_else(current_timestamp_ms);
                let result = if request.target.starts_with('/') {
                    limiter.decide_for_path(request.target, &client, now_ms).await
                } else {
                    limiter.decide_str(request.target, &client, now_ms).await
                };

                match result {
                    Ok(decision) => format_decision(&decision),
                    Err(err) => format!("error: {}", err),
                }
            }
            Err(reason) => {
                warn!(line = %line, reason = %reason, "Skipping malformed request");
                format!("error: {}", reason)
            }
        };

        stdout.write_all(output.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }

    Ok(())
}
