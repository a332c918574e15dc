use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use floodgate::algorithm::AlgorithmKind;
use floodgate::clock::{Clock, SystemClock};
use floodgate::config::{FloodgateConfig, LoggingConfig};
use floodgate::ratelimit::{RateLimiter, RequestDescriptor};

/// Evaluate requests read from stdin, one `CLIENT METHOD PATH` per line.
#[derive(Debug, Parser)]
#[command(name = "floodgate", version, about)]
struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured window algorithm
    #[arg(short, long)]
    algorithm: Option<AlgorithmKind>,

    /// Host name used in store keys
    #[arg(long, default_value = "localhost")]
    host: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => FloodgateConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => FloodgateConfig::default(),
    };
    if let Some(algorithm) = args.algorithm {
        config.rate_limiting.algorithm = algorithm;
    }

    init_tracing(&config.logging);

    info!("Starting Floodgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let clock: Arc<dyn Clock> = SystemClock::shared();
    let store = config.build_store(clock.clone()).await?;
    let limiter = config.build_limiter(store, clock)?;
    info!(
        algorithm = %config.rate_limiting.algorithm,
        backend = ?config.store.backend,
        "Rate limiter initialized"
    );

    tokio::select! {
        result = evaluate_lines(&limiter, &config, &args.host) => result?,
        _ = shutdown_signal() => {}
    }

    info!("Floodgate stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn evaluate_lines(
    limiter: &RateLimiter,
    config: &FloodgateConfig,
    host: &str,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [client, method, path] = fields.as_slice() else {
            if !fields.is_empty() {
                warn!(line = %line, "Expected CLIENT METHOD PATH");
            }
            continue;
        };

        let mut request = RequestDescriptor::new(*path, *path, *method)
            .with_header(&config.rate_limiting.client_id_header, *client);
        if let Ok(addr) = client.parse::<IpAddr>() {
            request = request.with_remote_addr(addr);
        }

        let result = limiter.limit_request(&request, host, || None).await?;
        let output = json!({
            "client": client,
            "method": method,
            "path": path,
            "decision": result.state,
            "remaining": result.remaining,
            "retry_after_secs": result.retry_after_secs(),
            "policy": result.violated_policy_name,
            "rate": result.cache_key.as_ref().map(|k| k.rate.to_string()),
        });

        stdout.write_all(format!("{}\n", output).as_bytes()).await?;
        stdout.flush().await?;
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
