use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::config::{LogFormat, TollgateConfig};
use tollgate::ratelimit::{RateLimiter, TracingAuditSink};

/// Token bucket admission control against a shared bucket store.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Ask for admission, consuming a token per allowed request
    Check {
        #[arg(short, long)]
        principal: String,
        #[arg(short, long)]
        resource: String,
        /// Number of requests to issue
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,
    },
    /// Show remaining tokens and reset time without consuming
    Status {
        #[arg(short, long)]
        principal: String,
        #[arg(short, long)]
        resource: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = TollgateConfig::load(cli.config.as_deref())?;

    init_tracing(config.logging.format);

    info!("Starting Tollgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        backend = ?config.store.backend,
        failure_policy = ?config.failure_policy,
        "Configuration loaded"
    );

    let limiter = RateLimiter::from_config(&config)
        .await?
        .with_audit_sink(std::sync::Arc::new(TracingAuditSink));

    match cli.command {
        Command::Check {
            principal,
            resource,
            count,
        } => {
            for _ in 0..count {
                let decision = limiter.allow_request(&principal, &resource).await;
                let output = json!({
                    "status": decision.http_status(),
                    "decision": decision,
                });
                println!("{}", serde_json::to_string(&output)?);
            }
        }
        Command::Status {
            principal,
            resource,
        } => {
            let decision = limiter.status(&principal, &resource).await;
            println!("{}", serde_json::to_string_pretty(&decision)?);
        }
    }

    Ok(())
}

/// Initialize tracing from `RUST_LOG`, defaulting to `info`.
fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
