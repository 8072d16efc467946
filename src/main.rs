use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::config::{LoggingConfig, NamedRate, RateSetting, TollgateConfig};
use tollgate::ratelimit::{AdmissionGate, Decision};

/// Reads caller keys from stdin, one per line, and prints an admission
/// decision for each. An empty line is charged to the global budget.
#[derive(Parser, Debug)]
#[command(name = "tollgate", version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Tokens per second, or "unlimited"
    #[arg(long, value_parser = parse_rate)]
    rate: Option<RateSetting>,

    /// Bucket capacity
    #[arg(long)]
    burst: Option<u32>,

    /// Seconds of inactivity before a caller's bucket is evicted
    #[arg(long)]
    cleanup_interval_secs: Option<u64>,

    /// Print decisions as JSON lines
    #[arg(long)]
    json: bool,
}

fn parse_rate(value: &str) -> Result<RateSetting, String> {
    match value.to_ascii_lowercase().as_str() {
        "unlimited" | "inf" | "infinite" => Ok(RateSetting::Named(NamedRate::Unlimited)),
        other => other
            .parse::<f64>()
            .map(RateSetting::PerSecond)
            .map_err(|e| format!("invalid rate {:?}: {}", value, e)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = TollgateConfig::load(args.config.as_deref())?;
    if let Some(rate) = args.rate {
        config.limiter.rate = rate;
    }
    if let Some(burst) = args.burst {
        config.limiter.burst = burst;
    }
    if let Some(secs) = args.cleanup_interval_secs {
        config.limiter.cleanup_interval_secs = secs;
    }
    config.validate()?;

    init_tracing(&config.logging);

    info!("Starting Tollgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let gate = Arc::new(AdmissionGate::from_config(&config.limiter));
    info!(
        limit = %gate.limit(),
        burst = gate.burst(),
        cleanup_interval = ?gate.cleanup_interval(),
        "Admission gate initialized"
    );

    tokio::select! {
        result = probe(&gate, args.json) => result?,
        _ = shutdown_signal() => {}
    }

    gate.close().await;
    info!("Tollgate stopped");
    Ok(())
}

/// Initialize tracing on stderr, leaving stdout to the decisions.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Answer one admission query per stdin line until EOF.
async fn probe(gate: &AdmissionGate, json: bool) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let key = line.trim();
        let decision = if key.is_empty() {
            gate.check()
        } else {
            gate.check_for(key)
        };

        if json {
            println!("{}", render_json(key, &decision));
        } else {
            println!("{}", render_text(key, &decision));
        }
    }

    info!("Reached end of input");
    Ok(())
}

fn render_text(key: &str, decision: &Decision) -> String {
    let key = if key.is_empty() { "<global>" } else { key };
    match decision {
        Decision::Admitted { remaining } => format!("admit {} remaining={}", key, remaining),
        Decision::Rejected {
            retry_after: Some(delay),
        } => format!("reject {} retry_after_ms={}", key, delay.as_millis()),
        Decision::Rejected { retry_after: None } => format!("reject {} retry_after=never", key),
    }
}

fn render_json(key: &str, decision: &Decision) -> serde_json::Value {
    let key = (!key.is_empty()).then_some(key);
    match decision {
        Decision::Admitted { remaining } => serde_json::json!({
            "key": key,
            "admitted": true,
            "remaining": remaining,
        }),
        Decision::Rejected { retry_after } => serde_json::json!({
            "key": key,
            "admitted": false,
            "retry_after_ms": retry_after.map(|d| d.as_millis() as u64),
        }),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_parse_rate() {
        assert_eq!(parse_rate("2.5"), Ok(RateSetting::PerSecond(2.5)));
        assert_eq!(
            parse_rate("Unlimited"),
            Ok(RateSetting::Named(NamedRate::Unlimited))
        );
        assert!(parse_rate("fast").is_err());
    }

    #[test]
    fn test_render_text() {
        assert_eq!(
            render_text("", &Decision::Admitted { remaining: 3 }),
            "admit <global> remaining=3"
        );
        assert_eq!(
            render_text(
                "10.0.0.1",
                &Decision::Rejected {
                    retry_after: Some(Duration::from_millis(250))
                }
            ),
            "reject 10.0.0.1 retry_after_ms=250"
        );
        assert_eq!(
            render_text("k", &Decision::Rejected { retry_after: None }),
            "reject k retry_after=never"
        );
    }

    #[test]
    fn test_render_json() {
        let value = render_json("k", &Decision::Rejected { retry_after: None });
        assert_eq!(value["key"], "k");
        assert_eq!(value["admitted"], false);
        assert!(value["retry_after_ms"].is_null());

        let value = render_json("", &Decision::Admitted { remaining: 1 });
        assert!(value["key"].is_null());
        assert_eq!(value["remaining"], 1);
    }

    #[test]
    fn test_args_override() {
        let args = Args::parse_from(["tollgate", "--rate", "inf", "--burst", "4", "--json"]);
        assert_eq!(args.rate, Some(RateSetting::Named(NamedRate::Unlimited)));
        assert_eq!(args.burst, Some(4));
        assert!(args.json);
    }
}
