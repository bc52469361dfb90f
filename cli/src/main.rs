//! agentguard CLI: probe agent servers and exercise circuit breakers from
//! the terminal.
//!
//! Usage:
//! ```bash
//! # Probe an agent's health endpoint (retry + deadline + circuit breaker)
//! agentguard probe --url http://10.0.0.7:8080 --attempts 3 --timeout-ms 2000
//!
//! # Replay an outage against a breaker on a simulated clock
//! agentguard simulate --threshold 3 --reset-ms 1000 --outage-ms 2500
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use agentguard_core::{
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, GuardError, ManualClock,
};
use agentguard_http::{ProbeClient, ProbeConfig};

mod logging;

use logging::{init_tracing, LogConfig};

#[derive(Parser)]
#[command(
    name = "agentguard",
    about = "Probe remote agent servers and inspect circuit breaker behaviour",
    version
)]
struct Cli {
    /// Log level (overridden by RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit JSON structured logs
    #[arg(long, global = true)]
    log_json: bool,

    /// JSON config file with `log` and `probe` sections
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe an agent's health endpoint
    Probe {
        /// Agent base URL
        #[arg(long)]
        url: String,
        /// Health endpoint path
        #[arg(long)]
        path: Option<String>,
        /// Total attempts, including the first
        #[arg(long)]
        attempts: Option<u32>,
        /// Deadline per attempt in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Drive a breaker through a simulated outage
    Simulate {
        /// Consecutive failures before the breaker opens
        #[arg(long, default_value_t = 3)]
        threshold: u32,
        /// Cool-down before a probe is let through
        #[arg(long, default_value_t = 1000)]
        reset_ms: u64,
        /// Successful probes needed to close again
        #[arg(long, default_value_t = 2)]
        success_threshold: u32,
        /// How long the dependency stays down
        #[arg(long, default_value_t = 2500)]
        outage_ms: u64,
        /// Time between calls
        #[arg(long, default_value_t = 250)]
        interval_ms: u64,
        /// Number of calls to make
        #[arg(long, default_value_t = 20)]
        calls: u32,
    },
}

/// Contents of the `--config` file.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct FileConfig {
    log: LogConfig,
    probe: ProbeConfig,
}

fn load_config(path: Option<&Path>) -> Result<FileConfig> {
    let Some(path) = path else {
        return Ok(FileConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read config {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid config {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;

    if let Some(level) = cli.log_level {
        config.log.level = level;
    }
    config.log.json |= cli.log_json;
    init_tracing(&config.log);

    match cli.command {
        Commands::Probe {
            url,
            path,
            attempts,
            timeout_ms,
            json,
        } => {
            let mut probe = config.probe;
            if let Some(path) = path {
                probe.path = path;
            }
            if let Some(attempts) = attempts {
                probe.retry.max_attempts = attempts;
            }
            if let Some(ms) = timeout_ms {
                probe.timeout = Duration::from_millis(ms);
            }
            cmd_probe(&url, probe, json).await
        }

        Commands::Simulate {
            threshold,
            reset_ms,
            success_threshold,
            outage_ms,
            interval_ms,
            calls,
        } => {
            let breaker = CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout: Duration::from_millis(reset_ms),
                success_threshold,
            };
            cmd_simulate(
                breaker,
                Duration::from_millis(outage_ms),
                Duration::from_millis(interval_ms),
                calls,
            )
            .await
        }
    }
}

async fn cmd_probe(url: &str, config: ProbeConfig, json: bool) -> Result<()> {
    let registry = Arc::new(CircuitBreakerRegistry::new());
    let client = ProbeClient::new(registry, config)?;

    let outcome = client.probe(url).await;
    let stats = client.breaker_for(url)?.stats();
    match &outcome {
        Ok(report) => tracing::info!(
            url = %report.url,
            status = report.status,
            latency_ms = report.latency.as_millis() as u64,
            health = %report.health,
            "probe complete"
        ),
        Err(e) => tracing::info!(url, error = %e, degraded = e.is_degraded(), "probe failed"),
    }

    if json {
        let value = match &outcome {
            Ok(report) => serde_json::json!({
                "url": report.url,
                "ok": true,
                "status": report.status,
                "latency_ms": report.latency.as_millis() as u64,
                "health": report.health.to_string(),
                "total_requests": stats.total_requests,
                "total_failures": stats.total_failures,
            }),
            Err(e) => serde_json::json!({
                "url": url,
                "ok": false,
                "error": e.to_string(),
                "degraded": e.is_degraded(),
                "retry_after_ms": e.retry_after().map(|d| d.as_millis() as u64),
                "health": client.health(url).to_string(),
                "total_requests": stats.total_requests,
                "total_failures": stats.total_failures,
            }),
        };
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        match &outcome {
            Ok(report) => {
                println!("Probing {}...", report.url);
                println!("  Status:    {}", report.status);
                println!("  Latency:   {}ms", report.latency.as_millis());
                println!("  Health:    {}", report.health);
            }
            Err(e) => {
                println!("Probing {url}...");
                println!("  Error:     {e}");
                println!("  Health:    {}", client.health(url));
            }
        }
        println!("  Requests:  {}", stats.total_requests);
        println!("  Failures:  {}", stats.total_failures);
    }

    outcome.map(|_| ()).context("probe failed")
}

async fn cmd_simulate(
    config: CircuitBreakerConfig,
    outage: Duration,
    interval: Duration,
    calls: u32,
) -> Result<()> {
    let clock = ManualClock::new();
    let registry = CircuitBreakerRegistry::new()
        .with_clock(Arc::new(clock.clone()))
        .with_observer(Arc::new({
            let clock = clock.clone();
            move |name: &str, from: CircuitState, to: CircuitState| {
                println!(
                    "t={:>6}ms  {name}: {from} → {to}",
                    clock.elapsed().as_millis()
                );
            }
        }));
    let breaker = registry.get("simulated", Some(config));

    for call in 1..=calls {
        let now = clock.elapsed();
        let down = now < outage;
        let outcome = breaker
            .execute(|| async move {
                if down {
                    Err(GuardError::Http("connection refused".into()))
                } else {
                    Ok(())
                }
            })
            .await;

        let label = match &outcome {
            Ok(()) => "ok".to_string(),
            Err(GuardError::CircuitOpen(e)) => {
                format!("fast-fail (retry in {}ms)", e.retry_after.as_millis())
            }
            Err(e) => format!("failed: {e}"),
        };
        println!(
            "t={:>6}ms  call #{call:<3} {label:<32} [{}]",
            now.as_millis(),
            breaker.state()
        );
        clock.advance(interval);
    }

    let stats = breaker.stats();
    tracing::info!(
        calls,
        total_requests = stats.total_requests,
        total_failures = stats.total_failures,
        state = %stats.state,
        "simulation finished"
    );
    println!();
    println!("Total requests: {}", stats.total_requests);
    println!("Total failures: {}", stats.total_failures);
    println!("Final state:    {}", stats.state);
    Ok(())
}
