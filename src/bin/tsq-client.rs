use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tsq::core::{Grouping, ProbeMode, DEFAULT_PORT};
use tsq::{platform_clock, ClientConfig, Error, Result, SyncSession, Target, TlsConnector, TlsOptions};

/// Measure clock offset against TSQ servers and correct the system clock
#[derive(Parser, Debug)]
#[command(name = "tsq-client", version)]
#[command(about = "Time Synchronization over a secure transport", long_about = None)]
struct Args {
    /// Time servers, as HOST or HOST:PORT
    #[arg(required = true)]
    servers: Vec<String>,

    /// Port for servers given without one
    #[arg(short, long, default_value_t = DEFAULT_PORT, value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,

    /// Probes per server
    #[arg(short = 'n', long, default_value_t = 5)]
    count: usize,

    /// Pause between rounds, in milliseconds
    #[arg(long, default_value_t = 500)]
    interval: u64,

    /// Response timeout per probe, in seconds
    #[arg(long, default_value_t = 3.0)]
    timeout: f64,

    /// Accept any server certificate
    #[arg(long)]
    insecure: bool,

    /// Additional trusted CA certificates (PEM)
    #[arg(long)]
    ca_file: Option<PathBuf>,

    /// Refuse to adjust when the median offset exceeds this many milliseconds
    #[arg(long, default_value_t = 1000.0)]
    max_offset: f64,

    /// Slew offsets up to this many milliseconds, step larger ones
    #[arg(long, default_value_t = 500.0)]
    slew_threshold: f64,

    /// Measure and decide, but leave the clock alone
    #[arg(long)]
    dry_run: bool,

    /// Probe all servers of a round at once
    #[arg(long)]
    concurrent: bool,

    /// Gate each server on its own instead of pooling all samples
    #[arg(long)]
    per_target: bool,

    /// Stop measuring after this many seconds and use what was collected
    #[arg(long)]
    deadline: Option<f64>,

    /// Padding bytes added to each request
    #[arg(long, default_value_t = 0)]
    padding: usize,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn seconds(name: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| Error::config(format!("invalid {}: {} ({})", name, value, e)))
}

impl Args {
    fn client_config(&self) -> Result<ClientConfig> {
        let targets = self
            .servers
            .iter()
            .map(|s| Target::parse(s, self.port))
            .collect::<Result<Vec<_>>>()?;

        Ok(ClientConfig {
            targets,
            count: self.count,
            interval: Duration::from_millis(self.interval),
            timeout: seconds("timeout", self.timeout)?,
            max_offset_ms: self.max_offset,
            slew_threshold_ms: self.slew_threshold,
            dry_run: self.dry_run,
            mode: if self.concurrent {
                ProbeMode::Concurrent
            } else {
                ProbeMode::Sequential
            },
            grouping: if self.per_target {
                Grouping::PerTarget
            } else {
                Grouping::Combined
            },
            deadline: self.deadline.map(|d| seconds("deadline", d)).transpose()?,
            padding: self.padding,
        })
    }

    fn session(&self) -> Result<SyncSession> {
        let config = self.client_config()?;
        let connector = TlsConnector::new(&TlsOptions {
            insecure: self.insecure,
            ca_file: self.ca_file.clone(),
        })?;
        SyncSession::new(config, Arc::new(connector), Arc::from(platform_clock()))
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let session = match args.session() {
        Ok(session) => session,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(2);
        }
    };

    match session.run().await {
        Ok(report) => {
            let samples: usize = report.results.iter().map(|r| r.samples.len()).sum();
            let attempts: usize = report.results.iter().map(|r| r.attempts()).sum();
            info!(
                "offset {:.3}ms from {}/{} probes, {} {}, finished in {:.0}ms",
                report.offset_ms,
                samples,
                attempts,
                report.decision.mode,
                if report.decision.applied { "applied" } else { "not applied" },
                report.duration_ms
            );
            for summary in report.server_summaries() {
                info!(
                    "{}: rtt {:.3}ms, offset {:+.3}ms ({} samples)",
                    summary.server, summary.median_rtt_ms, summary.median_offset_ms, summary.samples
                );
            }
            ExitCode::SUCCESS
        }
        Err(failure) => {
            error!("{}", failure);
            ExitCode::FAILURE
        }
    }
}
