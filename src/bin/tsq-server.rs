use std::path::PathBuf;
use std::time::Duration;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tsq::core::{DEFAULT_IDLE_TIMEOUT, DEFAULT_PORT};
use tsq::{Responder, Result, Server, ServerConfig};

/// Answer TSQ time requests over TLS
#[derive(Parser, Debug)]
#[command(name = "tsq-server", version)]
#[command(about = "TSQ time server", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT, value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,

    /// PEM certificate chain
    #[arg(long)]
    cert: PathBuf,

    /// PEM private key
    #[arg(long)]
    key: PathBuf,

    /// Seconds to wait on a silent connection before closing it
    #[arg(long, default_value_t = DEFAULT_IDLE_TIMEOUT.as_secs(), value_parser = clap::value_parser!(u64).range(1..))]
    idle_timeout: u64,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        let listen_addr = if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        };
        ServerConfig {
            listen_addr,
            cert_path: self.cert.clone(),
            key_path: self.key.clone(),
            idle_timeout: Duration::from_secs(self.idle_timeout),
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

async fn serve(config: ServerConfig) -> Result<()> {
    let server = Server::new(&config, Responder::new())?;
    let listener = server.bind().await?;

    tokio::select! {
        result = server.serve(listener) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    match serve(args.server_config()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
