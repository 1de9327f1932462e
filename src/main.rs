use anyhow::Result;
use clap::{Parser, Subcommand};
use std::io::IsTerminal;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

use skywatch::log_format::TrackerFormat;

#[derive(Parser, Debug)]
#[command(
    name = "skywatch",
    version,
    about = "Track aircraft sightings per project from a stream of decoded telemetry"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Read newline-delimited JSON messages and track sightings until end of input or Ctrl+C
    Run {
        /// Tracker configuration (TOML)
        #[arg(long)]
        config: PathBuf,

        /// Message input file, or - for stdin
        #[arg(long, default_value = "-")]
        input: PathBuf,

        /// Serve Prometheus metrics on this address (e.g. 127.0.0.1:9090)
        #[arg(long)]
        metrics_addr: Option<SocketAddr>,

        /// Write the final store contents as JSON after shutdown
        #[arg(long)]
        snapshot: Option<PathBuf>,

        /// Emit logs as JSON lines
        #[arg(long, default_value_t = false)]
        log_json: bool,
    },
    /// Validate a configuration file and print a summary
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder
            .event_format(TrackerFormat::new(std::io::stderr().is_terminal()))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            input,
            metrics_addr,
            snapshot,
            log_json,
        } => {
            init_tracing(log_json);
            commands::handle_run(&config, &input, metrics_addr, snapshot).await
        }
        Commands::CheckConfig { config } => {
            init_tracing(false);
            commands::handle_check_config(&config)
        }
    }
}
