use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use spikewatch::agent::Agent;
use spikewatch::config::Config;
use spikewatch::tracer::TracerLost;

/// Exit code for configuration errors.
const EXIT_CONFIG: u8 = 2;
/// Exit code for an unrecoverable tracer.
const EXIT_TRACER_LOST: u8 = 3;
/// Exit code for a fatal panic.
const EXIT_PANIC: i32 = 4;

/// Host performance diagnostics agent with spike RCA.
#[derive(Parser)]
#[command(name = "spikewatch", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} ({}/{})",
            RELEASE,
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("spikewatch {}", version::full());
        return ExitCode::SUCCESS;
    }

    // A panic anywhere is fatal for the whole agent.
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);
        eprintln!("fatal panic, exiting");
        std::process::exit(EXIT_PANIC);
    }));

    let filter = match EnvFilter::try_new(&cli.log_level) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("invalid log level {:?}: {e}", cli.log_level);
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    fmt().with_env_filter(filter).with_target(true).init();

    let cfg = match load_config(&cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "configuration error");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    tracing::info!(version = version::RELEASE, "starting spikewatch");

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "building tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(run(cfg)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.downcast_ref::<TracerLost>().is_some() => {
            tracing::error!(error = %format!("{e:#}"), "tracer unrecoverable");
            ExitCode::from(EXIT_TRACER_LOST)
        }
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "agent failed");
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let path = cli
        .config
        .as_ref()
        .context("--config is required (use --help for usage)")?;

    Config::load(path).with_context(|| format!("loading config from {}", path.display()))
}

async fn run(cfg: Config) -> Result<()> {
    let mut agent = Agent::new(cfg)?;
    agent.start().await?;

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received interrupt, shutting down");
            Ok(())
        }
        res = agent.tracer_finished() => res,
    };

    agent.stop().await?;

    tracing::info!("spikewatch stopped");
    outcome
}
