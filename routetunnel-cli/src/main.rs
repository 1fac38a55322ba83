use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use clap_verbosity_flag::Verbosity;

mod command;
mod config;
mod sys;

#[derive(Debug, clap::Parser)]
#[command(name = "routetunnel", version)]
#[command(about = "Expose local HTTP servers through a route-addressed relay.", long_about = None)]
pub struct Cli {
    #[clap(flatten)]
    verbose: clap_verbosity_flag::Verbosity,

    /// Profile to use for tunnel defaults
    #[arg(long, default_value = "default", global = true)]
    profile: String,

    /// Config file to use instead of the user config
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: command::Command,
}

fn init_logger_env(verbosity: &Verbosity) {
    use tracing::level_filters::LevelFilter;

    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("ROUTETUNNEL_LOG")
        .from_env_lossy();

    tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(match (verbosity.is_present(), verbosity.is_silent()) {
            (false, _) => env_filter,
            (true, true) => env_filter.add_directive(LevelFilter::OFF.into()),
            (true, false) => {
                let level_filter = match verbosity.log_level_filter() {
                    clap_verbosity_flag::LevelFilter::Off => LevelFilter::OFF,
                    clap_verbosity_flag::LevelFilter::Error => LevelFilter::ERROR,
                    clap_verbosity_flag::LevelFilter::Warn => LevelFilter::WARN,
                    clap_verbosity_flag::LevelFilter::Info => LevelFilter::INFO,
                    clap_verbosity_flag::LevelFilter::Debug => LevelFilter::DEBUG,
                    clap_verbosity_flag::LevelFilter::Trace => LevelFilter::TRACE,
                };
                env_filter.add_directive(level_filter.into())
            }
        })
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger_env(&cli.verbose);

    let config = config::Config::load(cli.config.as_deref()).context("Failed to load config")?;

    match &cli.command {
        command::Command::Serve(args) => {
            command::serve::execute(args, &config).await?;
        }
        command::Command::Tunnel(args) => {
            command::tunnel::execute(args, &config, &cli.profile).await?;
        }
    }

    Ok(())
}
