use clap::Parser;
use snafu::prelude::*;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod backends;
mod cmd;
mod config;
mod context;
mod definition;
mod dispatch;
mod engine;
mod expressions;
mod history;
mod persistence;
mod providers;
mod tools;
mod transition;
mod validate;

use cmd::{RunArgs, ValidateArgs, handle_run, handle_validate};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Run error: {source}"))]
    Run { source: cmd::run::Error },

    #[snafu(display("Validate error: {source}"))]
    Validate { source: cmd::validate::Error },
}

#[derive(Parser, Debug)]
#[command(name = "rook")]
#[command(version)]
#[command(about = "A durable, event-sourced execution engine for agent task workflows", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Execute a task
    Run(RunArgs),
    /// Validate a task without executing
    Validate(ValidateArgs),
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        Commands::Run(args) => handle_run(args).await.context(RunSnafu),
        Commands::Validate(args) => handle_validate(args).context(ValidateSnafu),
    }
}
