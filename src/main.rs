use clap::Parser;
use snafu::prelude::*;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod cache;
mod cancellation;
mod circuit_breaker;
mod cmd;
mod condition;
mod config;
mod context;
mod errors;
mod executor;
mod foreach;
mod graph;
mod output;
mod retry;
mod scheduler;
mod subworkflow;
mod template;
mod transform;
mod workflow;

use cmd::{RunArgs, ValidateArgs, handle_run, handle_validate};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("run error: {source}"))]
    Run { source: cmd::run::Error },

    #[snafu(display("validate error: {source}"))]
    Validate { source: cmd::validate::Error },
}

#[derive(Parser, Debug)]
#[command(name = "flowgraph")]
#[command(version)]
#[command(about = "A parallel, fault-tolerant DAG execution engine for declarative task workflows", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Execute a workflow from a manifest
    Run(RunArgs),
    /// Validate every workflow in a manifest without executing
    Validate(ValidateArgs),
}

fn init_tracing(verbose: bool) {
    let filter_layer = if verbose {
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"))
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    tracing_subscriber::registry().with(filter_layer).with(tracing_subscriber::fmt::layer()).init();
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            init_tracing(args.verbose);
            handle_run(args).await.context(RunSnafu)
        }
        Commands::Validate(args) => {
            init_tracing(args.verbose);
            handle_validate(args).await.context(ValidateSnafu)
        }
    }
}
