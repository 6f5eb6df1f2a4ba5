//! islet CLI - run callables in parallel, one isolated runtime instance per task.

mod bench;
mod colors;
mod run;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use islet_core::DispatcherConfig;

#[derive(Parser)]
#[command(name = "islet")]
#[command(about = "Parallel task dispatch across isolated runtime instances")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Dispatcher configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a batch of calls and print their results as a JSON array
    Run {
        /// Calls as `namespace.name:<json-args>`, e.g. `mathlib.square:4`
        #[arg(required = true)]
        tasks: Vec<String>,
    },

    /// Compare isolated dispatch against the shared-lock and native baselines
    Bench {
        /// Number of tasks per mode
        #[arg(short, long, default_value = "10")]
        tasks: usize,

        /// Smallest factorial input
        #[arg(long, default_value = "90000000")]
        min: i64,

        /// Largest factorial input
        #[arg(long, default_value = "90000100")]
        max: i64,

        /// Which mode to run
        #[arg(short, long, value_enum, default_value = "all")]
        mode: bench::Mode,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => DispatcherConfig::from_json_file(path)?,
        None => DispatcherConfig::default(),
    };

    match cli.command {
        Commands::Run { tasks } => run::execute(&tasks, config)?,

        Commands::Bench {
            tasks,
            min,
            max,
            mode,
        } => {
            let options = bench::Options {
                tasks,
                min,
                max,
                mode,
            };
            bench::execute(&options, config)?;
        }
    }

    Ok(())
}
