//! CLI for kilosim — execution-driven simulation of thousand-core CMPs.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "kilosim")]
#[command(about = "kilosim — execution-driven microarchitectural simulator")]
#[command(version = kilosim_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulation described by a TOML config file
    Run {
        /// Path to the configuration file
        config: PathBuf,

        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Access-trace utilities
    Trace {
        #[command(subcommand)]
        cmd: TraceCmd,
    },

    /// List the known DDR technology presets and their timings
    Techs,
}

#[derive(Subcommand)]
enum TraceCmd {
    /// Print the records of a trace file
    Dump {
        file: PathBuf,

        /// Stop after this many records
        #[arg(long)]
        limit: Option<u64>,
    },

    /// Rewrite a trace with records sorted by request cycle
    Sort {
        input: PathBuf,
        output: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, json } => commands::run::run(&config, json),
        Commands::Trace { cmd } => match cmd {
            TraceCmd::Dump { file, limit } => commands::trace::dump(&file, limit),
            TraceCmd::Sort { input, output } => commands::trace::sort(&input, &output),
        },
        Commands::Techs => commands::techs::run(),
    }
}
