use anyhow::Result;
use clap::{Parser, Subcommand};

mod cli;
mod config;

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Plan(args) => args.run(),
        Command::Check(args) => args.run(),
    }
}

#[derive(Parser)]
#[command(name = "cadenza", about = "Motion planning tooling for Cadenza")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Plan a moves file against a machine configuration and dump the
    /// resulting motion segments.
    Plan(cli::plan::PlanArgs),
    /// Validate a machine configuration file.
    Check(cli::check::CheckArgs),
}
