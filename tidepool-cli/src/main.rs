//! Tidepool: stream local source trees to remote long-poll clients.
//!
//! # Usage
//!
//! ```text
//! tidepool serve [DIRS..] [--host 127.0.0.1] [--port 8888] [--log-json]
//! tidepool check [DIR] [--json]
//! tidepool projects --place-id <ID> [--host 127.0.0.1] [--port 8888]
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{check::CheckArgs, projects::ProjectsArgs, serve::ServeArgs};

#[derive(Parser, Debug)]
#[command(
    name = "tidepool",
    version,
    about = "Sync local source trees to remote clients over HTTP long-poll",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch project directories and serve them in the foreground.
    Serve(ServeArgs),

    /// Validate a project's tidepool.json and show its partitions.
    Check(CheckArgs),

    /// Ask a running server which projects a place may see.
    Projects(ProjectsArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(args) => args.run(),
        Commands::Check(args) => args.run(),
        Commands::Projects(args) => args.run(),
    }
}
