use anyhow::Result;
use clap::Parser;

use kids_guard::config::EnginePaths;

mod cli;
mod commands;

use cli::{Args, Commands};

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Run { simulated } => commands::daemon::run(
            args.config.as_deref(),
            args.state_dir.as_deref(),
            simulated,
            args.verbose,
        ),
        command => {
            let config = commands::utils::load_config(args.config.as_deref())?;
            commands::utils::init_logging(args.verbose, &config.logging)?;

            let paths = EnginePaths::resolve(args.state_dir.as_deref())?;
            commands::run_control_command(command, &paths)
        }
    }
}
