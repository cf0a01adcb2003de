//! WebShield CLI
//!
//! Command-line interface for the filtering proxy.

mod args;
mod commands;
mod logging;

use anyhow::Result;
use clap::Parser;
use tracing::error;

use args::Args;
use commands::Command;

fn main() -> Result<()> {
    let args = Args::parse();

    // Held until exit so the file writer flushes
    let _log_guard = logging::init(&args)?;

    if matches!(args.command, Command::Run(_)) && !args.quiet {
        print_banner();
    }

    let result = run(args);

    if let Err(ref e) = result {
        error!("Fatal error: {:#}", e);
    }

    result
}

fn run(args: Args) -> Result<()> {
    match args.command {
        Command::Run(run_args) => commands::run::execute(run_args),
        Command::Config(config_args) => commands::config::execute(config_args),
        Command::Filter(filter_args) => commands::filter::execute(filter_args),
        Command::Check(check_args) => commands::check::execute(check_args),
        Command::Completions(comp_args) => commands::completions::execute(comp_args),
    }
}

fn print_banner() {
    use colored::Colorize;

    println!();
    println!("{}", "╔═══════════════════════════════════════════╗".cyan());
    println!(
        "{}{}{}",
        "║  ".cyan(),
        format!("WebShield v{:<8}", env!("CARGO_PKG_VERSION")).green().bold(),
        "                         ║".cyan()
    );
    println!(
        "{}{}{}",
        "║  ".cyan(),
        "Filtering forward proxy".white(),
        "                  ║".cyan()
    );
    println!("{}", "╚═══════════════════════════════════════════╝".cyan());
    println!();
}
