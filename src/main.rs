// ESG Granite
// Main entry point

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use esg_granite::cli::{commands, Cli};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over -v/--quiet; logs go to stderr so `ask` output stays clean JSON
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let code = commands::run(cli)?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
