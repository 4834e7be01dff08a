mod cli;
mod commands;
mod domain;
mod services;

use clap::Parser;
use cli::Cli;
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(&cli) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("ERROR: {e:#}");
            std::process::exit(2);
        }
    }
}

/// Logs go to stderr so `--json` output on stdout stays parseable.
fn init_logging(verbose: u8) {
    let fallback = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_env("DELTA_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: &Cli) -> anyhow::Result<bool> {
    let config = services::storage::load_tool_config(&cli.repo)?;

    if let Some(ok) = commands::handle_contract_commands(cli, &config)? {
        return Ok(ok);
    }
    if let Some(ok) = commands::handle_state_commands(cli, &config)? {
        return Ok(ok);
    }
    anyhow::bail!("no handler for {:?}", cli.command)
}
