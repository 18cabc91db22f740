mod approve;
mod cli;
mod display;
mod keys;
mod run;

use std::io::IsTerminal;

pub use cli::Cli;
use cli::Color;
use cli::Command;
use tracing_subscriber::EnvFilter;

pub async fn run_main(cli: Cli) -> anyhow::Result<i32> {
    let default_level = "error";
    let _ = tracing_subscriber::fmt()
        // Fall back to `default_level` when the environment variable is
        // unset or invalid.
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .try_init();

    match cli.command {
        Command::Run(args) => {
            let with_ansi = match args.color {
                Color::Always => true,
                Color::Never => false,
                Color::Auto => std::io::stderr().is_terminal(),
            };
            run::run_batch(args, with_ansi).await
        }
        Command::Keys(args) => keys::run_keys(args),
    }
}
