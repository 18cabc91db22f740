use autopoiesis_cli::Cli;
use autopoiesis_cli::run_main;
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let code = run_main(cli).await?;
    std::process::exit(code);
}
