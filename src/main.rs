use anyhow::Result;
use clap::Parser;
use flashflux::run;
use flashflux::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    run(cli).await
}
