use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = apptrack_cli::Cli::parse();
    apptrack_cli::run_cli(cli)
}
