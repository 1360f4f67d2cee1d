use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = quiz_stats_cli::Cli::parse();
    quiz_stats_cli::run_cli(cli)
}
