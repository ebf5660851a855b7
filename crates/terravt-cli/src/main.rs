//! Terravt CLI entry point

use anyhow::Result;
use clap::Parser;

use terravt_cli::{Cli, execute};

fn main() -> Result<()> {
    let cli = Cli::parse();
    execute(cli)
}
