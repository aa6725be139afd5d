//! SampleGraph CLI: budgeted, resumable crawler for audio-sample catalogs.
//!
//! Grows a relationship graph of catalog items across runs, backs up its
//! checkpoints, and runs post-processing when the graph crosses a milestone.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
