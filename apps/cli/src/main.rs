//! IdeaForge CLI: batch research-idea synthesis, scoring and validation.
//!
//! Turns a paper set into ranked, provenance-linked idea candidates under a
//! hard per-provider spend budget.

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
