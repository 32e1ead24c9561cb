//! Runs the dispatch controller standalone, against the [`worker_stub`]
//! binary as its replica workers, for local smoke-testing.
//!
//! Mirrors `examples/multithread_engine_example.rs` in the teacher: install
//! `color_eyre` and a `tracing_subscriber::FmtSubscriber`, then hand a config
//! file path to the entry point. Here the entry point is `dispatcher::run`
//! rather than `engine::Engine::run`, since this crate drives exactly one
//! fixed pipeline instead of a configurable set of them.

use color_eyre::eyre::Result;
use task::labels::ProcessLabels;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    init()?;

    let config_file_path = std::env::args().nth(1).unwrap_or_else(|| "demos/dispatcher.yaml".to_string());

    dispatcher::run(ProcessLabels::new("dispatcher"), config_file_path).await?;

    Ok(())
}

/// Initializes error reporting and logging, exactly as the teacher's own
/// example binaries do.
fn init() -> Result<()> {
    color_eyre::install()?;

    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    Ok(())
}
