//! Motion collection pipeline: multi-channel sampling, batched SQLite persistence, destructive
//! CSV export, sliding-window activity recognition and background-execution handling.

pub mod background;
pub mod cli;
pub mod config;
pub mod db;
pub mod events;
pub mod export;
pub mod inference;
pub mod platform;
pub mod presentation;
pub mod sensing;
pub mod sink;
pub mod utils;

use anyhow::Context;
use clap::Parser;

pub use background::{BackgroundManager, TaskOutcome, TaskStatus};
pub use config::{CollectorConfig, ConfigStore};
pub use db::{Channel, Database, Reading, Session, SessionStatus};
pub use events::CollectorEvent;
pub use export::{CsvExporter, ExportSummary};
pub use inference::{ActivityLabel, Classifier, Prediction};
pub use platform::Platform;
pub use presentation::{LiveSnapshot, LiveView};
pub use sensing::{Collector, MotionSource};
pub use sink::PersistenceSink;

pub fn run() -> anyhow::Result<()> {
    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let cli = cli::Cli::parse();
    log::info!("motion-collector {} starting up...", env!("CARGO_PKG_VERSION"));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("motion-runtime")
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(cli::execute(cli))
}
