//! Command line front end.
//!
//! ```bash
//! # sample for 30 s under a local background grant, then export
//! motion-collector collect --seconds 30 --export
//!
//! # let the grant expire after 5 s, like a host reclaiming background time
//! motion-collector collect --seconds 30 --expire-after-ms 5000
//!
//! motion-collector export
//! motion-collector status
//! ```

use std::{fs, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::{
    background::{drive_grants, BackgroundManager, LocalScheduler, TaskStatus},
    config::{CollectorConfig, ConfigStore},
    db::Database,
    export::CsvExporter,
    inference::Classifier,
    platform::Platform,
    presentation::LiveView,
    sensing::{Collector, MotionSource, SimulatedMotionSource},
    sink::PersistenceSink,
};

const DB_FILE: &str = "motion.sqlite3";
const CONFIG_FILE: &str = "config.json";

#[derive(Parser, Debug)]
#[command(name = "motion-collector")]
#[command(author, version, about = "Motion sampling, batched storage and CSV export")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Directory holding the database, config and exports
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Sample motion under a background grant
    Collect {
        /// How long to collect before stopping
        #[arg(long, default_value_t = 10)]
        seconds: u64,

        /// Export to CSV once collection stops
        #[arg(long)]
        export: bool,

        /// Expire the grant after this many milliseconds
        #[arg(long)]
        expire_after_ms: Option<u64>,

        /// Seed for the simulated motion source
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Write stored readings to CSV and remove them from the store
    Export,

    /// Show stored readings and recent sessions
    Status {
        #[arg(long, default_value_t = 5)]
        sessions: usize,
    },

    /// Show or change persisted settings
    Config {
        #[arg(long)]
        sample_rate_hz: Option<u32>,
        #[arg(long)]
        save_threshold: Option<usize>,
        #[arg(long)]
        export_dir: Option<PathBuf>,
        #[arg(long)]
        model_path: Option<PathBuf>,
    },
}

struct AppContext {
    data_dir: PathBuf,
    config_store: ConfigStore,
    db: Database,
    platform: Platform,
}

impl AppContext {
    async fn open(data_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match data_dir {
            Some(dir) => dir,
            None => dirs::data_dir()
                .ok_or_else(|| anyhow!("no data directory on this platform, pass --data-dir"))?
                .join("motion-collector"),
        };
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;

        let config_store = ConfigStore::new(data_dir.join(CONFIG_FILE))?;
        let db = Database::new(data_dir.join(DB_FILE))?;
        let platform = Platform::system();

        // Finalize sessions that were running when the process last died.
        for session_id in db.recover_incomplete_sessions(platform.clock.now()).await? {
            warn!("Recovered incomplete session {session_id}; marking as Interrupted");
        }

        Ok(Self {
            data_dir,
            config_store,
            db,
            platform,
        })
    }

    fn exporter(&self, config: &CollectorConfig) -> CsvExporter {
        CsvExporter::new(
            self.db.clone(),
            config.export_dir_or(&self.data_dir),
            config.export_page_size,
            self.platform.clock.clone(),
        )
    }
}

pub async fn execute(cli: Cli) -> Result<()> {
    let ctx = AppContext::open(cli.data_dir).await?;

    match cli.command {
        Commands::Collect {
            seconds,
            export,
            expire_after_ms,
            seed,
        } => collect(&ctx, seconds, export, expire_after_ms, seed).await,
        Commands::Export => export(&ctx).await,
        Commands::Status { sessions } => status(&ctx, sessions).await,
        Commands::Config {
            sample_rate_hz,
            save_threshold,
            export_dir,
            model_path,
        } => {
            let mut config = ctx.config_store.config();
            let changed = sample_rate_hz.is_some()
                || save_threshold.is_some()
                || export_dir.is_some()
                || model_path.is_some();
            if let Some(rate) = sample_rate_hz {
                config.sample_rate_hz = rate;
            }
            if let Some(threshold) = save_threshold {
                config.save_threshold = threshold;
            }
            if export_dir.is_some() {
                config.export_dir = export_dir;
            }
            if model_path.is_some() {
                config.model_path = model_path;
            }
            if changed {
                ctx.config_store.update(config.clone())?;
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn collect(
    ctx: &AppContext,
    seconds: u64,
    export_after: bool,
    expire_after_ms: Option<u64>,
    seed: Option<u64>,
) -> Result<()> {
    let config = Arc::new(ctx.config_store.config());

    let source: Box<dyn MotionSource> = Box::new(match seed {
        Some(seed) => SimulatedMotionSource::seeded(seed),
        None => SimulatedMotionSource::new(),
    });
    let sink = PersistenceSink::spawn(ctx.db.clone(), config.save_threshold);
    let collector = Collector::new(
        source,
        load_classifier(&config)?,
        config.clone(),
        ctx.db.clone(),
        sink.clone(),
        ctx.platform.clone(),
    );
    let view = LiveView::spawn(collector.subscribe());

    let (scheduler, grants) = LocalScheduler::new();
    let manager = BackgroundManager::new(
        collector,
        scheduler.clone(),
        ctx.platform.notifier.clone(),
        ctx.platform.clock.clone(),
        &config,
    );
    let grants_cancel = CancellationToken::new();
    let driver = tokio::spawn(drive_grants(
        manager.clone(),
        scheduler,
        grants,
        expire_after_ms.map(Duration::from_millis),
        grants_cancel.clone(),
    ));

    manager.submit().await?;

    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);
    let mut progress = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping collection");
                break;
            }
            _ = progress.tick() => {
                let snapshot = view.snapshot();
                info!(
                    "{} readings, activity: {}",
                    snapshot.readings,
                    snapshot.prediction.label().map_or("-", |label| label.as_str())
                );
                if manager.status().await == TaskStatus::Expired {
                    warn!("Background grant expired before the requested duration");
                    break;
                }
            }
        }
    }

    let session = manager.request_stop().await?;
    grants_cancel.cancel();
    if let Err(err) = driver.await {
        warn!("grant driver ended abnormally: {err}");
    }

    let stats = sink.stats();
    match session {
        Some(session) => println!(
            "Session {} finished: {} readings ({} committed, {} dropped)",
            session.id, session.sample_count, stats.committed, stats.dropped
        ),
        None if manager.status().await == TaskStatus::Expired => println!(
            "Collection ended by expiration: {} committed, {} dropped",
            stats.committed, stats.dropped
        ),
        None => println!("Stopped before the background grant arrived, nothing collected"),
    }
    println!("{}", serde_json::to_string_pretty(&manager.snapshot().await)?);

    if export_after {
        export(ctx).await?;
    }
    Ok(())
}

async fn export(ctx: &AppContext) -> Result<()> {
    let config = ctx.config_store.config();
    match ctx.exporter(&config).export_csv().await? {
        Some(summary) => println!(
            "Exported {} rows to {}",
            summary.rows,
            summary.path.display()
        ),
        None => println!("No data to export"),
    }
    Ok(())
}

async fn status(ctx: &AppContext, limit: usize) -> Result<()> {
    println!("Data directory: {}", ctx.data_dir.display());
    println!("Stored readings: {}", ctx.db.count_readings().await?);
    for session in ctx.db.list_recent_sessions(limit).await? {
        println!(
            "{}  {:<11}  {:>8} readings  started {}",
            session.id,
            session.status.as_str(),
            session.sample_count,
            session.started_at.to_rfc3339()
        );
    }
    Ok(())
}

#[cfg(feature = "onnx")]
fn load_classifier(config: &CollectorConfig) -> Result<Option<Box<dyn Classifier>>> {
    match &config.model_path {
        Some(path) => {
            let classifier = crate::inference::OnnxClassifier::load(path)?;
            Ok(Some(Box::new(classifier)))
        }
        None => Ok(None),
    }
}

#[cfg(not(feature = "onnx"))]
fn load_classifier(config: &CollectorConfig) -> Result<Option<Box<dyn Classifier>>> {
    if let Some(path) = &config.model_path {
        warn!(
            "Model {} ignored: built without the onnx feature",
            path.display()
        );
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_collect_flags() {
        let cli = Cli::parse_from([
            "motion-collector",
            "--data-dir",
            "/tmp/motion",
            "collect",
            "--seconds",
            "3",
            "--export",
            "--expire-after-ms",
            "500",
        ]);
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/motion")));
        match cli.command {
            Commands::Collect {
                seconds,
                export,
                expire_after_ms,
                seed,
            } => {
                assert_eq!(seconds, 3);
                assert!(export);
                assert_eq!(expire_after_ms, Some(500));
                assert_eq!(seed, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_config_command_persists_changes() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::parse_from([
            "motion-collector",
            "config",
            "--data-dir",
            dir.path().to_str().unwrap(),
            "--save-threshold",
            "50",
        ]);
        execute(cli).await.unwrap();

        let store = ConfigStore::new(dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(store.config().save_threshold, 50);
    }

    #[tokio::test]
    async fn test_zero_second_collect_leaves_no_running_session() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::parse_from([
            "motion-collector",
            "--data-dir",
            dir.path().to_str().unwrap(),
            "collect",
            "--seconds",
            "0",
        ]);
        execute(cli).await.unwrap();

        let db = Database::new(dir.path().join(DB_FILE)).unwrap();
        let sessions = db.list_recent_sessions(10).await.unwrap();
        assert!(sessions
            .iter()
            .all(|session| session.status != crate::db::SessionStatus::Running));
    }

    #[tokio::test]
    async fn test_collect_then_export_round() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().to_str().unwrap();

        let collect = Cli::parse_from([
            "motion-collector",
            "--data-dir",
            data_dir,
            "collect",
            "--seconds",
            "1",
            "--seed",
            "3",
        ]);
        execute(collect).await.unwrap();

        let ctx = AppContext::open(Some(dir.path().to_path_buf())).await.unwrap();
        let stored = ctx.db.count_readings().await.unwrap();
        assert!(stored > 0);
        let sessions = ctx.db.list_recent_sessions(1).await.unwrap();
        assert_eq!(sessions[0].sample_count, stored);

        execute(Cli::parse_from(["motion-collector", "--data-dir", data_dir, "export"]))
            .await
            .unwrap();
        assert_eq!(ctx.db.count_readings().await.unwrap(), 0);
    }
}
