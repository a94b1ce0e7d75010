//! QMP Backup - Main entry point
//!
//! Full and incremental backups of a running QEMU guest over QMP.

use anyhow::{bail, Context, Result};
use clap::Parser;
use qmp_backup::config::{BackupConfig, CleanupFlags, RunMode, Settings, DEFAULT_DEVICE};
use qmp_backup::executor::teardown::{Teardown, TeardownPlan};
use qmp_backup::executor::{BackupExecutor, OutcomeKind};
use qmp_backup::image::QemuImg;
use qmp_backup::naming::FULL_BACKUP_LEVEL;
use qmp_backup::qmp::client::QmpClient;
use qmp_backup::shutdown::ShutdownSignal;
use qmp_backup::utils;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// QMP monitor socket of the running guest
    #[arg(long, value_name = "PATH")]
    socket: PathBuf,

    /// Backup chain base name, e.g. /backups/vm
    #[arg(long, value_name = "BASE")]
    backup_file: Option<PathBuf>,

    /// Device to back up
    #[arg(long, default_value = DEFAULT_DEVICE)]
    device: String,

    /// Incremental level: -1 for a full backup, 0.. for incrementals
    #[arg(long, default_value_t = FULL_BACKUP_LEVEL, allow_negative_numbers = true)]
    inc: i32,

    /// Remove bitmap, cancel job and detach the target node
    #[arg(long)]
    clean: bool,

    /// Remove the dirty bitmap only
    #[arg(long)]
    rb: bool,

    /// Detach the target node only
    #[arg(long)]
    dd: bool,

    /// Remove the dirty bitmap and exit
    #[arg(long)]
    clean_bitmap: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

impl Args {
    fn cleanup(&self) -> CleanupFlags {
        CleanupFlags {
            clean_all: self.clean,
            remove_bitmap: self.rb,
            delete_device: self.dd,
            remove_bitmap_and_exit: self.clean_bitmap,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let settings = if let Some(config_path) = &args.config {
        Settings::from_file(config_path)
            .with_context(|| format!("Failed to load {}", config_path.display()))?
    } else {
        Settings::default()
    };

    // Initialize logging
    let log_level =
        utils::logger::effective_level(args.verbose, args.log_level.as_deref(), &settings.log.level);
    utils::logger::init(log_level)?;

    let config = BackupConfig::new(
        args.device.clone(),
        args.socket.clone(),
        args.backup_file.clone(),
        args.inc,
        args.cleanup(),
    )?
    .with_node_target(settings.qmp.node_target.clone());

    tracing::info!(
        "Starting qmp-backup v{} (device: {}, socket: {})",
        env!("CARGO_PKG_VERSION"),
        config.device,
        config.socket.display()
    );

    let client = QmpClient::connect(&config.socket, settings.qmp.connect_timeout())
        .await
        .with_context(|| format!("Failed to connect to {}", config.socket.display()))?;

    let qemu = &client.greeting()["version"]["qemu"];
    tracing::info!(
        "Connected to QEMU {}.{}.{}",
        qemu["major"],
        qemu["minor"],
        qemu["micro"]
    );

    let span = tracing::info_span!("backup", device = %config.device, level = config.inc_level);

    match config.cleanup.mode() {
        RunMode::Teardown(plan) => teardown(&client, &config, plan, span).await,
        RunMode::Backup => backup(client, config, &settings, span).await,
    }
}

async fn teardown(
    client: &QmpClient,
    config: &BackupConfig,
    plan: TeardownPlan,
    span: tracing::Span,
) -> Result<()> {
    async {
        tracing::info!("Cleaning up {}", config.device);
        Teardown::new(client, config)
            .run(plan)
            .await
            .context("Cleanup finished with errors")
    }
    .instrument(span)
    .await
}

async fn backup(
    client: QmpClient,
    config: BackupConfig,
    settings: &Settings,
    span: tracing::Span,
) -> Result<()> {
    let events = client
        .take_events()
        .await
        .context("QMP event feed already taken")?;

    // Interrupts cancel the running job
    let shutdown = ShutdownSignal::new(CancellationToken::new());
    let cancel = shutdown.token();
    let shutdown_handle = shutdown.spawn();

    let mut executor = BackupExecutor::new(client, QemuImg::new(&settings.image.qemu_img), config)
        .detach_after_completion(settings.backup.detach_after_completion)
        .with_span(span);

    let result = executor.run(events, cancel.clone()).await;

    // Stop the signal listener
    cancel.cancel();
    let _ = shutdown_handle.await;

    let outcome = result?;
    for job_error in &outcome.job_errors {
        tracing::warn!("Block job reported: {}", job_error);
    }

    match outcome.kind {
        OutcomeKind::Completed => {
            if let Some(file) = &outcome.backup_file {
                tracing::info!("Backup complete: {}", file.display());
            }
            Ok(())
        }
        OutcomeKind::BitmapRemoved => {
            tracing::info!("Dirty bitmap removed");
            Ok(())
        }
        OutcomeKind::Cancelled => bail!("Backup cancelled by operator"),
    }
}
