//! Backup job executor - Orchestrates one backup of one device.
//!
//! Setup runs synchronously, step by step:
//! 1. Attach the backup image as the target node, creating it if missing
//! 2. Make sure the dirty bitmap exists (full backups only)
//! 3. Start the completion monitor
//! 4. Start the backup (full transaction or incremental)
//!
//! Setup errors are returned straight away. Once the job is running the
//! executor waits for the monitor's completion signal or for the operator
//! to cancel.

pub mod monitor;
pub mod teardown;

use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};

use crate::config::BackupConfig;
use crate::image::{ImageCreator, ImageRequest};
use crate::naming::BackupFiles;
use crate::qmp::{commands, DomainError, Transport};
use crate::{BackupError, Result};
use monitor::{CompletionMonitor, JobCompletion, JobEvent, MonitorHandle};
use teardown::{Teardown, TeardownPlan};

/// Setup/run state of the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupState {
    Init,
    Attaching,
    BitmapPreparing,
    Running,
    Done,
    Failed,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    /// The block job completed
    Completed,
    /// The operator cancelled the running job
    Cancelled,
    /// Only the dirty bitmap was removed
    BitmapRemoved,
}

/// Result of a run that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupOutcome {
    pub kind: OutcomeKind,
    pub backup_file: Option<PathBuf>,

    /// Job error events seen while the job kept running
    pub job_errors: Vec<String>,
}

/// Main backup executor
pub struct BackupExecutor<T, I> {
    transport: T,
    images: I,
    config: BackupConfig,
    detach_after_completion: bool,
    state: BackupState,
    span: Span,
}

impl<T: Transport, I: ImageCreator> BackupExecutor<T, I> {
    pub fn new(transport: T, images: I, config: BackupConfig) -> Self {
        Self {
            transport,
            images,
            config,
            detach_after_completion: true,
            state: BackupState::Init,
            span: Span::none(),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Detach the target node once the job has completed (default: on).
    pub fn detach_after_completion(mut self, detach: bool) -> Self {
        self.detach_after_completion = detach;
        self
    }

    pub fn state(&self) -> BackupState {
        self.state
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Run the workflow. `events` must be the transport's event feed and
    /// `cancel` is the operator's interrupt.
    pub async fn run(
        &mut self,
        events: crate::qmp::EventStream,
        cancel: CancellationToken,
    ) -> Result<BackupOutcome> {
        let span = self.span.clone();
        async {
            let result = self.execute(events, cancel).await;
            if let Err(e) = &result {
                error!("Backup of {} failed: {}", self.config.device, e);
                self.transition(BackupState::Failed);
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn execute(
        &mut self,
        events: crate::qmp::EventStream,
        cancel: CancellationToken,
    ) -> Result<BackupOutcome> {
        if self.config.cleanup.remove_bitmap_and_exit {
            info!("Cleaning bitmap and exiting");
            self.transport
                .execute(&commands::bitmap_remove(&self.config.device))
                .await?;
            self.transition(BackupState::Done);
            return Ok(BackupOutcome {
                kind: OutcomeKind::BitmapRemoved,
                backup_file: None,
                job_errors: Vec::new(),
            });
        }

        let files = self.config.files()?.clone();
        info!(
            "Starting {} backup of {} into {}",
            self.config.backup_kind(),
            self.config.device,
            files.backup_file.display()
        );

        self.transition(BackupState::Attaching);
        self.attach(&files).await?;
        if cancel.is_cancelled() {
            return Ok(self.abandon_setup(&files).await);
        }

        if self.config.is_full() {
            self.transition(BackupState::BitmapPreparing);
            if let Err(e) = self.prepare_bitmap().await {
                self.recover().await;
                return Err(e);
            }
        }

        // Last chance to stop before the bitmap is cleared and data is written
        if cancel.is_cancelled() {
            return Ok(self.abandon_setup(&files).await);
        }

        let mut monitor = CompletionMonitor::new(
            self.config.device.clone(),
            files.backup_file.clone(),
            cancel.child_token(),
        )
        .with_span(self.span.clone())
        .spawn(events);

        if let Err(e) = self.start_backup().await {
            warn!("In case of error with bitmap operation, run with --clean-bitmap");
            monitor.shutdown().await;
            self.recover().await;
            return Err(e);
        }
        self.transition(BackupState::Running);

        let result = self.wait(&mut monitor, &cancel, &files).await;
        monitor.shutdown().await;
        result
    }

    /// Attach the backup image, creating it once if it does not exist.
    async fn attach(&self, files: &BackupFiles) -> Result<()> {
        let node = &self.config.node_target;
        let attach = commands::blockdev_add(node, &files.backup_file);

        let err = match self.transport.execute(&attach).await {
            Ok(_) => {
                info!("Attached {} as node {}", files.backup_file.display(), node);
                return Ok(());
            }
            Err(e) => e,
        };

        match err.domain() {
            Some(DomainError::MissingFile) => {
                info!(
                    "Missing file detected, attempting to create image {}",
                    files.backup_file.display()
                );
                self.create_image(files).await?;
                self.transport
                    .execute(&attach)
                    .await
                    .map_err(|e| BackupError::AttachRetry(Box::new(e)))?;
                info!("Attached {} as node {}", files.backup_file.display(), node);
                Ok(())
            }
            Some(DomainError::DuplicateNode) => {
                warn!("Node {} already exists, removing it. Please re-run", node);
                if let Err(e) = self.transport.execute(&commands::blockdev_del(node)).await {
                    warn!("Deleting node {} failed: {}", node, e);
                }
                Err(err)
            }
            _ => Err(err),
        }
    }

    async fn create_image(&self, files: &BackupFiles) -> Result<()> {
        if let Some(backing) = &files.backing_file {
            if !tokio::fs::try_exists(backing).await? {
                return Err(BackupError::MissingBackingFile(backing.clone()));
            }
        }

        let reply = self.transport.execute(&commands::query_block()).await?;
        let size_bytes = commands::virtual_size(&reply, &self.config.device)
            .ok_or_else(|| BackupError::DeviceNotFound(self.config.device.clone()))?;
        info!("Source image size: {} bytes", size_bytes);

        self.images
            .create(&ImageRequest {
                path: files.backup_file.clone(),
                size_bytes,
                backing_file: files.backing_file.clone(),
            })
            .await
    }

    async fn prepare_bitmap(&self) -> Result<()> {
        let device = &self.config.device;
        match self.transport.execute(&commands::bitmap_add(device)).await {
            Ok(_) => {
                info!("Created dirty bitmap {} on {}", commands::BITMAP_NAME, device);
                Ok(())
            }
            Err(e) if e.is_domain(DomainError::BitmapExists) => {
                info!(
                    "Dirty bitmap {} already exists on {}, reusing it",
                    commands::BITMAP_NAME,
                    device
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn start_backup(&self) -> Result<()> {
        let device = &self.config.device;
        let target = &self.config.node_target;
        let command = if self.config.is_full() {
            commands::full_backup(device, target)
        } else {
            commands::incremental_backup(device, target)
        };

        self.transport.execute(&command).await?;
        info!("Block job started on {}", device);
        Ok(())
    }

    async fn wait(
        &mut self,
        monitor: &mut MonitorHandle,
        cancel: &CancellationToken,
        files: &BackupFiles,
    ) -> Result<BackupOutcome> {
        let mut job_errors = Vec::new();
        debug!("Waiting for block job on {}", self.config.device);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!("Interrupt received, cancelling block job on {}", self.config.device);
                    if let Err(e) = self
                        .transport
                        .execute(&commands::block_job_cancel(&self.config.device))
                        .await
                    {
                        error!("Cancelling block job failed: {}", e);
                    }
                    warn!(
                        "Node {} left attached, re-run with --dd once the job has stopped",
                        self.config.node_target
                    );
                    self.transition(BackupState::Failed);
                    return Ok(BackupOutcome {
                        kind: OutcomeKind::Cancelled,
                        backup_file: Some(files.backup_file.clone()),
                        job_errors,
                    });
                }
                Some(event) = monitor.job_events.recv() => {
                    collect_job_error(event, &mut job_errors);
                }
                completion = &mut monitor.completion => {
                    while let Ok(event) = monitor.job_events.try_recv() {
                        collect_job_error(event, &mut job_errors);
                    }

                    return match completion {
                        Ok(JobCompletion::Succeeded) => {
                            self.transition(BackupState::Done);
                            if self.detach_after_completion {
                                self.detach().await;
                            }
                            info!("Backup written to {}", files.backup_file.display());
                            Ok(BackupOutcome {
                                kind: OutcomeKind::Completed,
                                backup_file: Some(files.backup_file.clone()),
                                job_errors,
                            })
                        }
                        Ok(JobCompletion::Failed(message)) => {
                            if self.detach_after_completion {
                                self.detach().await;
                            }
                            Err(BackupError::JobFailed {
                                device: self.config.device.clone(),
                                message,
                            })
                        }
                        Err(_) => {
                            if self.detach_after_completion {
                                self.detach().await;
                            }
                            Err(BackupError::EventFeedClosed(self.config.device.clone()))
                        }
                    };
                }
            }
        }
    }

    /// Interrupted before the block job was started: nothing to cancel,
    /// only the attached node to remove.
    async fn abandon_setup(&mut self, files: &BackupFiles) -> BackupOutcome {
        warn!("Interrupt received during setup, backup of {} not started", self.config.device);
        self.recover().await;
        self.transition(BackupState::Failed);
        BackupOutcome {
            kind: OutcomeKind::Cancelled,
            backup_file: Some(files.backup_file.clone()),
            job_errors: Vec::new(),
        }
    }

    /// Detach the target node after a setup failure past attach.
    async fn recover(&self) {
        info!("Detaching node {} after setup failure", self.config.node_target);
        self.detach().await;
    }

    async fn detach(&self) {
        if let Err(e) = Teardown::new(&self.transport, &self.config)
            .with_span(self.span.clone())
            .run(TeardownPlan::DEVICE_ONLY)
            .await
        {
            warn!("Could not detach node {}: {}", self.config.node_target, e);
        }
    }

    fn transition(&mut self, next: BackupState) {
        debug!("Backup state {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

fn collect_job_error(event: JobEvent, job_errors: &mut Vec<String>) {
    if let JobEvent::Error { payload, hint, .. } = event {
        let mut message = payload.to_string();
        if let Some(hint) = hint {
            message.push_str(". ");
            message.push_str(&hint);
        }
        job_errors.push(message);
    }
}
