//! Backup image creation.
//!
//! A full backup target is created with the source device's virtual size.
//! An incremental target is a qcow2 overlay on the previous image in the
//! chain and inherits its size from it.

use std::ffi::OsString;
use std::future::Future;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info};

use crate::naming::IMAGE_EXTENSION;
use crate::{BackupError, Result};

/// What to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRequest {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub backing_file: Option<PathBuf>,
}

/// Materializes new image files.
pub trait ImageCreator: Send + Sync {
    fn create(&self, request: &ImageRequest) -> impl Future<Output = Result<()>> + Send;
}

/// Creates images by running `qemu-img create`.
#[derive(Debug, Clone)]
pub struct QemuImg {
    program: PathBuf,
}

impl QemuImg {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Arguments passed to `qemu-img` for `request`.
    pub fn args(&self, request: &ImageRequest) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "create".into(),
            "-f".into(),
            IMAGE_EXTENSION.into(),
            request.path.clone().into(),
        ];

        match &request.backing_file {
            Some(backing) => {
                args.push("-b".into());
                args.push(backing.clone().into());
                args.push("-F".into());
                args.push(IMAGE_EXTENSION.into());
            }
            None => args.push(request.size_bytes.to_string().into()),
        }

        args
    }
}

impl Default for QemuImg {
    fn default() -> Self {
        Self::new("qemu-img")
    }
}

impl ImageCreator for QemuImg {
    async fn create(&self, request: &ImageRequest) -> Result<()> {
        let args = self.args(request);
        debug!("Running {} {:?}", self.program.display(), args);

        let output = Command::new(&self.program).args(&args).output().await?;

        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(BackupError::ImageCreation {
                path: request.path.clone(),
                status: output.status.to_string(),
                output: combined,
            });
        }

        info!("Image created successfully: {}", request.path.display());
        Ok(())
    }
}
