//! QMP Backup Library
//!
//! Full and incremental block device backups of a running QEMU guest,
//! driven over the QMP monitor socket. Incremental backups use a
//! persistent dirty bitmap and form a qcow2 backing chain on disk.

pub mod config;
pub mod executor;
pub mod image;
pub mod naming;
pub mod qmp;
pub mod shutdown;
pub mod utils;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::{BackupConfig, Settings};
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
