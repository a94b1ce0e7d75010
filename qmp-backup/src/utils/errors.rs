//! Custom error types for the backup orchestrator.

use std::path::PathBuf;
use thiserror::Error;

use crate::qmp::{classify, DomainError};

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("QMP connection closed")]
    ConnectionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("QMP framing error: {0}")]
    Codec(#[from] tokio_util::codec::LinesCodecError),

    #[error("QMP protocol error: {0}")]
    Protocol(String),

    /// Error response to a QMP command. `desc` is the only text the
    /// hypervisor gives us, so all classification happens on it.
    #[error("{command} failed ({class}): {desc}")]
    Qmp {
        command: String,
        class: String,
        desc: String,
    },

    #[error("device {0} not found or has no virtual size, is --device set correctly?")]
    DeviceNotFound(String),

    #[error("backing file {} does not exist, run the previous backup level first", .0.display())]
    MissingBackingFile(PathBuf),

    #[error("failed to create image {}: {status}\nOutput: {output}", path.display())]
    ImageCreation {
        path: PathBuf,
        status: String,
        output: String,
    },

    #[error("device attach retry failed after creating the image: {0}")]
    AttachRetry(Box<BackupError>),

    #[error("block job on {device} failed: {message}")]
    JobFailed { device: String, message: String },

    #[error("event feed closed before the block job on {0} completed")]
    EventFeedClosed(String),
}

impl BackupError {
    /// Classify a QMP command failure. Other variants have no domain meaning.
    pub fn domain(&self) -> Option<DomainError> {
        match self {
            BackupError::Qmp { desc, .. } => Some(classify(desc)),
            _ => None,
        }
    }

    pub fn is_domain(&self, kind: DomainError) -> bool {
        self.domain() == Some(kind)
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn qmp_error(desc: &str) -> BackupError {
        BackupError::Qmp {
            command: "blockdev-add".to_string(),
            class: "GenericError".to_string(),
            desc: desc.to_string(),
        }
    }

    #[test]
    fn test_domain_classification_on_qmp_errors() {
        let err = qmp_error("Could not open '/b/vm.full.qcow2': No such file or directory");
        assert!(err.is_domain(DomainError::MissingFile));

        let err = qmp_error("Duplicated nodes with node-name='target0-node'");
        assert!(err.is_domain(DomainError::DuplicateNode));
    }

    #[test]
    fn test_non_qmp_errors_have_no_domain() {
        assert_eq!(BackupError::ConnectionClosed.domain(), None);
        assert_eq!(BackupError::Config("x".to_string()).domain(), None);
    }

    #[test]
    fn test_error_messages() {
        let err = qmp_error("boom");
        assert_eq!(err.to_string(), "blockdev-add failed (GenericError): boom");

        let err = BackupError::MissingBackingFile(PathBuf::from("/b/vm.inc0.qcow2"));
        assert!(err.to_string().contains("/b/vm.inc0.qcow2"));
    }
}
