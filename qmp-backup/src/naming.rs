//! Backup chain file naming.
//!
//! Chain state is never written anywhere: it lives in the file names
//! (`base.full.qcow2`, `base.inc0.qcow2`, `base.incN.qcow2`) and in the
//! hypervisor's dirty bitmap. Each incremental image is a qcow2 overlay whose
//! backing file is the image of the previous level.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Extension of every image in the chain.
pub const IMAGE_EXTENSION: &str = "qcow2";

/// Increment level of a full backup.
pub const FULL_BACKUP_LEVEL: i32 = -1;

/// Paths derived for one backup generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupFiles {
    /// Image the backup job writes into
    pub backup_file: PathBuf,

    /// Previous image in the chain (absent for full backups)
    pub backing_file: Option<PathBuf>,
}

/// Derive the backup and backing file paths for `level`.
///
/// Pure: no existence checks are made, callers verify the backing file
/// before relying on it.
pub fn resolve(base: &Path, level: i32) -> BackupFiles {
    if level < 0 {
        return BackupFiles {
            backup_file: with_suffix(base, "full"),
            backing_file: None,
        };
    }

    let backing_suffix = if level == 0 {
        "full".to_string()
    } else {
        format!("inc{}", level - 1)
    };

    BackupFiles {
        backup_file: with_suffix(base, &format!("inc{}", level)),
        backing_file: Some(with_suffix(base, &backing_suffix)),
    }
}

fn with_suffix(base: &Path, generation: &str) -> PathBuf {
    let mut name = OsString::from(base.as_os_str());
    name.push(format!(".{}.{}", generation, IMAGE_EXTENSION));
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_backup_has_no_backing_file() {
        let files = resolve(Path::new("/backups/vm"), FULL_BACKUP_LEVEL);
        assert_eq!(files.backup_file, PathBuf::from("/backups/vm.full.qcow2"));
        assert!(files.backing_file.is_none());

        // Any negative level is a full backup.
        assert_eq!(resolve(Path::new("/backups/vm"), -7), files);
    }

    #[test]
    fn test_first_incremental_backs_onto_full() {
        let files = resolve(Path::new("/backups/vm"), 0);
        assert_eq!(files.backup_file, PathBuf::from("/backups/vm.inc0.qcow2"));
        assert_eq!(files.backing_file, Some(PathBuf::from("/backups/vm.full.qcow2")));
    }

    #[test]
    fn test_chain_continuity() {
        let base = Path::new("/backups/vm");
        let full = resolve(base, FULL_BACKUP_LEVEL);
        assert_eq!(resolve(base, 0).backing_file.as_ref(), Some(&full.backup_file));

        for level in 1..20 {
            let previous = resolve(base, level - 1);
            let current = resolve(base, level);
            assert_eq!(current.backing_file.as_ref(), Some(&previous.backup_file));
        }
    }

    #[test]
    fn test_relative_base() {
        let files = resolve(Path::new("disk"), 3);
        assert_eq!(files.backup_file, PathBuf::from("disk.inc3.qcow2"));
        assert_eq!(files.backing_file, Some(PathBuf::from("disk.inc2.qcow2")));
    }
}
