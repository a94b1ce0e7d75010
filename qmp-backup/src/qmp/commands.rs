//! QMP command builders.
//!
//! Pure functions: each takes already-validated fields and returns a
//! [`Command`]. Nothing here talks to the hypervisor.

use serde_json::{json, Value};
use std::path::Path;

use super::Command;

/// Name of the dirty bitmap tracking changes between backups. It is never
/// recreated per run: it persists across generations.
pub const BITMAP_NAME: &str = "bitmap0";

/// Image driver of the backup target node.
pub const TARGET_DRIVER: &str = "qcow2";

/// `blockdev-add`: attach the backup image as node `node_name`.
pub fn blockdev_add(node_name: &str, filename: &Path) -> Command {
    Command::with_arguments(
        "blockdev-add",
        json!({
            "node-name": node_name,
            "driver": TARGET_DRIVER,
            "file": {
                "driver": "file",
                "filename": filename.to_string_lossy(),
            },
        }),
    )
}

/// `blockdev-del`: detach node `node_name`.
pub fn blockdev_del(node_name: &str) -> Command {
    Command::with_arguments("blockdev-del", json!({ "node-name": node_name }))
}

/// `block-dirty-bitmap-add` on `device`.
pub fn bitmap_add(device: &str) -> Command {
    Command::with_arguments(
        "block-dirty-bitmap-add",
        json!({ "node": device, "name": BITMAP_NAME }),
    )
}

/// `block-dirty-bitmap-remove` on `device`.
pub fn bitmap_remove(device: &str) -> Command {
    Command::with_arguments(
        "block-dirty-bitmap-remove",
        json!({ "node": device, "name": BITMAP_NAME }),
    )
}

/// `block-job-cancel` for the job running on `device`.
pub fn block_job_cancel(device: &str) -> Command {
    Command::with_arguments("block-job-cancel", json!({ "device": device }))
}

/// `query-block`: list block devices with their inserted images.
pub fn query_block() -> Command {
    Command::new("query-block")
}

/// Full backup as one transaction: clear the bitmap, then copy everything.
///
/// Both actions must succeed or fail together. Issued separately, a failure
/// between them would drop the changes tracked since the last clear.
pub fn full_backup(device: &str, target: &str) -> Command {
    Command::with_arguments(
        "transaction",
        json!({
            "actions": [
                {
                    "type": "block-dirty-bitmap-clear",
                    "data": { "node": device, "name": BITMAP_NAME },
                },
                {
                    "type": "blockdev-backup",
                    "data": {
                        "device": device,
                        "target": target,
                        "sync": "full",
                        "auto-dismiss": true,
                        "compress": true,
                    },
                },
            ],
        }),
    )
}

/// Incremental backup of the regions recorded in the bitmap.
pub fn incremental_backup(device: &str, target: &str) -> Command {
    Command::with_arguments(
        "blockdev-backup",
        json!({
            "device": device,
            "bitmap": BITMAP_NAME,
            "target": target,
            "sync": "incremental",
        }),
    )
}

/// Extract `device`'s virtual size in bytes from a `query-block` result.
pub fn virtual_size(query_block: &Value, device: &str) -> Option<u64> {
    query_block
        .as_array()?
        .iter()
        .find(|entry| entry.get("device").and_then(Value::as_str) == Some(device))?
        .pointer("/inserted/image/virtual-size")?
        .as_u64()
}
