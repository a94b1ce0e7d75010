//! Best-effort reversal of backup setup.
//!
//! Steps run in a fixed order (bitmap, job, node) and every requested step
//! is attempted even when an earlier one fails. Objects that are already
//! gone count as success, so running a teardown twice is harmless.

use tracing::{debug, info, warn, Instrument, Span};

use crate::config::BackupConfig;
use crate::qmp::{commands, Command, DomainError, Transport};
use crate::Result;

/// Which setup steps to undo.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownPlan {
    pub remove_bitmap: bool,
    pub cancel_job: bool,
    pub detach_device: bool,
}

impl TeardownPlan {
    pub const ALL: Self = Self {
        remove_bitmap: true,
        cancel_job: true,
        detach_device: true,
    };

    pub const BITMAP_ONLY: Self = Self {
        remove_bitmap: true,
        cancel_job: false,
        detach_device: false,
    };

    pub const DEVICE_ONLY: Self = Self {
        remove_bitmap: false,
        cancel_job: false,
        detach_device: true,
    };

    pub fn is_empty(&self) -> bool {
        !self.remove_bitmap && !self.cancel_job && !self.detach_device
    }
}

pub struct Teardown<'a, T> {
    transport: &'a T,
    device: &'a str,
    node_target: &'a str,
    span: Span,
}

impl<'a, T: Transport> Teardown<'a, T> {
    pub fn new(transport: &'a T, config: &'a BackupConfig) -> Self {
        Self {
            transport,
            device: &config.device,
            node_target: &config.node_target,
            span: Span::none(),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Attempt every step in `plan`. Returns the last failure, if any.
    pub async fn run(&self, plan: TeardownPlan) -> Result<()> {
        if plan.is_empty() {
            debug!("Teardown: nothing requested");
            return Ok(());
        }
        self.run_steps(plan).instrument(self.span.clone()).await
    }

    async fn run_steps(&self, plan: TeardownPlan) -> Result<()> {
        let steps = [
            (
                plan.remove_bitmap,
                "remove dirty bitmap",
                commands::bitmap_remove(self.device),
            ),
            (
                plan.cancel_job,
                "cancel block job",
                commands::block_job_cancel(self.device),
            ),
            (
                plan.detach_device,
                "detach target node",
                commands::blockdev_del(self.node_target),
            ),
        ];

        let mut last_error = None;
        for (_, step, command) in steps.iter().filter(|(enabled, _, _)| *enabled) {
            if let Err(e) = self.step(step, command).await {
                last_error = Some(e);
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn step(&self, step: &str, command: &Command) -> Result<()> {
        match self.transport.execute(command).await {
            Ok(_) => {
                info!("Teardown: {} done", step);
                Ok(())
            }
            Err(e) if e.is_domain(DomainError::NotFound) => {
                info!("Teardown: {} skipped, nothing to remove ({})", step, e);
                Ok(())
            }
            Err(e) => {
                warn!("Teardown: {} failed: {}", step, e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{backup_config, FakeTransport};

    #[tokio::test]
    async fn test_all_steps_attempted_after_failure() {
        let transport = FakeTransport::new().fail("block-dirty-bitmap-remove", "Permission denied");
        let config = backup_config("/backups/vm", -1);

        let err = Teardown::new(&transport, &config)
            .run(TeardownPlan::ALL)
            .await
            .unwrap_err();

        assert_eq!(transport.count("block-dirty-bitmap-remove"), 1);
        assert_eq!(transport.count("block-job-cancel"), 1);
        assert_eq!(transport.count("blockdev-del"), 1);
        assert!(err.to_string().contains("Permission denied"));
    }

    #[tokio::test]
    async fn test_order_and_last_error() {
        let transport = FakeTransport::new()
            .fail("block-dirty-bitmap-remove", "first")
            .fail("block-job-cancel", "second")
            .fail("blockdev-del", "third");
        let config = backup_config("/backups/vm", -1);

        let err = Teardown::new(&transport, &config)
            .run(TeardownPlan::ALL)
            .await
            .unwrap_err();

        assert_eq!(
            transport.actions(),
            vec!["block-dirty-bitmap-remove", "block-job-cancel", "blockdev-del"]
        );
        assert!(err.to_string().contains("third"));
    }

    #[tokio::test]
    async fn test_already_removed_is_tolerated() {
        let transport = FakeTransport::new()
            .fail("block-dirty-bitmap-remove", "Dirty bitmap 'bitmap0' not found")
            .fail("block-job-cancel", "No active block job on device 'drive0'")
            .fail("blockdev-del", "Failed to find node with node-name='target0-node'");
        let config = backup_config("/backups/vm", -1);

        Teardown::new(&transport, &config)
            .run(TeardownPlan::ALL)
            .await
            .unwrap();
        assert_eq!(transport.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_partial_plans() {
        let transport = FakeTransport::new();
        let config = backup_config("/backups/vm", -1);
        let teardown = Teardown::new(&transport, &config);

        teardown.run(TeardownPlan::BITMAP_ONLY).await.unwrap();
        assert_eq!(transport.actions(), vec!["block-dirty-bitmap-remove"]);

        teardown.run(TeardownPlan::DEVICE_ONLY).await.unwrap();
        assert_eq!(
            transport.actions(),
            vec!["block-dirty-bitmap-remove", "blockdev-del"]
        );

        let calls = transport.calls();
        let detach = &calls[1];
        assert_eq!(
            detach.argument("/node-name").and_then(|v| v.as_str()),
            Some("target0-node")
        );

        teardown.run(TeardownPlan::default()).await.unwrap();
        assert_eq!(transport.calls().len(), 2);
        assert!(TeardownPlan::default().is_empty());
    }

    #[tokio::test]
    async fn test_idempotent() {
        let transport = FakeTransport::new();
        let config = backup_config("/backups/vm", 0);
        let teardown = Teardown::new(&transport, &config);

        teardown.run(TeardownPlan::ALL).await.unwrap();
        teardown.run(TeardownPlan::ALL).await.unwrap();
        assert_eq!(transport.count("blockdev-del"), 2);
    }
}
