//! Operator interrupt handling for SIGTERM and SIGINT.
//!
//! A signal cancels the run's [`CancellationToken`]; the executor then
//! cancels the block job and exits.

use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Turns process signals into cancellation of a token.
pub struct ShutdownSignal {
    token: CancellationToken,
}

impl ShutdownSignal {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// The token cancelled on interrupt
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for SIGINT or SIGTERM, then cancel the token. Returns early
    /// if the token is cancelled some other way.
    pub async fn listen(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = self.token.cancelled() => return,
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), cancelling backup...");
            }
            _ = terminate => {
                info!("Received SIGTERM, cancelling backup...");
            }
        }

        self.token.cancel();
    }

    /// Listen on a background task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.listen().await })
    }
}
