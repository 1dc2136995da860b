// External crates
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Process-wide shutdown handle, built on a `CancellationToken`.
///
/// - Clones share one token; cancelling any of them stops every holder.
/// - `child()` hands a token to a long-running task such as the metrics server.
/// - `listen_for_interrupt()` cancels the token on Ctrl+C.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
}

impl Shutdown {
    #[instrument(
        name = "vmwarelog_shutdown_channel",
        target = "helpers::shutdown",
        level = "trace"
    )]
    pub fn new() -> Self {
        tracing::trace!("Creating shutdown token");
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token cancelled together with this handle.
    pub fn child(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Trigger shutdown, waking every waiter.
    #[instrument(
        name = "vmwarelog_shutdown_trigger",
        target = "helpers::shutdown",
        level = "trace"
    )]
    pub fn trigger(&self) {
        tracing::trace!("Shutdown triggered");
        self.token.cancel();
    }

    /// Resolve once `trigger` has been called.
    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// Spawn a task that triggers shutdown on the first Ctrl+C.
    pub fn listen_for_interrupt(&self) {
        let shutdown = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = signal::ctrl_c() => match result {
                    Ok(()) => {
                        tracing::info!("Interrupt received, shutting down");
                        shutdown.trigger();
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to listen for Ctrl+C"),
                },
                _ = shutdown.wait_for_shutdown() => {}
            }
        });
    }
}
