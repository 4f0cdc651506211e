//! Graceful-shutdown plumbing: SIGTERM/SIGINT fan out through one
//! cancellation token to the HTTP server and every background job.

use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub struct ShutdownSignal {
    _listener: TaskTracker,
    token: CancellationToken,
}

impl ShutdownSignal {
    /// Registers the signal handlers; fails only if the runtime refuses
    /// signal registration.
    pub fn try_new() -> Result<Self, std::io::Error> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let token = CancellationToken::new();
        let trigger = token.clone();
        let listener = TaskTracker::new();
        listener.spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
                _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
            }
            trigger.cancel();
        });
        listener.close();
        Ok(Self {
            _listener: listener,
            token,
        })
    }

    /// A clone of the token for handing to subsystems.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}
