//! Process-wide stop flag shared by the worker, the gateway and the supervisor.

use botlink_ipc::spawn_named;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cloneable handle; every clone observes the same trigger.
#[derive(Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Resolves once triggered, immediately if that already happened.
    pub async fn wait(&self) {
        self.token.cancelled().await;
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Trigger on SIGTERM or SIGINT. Must be called inside the runtime.
    pub fn trigger_on_signals(&self) {
        for (kind, name) in [
            (SignalKind::terminate(), "SIGTERM"),
            (SignalKind::interrupt(), "SIGINT"),
        ] {
            let shutdown = self.clone();
            spawn_named(name, async move {
                let mut stream = match signal(kind) {
                    Ok(stream) => stream,
                    Err(error) => {
                        warn!(%error, "failed to set up {name} handler");
                        return;
                    }
                };
                tokio::select! {
                    _ = stream.recv() => {
                        info!("received {name}, shutting down");
                        shutdown.trigger();
                    }
                    () = shutdown.wait() => {}
                }
            });
        }
    }
}
