use tokio::task::JoinHandle;

pub mod error;
pub mod messages;
pub mod wire;

// local socket transport between the gateway and the worker
#[cfg(unix)]
pub mod callback;
#[cfg(unix)]
pub mod command;
#[cfg(unix)]
pub mod socket;

pub use error::IpcError;
pub use messages::{
    CallbackMessage, CommandKind, CommandMessage, ErrorCode, ProcessParams,
    Reply, ReplyStatus,
};

use tracing::Instrument;

/// Spawn `fut` inside a `task` span carrying `name`. Under `tokio_unstable`
/// the name also shows up in tokio-console.
#[allow(unexpected_cfgs)]
pub fn spawn_named<F>(name: &str, fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    use futures::FutureExt;

    let fut = fut
        .instrument(tracing::info_span!("task", task_name = %name))
        .boxed();

    // both fail only outside a running runtime, where tokio::spawn panics too
    #[cfg(tokio_unstable)]
    {
        tokio::task::Builder::new()
            .name(name)
            .spawn(fut)
            .expect("spawn outside a tokio runtime")
    }

    #[cfg(not(tokio_unstable))]
    {
        tokio::spawn(fut)
    }
}
