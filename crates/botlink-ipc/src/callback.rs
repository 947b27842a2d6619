//! Callback Channel: best-effort fan-out of events from the worker.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::ResultExt;
use tokio::{
    net::{UnixListener, UnixStream},
    sync::broadcast::{self, error::RecvError},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::{DisconnectedSnafu, IoSnafu, IpcError, UnexpectedFrameSnafu},
    messages::CallbackMessage,
    socket::{SOCKET_MODE, SocketGuard, setup_unix_socket},
    spawn_named,
    wire::{read_frame, write_frame},
};

const BROADCAST_DEPTH: usize = 1024;

/// What actually travels on a subscriber connection. `Ready` is sent once,
/// after the subscriber's queue exists, so nothing published after
/// [`CallbackSubscriber::connect`] returns can be missed.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum CallbackFrame {
    Ready,
    Event(CallbackMessage),
}

struct Inner {
    tx: broadcast::Sender<CallbackMessage>,
    stop: CancellationToken,
    _guard: Option<SocketGuard>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Worker side of the Callback Channel. Cheap to clone; the accept loop and
/// socket file live until the last clone is dropped.
#[derive(Clone)]
pub struct CallbackPublisher {
    inner: Arc<Inner>,
}

impl CallbackPublisher {
    pub fn bind(path: &Path) -> Result<Self, IpcError> {
        let (listener, guard) =
            setup_unix_socket(path, SOCKET_MODE).context(IoSnafu { path })?;
        let (tx, _) = broadcast::channel(BROADCAST_DEPTH);
        let stop = CancellationToken::new();

        spawn_named(
            "callback-accept",
            accept_loop(listener, tx.clone(), stop.clone()),
        );

        Ok(Self {
            inner: Arc::new(Inner {
                tx,
                stop,
                _guard: Some(guard),
            }),
        })
    }

    /// A publisher with no socket behind it. Events only reach
    /// [`subscribe_local`](Self::subscribe_local) receivers.
    pub fn detached() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_DEPTH);
        Self {
            inner: Arc::new(Inner {
                tx,
                stop: CancellationToken::new(),
                _guard: None,
            }),
        }
    }

    pub fn subscribe_local(&self) -> broadcast::Receiver<CallbackMessage> {
        self.inner.tx.subscribe()
    }

    /// Fire and forget. Returns how many subscribers the event was queued
    /// for; with none it is simply lost.
    pub fn publish(&self, event: impl Into<String>, data: Value) -> usize {
        let msg = CallbackMessage::new(event, data);
        match self.inner.tx.send(msg) {
            Ok(n) => n,
            Err(broadcast::error::SendError(msg)) => {
                debug!("no subscriber for event {:?}, dropped", msg.event);
                0
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.tx.receiver_count()
    }
}

async fn accept_loop(
    listener: UnixListener,
    tx: broadcast::Sender<CallbackMessage>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            () = stop.cancelled() => return,
            res = listener.accept() => match res {
                Ok((stream, _addr)) => {
                    // subscribe before anything is written so the Ready frame
                    // is a registration guarantee
                    let rx = tx.subscribe();
                    let stop = stop.clone();
                    spawn_named("callback-subscriber", async move {
                        if let Err(e) = feed_subscriber(stream, rx, stop).await {
                            debug!("callback subscriber gone: {e}");
                        }
                    });
                }
                Err(e) => warn!("callback accept failed: {e}"),
            }
        }
    }
}

async fn feed_subscriber(
    mut stream: UnixStream,
    mut rx: broadcast::Receiver<CallbackMessage>,
    stop: CancellationToken,
) -> std::io::Result<()> {
    write_frame(&mut stream, &CallbackFrame::Ready).await?;
    loop {
        let msg = tokio::select! {
            () = stop.cancelled() => return Ok(()),
            msg = rx.recv() => msg,
        };
        match msg {
            Ok(msg) => {
                write_frame(&mut stream, &CallbackFrame::Event(msg)).await?;
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("callback subscriber lagged, {skipped} events dropped");
            }
            Err(RecvError::Closed) => return Ok(()),
        }
    }
}

/// Gateway side of the Callback Channel.
#[derive(Debug)]
pub struct CallbackSubscriber {
    stream: UnixStream,
    path: PathBuf,
}

impl CallbackSubscriber {
    /// Returns once the publisher has registered this subscriber.
    pub async fn connect(path: impl Into<PathBuf>) -> Result<Self, IpcError> {
        let path = path.into();
        let Ok(mut stream) = UnixStream::connect(&path).await else {
            return DisconnectedSnafu { path }.fail();
        };
        match read_frame::<_, CallbackFrame>(&mut stream).await {
            Ok(Some(CallbackFrame::Ready)) => Ok(Self { stream, path }),
            Ok(Some(CallbackFrame::Event(_))) => UnexpectedFrameSnafu {
                what: "event before ready",
            }
            .fail(),
            Ok(None) | Err(_) => DisconnectedSnafu { path }.fail(),
        }
    }

    /// Next event in emission order. `Disconnected` once the worker is gone.
    pub async fn recv(&mut self) -> Result<CallbackMessage, IpcError> {
        match read_frame::<_, CallbackFrame>(&mut self.stream).await {
            Ok(Some(CallbackFrame::Event(msg))) => Ok(msg),
            Ok(Some(CallbackFrame::Ready)) => UnexpectedFrameSnafu {
                what: "second ready",
            }
            .fail(),
            Ok(None) | Err(_) => DisconnectedSnafu { path: &self.path }.fail(),
        }
    }
}
