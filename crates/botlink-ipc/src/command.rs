//! Command Channel: strict request-then-reply between gateway and worker.
//!
//! The worker binds a [`CommandServer`] and drains [`PendingCommand`]s one at
//! a time. The gateway holds a [`CommandClient`] that reconnects on its own
//! across worker restarts.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use snafu::ResultExt;
use tokio::{
    io::AsyncWriteExt,
    net::{UnixListener, UnixStream},
    sync::{mpsc, oneshot},
    time::Instant,
};
use tracing::{debug, warn};

use crate::{
    error::{
        DisconnectedSnafu, IoSnafu, IpcError, TimeoutSnafu, UnexpectedFrameSnafu,
    },
    messages::{CommandMessage, ErrorCode, Reply},
    socket::{SOCKET_MODE, SocketGuard, setup_unix_socket},
    spawn_named,
    wire::{read_frame, read_raw_frame, serialize_message, write_frame},
};

const QUEUE_DEPTH: usize = 16;
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// A command waiting for the worker's answer.
#[derive(Debug)]
pub struct PendingCommand {
    pub message: CommandMessage,
    reply: oneshot::Sender<(Reply, oneshot::Sender<bool>)>,
}

impl PendingCommand {
    /// Hand the reply to the connection that sent the command and wait until
    /// it has been written. Returns `false` if the requester is gone.
    pub async fn respond(self, reply: Reply) -> bool {
        let (written_tx, written_rx) = oneshot::channel();
        if self.reply.send((reply, written_tx)).is_err() {
            return false;
        }
        written_rx.await.unwrap_or(false)
    }
}

pub struct CommandServer {
    listener: UnixListener,
    guard: SocketGuard,
}

impl CommandServer {
    pub fn bind(path: &Path) -> Result<Self, IpcError> {
        let (listener, guard) =
            setup_unix_socket(path, SOCKET_MODE).context(IoSnafu { path })?;
        Ok(Self { listener, guard })
    }

    pub fn path(&self) -> &Path {
        self.guard.path()
    }

    /// Start accepting. Every connection feeds the returned queue, so
    /// commands execute one at a time no matter how many requesters exist.
    /// Dropping the receiver stops the accept loop and removes the socket.
    pub fn serve(self) -> mpsc::Receiver<PendingCommand> {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        spawn_named("command-accept", accept_loop(self, tx));
        rx
    }
}

async fn accept_loop(server: CommandServer, queue: mpsc::Sender<PendingCommand>) {
    let CommandServer { listener, guard } = server;
    let path = guard.path().to_path_buf();
    loop {
        tokio::select! {
            () = queue.closed() => break,
            res = listener.accept() => match res {
                Ok((stream, _addr)) => {
                    debug!("command connection accepted");
                    let queue = queue.clone();
                    let path = path.clone();
                    spawn_named("command-conn", async move {
                        if let Err(e) = handle_connection(stream, queue, &path).await {
                            warn!("command connection error: {e}");
                        }
                    });
                }
                Err(e) => {
                    warn!("accept on {} failed: {e}", path.display());
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
            }
        }
    }
    drop(guard);
}

/// Serve a single requester: read, enqueue, await reply, write, repeat.
async fn handle_connection(
    mut stream: UnixStream,
    queue: mpsc::Sender<PendingCommand>,
    path: &Path,
) -> Result<(), IpcError> {
    loop {
        let frame = tokio::select! {
            // worker loop is gone; close so the requester notices
            () = queue.closed() => return Ok(()),
            frame = read_raw_frame(&mut stream) => frame,
        };
        let Some(payload) = frame.context(IoSnafu { path })? else {
            // requester hung up
            return Ok(());
        };

        let message = match serde_cbor::from_slice::<CommandMessage>(&payload) {
            Ok(message) => message,
            Err(e) => {
                let reply = Reply::error(
                    ErrorCode::InvalidFormat,
                    format!("malformed command: {e}"),
                );
                write_frame(&mut stream, &reply)
                    .await
                    .context(IoSnafu { path })?;
                continue;
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if queue
            .send(PendingCommand {
                message,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            // worker loop is gone
            return Ok(());
        }

        let Ok((reply, written)) = reply_rx.await else {
            return Ok(());
        };
        let res = write_frame(&mut stream, &reply).await;
        let _ = written.send(res.is_ok());
        res.context(IoSnafu { path })?;
    }
}

/// Gateway side of the Command Channel.
#[derive(Debug)]
pub struct CommandClient {
    path: PathBuf,
    reconnect_window: Duration,
    stream: Option<UnixStream>,
}

impl CommandClient {
    /// No connection is made until the first command.
    pub fn new(path: impl Into<PathBuf>, reconnect_window: Duration) -> Self {
        Self {
            path: path.into(),
            reconnect_window,
            stream: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Connect, retrying for up to `reconnect_window` while the worker is
    /// (re)starting.
    async fn connect(&self) -> Result<UnixStream, IpcError> {
        let deadline = Instant::now() + self.reconnect_window;
        loop {
            match UnixStream::connect(&self.path).await {
                Ok(stream) => return Ok(stream),
                Err(e) if Instant::now() >= deadline => {
                    debug!("giving up on {}: {e}", self.path.display());
                    return DisconnectedSnafu { path: &self.path }.fail();
                }
                Err(_) => tokio::time::sleep(CONNECT_RETRY_INTERVAL).await,
            }
        }
    }

    /// Send one command and wait up to `timeout` for its reply.
    ///
    /// On `Timeout` the connection is dropped, so a late reply can never be
    /// read as the answer to the next command.
    pub async fn send_command(
        &mut self,
        msg: &CommandMessage,
        timeout: Duration,
    ) -> Result<Reply, IpcError> {
        let bytes = serialize_message(msg)?;

        let mut stream = match self.stream.take() {
            Some(stream) => stream,
            None => self.connect().await?,
        };

        if write_all(&mut stream, &bytes).await.is_err() {
            // the worker restarted since the last command; the request was
            // never delivered, so one retry on a fresh connection is safe
            debug!("stale command connection, reconnecting");
            stream = self.connect().await?;
            if write_all(&mut stream, &bytes).await.is_err() {
                return DisconnectedSnafu { path: &self.path }.fail();
            }
        }

        match tokio::time::timeout(timeout, read_frame::<_, Reply>(&mut stream))
            .await
        {
            Err(_elapsed) => TimeoutSnafu { timeout }.fail(),
            Ok(Ok(Some(reply))) => {
                self.stream = Some(stream);
                Ok(reply)
            }
            Ok(Ok(None)) => DisconnectedSnafu { path: &self.path }.fail(),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
                UnexpectedFrameSnafu {
                    what: e.to_string(),
                }
                .fail()
            }
            Ok(Err(e)) => {
                debug!("command read failed: {e}");
                DisconnectedSnafu { path: &self.path }.fail()
            }
        }
    }
}

async fn write_all(stream: &mut UnixStream, bytes: &[u8]) -> std::io::Result<()> {
    stream.write_all(bytes).await?;
    stream.flush().await
}
