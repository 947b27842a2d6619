//! Gateway process: terminates client connections, admits one session at a
//! time, forwards its actions over the Command Channel and relays Callback
//! Channel events back to it.

pub mod client_proto;

use std::{io, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use botlink_ipc::{
    CallbackMessage, CommandKind, CommandMessage, ErrorCode, IpcError, Reply,
    callback::CallbackSubscriber, command::CommandClient, spawn_named,
};
use serde_json::json;
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream, tcp::OwnedWriteHalf},
    sync::{Mutex, broadcast, mpsc},
};
use tracing::{debug, error, info, warn};

use self::client_proto::{ServerLine, parse_hello, parse_request};
use crate::{
    config::Config,
    session::{CleanupHook, ConnectionManager, Identity, Session},
    shutdown::Shutdown,
};

const HELLO_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_BUFFER: usize = 256;
const RELAY_RETRY: Duration = Duration::from_millis(200);
/// Added to the execution budget so a worker-side `ExecutionTimeout` reply
/// arrives before the gateway gives up waiting for it.
const PROCESS_REPLY_SLACK: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("cannot listen on {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
}

type SharedClient = Arc<Mutex<CommandClient>>;

/// Cleanup hook that asks the worker to quiesce.
struct WorkerCleanup {
    commands: SharedClient,
    timeout: Duration,
}

#[async_trait]
impl CleanupHook for WorkerCleanup {
    async fn on_release(&self, session: &Session) {
        let reply = self
            .commands
            .lock()
            .await
            .send_command(&CommandMessage::cleanup(), self.timeout)
            .await;
        match reply {
            Ok(reply) if reply.is_success() => {
                info!(session = %session.id(), data = ?reply.data, "worker cleaned up");
            }
            Ok(reply) => warn!(session = %session.id(), "worker cleanup failed: {}", reply.message),
            Err(e) => warn!(session = %session.id(), "worker cleanup not delivered: {e}"),
        }
    }
}

#[derive(Clone)]
struct Ctx {
    manager: Arc<ConnectionManager>,
    commands: SharedClient,
    events: broadcast::Sender<CallbackMessage>,
    reply_timeout: Duration,
    long_reply_timeout: Duration,
    shutdown: Shutdown,
}

impl Ctx {
    fn timeout_for(&self, kind: CommandKind) -> Duration {
        match kind {
            // both may run project code
            CommandKind::Process | CommandKind::Start => self.long_reply_timeout,
            CommandKind::Update | CommandKind::Cleanup | CommandKind::Ping => {
                self.reply_timeout
            }
        }
    }
}

pub struct Gateway {
    listener: TcpListener,
    ctx: Ctx,
    callback_socket: PathBuf,
}

impl Gateway {
    pub async fn bind(config: &Config, shutdown: Shutdown) -> Result<Self, GatewayError> {
        let addr = config.gateway.listen;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| GatewayError::Bind { addr, source })?;

        let commands = Arc::new(Mutex::new(CommandClient::new(
            &config.ipc.command_socket,
            config.gateway.reconnect_window(),
        )));
        let reply_timeout = config.ipc.reply_timeout();
        let cleanup = WorkerCleanup {
            commands: Arc::clone(&commands),
            timeout: reply_timeout + config.worker.stop_grace() * 2,
        };
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        Ok(Self {
            listener,
            ctx: Ctx {
                manager: Arc::new(ConnectionManager::new(Arc::new(cleanup))),
                commands,
                events,
                reply_timeout,
                long_reply_timeout: reply_timeout
                    .max(config.worker.execution_budget() + PROCESS_REPLY_SLACK),
                shutdown,
            },
            callback_socket: config.ipc.callback_socket.clone(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) {
        let Self {
            listener,
            ctx,
            callback_socket,
        } = self;
        info!("gateway listening on {:?}", listener.local_addr());

        spawn_named(
            "callback-relay",
            relay_callbacks(callback_socket, ctx.events.clone(), ctx.shutdown.clone()),
        );

        loop {
            tokio::select! {
                () = ctx.shutdown.wait() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let ctx = ctx.clone();
                        spawn_named("client", async move {
                            handle_client(stream, peer, ctx).await;
                        });
                    }
                    Err(e) => error!("accept error: {e}"),
                },
            }
        }
        info!("gateway stopped accepting clients");
    }
}

pub async fn run_gateway(config: &Config, shutdown: Shutdown) -> Result<(), GatewayError> {
    Gateway::bind(config, shutdown).await?.run().await;
    Ok(())
}

/// Keep one Callback Channel subscription alive across worker restarts and
/// fan its events out to whoever is connected.
async fn relay_callbacks(
    path: PathBuf,
    events: broadcast::Sender<CallbackMessage>,
    shutdown: Shutdown,
) {
    while !shutdown.is_shutdown() {
        let mut subscriber = tokio::select! {
            () = shutdown.wait() => return,
            connected = CallbackSubscriber::connect(&path) => match connected {
                Ok(subscriber) => subscriber,
                Err(e) => {
                    debug!("callback channel not up yet: {e}");
                    tokio::time::sleep(RELAY_RETRY).await;
                    continue;
                }
            },
        };
        info!("subscribed to callbacks on {}", path.display());

        loop {
            tokio::select! {
                () = shutdown.wait() => return,
                msg = subscriber.recv() => match msg {
                    Ok(msg) => {
                        // no connected client means nobody to tell
                        let _ = events.send(msg);
                    }
                    Err(e) => {
                        info!("callback channel closed ({e}), resubscribing");
                        break;
                    }
                },
            }
        }
    }
}

async fn write_line(writer: &mut OwnedWriteHalf, line: &ServerLine) -> io::Result<()> {
    writer.write_all(&line.to_line()).await?;
    writer.flush().await
}

async fn handle_client(stream: TcpStream, peer: SocketAddr, ctx: Ctx) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let identity = match tokio::time::timeout(HELLO_TIMEOUT, lines.next_line()).await {
        Ok(Ok(Some(line))) => match parse_hello(&line) {
            Ok(identity) => identity,
            Err(e) => {
                let _ = write_line(&mut writer, &ServerLine::error(e.code, e.message)).await;
                return;
            }
        },
        Ok(Ok(None)) | Ok(Err(_)) => return,
        Err(_) => {
            debug!(%peer, "no hello within {HELLO_TIMEOUT:?}");
            return;
        }
    };

    let session = match ctx.manager.admit(&identity, Some(peer)) {
        Ok(session) => session,
        Err(e) => {
            warn!(%peer, subject = %identity.subject, "connection rejected: {e}");
            let _ = write_line(&mut writer, &ServerLine::error(e.code(), e.to_string())).await;
            return;
        }
    };

    // subscribe before announcing the session so no event slips past
    let events = ctx.events.subscribe();
    let (out_tx, out_rx) = mpsc::channel(EVENT_BUFFER);
    let _ = out_tx
        .send(ServerLine::event(
            "connected",
            json!({ "session": session.id(), "subject": session.subject() }),
        ))
        .await;
    let writer_task = spawn_named("client-writer", write_to_client(writer, out_rx, events));

    loop {
        let line = tokio::select! {
            () = ctx.shutdown.wait() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    debug!(%peer, "read error: {e}");
                    break;
                }
            },
        };
        if line.trim().is_empty() {
            continue;
        }
        let out = forward(&ctx, &identity, &line).await;
        if out_tx.send(out).await.is_err() {
            break;
        }
    }

    drop(out_tx);
    writer_task.abort();
    info!(session = %session.id(), %peer, "client disconnected");
    ctx.manager.release(&session).await;
}

async fn write_to_client(
    mut writer: OwnedWriteHalf,
    mut out_rx: mpsc::Receiver<ServerLine>,
    mut events: broadcast::Receiver<CallbackMessage>,
) {
    loop {
        let line = tokio::select! {
            out = out_rx.recv() => match out {
                Some(line) => line,
                None => return,
            },
            event = events.recv() => match event {
                Ok(msg) => ServerLine::event(msg.event, msg.data),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("client fell behind, {n} event(s) dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
        };
        if let Err(e) = write_line(&mut writer, &line).await {
            debug!("client write failed: {e}");
            return;
        }
    }
}

/// Validate, authorize and forward one request line. Always produces the
/// single reply line for it.
async fn forward(ctx: &Ctx, identity: &Identity, line: &str) -> ServerLine {
    let request = match parse_request(line) {
        Ok(request) => request,
        Err((id, e)) => {
            return ServerLine::Reply {
                id,
                reply: e.into_reply(),
            };
        }
    };
    let kind = request.command.kind;
    let reply = if identity.allows(kind) {
        debug!(%kind, subject = %identity.subject, "forwarding");
        send(ctx, &request.command).await
    } else {
        Reply::error(
            ErrorCode::PermissionDenied,
            format!("{} may not {kind}", identity.subject),
        )
    };
    ServerLine::Reply {
        id: request.id,
        reply,
    }
}

async fn send(ctx: &Ctx, command: &CommandMessage) -> Reply {
    let timeout = ctx.timeout_for(command.kind);
    let result = ctx
        .commands
        .lock()
        .await
        .send_command(command, timeout)
        .await;
    match result {
        Ok(reply) => reply,
        Err(IpcError::Timeout { timeout }) => Reply::error(
            ErrorCode::WorkerTimeout,
            format!("worker did not reply within {timeout:?}"),
        ),
        Err(e) => {
            warn!("command {} failed: {e}", command.kind);
            Reply::error(ErrorCode::WorkerUnavailable, format!("worker unavailable: {e}"))
        }
    }
}
