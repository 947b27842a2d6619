//! Worker process: serves the Command Channel against the engine, one
//! command at a time.

use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use botlink_ipc::{
    CommandKind, CommandMessage, ErrorCode, IpcError, Reply,
    callback::CallbackPublisher, command::CommandServer,
};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    engine::{
        Engine, EngineError, EngineState, script::RhaiLoader, tasks::TaskRegistry,
    },
    shutdown::Shutdown,
    store::{ProjectStore, StoreError},
};

/// Process exit status. The supervisor restarts the worker right away on
/// `Reload` and with backoff on anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum WorkerExit {
    Clean = 0,
    Fatal = 1,
    Reload = 75,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ipc(#[from] IpcError),
}

/// What the loop does once a reply is out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Continue,
    Restart,
}

pub async fn run_worker(
    config: &Config,
    shutdown: Shutdown,
) -> Result<WorkerExit, WorkerError> {
    let store = ProjectStore::open(&config.worker.storage_dir, config.store.clone())?;
    store.recover()?;
    store.ensure_default_seeded()?;

    let publisher = CallbackPublisher::bind(&config.ipc.callback_socket)?;
    let server = CommandServer::bind(&config.ipc.command_socket)?;

    let tasks = TaskRegistry::new(publisher.clone());
    let loader = Arc::new(RhaiLoader::new(
        publisher,
        Arc::clone(&tasks),
        config.worker.agent_endpoint,
    ));
    let mut engine = Engine::new(store, loader, tasks, &config.worker);

    // loading waits for the first start/process
    if let Err(e) = engine.store().bootstrap_current() {
        warn!("could not bootstrap current project: {e}");
    }

    let mut queue = server.serve();
    info!(
        "worker ready on {} (callbacks on {})",
        config.ipc.command_socket.display(),
        config.ipc.callback_socket.display()
    );

    let exit = loop {
        let pending = tokio::select! {
            () = shutdown.wait() => break WorkerExit::Clean,
            next = queue.recv() => match next {
                Some(pending) => pending,
                None => {
                    error!("command server stopped accepting");
                    break WorkerExit::Fatal;
                }
            },
        };

        let kind = pending.message.kind;
        let (reply, next) = handle_command(&mut engine, &pending.message).await;
        debug!(%kind, status = ?reply.status, "replying");
        if !pending.respond(reply).await {
            warn!("reply to {kind} was not delivered");
        }
        // tasks started by this command only run once its reply is out
        engine.launch_pending();

        if next == Next::Restart {
            info!("project replaced, exiting for restart");
            break WorkerExit::Reload;
        }
    };

    drop(queue);
    let report = engine.cleanup_on_disconnect().await;
    info!(?exit, ?report, "worker stopping");
    Ok(exit)
}

fn engine_error(e: &EngineError) -> Reply {
    Reply::error(e.code(), e.to_string())
}

async fn handle_command(
    engine: &mut Engine,
    message: &CommandMessage,
) -> (Reply, Next) {
    match message.kind {
        CommandKind::Update => {
            let Some(encoded) = message.data.as_deref() else {
                return (
                    Reply::error(ErrorCode::MissingField, "update requires data"),
                    Next::Continue,
                );
            };
            let archive = match BASE64.decode(encoded) {
                Ok(archive) => archive,
                Err(e) => {
                    return (
                        Reply::error(
                            ErrorCode::InvalidParams,
                            format!("data is not valid base64: {e}"),
                        ),
                        Next::Continue,
                    );
                }
            };
            match engine.swap(archive).await {
                Ok(dir) => (
                    Reply::success(
                        "project updated, worker restarting",
                        Some(json!({
                            "worker_will_restart": true,
                            "project_dir": dir.display().to_string(),
                        })),
                    ),
                    Next::Restart,
                ),
                Err(e) => {
                    warn!("update rejected: {e}");
                    (engine_error(&e), Next::Continue)
                }
            }
        }
        CommandKind::Start => {
            let message = if engine.state() == EngineState::Ready {
                "already started"
            } else {
                "project started"
            };
            let reply = match engine.ensure_ready().await {
                Ok(()) => Reply::success(
                    message,
                    Some(json!({
                        "state": engine.state(),
                        "objects": engine.object_names(),
                    })),
                ),
                Err(e) => engine_error(&e),
            };
            (reply, Next::Continue)
        }
        CommandKind::Process => {
            let Some(params) = message.params.as_ref() else {
                return (
                    Reply::error(ErrorCode::MissingField, "process requires params"),
                    Next::Continue,
                );
            };
            if params.object.is_empty() || params.method.is_empty() {
                return (
                    Reply::error(
                        ErrorCode::InvalidParams,
                        "params.object and params.method must be non-empty",
                    ),
                    Next::Continue,
                );
            }
            if let Err(e) = engine.ensure_ready().await {
                return (engine_error(&e), Next::Continue);
            }
            let reply = match engine
                .dispatch(&params.object, &params.method, params.args.clone())
                .await
            {
                Ok(value) => Reply::success(
                    format!("{}.{} executed", params.object, params.method),
                    Some(value),
                ),
                Err(e) => {
                    info!("{}.{} failed: {e}", params.object, params.method);
                    engine_error(&e)
                }
            };
            (reply, Next::Continue)
        }
        CommandKind::Cleanup => {
            let report = engine.cleanup_on_disconnect().await;
            (
                Reply::success("cleanup finished", serde_json::to_value(report).ok()),
                Next::Continue,
            )
        }
        CommandKind::Ping => (Reply::success("pong", Some(engine.status())), Next::Continue),
    }
}
