//! Supervisor: starts the worker and the gateway as separate processes,
//! restarts the worker when it exits and shuts both down on a signal.

use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Duration,
};

use botlink_ipc::socket::remove_stale_socket;
use nix::{
    sys::signal::{Signal, kill},
    unistd::Pid,
};
use thiserror::Error;
use tokio::{
    process::{Child, Command},
    time::Instant,
};
use tracing::{error, info, warn};

use crate::{config::Config, shutdown::Shutdown, worker::WorkerExit};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("cannot start {name}: {source}")]
    Spawn { name: &'static str, source: io::Error },
    #[error("lost track of {name}: {source}")]
    Wait { name: &'static str, source: io::Error },
    #[error("cannot locate the botlink executable: {0}")]
    CurrentExe(io::Error),
    #[error("gateway exited ({0}); not restarting it")]
    GatewayExited(ExitStatus),
}

/// How to start one child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildSpec {
    pub name: &'static str,
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl ChildSpec {
    /// Re-run this executable as `botlink <role>` with the same config.
    pub fn for_role(
        name: &'static str,
        config: Option<&Path>,
        log_path: Option<&Path>,
    ) -> Result<Self, SupervisorError> {
        let program = std::env::current_exe().map_err(SupervisorError::CurrentExe)?;
        let mut args = vec![OsString::from(name)];
        if let Some(config) = config {
            args.push("--config".into());
            args.push(config.into());
        }
        if let Some(log_path) = log_path {
            args.push("--log-path".into());
            args.push(log_path.into());
        }
        Ok(Self {
            name,
            program,
            args,
        })
    }

    fn spawn(&self) -> Result<Running, SupervisorError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                name: self.name,
                source,
            })?;
        info!(pid = ?child.id(), "started {}", self.name);
        Ok(Running {
            name: self.name,
            child,
            started: Instant::now(),
        })
    }
}

struct Running {
    name: &'static str,
    child: Child,
    started: Instant,
}

/// Exponential restart delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Exited with the reload status after installing a new project.
    Reload,
    /// Anything else: crash, signal, or an unexpected clean exit.
    Fault,
}

pub fn classify(status: ExitStatus) -> WorkerOutcome {
    match status.code().and_then(|c| WorkerExit::try_from(c).ok()) {
        Some(WorkerExit::Reload) => WorkerOutcome::Reload,
        _ => WorkerOutcome::Fault,
    }
}

async fn wait_running(running: &mut Option<Running>) -> io::Result<ExitStatus> {
    match running {
        Some(running) => running.child.wait().await,
        None => std::future::pending().await,
    }
}

pub struct Supervisor {
    worker: ChildSpec,
    gateway: ChildSpec,
    config: Config,
}

impl Supervisor {
    pub fn new(worker: ChildSpec, gateway: ChildSpec, config: Config) -> Self {
        Self {
            worker,
            gateway,
            config,
        }
    }

    /// Supervise until `shutdown` fires (`Ok`) or the gateway dies and is not
    /// to be restarted.
    pub async fn run(self, shutdown: Shutdown) -> Result<(), SupervisorError> {
        for socket in [&self.config.ipc.command_socket, &self.config.ipc.callback_socket] {
            if let Err(e) = remove_stale_socket(socket) {
                warn!("cannot remove stale socket {}: {e}", socket.display());
            }
        }

        let sup = &self.config.supervisor;
        let stable_after = Duration::from_millis(sup.stable_after_ms);
        let new_backoff = || {
            Backoff::new(
                Duration::from_millis(sup.backoff_initial_ms),
                Duration::from_millis(sup.backoff_max_ms),
            )
        };
        let mut backoff = new_backoff();
        let mut gateway_backoff = new_backoff();

        let mut worker = Some(self.worker.spawn()?);
        let mut gateway = match self.gateway.spawn() {
            Ok(gateway) => Some(gateway),
            Err(e) => {
                stop_children(vec![worker.take()], sup.shutdown_grace()).await;
                return Err(e);
            }
        };
        let mut retry_at = Instant::now();
        let mut gateway_retry_at = Instant::now();

        let result = loop {
            tokio::select! {
                () = shutdown.wait() => break Ok(()),

                () = tokio::time::sleep_until(retry_at), if worker.is_none() => {
                    match self.worker.spawn() {
                        Ok(running) => worker = Some(running),
                        Err(e) => {
                            error!("{e}");
                            retry_at = Instant::now() + backoff.next_delay();
                        }
                    }
                }

                status = wait_running(&mut worker), if worker.is_some() => {
                    let ran_for = worker.take().map(|w| w.started.elapsed()).unwrap_or_default();
                    let outcome = match status {
                        Ok(status) => {
                            let outcome = classify(status);
                            match outcome {
                                WorkerOutcome::Reload => info!("worker requested reload"),
                                WorkerOutcome::Fault => error!("worker exited unexpectedly ({status}) after {ran_for:?}"),
                            }
                            outcome
                        }
                        Err(e) => {
                            error!("lost track of worker: {e}");
                            WorkerOutcome::Fault
                        }
                    };
                    retry_at = match outcome {
                        WorkerOutcome::Reload => Instant::now(),
                        WorkerOutcome::Fault => {
                            if ran_for >= stable_after {
                                backoff.reset();
                            }
                            let delay = backoff.next_delay();
                            warn!("restarting worker in {delay:?}");
                            Instant::now() + delay
                        }
                    };
                }

                () = tokio::time::sleep_until(gateway_retry_at), if gateway.is_none() => {
                    match self.gateway.spawn() {
                        Ok(running) => gateway = Some(running),
                        Err(e) => {
                            error!("{e}");
                            gateway_retry_at = Instant::now() + gateway_backoff.next_delay();
                        }
                    }
                }

                status = wait_running(&mut gateway), if gateway.is_some() => {
                    let ran_for = gateway.take().map(|g| g.started.elapsed()).unwrap_or_default();
                    let status = match status {
                        Ok(status) => status,
                        Err(source) => {
                            break Err(SupervisorError::Wait { name: self.gateway.name, source });
                        }
                    };
                    if !sup.restart_gateway {
                        error!("gateway exited ({status})");
                        break Err(SupervisorError::GatewayExited(status));
                    }
                    if ran_for >= stable_after {
                        gateway_backoff.reset();
                    }
                    let delay = gateway_backoff.next_delay();
                    warn!("gateway exited ({status}), restarting in {delay:?}");
                    gateway_retry_at = Instant::now() + delay;
                }
            }
        };

        info!("stopping children");
        stop_children(vec![gateway, worker], sup.shutdown_grace()).await;
        result
    }
}

/// SIGTERM every child, give them `grace` in total, then kill what is left.
async fn stop_children(children: Vec<Option<Running>>, grace: Duration) {
    let mut children: Vec<Running> = children.into_iter().flatten().collect();
    for running in &children {
        let Some(pid) = running.child.id().and_then(|id| i32::try_from(id).ok()) else {
            continue;
        };
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            warn!("cannot signal {} ({pid}): {e}", running.name);
        }
    }

    let deadline = Instant::now() + grace;
    for running in &mut children {
        match tokio::time::timeout_at(deadline, running.child.wait()).await {
            Ok(Ok(status)) => info!("{} exited ({status})", running.name),
            Ok(Err(e)) => warn!("waiting for {}: {e}", running.name),
            Err(_) => {
                warn!("{} ignored SIGTERM, killing it", running.name);
                let _ = running.child.kill().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::process::ExitStatusExt;

    use super::*;

    #[test]
    fn backoff_doubles_up_to_max_and_resets() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        let delays: Vec<_> = (0..4).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, [100, 200, 350, 350]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn only_the_reload_status_is_a_reload() {
        // wait(2) status words: exit code in the high byte
        assert_eq!(classify(ExitStatus::from_raw(75 << 8)), WorkerOutcome::Reload);
        assert_eq!(classify(ExitStatus::from_raw(0)), WorkerOutcome::Fault);
        assert_eq!(classify(ExitStatus::from_raw(1 << 8)), WorkerOutcome::Fault);
        // killed by SIGKILL
        assert_eq!(classify(ExitStatus::from_raw(9)), WorkerOutcome::Fault);
    }

    #[test]
    fn role_children_rerun_this_binary_with_the_same_config() {
        let spec = ChildSpec::for_role("worker", Some(Path::new("/etc/botlink.toml")), None)
            .unwrap();
        assert_eq!(spec.name, "worker");
        assert_eq!(
            spec.args,
            [OsString::from("worker"), "--config".into(), "/etc/botlink.toml".into()]
        );
    }
}
