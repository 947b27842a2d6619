//! Worker Execution Engine.
//!
//! Owns the project store and the object registry and moves through
//! `Empty -> Loading -> Ready`. A successful `swap` ends in `Reloading`: the
//! worker then exits and the supervisor starts a fresh process, because
//! loaded code is never unloaded in place.

pub mod registry;
pub mod script;
pub mod tasks;

use std::{path::PathBuf, sync::Arc, time::Duration};

use botlink_ipc::ErrorCode;
use serde::Serialize;
use serde_json::{Map, Value, json};
use strum::Display;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use self::{
    registry::{ObjectRegistry, ProjectLoader, StopHook},
    tasks::TaskRegistry,
};
use crate::{
    config::WorkerConfig,
    store::{ProjectStore, StoreError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EngineState {
    Empty,
    Loading,
    Ready,
    Reloading,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid project: {0}")]
    InvalidProject(String),
    #[error("project failed to load: {0}")]
    LoadError(String),
    #[error("no project is loaded")]
    NotReady,
    #[error("object {0:?} not found")]
    ObjectNotFound(String),
    #[error("object {object:?} has no method {method:?}")]
    MethodNotFound { object: String, method: String },
    #[error("execution failed: {0}")]
    ExecutionError(String),
    /// Reported only. The call is not interrupted and keeps running.
    #[error("method did not return within {0:?}; it was left running")]
    ExecutionTimeout(Duration),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::InvalidProject(_) => ErrorCode::InvalidProject,
            EngineError::LoadError(_) => ErrorCode::LoadFailed,
            EngineError::NotReady => ErrorCode::NoProjectLoaded,
            EngineError::ObjectNotFound(_) => ErrorCode::ObjectNotFound,
            EngineError::MethodNotFound { .. } => ErrorCode::MethodNotFound,
            EngineError::ExecutionError(_) => ErrorCode::ExecutionFailed,
            EngineError::ExecutionTimeout(_) => ErrorCode::ExecutionTimeout,
            EngineError::Store(e) => e.code(),
            EngineError::Internal(_) => ErrorCode::Internal,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub stop_hooks_run: usize,
    pub stop_hooks_failed: usize,
    pub tasks_signalled: usize,
    pub tasks_still_running: usize,
    pub elapsed_ms: u64,
}

pub struct Engine {
    store: ProjectStore,
    loader: Arc<dyn ProjectLoader>,
    tasks: Arc<TaskRegistry>,
    registry: ObjectRegistry,
    state: EngineState,
    execution_budget: Duration,
    stop_grace: Duration,
}

impl Engine {
    pub fn new(
        store: ProjectStore,
        loader: Arc<dyn ProjectLoader>,
        tasks: Arc<TaskRegistry>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            store,
            loader,
            tasks,
            registry: ObjectRegistry::default(),
            state: EngineState::Empty,
            execution_budget: config.execution_budget(),
            stop_grace: config.stop_grace(),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn object_names(&self) -> Vec<String> {
        self.registry.names()
    }

    pub fn tasks(&self) -> &Arc<TaskRegistry> {
        &self.tasks
    }

    pub fn store(&self) -> &ProjectStore {
        &self.store
    }

    pub fn status(&self) -> Value {
        json!({
            "state": self.state,
            "objects": self.registry.names(),
            "running_tasks": self.tasks.running_count(),
        })
    }

    /// Execute the current project's entry code and fill the registry.
    pub async fn load(&mut self) -> Result<(), EngineError> {
        if self.state == EngineState::Reloading {
            return Err(EngineError::NotReady);
        }
        self.state = EngineState::Loading;
        self.registry.clear();

        let result = self.run_loader().await;
        match result {
            Ok(project) if project.objects.is_empty() => {
                self.state = EngineState::Empty;
                self.tasks.cancel_all();
                Err(EngineError::InvalidProject(
                    "entry code exposes no objects".into(),
                ))
            }
            Ok(project) => {
                self.registry.install(project);
                self.state = EngineState::Ready;
                info!(objects = ?self.registry.names(), "project loaded");
                self.launch_pending();
                Ok(())
            }
            Err(e) => {
                self.state = EngineState::Empty;
                self.tasks.cancel_all();
                warn!("load failed: {e}");
                Err(e)
            }
        }
    }

    async fn run_loader(&self) -> Result<registry::LoadedProject, EngineError> {
        let layout = match self.store.current_layout() {
            Ok(layout) => layout,
            Err(StoreError::InvalidProject(msg)) => {
                return Err(EngineError::InvalidProject(msg));
            }
            Err(e) => return Err(e.into()),
        };
        let loader = Arc::clone(&self.loader);
        let handle = tokio::task::spawn_blocking(move || loader.load(&layout));
        match tokio::time::timeout(self.execution_budget, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(_join)) => {
                Err(EngineError::LoadError("entry code panicked".into()))
            }
            Err(_) => Err(EngineError::LoadError(format!(
                "entry code did not finish within {:?}",
                self.execution_budget
            ))),
        }
    }

    /// Start the tasks recorded while the last command ran. Outside `Ready`
    /// they can only come from abandoned code, such as a loader that overran
    /// its budget, and are dropped instead.
    pub fn launch_pending(&self) -> usize {
        if self.state == EngineState::Ready {
            return self.tasks.launch_pending();
        }
        let dropped = self.tasks.drop_pending();
        if dropped > 0 {
            warn!(dropped, state = %self.state, "discarded tasks started outside a loaded project");
        }
        0
    }

    /// Seed `current` from `default` if needed, then load. No-op when ready.
    pub async fn ensure_ready(&mut self) -> Result<(), EngineError> {
        match self.state {
            EngineState::Ready => return Ok(()),
            EngineState::Reloading => return Err(EngineError::NotReady),
            EngineState::Empty | EngineState::Loading => {}
        }
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.bootstrap_current())
            .await
            .map_err(|e| EngineError::Internal(e.to_string()))??;
        self.load().await
    }

    /// Look up `object.method` and run it on the blocking pool.
    ///
    /// The execution budget only bounds how long we wait: a call that runs
    /// over is reported as `ExecutionTimeout` and left to finish on its own.
    pub async fn dispatch(
        &self,
        object: &str,
        method: &str,
        args: Map<String, Value>,
    ) -> Result<Value, EngineError> {
        if self.state != EngineState::Ready {
            return Err(EngineError::NotReady);
        }
        let obj = self
            .registry
            .get(object)
            .ok_or_else(|| EngineError::ObjectNotFound(object.to_string()))?;
        if !obj.has_method(method) {
            return Err(EngineError::MethodNotFound {
                object: object.to_string(),
                method: method.to_string(),
            });
        }

        let method_name = method.to_string();
        let call = tokio::task::spawn_blocking(move || obj.call(&method_name, &args));
        match tokio::time::timeout(self.execution_budget, call).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(raised))) => Err(EngineError::ExecutionError(raised)),
            Ok(Err(join)) => Err(EngineError::ExecutionError(if join.is_panic() {
                format!("{object}.{method} panicked")
            } else {
                format!("{object}.{method} was aborted")
            })),
            Err(_) => {
                warn!(
                    "{object}.{method} exceeded {:?}, leaving it running",
                    self.execution_budget
                );
                Err(EngineError::ExecutionTimeout(self.execution_budget))
            }
        }
    }

    /// Install `archive` as the new `current` project. On success the engine
    /// is `Reloading` and the process must be restarted to pick it up.
    pub async fn swap(&mut self, archive: Vec<u8>) -> Result<PathBuf, EngineError> {
        if self.state == EngineState::Reloading {
            return Err(EngineError::NotReady);
        }
        let store = self.store.clone();
        let installed = tokio::task::spawn_blocking(move || {
            let staged = store.extract(&archive)?;
            store.replace_current(staged)
        })
        .await
        .map_err(|e| EngineError::Internal(e.to_string()))??;
        self.state = EngineState::Reloading;
        info!("new project installed at {}", installed.display());
        Ok(installed)
    }

    /// Quiesce after a client leaves: object `stop` hooks, then the module
    /// `stop`, then cancel every task. The registry and loaded code stay, so
    /// the next client does not pay for a reload.
    pub async fn cleanup_on_disconnect(&self) -> CleanupReport {
        let started = Instant::now();
        let mut report = CleanupReport::default();

        let hooks = self
            .registry
            .stop_hooks()
            .into_iter()
            .map(|(name, hook)| (format!("{name}.stop"), hook))
            .chain(self.registry.module_stop().map(|h| ("stop".to_string(), h)));
        for (label, hook) in hooks {
            if run_stop_hook(&label, hook, self.stop_grace).await {
                report.stop_hooks_run += 1;
            } else {
                report.stop_hooks_failed += 1;
            }
        }

        report.tasks_signalled = self.tasks.cancel_all();
        report.tasks_still_running = self.tasks.wait_idle(self.stop_grace).await;
        if report.tasks_still_running > 0 {
            warn!(
                "{} task(s) ignored cancellation, abandoning them",
                report.tasks_still_running
            );
        }
        report.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(?report, "cleanup finished");
        report
    }
}

async fn run_stop_hook(label: &str, hook: StopHook, grace: Duration) -> bool {
    let handle = tokio::task::spawn_blocking(move || hook());
    match tokio::time::timeout(grace, handle).await {
        Ok(Ok(Ok(()))) => true,
        Ok(Ok(Err(e))) => {
            warn!("{label} failed: {e}");
            false
        }
        Ok(Err(_join)) => {
            warn!("{label} panicked");
            false
        }
        Err(_) => {
            warn!("{label} did not return within {grace:?}");
            false
        }
    }
}
