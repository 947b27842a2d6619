//! Rhai projects.
//!
//! The entry script's top level runs once. Every top-level variable holding
//! an object map with function-pointer properties becomes a registry object;
//! those properties are its methods and run with `this` bound to the map, so
//! state survives between calls. An optional `fn init()` runs after the top
//! level, `fn stop()` is the module stop hook and an object's `stop` property
//! is its stop hook.
//!
//! Scripts get these natives on top of the Rhai standard library:
//!
//! | function                 | effect                                         |
//! |--------------------------|------------------------------------------------|
//! | `push(event[, data])`    | emit a Callback Channel event                  |
//! | `start_task(fn[, args])` | start a background task, returns its id        |
//! | `cancel(id)`             | signal a task                                  |
//! | `task_running(id)`       | whether a task is still alive                  |
//! | `cancelled()`            | inside a task: whether it has been cancelled   |
//! | `sleep(ms)`              | sleep, returning early (false) on cancellation |
//! | `send_agent(line)`       | send one line to the robot's control agent     |
//!
//! `spawn` would be the obvious name for the task native, but Rhai reserves
//! it (along with `thread`, `go` and `sync`), so scripts using it fail to
//! parse.

use std::{
    collections::BTreeMap,
    io::Write,
    net::{SocketAddr, TcpStream},
    sync::{Arc, OnceLock, Weak},
    time::Duration,
};

use botlink_ipc::callback::CallbackPublisher;
use parking_lot::Mutex;
use rhai::{
    AST, Array, CallFnOptions, Dynamic, EvalAltResult, FnPtr, INT,
    ImmutableString, Map as RhaiMap, Scope,
    module_resolvers::FileModuleResolver,
};
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::{
    EngineError,
    registry::{LoadedProject, ProjectLoader, ProjectObject, StopHook},
    tasks::{
        OwnerScope, TaskId, TaskRegistry, cancellable_sleep, current_token,
        task_body,
    },
};
use crate::store::ProjectLayout;

const AGENT_TIMEOUT: Duration = Duration::from_millis(200);

/// Parser nesting limits, top level and inside functions. Rhai's defaults
/// vary by build profile (32/16 in debug).
const MAX_EXPR_DEPTH: usize = 128;
const MAX_FN_EXPR_DEPTH: usize = 64;

type RhaiResult<T> = Result<T, Box<EvalAltResult>>;

/// Everything loaded code can reach outside the interpreter.
struct Host {
    publisher: CallbackPublisher,
    tasks: Arc<TaskRegistry>,
    agent_endpoint: Option<SocketAddr>,
}

impl Host {
    fn push(&self, event: &str, data: &Dynamic) -> RhaiResult<()> {
        let data = to_json(data).map_err(|e| format!("push({event:?}): {e}"))?;
        let delivered = self.publisher.publish(event, data);
        debug!(event, delivered, "push");
        Ok(())
    }

    fn send_agent(&self, line: &str) -> bool {
        let Some(addr) = self.agent_endpoint else {
            debug!("no agent endpoint configured, dropping {line:?}");
            return false;
        };
        let mut stream = match TcpStream::connect_timeout(&addr, AGENT_TIMEOUT) {
            Ok(stream) => stream,
            Err(e) => {
                debug!("agent at {addr} unreachable: {e}");
                return false;
            }
        };
        let _ = stream.set_write_timeout(Some(AGENT_TIMEOUT));
        stream.write_all(format!("{line}\n").as_bytes()).is_ok()
    }
}

/// Weak so the natives registered on an engine do not keep it alive.
#[derive(Clone)]
struct WeakRuntime {
    engine: Weak<rhai::Engine>,
    ast: Arc<AST>,
}

#[derive(Clone)]
struct Runtime {
    engine: Arc<rhai::Engine>,
    ast: Arc<AST>,
}

impl Runtime {
    /// Call a function pointer, prepending its curried (captured) values.
    fn call(
        &self,
        f: &FnPtr,
        this: Option<&mut Dynamic>,
        args: Vec<Dynamic>,
    ) -> RhaiResult<Dynamic> {
        call_fn_ptr(&self.engine, &self.ast, f, this, args)
    }

    fn has_fn(&self, name: &str, arity: usize) -> bool {
        self.ast
            .iter_functions()
            .any(|f| f.name == name && f.params.len() == arity)
    }

    fn call_module_fn(&self, name: &str) -> RhaiResult<Dynamic> {
        // the top level already ran; never evaluate it again
        let options = CallFnOptions::new().eval_ast(false).rewind_scope(true);
        self.engine.call_fn_with_options::<Dynamic>(
            options,
            &mut Scope::new(),
            &self.ast,
            name,
            (),
        )
    }
}

fn call_fn_ptr(
    engine: &rhai::Engine,
    ast: &AST,
    f: &FnPtr,
    this: Option<&mut Dynamic>,
    args: Vec<Dynamic>,
) -> RhaiResult<Dynamic> {
    let mut full: Vec<Dynamic> = f.curry().to_vec();
    full.extend(args);
    let options = CallFnOptions::new().eval_ast(false).rewind_scope(true);
    let options = match this {
        Some(this) => options.bind_this_ptr(this),
        None => options,
    };
    engine.call_fn_with_options::<Dynamic>(
        options,
        &mut Scope::new(),
        ast,
        f.fn_name(),
        full,
    )
}

/// Loads `.rhai` projects.
pub struct RhaiLoader {
    host: Arc<Host>,
}

impl RhaiLoader {
    pub fn new(
        publisher: CallbackPublisher,
        tasks: Arc<TaskRegistry>,
        agent_endpoint: Option<SocketAddr>,
    ) -> Self {
        Self {
            host: Arc::new(Host {
                publisher,
                tasks,
                agent_endpoint,
            }),
        }
    }

    fn build_engine(
        &self,
        layout: &ProjectLayout,
        slot: &Arc<OnceLock<WeakRuntime>>,
    ) -> rhai::Engine {
        let mut engine = rhai::Engine::new();
        engine.set_max_expr_depths(MAX_EXPR_DEPTH, MAX_FN_EXPR_DEPTH);
        engine.set_module_resolver(FileModuleResolver::new_with_path(layout.root.clone()));
        engine.on_print(|s| info!(target: "project", "{s}"));
        engine.on_debug(|s, source, pos| {
            debug!(target: "project", "[{}:{pos}] {s}", source.unwrap_or("main"));
        });

        let host = Arc::clone(&self.host);
        engine.register_fn("push", move |event: ImmutableString| {
            host.push(&event, &Dynamic::UNIT)
        });
        let host = Arc::clone(&self.host);
        engine.register_fn(
            "push",
            move |event: ImmutableString, data: Dynamic| host.push(&event, &data),
        );

        let (host, slot_) = (Arc::clone(&self.host), Arc::clone(slot));
        engine.register_fn("start_task", move |f: FnPtr| {
            spawn_task(&host.tasks, &slot_, f, Vec::new())
        });
        let (host, slot_) = (Arc::clone(&self.host), Arc::clone(slot));
        engine.register_fn("start_task", move |f: FnPtr, args: Array| {
            spawn_task(&host.tasks, &slot_, f, args)
        });

        let host = Arc::clone(&self.host);
        engine.register_fn("cancel", move |id: INT| {
            TaskId::try_from(id).is_ok_and(|id| host.tasks.cancel(id))
        });
        let host = Arc::clone(&self.host);
        engine.register_fn("task_running", move |id: INT| {
            TaskId::try_from(id).is_ok_and(|id| host.tasks.is_running(id))
        });
        engine.register_fn("cancelled", || {
            current_token().is_some_and(|t| t.is_cancelled())
        });
        engine.register_fn("sleep", |ms: INT| {
            cancellable_sleep(Duration::from_millis(u64::try_from(ms).unwrap_or(0)))
        });

        let host = Arc::clone(&self.host);
        engine.register_fn("send_agent", move |line: ImmutableString| {
            host.send_agent(&line)
        });

        engine
    }
}

fn spawn_task(
    tasks: &Arc<TaskRegistry>,
    slot: &OnceLock<WeakRuntime>,
    f: FnPtr,
    args: Array,
) -> RhaiResult<INT> {
    let Some(runtime) = slot.get().cloned() else {
        return Err("start_task is not available yet".into());
    };
    let label = if f.is_anonymous() {
        "closure".to_string()
    } else {
        f.fn_name().to_string()
    };
    let body = task_body(move |_token| {
        let engine = runtime
            .engine
            .upgrade()
            .ok_or("project is no longer loaded")?;
        let result = call_fn_ptr(&engine, &runtime.ast, &f, None, args)
            .map_err(|e| e.to_string())?;
        to_json(&result)
    });
    Ok(INT::try_from(tasks.spawn(label, body)).unwrap_or(INT::MAX))
}

impl ProjectLoader for RhaiLoader {
    fn load(&self, layout: &ProjectLayout) -> Result<LoadedProject, EngineError> {
        let slot = Arc::new(OnceLock::new());
        let engine = self.build_engine(layout, &slot);

        let ast = engine
            .compile_file(layout.entry.clone())
            .map_err(|e| EngineError::LoadError(e.to_string()))?;
        let runtime = Runtime {
            engine: Arc::new(engine),
            ast: Arc::new(ast),
        };
        let _ = slot.set(WeakRuntime {
            engine: Arc::downgrade(&runtime.engine),
            ast: Arc::clone(&runtime.ast),
        });

        let mut scope = Scope::new();
        runtime
            .engine
            .run_ast_with_scope(&mut scope, &runtime.ast)
            .map_err(|e| EngineError::LoadError(e.to_string()))?;
        if runtime.has_fn("init", 0) {
            runtime
                .call_module_fn("init")
                .map_err(|e| EngineError::LoadError(format!("init(): {e}")))?;
        }

        let mut objects: BTreeMap<String, Arc<dyn ProjectObject>> = BTreeMap::new();
        for (name, _is_const, value) in scope.iter_raw() {
            let methods = method_names(value);
            if methods.is_empty() {
                continue;
            }
            debug!(object = name, ?methods, "registered object");
            objects.insert(
                name.to_string(),
                Arc::new(ScriptObject {
                    name: name.to_string(),
                    this: Arc::new(Mutex::new(value.clone())),
                    runtime: runtime.clone(),
                }),
            );
        }

        let module_stop = runtime.has_fn("stop", 0).then(|| {
            let runtime = runtime.clone();
            let hook: StopHook = Arc::new(move || {
                runtime
                    .call_module_fn("stop")
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            });
            hook
        });

        Ok(LoadedProject {
            objects,
            module_stop,
        })
    }
}

/// Properties of an object map that hold function pointers.
fn method_names(value: &Dynamic) -> Vec<String> {
    let Some(map) = value.flatten_clone().try_cast::<RhaiMap>() else {
        return Vec::new();
    };
    map.iter()
        .filter(|(_, v)| v.flatten_clone().is::<FnPtr>())
        .map(|(k, _)| k.to_string())
        .collect()
}

struct ScriptObject {
    name: String,
    /// The object map itself; methods mutate it through `this`.
    this: Arc<Mutex<Dynamic>>,
    runtime: Runtime,
}

impl ScriptObject {
    fn method_ptr(this: &Dynamic, method: &str) -> Option<FnPtr> {
        this.flatten_clone()
            .try_cast::<RhaiMap>()?
            .get(method)?
            .flatten_clone()
            .try_cast::<FnPtr>()
    }

    /// Order JSON keyword arguments by the target function's parameter
    /// names. Captured values fill the leading parameters of a closure.
    fn bind_args(
        &self,
        f: &FnPtr,
        args: &Map<String, Value>,
    ) -> Result<Vec<Dynamic>, String> {
        let curried = f.curry().len();
        let candidates: Vec<Vec<&str>> = self
            .runtime
            .ast
            .iter_functions()
            .filter(|meta| meta.name == f.fn_name() && meta.params.len() >= curried)
            .map(|meta| meta.params[curried..].to_vec())
            .collect();
        if candidates.is_empty() {
            return Err(format!("function {} is not defined", f.fn_name()));
        }

        let params = candidates
            .iter()
            .filter(|params| args.keys().all(|k| params.contains(&k.as_str())))
            .min_by_key(|params| params.len())
            .ok_or_else(|| {
                let known = candidates.concat().join(", ");
                let unknown: Vec<&str> = args
                    .keys()
                    .map(String::as_str)
                    .filter(|k| !candidates.iter().any(|p| p.contains(k)))
                    .collect();
                format!(
                    "unexpected argument(s) {} (parameters: {known})",
                    unknown.join(", ")
                )
            })?;

        params
            .iter()
            .map(|p| match args.get(*p) {
                Some(v) => rhai::serde::to_dynamic(v).map_err(|e| e.to_string()),
                None => Ok(Dynamic::UNIT),
            })
            .collect()
    }
}

impl ProjectObject for ScriptObject {
    fn methods(&self) -> Vec<String> {
        method_names(&self.this.lock())
    }

    fn has_method(&self, method: &str) -> bool {
        Self::method_ptr(&self.this.lock(), method).is_some()
    }

    fn call(&self, method: &str, args: &Map<String, Value>) -> Result<Value, String> {
        let _owner = OwnerScope::enter(&self.name);
        let mut this = self.this.lock();
        let f = Self::method_ptr(&this, method)
            .ok_or_else(|| format!("{}.{method} is not a method", self.name))?;
        let bound = self.bind_args(&f, args)?;
        let result = self
            .runtime
            .call(&f, Some(&mut this), bound)
            .map_err(|e| e.to_string())?;
        to_json(&result)
    }

    fn stop_hook(&self) -> Option<StopHook> {
        Self::method_ptr(&self.this.lock(), "stop")?;
        let (name, this, runtime) =
            (self.name.clone(), Arc::clone(&self.this), self.runtime.clone());
        Some(Arc::new(move || {
            let _owner = OwnerScope::enter(&name);
            let mut this = this.lock();
            let f = Self::method_ptr(&this, "stop")
                .ok_or_else(|| format!("{name}.stop was removed"))?;
            runtime
                .call(&f, Some(&mut this), Vec::new())
                .map(|_| ())
                .map_err(|e| e.to_string())
        }))
    }
}

fn to_json(value: &Dynamic) -> Result<Value, String> {
    serde_json::to_value(value)
        .map_err(|e| format!("value cannot be represented as JSON: {e}"))
}
