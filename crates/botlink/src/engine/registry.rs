use std::{collections::BTreeMap, sync::Arc};

use serde_json::{Map, Value};

use super::EngineError;
use crate::store::ProjectLayout;

/// Cleanup entry point exposed by loaded code. May be called once per
/// client disconnect, so it must tolerate repeat calls.
pub type StopHook = Arc<dyn Fn() -> Result<(), String> + Send + Sync>;

/// A named instance exposed by the loaded project.
pub trait ProjectObject: Send + Sync {
    fn methods(&self) -> Vec<String>;

    fn has_method(&self, method: &str) -> bool {
        self.methods().iter().any(|m| m == method)
    }

    /// Invoke `method` with keyword arguments. Errors are whatever the
    /// loaded code raised, rendered as text.
    fn call(&self, method: &str, args: &Map<String, Value>)
    -> Result<Value, String>;

    /// Probe for the optional `stop` convention.
    fn stop_hook(&self) -> Option<StopHook> {
        None
    }
}

/// What a successful load hands to the engine.
pub struct LoadedProject {
    pub objects: BTreeMap<String, Arc<dyn ProjectObject>>,
    /// Module-level `stop`, if the project defines one.
    pub module_stop: Option<StopHook>,
}

/// Turns a project directory into live objects. Runs on a blocking thread.
pub trait ProjectLoader: Send + Sync {
    fn load(&self, layout: &ProjectLayout) -> Result<LoadedProject, EngineError>;
}

/// Name-keyed view of the loaded project. Filled on load, emptied only by a
/// process restart.
#[derive(Default)]
pub struct ObjectRegistry {
    objects: BTreeMap<String, Arc<dyn ProjectObject>>,
    module_stop: Option<StopHook>,
}

impl ObjectRegistry {
    pub fn install(&mut self, project: LoadedProject) {
        self.objects = project.objects;
        self.module_stop = project.module_stop;
    }

    pub fn clear(&mut self) {
        self.objects.clear();
        self.module_stop = None;
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ProjectObject>> {
        self.objects.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.objects.keys().cloned().collect()
    }

    /// Object stop hooks in name order.
    pub fn stop_hooks(&self) -> Vec<(String, StopHook)> {
        self.objects
            .iter()
            .filter_map(|(name, obj)| obj.stop_hook().map(|h| (name.clone(), h)))
            .collect()
    }

    pub fn module_stop(&self) -> Option<StopHook> {
        self.module_stop.clone()
    }
}
