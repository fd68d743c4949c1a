//! Named callables that tasks refer to by `function_name`.

use super::task::TaskArgs;
use crate::error::TaskError;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub type TaskOutcome = Result<Value, TaskError>;

/// A registered task body.
pub type TaskFn = Arc<dyn Fn(&TaskArgs) -> TaskOutcome + Send + Sync + 'static>;

#[derive(Default)]
pub struct FunctionRegistry {
    functions: RwLock<HashMap<String, TaskFn>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `f` under `name`. An existing entry is replaced and returned.
    pub fn register<F>(&self, name: impl Into<String>, f: F) -> Option<TaskFn>
    where
        F: Fn(&TaskArgs) -> TaskOutcome + Send + Sync + 'static,
    {
        let name = name.into();
        let previous = self.functions.write().insert(name.clone(), Arc::new(f));
        if previous.is_some() {
            tracing::debug!(function = %name, "replaced task function");
        } else {
            tracing::debug!(function = %name, "registered task function");
        }
        previous
    }

    pub fn get(&self, name: &str) -> Option<TaskFn> {
        self.functions.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.functions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.read().is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}
