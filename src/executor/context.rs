// Execution context for tasks

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::inventory::Host;
use crate::parser::ast::Value;

/// Variable-binding context for one host.
///
/// Built once per host before the host's first task. Play vars and host
/// facts are read-only for the whole play; registered results are shared
/// between clones so later tasks see what earlier tasks registered.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// The target host
    pub host: Arc<Host>,
    play_vars: Arc<HashMap<String, Value>>,
    /// Registered results from previous tasks on this host
    registered: Arc<RwLock<HashMap<String, Value>>>,
    /// Bindings scoped to one evaluation (loop var, `result`, `output`)
    locals: HashMap<String, Value>,
    /// Current loop item (if in a loop)
    pub loop_item: Option<Value>,
    /// Current loop index (if in a loop)
    pub loop_index: Option<usize>,
}

impl ExecutionContext {
    pub fn new(host: Arc<Host>, play_vars: Arc<HashMap<String, Value>>) -> Self {
        ExecutionContext {
            host,
            play_vars,
            registered: Arc::new(RwLock::new(HashMap::new())),
            locals: HashMap::new(),
            loop_item: None,
            loop_index: None,
        }
    }

    pub fn host_name(&self) -> &str {
        &self.host.name
    }

    /// Clone for one loop iteration, binding the item under `loop_var`
    pub fn with_loop_item(&self, loop_var: &str, item: Value, index: usize) -> Self {
        let mut ctx = self.clone();
        ctx.locals.insert(loop_var.to_string(), item.clone());
        ctx.loop_item = Some(item);
        ctx.loop_index = Some(index);
        ctx
    }

    /// Bind a value for the current evaluation only
    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.locals.insert(name.into(), value);
    }

    /// Register a task result for the rest of the play
    pub fn register(&self, name: impl Into<String>, value: Value) {
        self.registered.write().insert(name.into(), value);
    }

    pub fn get_registered(&self, name: &str) -> Option<Value> {
        self.registered.read().get(name).cloned()
    }

    /// Look up a top-level name.
    ///
    /// Order: evaluation locals, registered results, host facts, play
    /// vars, then the built-in host bindings.
    pub fn get_var(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.locals.get(name) {
            return Some(v.clone());
        }
        if let Some(v) = self.registered.read().get(name) {
            return Some(v.clone());
        }
        if let Some(v) = self.host.facts.get(name) {
            return Some(v.clone());
        }
        if let Some(v) = self.play_vars.get(name) {
            return Some(v.clone());
        }

        match name {
            "inventory_hostname" => Some(Value::String(self.host.name.clone())),
            "groups" | "group_names" => Some(Value::List(
                self.host
                    .groups
                    .iter()
                    .map(|g| Value::String(g.clone()))
                    .collect(),
            )),
            "facts" => Some(Value::Dict(self.host.facts.clone())),
            "vars" => Some(Value::Dict((*self.play_vars).clone())),
            _ => None,
        }
    }

    /// Get a nested variable value (e.g., "result.stdout")
    pub fn get_nested_var(&self, path: &[String]) -> Option<Value> {
        let (first, rest) = path.split_first()?;
        let mut current = self.get_var(first)?;

        for part in rest {
            current = match current {
                Value::Dict(ref map) => map.get(part).cloned()?,
                Value::List(ref list) => {
                    let idx: usize = part.parse().ok()?;
                    list.get(idx).cloned()?
                }
                _ => return None,
            };
        }

        Some(current)
    }
}
