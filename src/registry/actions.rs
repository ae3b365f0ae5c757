//! Action registry: numeric action ids mapped to local handlers

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

pub type ActionFn = dyn Fn(Value) -> Value + Send + Sync;

/// A handler for one platform action id
///
/// The value returned by the handler is reported back to the platform as the
/// action's result.
#[derive(Clone)]
pub struct ActionHandler {
    id: i64,
    handler: Arc<ActionFn>,
    log_on_invoke: bool,
}

impl ActionHandler {
    pub fn new<F>(id: i64, handler: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        Self {
            id,
            handler: Arc::new(handler),
            log_on_invoke: true,
        }
    }

    /// Disables the info line written on every invocation
    pub fn quiet(mut self) -> Self {
        self.log_on_invoke = false;
        self
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn log_on_invoke(&self) -> bool {
        self.log_on_invoke
    }

    pub fn invoke(&self, value: Value) -> Value {
        if self.log_on_invoke {
            info!("Action {} was called with the value: {}", self.id, value);
        }
        (self.handler)(value)
    }
}

impl fmt::Debug for ActionHandler {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ActionHandler")
            .field("id", &self.id)
            .field("log_on_invoke", &self.log_on_invoke)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Default, Debug)]
pub struct ActionRegistry {
    handlers: HashMap<i64, ActionHandler>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler; a later registration for the same id replaces the
    /// earlier one, which is returned.
    pub fn register(&mut self, handler: ActionHandler) -> Option<ActionHandler> {
        let previous = self.handlers.insert(handler.id, handler);
        if let Some(old) = &previous {
            warn!("Action {} registered twice, the last handler wins", old.id);
        }
        previous
    }

    pub fn get(&self, id: i64) -> Option<&ActionHandler> {
        self.handlers.get(&id)
    }

    pub fn contains(&self, id: i64) -> bool {
        self.handlers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered ids in ascending order
    pub fn ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.handlers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
