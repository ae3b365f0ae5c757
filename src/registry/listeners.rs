//! Field listeners and the broadcast listener
//!
//! A listener subscribes to a set of document fields. When the platform
//! pushes field changes, each listener only ever sees the fields it asked for.

use super::error::RegistrationError;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

pub type ListenerFn = dyn Fn(Map<String, Value>) + Send + Sync;
pub type BroadcastFn = dyn Fn(Value) + Send + Sync;

#[derive(Clone)]
pub struct Listener {
    fields: BTreeSet<String>,
    handler: Arc<ListenerFn>,
}

impl Listener {
    pub fn new<I, S, F>(fields: I, handler: F) -> Result<Self, RegistrationError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(Map<String, Value>) + Send + Sync + 'static,
    {
        let fields: BTreeSet<String> = fields.into_iter().map(Into::into).collect();
        if fields.is_empty() {
            return Err(RegistrationError::EmptyListener);
        }
        Ok(Self {
            fields,
            handler: Arc::new(handler),
        })
    }

    pub fn fields(&self) -> &BTreeSet<String> {
        &self.fields
    }

    /// The subset of `payload` this listener subscribed to
    pub fn select(&self, payload: &Map<String, Value>) -> Map<String, Value> {
        payload
            .iter()
            .filter(|(field, _)| self.fields.contains(field.as_str()))
            .map(|(field, value)| (field.clone(), value.clone()))
            .collect()
    }

    /// Invokes the handler with the intersecting fields, if there are any
    pub fn notify(&self, payload: &Map<String, Value>) -> bool {
        let selected = self.select(payload);
        if selected.is_empty() {
            return false;
        }
        (self.handler)(selected);
        true
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Listener")
            .field("fields", &self.fields)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Default)]
pub struct ListenerRegistry {
    listeners: Vec<Listener>,
    broadcast: Option<Arc<BroadcastFn>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, listener: Listener) {
        debug!("Registering listener on fields {:?}", listener.fields);
        self.listeners.push(listener);
    }

    /// Sets the broadcast handler. Returns true when an earlier one was replaced.
    pub fn set_broadcast<F>(&mut self, handler: F) -> bool
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let replaced = self.broadcast.replace(Arc::new(handler)).is_some();
        if replaced {
            warn!("Broadcast listener registered twice, the last handler wins");
        }
        replaced
    }

    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn has_broadcast(&self) -> bool {
        self.broadcast.is_some()
    }

    /// Sorted, deduplicated union of every listener's fields
    pub fn subscribed_fields(&self) -> Vec<String> {
        self.listeners
            .iter()
            .flat_map(|listener| listener.fields.iter().cloned())
            .collect::<BTreeSet<String>>()
            .into_iter()
            .collect()
    }

    /// Notifies every listener whose fields intersect `payload`; returns how
    /// many handlers ran.
    pub fn dispatch_fields(&self, payload: &Map<String, Value>) -> usize {
        self.listeners
            .iter()
            .filter(|listener| listener.notify(payload))
            .count()
    }

    pub fn dispatch_broadcast(&self, payload: Value) -> bool {
        match &self.broadcast {
            Some(handler) => {
                handler(payload);
                true
            }
            None => {
                debug!("Broadcast received without a broadcast listener, ignoring");
                false
            }
        }
    }
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.listeners)
            .field("broadcast", &self.broadcast.is_some())
            .finish()
    }
}
