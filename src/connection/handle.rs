//! Cloneable handle onto an object's current link
//!
//! Hooks receive one, and application code can get one from
//! [`AliotObject::handle`](crate::AliotObject::handle) to send updates or stop
//! the connection from another task or thread. Before the first `run()` (and
//! after a link closes) every send is a silent no-op.

use super::{ConnectionStatus, LinkShared, OutboundSender};
use crate::protocol::EventKind;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

#[derive(Clone)]
struct AttachedLink {
    shared: Arc<LinkShared>,
    outbound: OutboundSender,
}

struct HandleInner {
    name: String,
    object_id: String,
    link: RwLock<Option<AttachedLink>>,
}

#[derive(Clone)]
pub struct ObjectHandle {
    inner: Arc<HandleInner>,
}

impl ObjectHandle {
    /// A handle with no link attached yet
    pub fn detached(name: impl Into<String>, object_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                name: name.into(),
                object_id: object_id.into(),
                link: RwLock::new(None),
            }),
        }
    }

    pub(crate) fn attach(&self, shared: Arc<LinkShared>, outbound: OutboundSender) {
        let mut link = match self.inner.link.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *link = Some(AttachedLink { shared, outbound });
    }

    fn current(&self) -> Option<AttachedLink> {
        match self.inner.link.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn object_id(&self) -> &str {
        &self.inner.object_id
    }

    /// True while the platform considers the object connected
    pub fn is_connected(&self) -> bool {
        self.current()
            .map(|link| link.shared.is_logically_connected())
            .unwrap_or(false)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.current()
            .map(|link| link.shared.snapshot())
            .unwrap_or_default()
    }

    /// Resolves once the current link starts shutting down. Resolves
    /// immediately when no link is attached.
    pub async fn cancelled(&self) {
        if let Some(link) = self.current() {
            link.shared.shutdown_token().cancelled().await;
        }
    }

    /// Drops the logical connection, which closes the physical one. Calling it
    /// again, or on a closed link, does nothing.
    pub fn stop(&self) {
        match self.current() {
            Some(link) => {
                if link.shared.request_disconnect() {
                    info!("Stopping {}", self.inner.name);
                }
            }
            None => debug!("Stop requested for {} before it ever ran", self.inner.name),
        }
    }

    pub fn send(&self, event: EventKind, data: Value) {
        if let Some(link) = self.current() {
            link.outbound.send(event, data);
        }
    }

    pub fn update_component(&self, id: &str, value: Value) {
        if let Some(link) = self.current() {
            link.outbound.update_component(id, value);
        }
    }

    pub fn broadcast(&self, data: Value) {
        if let Some(link) = self.current() {
            link.outbound.broadcast(data);
        }
    }

    pub fn update_document(&self, fields: Map<String, Value>) {
        if let Some(link) = self.current() {
            link.outbound.update_document(fields);
        }
    }

    pub fn send_route(&self, route_path: &str, data: Value) {
        if let Some(link) = self.current() {
            link.outbound.send_route(route_path, data);
        }
    }

    pub fn send_action(&self, target_id: &str, action_id: i64, value: Option<Value>) {
        if let Some(link) = self.current() {
            link.outbound.send_action(target_id, action_id, value);
        }
    }
}

impl fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ObjectHandle")
            .field("name", &self.inner.name)
            .field("object_id", &self.inner.object_id)
            .field("status", &self.status())
            .finish()
    }
}
