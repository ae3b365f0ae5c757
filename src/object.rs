//! The object facade: registration, `run()`, outbound helpers, document reads
//!
//! ```rust,no_run
//! use aliot::{AliotObject, ObjectConfig};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), aliot::AliotError> {
//! let config = ObjectConfig::new("ws://localhost:8881", "http://localhost:8000", "obj-id");
//! let mut lamp = AliotObject::new("lamp", config)?;
//!
//! lamp.register_action(1, |value| json!({ "echo": value }));
//! lamp.register_listener(["brightness"], |fields| println!("{fields:?}"))?;
//! lamp.main_loop(None, |handle| {
//!     handle.update_component("status", json!("on"));
//!     std::thread::sleep(std::time::Duration::from_secs(1));
//! })?;
//!
//! lamp.run().await?;
//! # Ok(())
//! # }
//! ```

use crate::config::{ConfigProvider, ObjectConfig};
use crate::connection::link::Link;
use crate::connection::session::Session;
use crate::connection::{ConnectionStatus, LinkShared, ObjectHandle, OutboundSender};
use crate::document::DocumentClient;
use crate::error::AliotError;
use crate::protocol::{Codec, JsonCodec};
use crate::registry::{
    ActionHandler, ActionRegistry, HookGuard, HookSlot, Listener, ListenerRegistry, Registries,
};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

pub struct AliotObject {
    name: String,
    config: ObjectConfig,
    codec: Arc<dyn Codec>,
    registries: Registries,
    handle: ObjectHandle,
    documents: DocumentClient,
}

impl AliotObject {
    pub fn new(name: impl Into<String>, config: ObjectConfig) -> Result<Self, AliotError> {
        let name = name.into();
        let documents = DocumentClient::new(&config)?;
        let handle = ObjectHandle::detached(name.clone(), config.object_id.clone());
        debug!("Created object {} ({})", name, config.object_id);
        Ok(Self {
            name,
            config,
            codec: Arc::new(JsonCodec),
            registries: Registries::default(),
            handle,
            documents,
        })
    }

    /// Builds an object from its section of a configuration provider
    pub fn from_provider(
        name: impl Into<String>,
        provider: &dyn ConfigProvider,
    ) -> Result<Self, AliotError> {
        let name = name.into();
        let config = ObjectConfig::resolve(provider, &name)?;
        Self::new(name, config)
    }

    pub fn with_codec<C: Codec + 'static>(mut self, codec: C) -> Self {
        self.set_codec(codec);
        self
    }

    /// Replaces the codec used by subsequent runs
    pub fn set_codec<C: Codec + 'static>(&mut self, codec: C) {
        self.codec = Arc::new(codec);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn object_id(&self) -> &str {
        &self.config.object_id
    }

    pub fn config(&self) -> &ObjectConfig {
        &self.config
    }

    pub fn actions(&self) -> &ActionRegistry {
        &self.registries.actions
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.registries.listeners
    }

    /// A cloneable handle for sending and stopping from other tasks/threads
    pub fn handle(&self) -> ObjectHandle {
        self.handle.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.handle.status()
    }

    /// Registers `handler` for action `id`, logging every invocation. A second
    /// registration for the same id replaces the first.
    pub fn register_action<F>(&mut self, id: i64, handler: F)
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.register_action_handler(ActionHandler::new(id, handler));
    }

    pub fn register_action_handler(&mut self, handler: ActionHandler) {
        self.registries.actions.register(handler);
    }

    pub fn register_listener<I, S, F>(&mut self, fields: I, handler: F) -> Result<(), AliotError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(Map<String, Value>) + Send + Sync + 'static,
    {
        let listener = Listener::new(fields, handler)?;
        self.registries.listeners.register(listener);
        Ok(())
    }

    pub fn register_broadcast_listener<F>(&mut self, handler: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.registries.listeners.set_broadcast(handler);
    }

    /// Runs on a worker once the platform has acknowledged the object
    pub fn on_start<F>(&mut self, callback: F) -> Result<HookGuard, AliotError>
    where
        F: Fn(&ObjectHandle) + Send + Sync + 'static,
    {
        Ok(self.registries.hooks.register(HookSlot::OnStart, callback)?)
    }

    /// Repeats `body` on the on-start worker while the object is connected,
    /// at most `repetitions` times when given. Takes the on-start slot.
    pub fn main_loop<F>(
        &mut self,
        repetitions: Option<usize>,
        body: F,
    ) -> Result<HookGuard, AliotError>
    where
        F: Fn(&ObjectHandle) + Send + Sync + 'static,
    {
        Ok(self.registries.hooks.register_main_loop(repetitions, body)?)
    }

    /// Runs inline when the physical connection closes
    pub fn on_end<F>(&mut self, callback: F) -> Result<HookGuard, AliotError>
    where
        F: Fn(&ObjectHandle) + Send + Sync + 'static,
    {
        Ok(self.registries.hooks.register(HookSlot::OnEnd, callback)?)
    }

    /// Opens a fresh connection and drives it until it closes.
    ///
    /// Each call builds a brand-new link and state machine; there is no
    /// automatic reconnection. Returns an error only when the connection could
    /// not be opened at all.
    pub async fn run(&mut self) -> Result<(), AliotError> {
        info!("Connecting object {} ...", self.name);

        let registries = Arc::new(self.registries.clone());
        let shared = Arc::new(LinkShared::new());
        let (frames_tx, frames_rx) = mpsc::channel(self.config.outbound_capacity);
        let outbound = OutboundSender::new(self.codec.clone(), frames_tx, shared.clone());
        self.handle.attach(shared.clone(), outbound.clone());

        let mut session = Session::new(
            self.handle.clone(),
            registries,
            self.codec.clone(),
            shared.clone(),
            outbound,
        );

        let link = Link::create(self.config.ws_url.clone(), shared.clone());
        let open = match link.connect().await {
            Ok(open) => open,
            Err(e) => {
                error!("Object {} could not connect: {}", self.name, e);
                return Err(e.into());
            }
        };

        let (closed, start_task) = open.run_until_closed(&mut session, frames_rx).await;
        debug!("Link to {} ended {}", closed.url(), closed.state());

        if let Some(task) = start_task {
            if !task.is_finished() {
                debug!("Waiting for the on-start hook to notice the disconnect");
            }
            task.join(self.config.hook_join_timeout).await;
        }
        Ok(())
    }

    /// Drops the logical connection; the physical connection follows
    pub fn stop(&self) {
        self.handle.stop();
    }

    pub fn update_component(&self, id: &str, value: Value) {
        self.handle.update_component(id, value);
    }

    pub fn broadcast(&self, data: Value) {
        self.handle.broadcast(data);
    }

    pub fn update_document(&self, fields: Map<String, Value>) {
        self.handle.update_document(fields);
    }

    pub fn send_route(&self, route_path: &str, data: Value) {
        self.handle.send_route(route_path, data);
    }

    pub fn send_action(&self, target_id: &str, action_id: i64, value: Option<Value>) {
        self.handle.send_action(target_id, action_id, value);
    }

    /// Reads the remote document (or one field). `None` means the read failed
    /// or the document is empty; the reason has been logged.
    pub async fn get_document(&self, field: Option<&str>) -> Option<Value> {
        self.documents.get_document(field).await
    }
}
