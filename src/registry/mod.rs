//! Handler registries populated before the connection starts
//!
//! 1. [`actions`] - action id → handler
//! 2. [`listeners`] - field listeners and the broadcast listener
//! 3. [`hooks`] - on-start / on-end lifecycle slots
//!
//! When `run()` begins, the object freezes a [`Registries`] snapshot and hands
//! it to the session; nothing registered afterwards is seen by that run.

pub mod actions;
pub mod error;
pub mod hooks;
pub mod listeners;

pub use actions::{ActionHandler, ActionRegistry};
pub use error::RegistrationError;
pub use hooks::{HookGuard, HookSlot, LifecycleHook, LifecycleHooks};
pub use listeners::{Listener, ListenerRegistry};

#[derive(Clone, Default, Debug)]
pub struct Registries {
    pub actions: ActionRegistry,
    pub listeners: ListenerRegistry,
    pub hooks: LifecycleHooks,
}
