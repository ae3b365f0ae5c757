//! Runtime for objects connected to an IoT platform
//!
//! An [`AliotObject`] keeps one websocket connection to the platform, answers
//! actions, forwards document changes to listeners and runs user lifecycle
//! hooks. Document reads go through a separate HTTP client.
//!
//! ```text
//!   user code ──register──► Registries ──frozen──► Session ◄──frames── Link ◄──► platform
//!       │                                            │                   ▲
//!       └──── ObjectHandle ──► OutboundSender ───────┴──── channel ──────┘
//! ```

pub mod config;
pub mod connection;
pub mod document;
pub mod error;
pub mod object;
pub mod protocol;
pub mod registry;

pub use config::{ConfigError, ConfigProvider, ObjectConfig, TomlConfig};
pub use connection::{ConnectionState, ConnectionStatus, ObjectHandle};
pub use document::{DocumentClient, DocumentOutcome};
pub use error::AliotError;
pub use object::AliotObject;
pub use protocol::{Codec, CodecError, EventKind, JsonCodec, Message};
pub use registry::{ActionHandler, HookGuard, HookSlot, Listener, RegistrationError};
