//! Wire protocol spoken with the platform
//!
//! Every frame exchanged over the persistent connection is a [`Message`]
//! envelope of the form `{"event": <kind>, "data": <payload>}`. The [`codec`]
//! submodule turns envelopes into wire text and back.
//!
//! # Handshake
//!
//! ```text
//! Object                              Platform
//!   │ ── CONNECT_OBJECT {id} ──────────► │
//!   │ ◄───────────────── CONNECT_SUCCESS │
//!   │ ── SUBSCRIBE_LISTENER {fields} ──► │   (only with listeners)
//!   │ ◄────── SUBSCRIBE_LISTENER_SUCCESS │   (once per listener)
//!   │          ... live traffic ...      │
//! ```

pub mod codec;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

pub use codec::{Codec, CodecError, JsonCodec};

/// All event kinds understood by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    ConnectObject,
    ConnectSuccess,
    SendAction,
    SendActionDone,
    ReceiveAction,
    SubscribeListener,
    SubscribeListenerSuccess,
    ReceiveListen,
    SendBroadcast,
    ReceiveBroadcast,
    UpdateComponent,
    UpdateDoc,
    SendRoute,
    GetDoc,
    GetField,
    Error,
    Ping,
    Pong,
}

impl EventKind {
    /// Name of the event as it appears on the wire and in endpoint paths
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ConnectObject => "CONNECT_OBJECT",
            EventKind::ConnectSuccess => "CONNECT_SUCCESS",
            EventKind::SendAction => "SEND_ACTION",
            EventKind::SendActionDone => "SEND_ACTION_DONE",
            EventKind::ReceiveAction => "RECEIVE_ACTION",
            EventKind::SubscribeListener => "SUBSCRIBE_LISTENER",
            EventKind::SubscribeListenerSuccess => "SUBSCRIBE_LISTENER_SUCCESS",
            EventKind::ReceiveListen => "RECEIVE_LISTEN",
            EventKind::SendBroadcast => "SEND_BROADCAST",
            EventKind::ReceiveBroadcast => "RECEIVE_BROADCAST",
            EventKind::UpdateComponent => "UPDATE_COMPONENT",
            EventKind::UpdateDoc => "UPDATE_DOC",
            EventKind::SendRoute => "SEND_ROUTE",
            EventKind::GetDoc => "GET_DOC",
            EventKind::GetField => "GET_FIELD",
            EventKind::Error => "ERROR",
            EventKind::Ping => "PING",
            EventKind::Pong => "PONG",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit exchanged on the wire in both directions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub event: EventKind,
    #[serde(default)]
    pub data: Value,
}

impl Message {
    pub fn new(event: EventKind, data: Value) -> Self {
        Self { event, data }
    }
}

/// One `{id, value}` action invocation sent by the platform
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRecord {
    pub id: i64,
    pub value: Value,
}

impl ActionRecord {
    /// Extracts a record from a raw JSON object.
    ///
    /// Returns `None` when `id` or `value` is missing, or when `id` is not an
    /// integer.
    pub fn from_value(raw: &Value) -> Option<Self> {
        let obj = raw.as_object()?;
        let id = obj.get("id")?.as_i64()?;
        let value = obj.get("value")?.clone();
        Some(Self { id, value })
    }
}

/// `RECEIVE_ACTION` payloads are either one record or an ordered batch
#[derive(Debug, Clone, PartialEq)]
pub enum ActionPayload {
    Single(Value),
    Batch(Vec<Value>),
}

impl ActionPayload {
    pub fn from_data(data: Value) -> Self {
        match data {
            Value::Array(items) => ActionPayload::Batch(items),
            other => ActionPayload::Single(other),
        }
    }

    /// Flattens the payload into raw records in arrival order
    pub fn into_records(self) -> Vec<Value> {
        match self {
            ActionPayload::Single(record) => vec![record],
            ActionPayload::Batch(records) => records,
        }
    }
}

/// Pulls the `fields` mapping out of a `RECEIVE_LISTEN` payload
pub fn listen_fields(data: &Value) -> Option<&Map<String, Value>> {
    data.get("fields")?.as_object()
}

/// Pulls the broadcast body out of a `RECEIVE_BROADCAST` payload
pub fn broadcast_body(data: &Value) -> Option<&Value> {
    data.get("data")
}
