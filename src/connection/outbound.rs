//! Outbound sender
//!
//! Every outbound event goes through [`OutboundSender::send`]: the envelope is
//! built, encoded and queued for the connection task, but only while the
//! physical connection is open. Anything sent while disconnected is dropped
//! without an error.

use super::LinkShared;
use crate::protocol::{Codec, EventKind, Message};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, trace, warn};

#[derive(Clone)]
pub struct OutboundSender {
    codec: Arc<dyn Codec>,
    frames: mpsc::Sender<String>,
    shared: Arc<LinkShared>,
}

impl OutboundSender {
    pub(crate) fn new(
        codec: Arc<dyn Codec>,
        frames: mpsc::Sender<String>,
        shared: Arc<LinkShared>,
    ) -> Self {
        Self {
            codec,
            frames,
            shared,
        }
    }

    /// Sends `{event, data}` if the physical connection is open
    pub fn send(&self, event: EventKind, data: Value) {
        if !self.shared.is_physically_connected() {
            trace!("Dropping {} while disconnected", event);
            return;
        }

        let message = Message::new(event, data);
        let frame = match self.codec.encode(&message) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Could not encode {}: {}", event, e);
                return;
            }
        };
        trace!("[Encoding] {:?}", message);
        trace!("[Sending] {}", frame);

        match self.frames.try_send(frame) {
            Ok(()) => self.shared.record_sent(),
            Err(TrySendError::Full(_)) => warn!("Outbound queue full, dropping {}", event),
            Err(TrySendError::Closed(_)) => debug!("Connection task gone, dropping {}", event),
        }
    }

    pub fn update_component(&self, id: &str, value: Value) {
        self.send(EventKind::UpdateComponent, json!({ "id": id, "value": value }));
    }

    pub fn broadcast(&self, data: Value) {
        self.send(EventKind::SendBroadcast, json!({ "data": data }));
    }

    pub fn update_document(&self, fields: Map<String, Value>) {
        self.send(EventKind::UpdateDoc, json!({ "fields": fields }));
    }

    pub fn send_route(&self, route_path: &str, data: Value) {
        self.send(
            EventKind::SendRoute,
            json!({ "routePath": route_path, "data": data }),
        );
    }

    /// Triggers an action on another object. The platform expects `""` when
    /// there is no value to pass.
    pub fn send_action(&self, target_id: &str, action_id: i64, value: Option<Value>) {
        self.send(
            EventKind::SendAction,
            json!({
                "targetId": target_id,
                "actionId": action_id,
                "value": value.unwrap_or_else(|| json!("")),
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JsonCodec;

    fn sender(capacity: usize) -> (OutboundSender, mpsc::Receiver<String>, Arc<LinkShared>) {
        let shared = Arc::new(LinkShared::new());
        let (tx, rx) = mpsc::channel(capacity);
        (
            OutboundSender::new(Arc::new(JsonCodec), tx, shared.clone()),
            rx,
            shared,
        )
    }

    fn decoded(frame: String) -> Message {
        JsonCodec.decode(&frame).unwrap()
    }

    #[test]
    fn nothing_is_written_while_disconnected() {
        let (outbound, mut rx, shared) = sender(8);
        outbound.update_component("led", json!(true));
        outbound.broadcast(json!({"hello": "world"}));

        assert!(rx.try_recv().is_err());
        assert_eq!(shared.snapshot().messages_sent, 0);
    }

    #[test]
    fn convenience_methods_format_their_payloads() {
        let (outbound, mut rx, shared) = sender(8);
        shared.set_physically_connected(true);

        outbound.update_component("led", json!(true));
        outbound.send_route("/lights", json!({"on": 1}));
        outbound.send_action("other-object", 3, None);
        let mut fields = Map::new();
        fields.insert("temp".into(), json!(21.5));
        outbound.update_document(fields);

        let msg = decoded(rx.try_recv().unwrap());
        assert_eq!(msg.event, EventKind::UpdateComponent);
        assert_eq!(msg.data, json!({"id": "led", "value": true}));

        let msg = decoded(rx.try_recv().unwrap());
        assert_eq!(msg.event, EventKind::SendRoute);
        assert_eq!(msg.data, json!({"routePath": "/lights", "data": {"on": 1}}));

        let msg = decoded(rx.try_recv().unwrap());
        assert_eq!(msg.event, EventKind::SendAction);
        assert_eq!(
            msg.data,
            json!({"targetId": "other-object", "actionId": 3, "value": ""})
        );

        let msg = decoded(rx.try_recv().unwrap());
        assert_eq!(msg.event, EventKind::UpdateDoc);
        assert_eq!(msg.data, json!({"fields": {"temp": 21.5}}));

        assert_eq!(shared.snapshot().messages_sent, 4);
    }

    #[test]
    fn full_queue_drops_without_counting() {
        let (outbound, mut rx, shared) = sender(1);
        shared.set_physically_connected(true);

        outbound.broadcast(json!(1));
        outbound.broadcast(json!(2));

        assert_eq!(decoded(rx.try_recv().unwrap()).data, json!({"data": 1}));
        assert!(rx.try_recv().is_err());
        assert_eq!(shared.snapshot().messages_sent, 1);
    }
}
