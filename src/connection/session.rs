//! Protocol session: the connection state machine and the event dispatcher
//!
//! The session never touches the socket. The link feeds it lifecycle callbacks
//! (`on_open`, `on_frame`, `on_transport_error`, `on_close`) and it answers
//! through the [`OutboundSender`]. Inbound handlers run synchronously on the
//! connection task, so a slow handler delays the next inbound frame.

use super::{ConnectionState, LinkShared, ObjectHandle, OutboundSender};
use crate::protocol::{
    broadcast_body, listen_fields, ActionPayload, ActionRecord, Codec, EventKind, Message,
};
use crate::registry::hooks::StartTask;
use crate::registry::Registries;
use serde_json::{json, Value};
use std::io;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::error::{Error as WsError, ProtocolError};
use tracing::{debug, error, info, trace, warn};

pub(crate) struct Session {
    handle: ObjectHandle,
    registries: Arc<Registries>,
    codec: Arc<dyn Codec>,
    shared: Arc<LinkShared>,
    outbound: OutboundSender,
    start_task: Option<StartTask>,
    opened: bool,
    closed: bool,
}

impl Session {
    pub(crate) fn new(
        handle: ObjectHandle,
        registries: Arc<Registries>,
        codec: Arc<dyn Codec>,
        shared: Arc<LinkShared>,
        outbound: OutboundSender,
    ) -> Self {
        Self {
            handle,
            registries,
            codec,
            shared,
            outbound,
            start_task: None,
            opened: false,
            closed: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Physical connection is up: register the object with the platform
    pub(crate) fn on_open(&mut self) {
        self.opened = true;
        self.shared.set_physically_connected(true);
        self.shared.set_state(ConnectionState::AwaitingConnectAck);
        info!("Registering object {} with the platform", self.handle.name());
        self.outbound.send(
            EventKind::ConnectObject,
            json!({ "id": self.handle.object_id() }),
        );
    }

    pub(crate) fn on_frame(&mut self, frame: &str) {
        self.shared.record_received();
        trace!("[Receiving] {}", frame);
        match self.codec.decode(frame) {
            Ok(message) => self.handle_message(message),
            Err(e) => warn!("Ignoring frame that could not be decoded: {}", e),
        }
    }

    pub(crate) fn handle_message(&mut self, message: Message) {
        let Message { event, data } = message;
        match event {
            EventKind::ConnectSuccess => self.on_connect_success(),
            EventKind::SubscribeListenerSuccess => self.on_subscribe_ack(),
            EventKind::ReceiveAction => {
                self.note_if_early(event);
                self.dispatch_actions(data);
            }
            EventKind::ReceiveListen => {
                self.note_if_early(event);
                self.dispatch_listen(&data);
            }
            EventKind::ReceiveBroadcast => {
                self.note_if_early(event);
                self.dispatch_broadcast(&data);
            }
            EventKind::Ping => self.outbound.send(EventKind::Pong, Value::Null),
            EventKind::Error => self.on_peer_error(&data),
            EventKind::ConnectObject
            | EventKind::SendAction
            | EventKind::SendActionDone
            | EventKind::SubscribeListener
            | EventKind::SendBroadcast
            | EventKind::UpdateComponent
            | EventKind::UpdateDoc
            | EventKind::SendRoute
            | EventKind::GetDoc
            | EventKind::GetField
            | EventKind::Pong => debug!("Ignoring {} from the platform", event),
        }
    }

    fn note_if_early(&self, event: EventKind) {
        let state = self.shared.state();
        if state != ConnectionState::Live {
            debug!("{} arrived while {}", event, state);
        }
    }

    fn on_connect_success(&mut self) {
        let state = self.shared.state();
        if state != ConnectionState::AwaitingConnectAck {
            warn!("Unexpected CONNECT_SUCCESS while {}", state);
            return;
        }

        let listeners = &self.registries.listeners;
        if listeners.is_empty() {
            info!("Object {} connected", self.handle.name());
            self.go_live();
            return;
        }

        let fields = listeners.subscribed_fields();
        info!(
            "Subscribing {} listener(s) on fields {:?}",
            listeners.len(),
            fields
        );
        self.shared.set_state(ConnectionState::AwaitingSubscribeAcks);
        self.outbound
            .send(EventKind::SubscribeListener, json!({ "fields": fields }));
    }

    fn on_subscribe_ack(&mut self) {
        let state = self.shared.state();
        if state != ConnectionState::AwaitingSubscribeAcks {
            warn!("Unexpected SUBSCRIBE_LISTENER_SUCCESS while {}", state);
            return;
        }

        let acks = self.shared.record_subscribe_ack();
        let expected = self.registries.listeners.len();
        debug!("Listener subscription acknowledged ({}/{})", acks, expected);
        if acks == expected {
            info!("Object {} connected", self.handle.name());
            self.go_live();
        }
    }

    fn go_live(&mut self) {
        self.shared.mark_live();
        if let Some(hook) = self.registries.hooks.on_start() {
            if self.start_task.is_some() {
                warn!("On-start hook already launched for this connection");
                return;
            }
            self.start_task = Some(StartTask::launch(hook.clone(), self.handle.clone()));
        }
    }

    fn dispatch_actions(&self, data: Value) {
        for raw in ActionPayload::from_data(data).into_records() {
            let Some(record) = ActionRecord::from_value(&raw) else {
                warn!("Dropping action record without a valid id and value: {}", raw);
                continue;
            };

            match self.registries.actions.get(record.id) {
                Some(handler) => {
                    let result = handler.invoke(record.value);
                    self.outbound.send(
                        EventKind::SendActionDone,
                        json!({ "actionId": record.id, "value": result }),
                    );
                }
                None => {
                    error!("The action with the id {} is not implemented", record.id);
                    if self.shared.request_disconnect() {
                        info!("Closing the connection after unknown action {}", record.id);
                    }
                }
            }
        }
    }

    fn dispatch_listen(&self, data: &Value) {
        let Some(fields) = listen_fields(data) else {
            warn!("RECEIVE_LISTEN without a fields mapping: {}", data);
            return;
        };
        let notified = self.registries.listeners.dispatch_fields(fields);
        debug!(
            "Field update on {:?} reached {} listener(s)",
            fields.keys().collect::<Vec<_>>(),
            notified
        );
    }

    fn dispatch_broadcast(&self, data: &Value) {
        match broadcast_body(data) {
            Some(body) => {
                self.registries.listeners.dispatch_broadcast(body.clone());
            }
            None => warn!("RECEIVE_BROADCAST without a data field: {}", data),
        }
    }

    fn on_peer_error(&self, data: &Value) {
        error!("Platform reported an error: {}", data);
        if self.shared.request_disconnect() {
            info!("Closing the connection after a platform error");
        }
    }

    pub(crate) fn on_transport_error(&self, err: &WsError) {
        error!("Connection error: {}", err);
        if self.suggests_wrong_key(err) {
            warn!(
                "The connection was reset before the object connected, \
                 verify that the object id is the right key"
            );
        }
    }

    /// A reset before the platform acknowledged the object usually means the
    /// object id was rejected
    fn suggests_wrong_key(&self, err: &WsError) -> bool {
        is_reset(err) && !self.shared.is_logically_connected()
    }

    /// Physical connection is gone. Runs the on-end hook inline and hands back
    /// the on-start worker so the caller can join it.
    pub(crate) fn on_close(&mut self) -> Option<StartTask> {
        if self.closed {
            return None;
        }
        self.closed = true;
        self.shared.mark_closed();
        info!("Connection closed for {}", self.handle.name());

        if self.opened {
            if let Some(hook) = self.registries.hooks.on_end() {
                hook.invoke(&self.handle);
            }
        }
        self.start_task.take()
    }
}

fn is_reset(err: &WsError) -> bool {
    match err {
        WsError::Io(e) => e.kind() == io::ErrorKind::ConnectionReset,
        WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JsonCodec;
    use crate::registry::{ActionHandler, HookSlot, Listener};
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Harness {
        session: Session,
        frames: mpsc::Receiver<String>,
        shared: Arc<LinkShared>,
    }

    impl Harness {
        fn new(registries: Registries) -> Self {
            let handle = ObjectHandle::detached("lamp", "obj-1");
            let shared = Arc::new(LinkShared::new());
            let (tx, frames) = mpsc::channel(64);
            let codec: Arc<dyn Codec> = Arc::new(JsonCodec);
            let outbound = OutboundSender::new(codec.clone(), tx, shared.clone());
            handle.attach(shared.clone(), outbound.clone());
            let session = Session::new(handle, Arc::new(registries), codec, shared.clone(), outbound);
            Self {
                session,
                frames,
                shared,
            }
        }

        fn opened(registries: Registries) -> Self {
            let mut harness = Self::new(registries);
            harness.session.on_open();
            harness.sent();
            harness
        }

        fn receive(&mut self, event: EventKind, data: Value) {
            let frame = JsonCodec.encode(&Message::new(event, data)).unwrap();
            self.session.on_frame(&frame);
        }

        fn sent(&mut self) -> Vec<Message> {
            let mut out = Vec::new();
            while let Ok(frame) = self.frames.try_recv() {
                out.push(JsonCodec.decode(&frame).unwrap());
            }
            out
        }
    }

    fn counting_hook(registries: &mut Registries, slot: HookSlot) -> Arc<AtomicUsize> {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        registries
            .hooks
            .register(slot, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        calls
    }

    fn listener(fields: &[&str]) -> Listener {
        Listener::new(fields.iter().copied(), |_| {}).unwrap()
    }

    #[test]
    fn open_registers_the_object() {
        let mut harness = Harness::new(Registries::default());
        harness.session.on_open();

        assert_eq!(harness.session.state(), ConnectionState::AwaitingConnectAck);
        let sent = harness.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event, EventKind::ConnectObject);
        assert_eq!(sent[0].data, json!({"id": "obj-1"}));
    }

    #[tokio::test]
    async fn connect_success_without_listeners_goes_live_and_starts_once() {
        let mut registries = Registries::default();
        let starts = counting_hook(&mut registries, HookSlot::OnStart);
        let mut harness = Harness::opened(registries);

        harness.receive(EventKind::ConnectSuccess, Value::Null);
        assert_eq!(harness.session.state(), ConnectionState::Live);
        assert!(harness.shared.is_logically_connected());
        assert!(harness.sent().is_empty());

        // A duplicate ack must not launch the hook a second time.
        harness.receive(EventKind::ConnectSuccess, Value::Null);

        let task = harness.session.on_close().expect("on-start task");
        task.join(Duration::from_secs(2)).await;
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn listeners_are_subscribed_before_going_live() {
        let mut registries = Registries::default();
        registries.listeners.register(listener(&["temp", "light"]));
        registries.listeners.register(listener(&["light", "door"]));
        let starts = counting_hook(&mut registries, HookSlot::OnStart);
        let mut harness = Harness::opened(registries);

        harness.receive(EventKind::ConnectSuccess, Value::Null);
        let sent = harness.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event, EventKind::SubscribeListener);
        assert_eq!(sent[0].data, json!({"fields": ["door", "light", "temp"]}));
        assert_eq!(harness.session.state(), ConnectionState::AwaitingSubscribeAcks);

        harness.receive(EventKind::SubscribeListenerSuccess, Value::Null);
        assert_eq!(harness.session.state(), ConnectionState::AwaitingSubscribeAcks);
        assert!(!harness.shared.is_logically_connected());

        harness.receive(EventKind::SubscribeListenerSuccess, Value::Null);
        assert_eq!(harness.session.state(), ConnectionState::Live);
        assert!(harness.shared.is_logically_connected());
        assert_eq!(harness.shared.snapshot().subscribe_acks, 2);

        let task = harness.session.on_close().expect("on-start task");
        task.join(Duration::from_secs(2)).await;
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn known_actions_report_their_result() {
        let mut registries = Registries::default();
        registries
            .actions
            .register(ActionHandler::new(1, |v| json!(v.as_i64().unwrap_or(0) + 1)));
        let mut harness = Harness::opened(registries);
        harness.receive(EventKind::ConnectSuccess, Value::Null);

        harness.receive(
            EventKind::ReceiveAction,
            json!([
                {"id": 1, "value": 41},
                {"id": 1},
                {"id": 1, "value": 1}
            ]),
        );

        let sent = harness.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|m| m.event == EventKind::SendActionDone));
        assert_eq!(sent[0].data, json!({"actionId": 1, "value": 42}));
        assert_eq!(sent[1].data, json!({"actionId": 1, "value": 2}));
        assert!(harness.shared.is_logically_connected());
    }

    #[test]
    fn unknown_action_forces_a_single_disconnect() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut registries = Registries::default();
        registries.actions.register(ActionHandler::new(1, move |v| {
            counter.fetch_add(1, Ordering::SeqCst);
            v
        }));
        let mut harness = Harness::opened(registries);
        harness.receive(EventKind::ConnectSuccess, Value::Null);
        let token = harness.shared.shutdown_token();

        harness.receive(
            EventKind::ReceiveAction,
            json!([
                {"id": 5, "value": 0},
                {"id": 1, "value": 5},
                {"id": 6, "value": 0}
            ]),
        );
        harness.receive(EventKind::ReceiveAction, json!({"id": 7, "value": 0}));

        // Records after the unknown id still run
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            harness.sent(),
            vec![Message::new(
                EventKind::SendActionDone,
                json!({"actionId": 1, "value": 5})
            )]
        );
        assert!(!harness.shared.is_logically_connected());
        assert!(token.is_cancelled());
        assert_eq!(harness.shared.snapshot().disconnect_requests, 1);
    }

    #[test]
    fn unknown_action_disconnects_even_before_going_live() {
        let mut harness = Harness::opened(Registries::default());
        harness.receive(EventKind::ReceiveAction, json!({"id": 5, "value": 0}));

        assert_eq!(harness.shared.snapshot().disconnect_requests, 1);
        assert!(harness.shared.shutdown_token().is_cancelled());
    }

    #[test]
    fn ping_gets_exactly_one_pong() {
        let mut harness = Harness::opened(Registries::default());
        let before = harness.shared.snapshot();

        harness.receive(EventKind::Ping, Value::Null);

        let sent = harness.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event, EventKind::Pong);
        assert_eq!(sent[0].data, Value::Null);
        let after = harness.shared.snapshot();
        assert_eq!(after.state, before.state);
        assert_eq!(after.logically_connected, before.logically_connected);
    }

    #[test]
    fn platform_error_requests_disconnect() {
        let mut harness = Harness::opened(Registries::default());
        harness.receive(EventKind::ConnectSuccess, Value::Null);

        harness.receive(EventKind::Error, json!("bad key"));

        assert!(!harness.shared.is_logically_connected());
        assert!(harness.shared.shutdown_token().is_cancelled());
    }

    #[test]
    fn listen_and_broadcast_reach_their_handlers() {
        let seen = Arc::new(Mutex::new(Vec::<Map<String, Value>>::new()));
        let broadcasts = Arc::new(Mutex::new(Vec::<Value>::new()));
        let mut registries = Registries::default();
        let sink = seen.clone();
        registries.listeners.register(
            Listener::new(["a", "b"], move |fields| sink.lock().unwrap().push(fields)).unwrap(),
        );
        let sink = broadcasts.clone();
        registries
            .listeners
            .set_broadcast(move |v| sink.lock().unwrap().push(v));

        let mut harness = Harness::opened(registries);
        harness.receive(EventKind::ReceiveListen, json!({"fields": {"a": 1, "c": 2}}));
        harness.receive(EventKind::ReceiveListen, json!({"fields": {"c": 2}}));
        harness.receive(EventKind::ReceiveBroadcast, json!({"data": {"msg": "hi"}}));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(Value::Object(seen[0].clone()), json!({"a": 1}));
        assert_eq!(*broadcasts.lock().unwrap(), vec![json!({"msg": "hi"})]);
    }

    #[test]
    fn garbage_frames_are_ignored() {
        let mut harness = Harness::opened(Registries::default());
        harness.session.on_frame("{not json");
        harness.session.on_frame(r#"{"event":"SOMETHING_ELSE","data":1}"#);

        assert_eq!(harness.session.state(), ConnectionState::AwaitingConnectAck);
        assert_eq!(harness.shared.snapshot().messages_received, 2);
        assert!(harness.sent().is_empty());
    }

    #[test]
    fn close_runs_the_end_hook_once_and_silences_sends() {
        let mut registries = Registries::default();
        let ends = counting_hook(&mut registries, HookSlot::OnEnd);
        let mut harness = Harness::opened(registries);
        harness.receive(EventKind::ConnectSuccess, Value::Null);

        assert!(harness.session.on_close().is_none());
        assert!(harness.session.on_close().is_none());
        assert_eq!(ends.load(Ordering::SeqCst), 1);
        assert_eq!(harness.session.state(), ConnectionState::Closed);

        harness.receive(EventKind::Ping, Value::Null);
        assert!(harness.sent().is_empty());
    }

    #[test]
    fn only_resets_count_as_resets() {
        let reset = WsError::Io(io::Error::from(io::ErrorKind::ConnectionReset));
        let no_handshake = WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake);
        assert!(is_reset(&reset));
        assert!(is_reset(&no_handshake));

        assert!(!is_reset(&WsError::Io(io::Error::from(io::ErrorKind::TimedOut))));
        assert!(!is_reset(&WsError::ConnectionClosed));
        assert!(!is_reset(&WsError::Protocol(ProtocolError::HandshakeIncomplete)));
    }

    #[test]
    fn reset_before_connecting_points_at_the_object_id() {
        let mut harness = Harness::opened(Registries::default());
        let reset = WsError::Io(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(harness.session.suggests_wrong_key(&reset));
        assert!(!harness.session.suggests_wrong_key(&WsError::ConnectionClosed));

        harness.receive(EventKind::ConnectSuccess, Value::Null);
        assert!(!harness.session.suggests_wrong_key(&reset));
    }

    #[test]
    fn transport_errors_leave_the_state_alone() {
        let mut harness = Harness::opened(Registries::default());
        harness.receive(EventKind::ConnectSuccess, Value::Null);
        let before = harness.shared.snapshot();

        harness
            .session
            .on_transport_error(&WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake));
        harness.session.on_transport_error(&WsError::ConnectionClosed);

        let after = harness.shared.snapshot();
        assert_eq!(after.state, ConnectionState::Live);
        assert_eq!(after.logically_connected, before.logically_connected);
        assert_eq!(after.physically_connected, before.physically_connected);
        assert_eq!(after.disconnect_requests, 0);
        assert!(!harness.shared.shutdown_token().is_cancelled());
    }

    #[tokio::test]
    async fn counted_main_loop_runs_its_body_that_many_times() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let mut registries = Registries::default();
        registries
            .hooks
            .register_main_loop(Some(3), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        let mut harness = Harness::opened(registries);

        harness.receive(EventKind::ConnectSuccess, Value::Null);
        let task = harness.session.start_task.take().expect("on-start task");
        task.join(Duration::from_secs(2)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert!(harness.shared.is_logically_connected());
    }

    #[tokio::test]
    async fn open_ended_main_loop_runs_until_disconnected() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let mut registries = Registries::default();
        registries
            .hooks
            .register_main_loop(None, move |handle| {
                if counter.fetch_add(1, Ordering::SeqCst) + 1 == 5 {
                    handle.stop();
                }
            })
            .unwrap();
        let mut harness = Harness::opened(registries);

        harness.receive(EventKind::ConnectSuccess, Value::Null);
        let task = harness.session.start_task.take().expect("on-start task");
        task.join(Duration::from_secs(2)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 5);
        assert!(!harness.shared.is_logically_connected());
        assert_eq!(harness.shared.snapshot().disconnect_requests, 1);
    }
}
