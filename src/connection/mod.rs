//! # Connection manager
//!
//! Owns the single physical connection to the platform and the logical
//! "connected" state negotiated over it.
//!
//! ```text
//! connection/
//! ├── link.rs      - physical websocket driver (statum machine)
//! ├── session.rs   - protocol state machine and inbound dispatch
//! ├── outbound.rs  - `{event, data}` formatting and guarded writes
//! └── handle.rs    - cloneable handle for hooks and application code
//! ```
//!
//! ## State machine
//!
//! ```text
//! Idle ──► Connecting ──► AwaitingConnectAck ──┬──────────────────────────► Live
//!                                              └─► AwaitingSubscribeAcks ──► Live
//!                      any ──(logical false / peer close)──► Closed
//! ```
//!
//! ## Shared state
//!
//! The connection task and the on-start worker both touch the flags below, so
//! flags and counters are atomics and the state enum sits behind a mutex. The
//! session is the only writer of the state; everybody else reads snapshots.
//! Dropping the logical flag always cancels the link's shutdown token, which is
//! what closes the physical connection.

pub mod handle;
pub mod link;
pub mod outbound;
pub mod session;

pub use handle::ObjectHandle;
pub use link::LinkError;
pub use outbound::OutboundSender;

use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    AwaitingConnectAck,
    AwaitingSubscribeAcks,
    Live,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::AwaitingConnectAck => "awaiting connect ack",
            ConnectionState::AwaitingSubscribeAcks => "awaiting subscribe acks",
            ConnectionState::Live => "live",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of a link, for diagnostics
#[derive(Clone, Debug, Default, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub physically_connected: bool,
    pub logically_connected: bool,
    pub subscribe_acks: usize,
    pub messages_sent: usize,
    pub messages_received: usize,
    pub disconnect_requests: usize,
    pub last_activity: Option<DateTime<Local>>,
}

/// State shared between the connection task, the outbound path and the
/// on-start worker for the lifetime of one `run()`
#[derive(Debug, Default)]
pub(crate) struct LinkShared {
    state: Mutex<ConnectionState>,
    physical: AtomicBool,
    logical: AtomicBool,
    disconnect_requested: AtomicBool,
    disconnect_requests: AtomicUsize,
    subscribe_acks: AtomicUsize,
    messages_sent: AtomicUsize,
    messages_received: AtomicUsize,
    last_activity: Mutex<Option<DateTime<Local>>>,
    shutdown: CancellationToken,
}

impl LinkShared {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn state(&self) -> ConnectionState {
        match self.state.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub(crate) fn set_state(&self, next: ConnectionState) {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *guard != next {
            debug!("Connection state: {} -> {}", *guard, next);
            *guard = next;
        }
    }

    pub(crate) fn is_physically_connected(&self) -> bool {
        self.physical.load(Ordering::SeqCst)
    }

    pub(crate) fn set_physically_connected(&self, connected: bool) {
        self.physical.store(connected, Ordering::SeqCst);
    }

    pub(crate) fn is_logically_connected(&self) -> bool {
        self.logical.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_live(&self) {
        self.logical.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::Live);
    }

    /// Drops the logical connection and asks the link to close.
    ///
    /// Only the first call per link counts, and none after the link closed;
    /// returns whether this call was it.
    pub(crate) fn request_disconnect(&self) -> bool {
        if self.state() == ConnectionState::Closed {
            return false;
        }
        self.logical.store(false, Ordering::SeqCst);
        let first = !self.disconnect_requested.swap(true, Ordering::SeqCst);
        if first {
            self.disconnect_requests.fetch_add(1, Ordering::SeqCst);
            self.shutdown.cancel();
        }
        first
    }

    /// Terminal bookkeeping once the physical connection is gone
    pub(crate) fn mark_closed(&self) {
        self.physical.store(false, Ordering::SeqCst);
        self.logical.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Closed);
        self.shutdown.cancel();
    }

    pub(crate) fn record_subscribe_ack(&self) -> usize {
        self.subscribe_acks.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn record_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub(crate) fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    fn touch(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Some(Local::now());
        }
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub(crate) fn snapshot(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state(),
            physically_connected: self.is_physically_connected(),
            logically_connected: self.is_logically_connected(),
            subscribe_acks: self.subscribe_acks.load(Ordering::SeqCst),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            disconnect_requests: self.disconnect_requests.load(Ordering::SeqCst),
            last_activity: self.last_activity.lock().ok().and_then(|last| *last),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_is_requested_once_and_cancels_the_token() {
        let shared = LinkShared::new();
        shared.set_physically_connected(true);
        shared.mark_live();
        let token = shared.shutdown_token();

        assert!(shared.request_disconnect());
        assert!(!shared.request_disconnect());
        assert!(token.is_cancelled());

        let status = shared.snapshot();
        assert!(!status.logically_connected);
        assert!(status.physically_connected);
        assert_eq!(status.disconnect_requests, 1);
    }

    #[test]
    fn closing_clears_both_flags() {
        let shared = LinkShared::new();
        shared.set_physically_connected(true);
        shared.mark_live();
        shared.mark_closed();
        assert!(!shared.request_disconnect());

        let status = shared.snapshot();
        assert_eq!(status.state, ConnectionState::Closed);
        assert!(!status.physically_connected);
        assert!(!status.logically_connected);
        assert_eq!(status.disconnect_requests, 0);
    }

    #[test]
    fn counters_track_activity() {
        let shared = LinkShared::new();
        assert!(shared.snapshot().last_activity.is_none());
        shared.record_sent();
        shared.record_received();
        shared.record_received();
        assert_eq!(shared.record_subscribe_ack(), 1);

        let status = shared.snapshot();
        assert_eq!(status.messages_sent, 1);
        assert_eq!(status.messages_received, 2);
        assert_eq!(status.subscribe_acks, 1);
        assert!(status.last_activity.is_some());
    }
}
