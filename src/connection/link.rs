//! Physical websocket link with statum state machine
//!
//! ```text
//! Idle ──connect()──► Open ──run_until_closed()──► Closed
//! ```
//!
//! The link owns the socket and nothing else: frames coming in are handed to
//! the [`Session`], frames going out arrive on the outbound channel. The link
//! closes the socket when the peer closes it, on a transport error, or when
//! the shared shutdown token is cancelled (logical disconnect).

use super::session::Session;
use super::{ConnectionState, LinkShared};
use crate::registry::hooks::StartTask;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use statum::{machine, state};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Failed to open connection to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: WsError,
    },
}

#[state]
#[derive(Debug, Clone)]
pub(crate) enum LinkPhase {
    Idle,   // Nothing opened yet
    Open,   // Socket open, session running
    Closed, // Socket gone, terminal
}

#[machine]
pub(crate) struct Link<S: LinkPhase> {
    url: String,
    shared: Arc<LinkShared>,
    stream: Option<WsStream>,
}

impl<S: LinkPhase> Link<S> {
    pub(crate) fn url(&self) -> &str {
        &self.url
    }
}

impl Link<Idle> {
    pub(crate) fn create(url: String, shared: Arc<LinkShared>) -> Self {
        Self::new(url, shared, None)
    }

    /// Opens the websocket and transitions to Open
    pub(crate) async fn connect(mut self) -> Result<Link<Open>, LinkError> {
        self.shared.set_state(ConnectionState::Connecting);
        info!("Connecting to {}", self.url);

        match connect_async(self.url.as_str()).await {
            Ok((stream, response)) => {
                debug!("Websocket handshake done with status {}", response.status());
                self.stream = Some(stream);
                Ok(self.transition())
            }
            Err(source) => {
                error!("Could not connect to {}: {}", self.url, source);
                self.shared.mark_closed();
                Err(LinkError::Connect {
                    url: self.url.clone(),
                    source,
                })
            }
        }
    }
}

impl Link<Open> {
    /// Pumps frames until the connection closes, then runs the session's close
    /// path. Returns the closed link and the on-start worker, if one was
    /// launched.
    pub(crate) async fn run_until_closed(
        mut self,
        session: &mut Session,
        mut frames: mpsc::Receiver<String>,
    ) -> (Link<Closed>, Option<StartTask>) {
        let Some(stream) = self.stream.take() else {
            warn!("Link opened without a stream");
            let task = session.on_close();
            return (self.transition(), task);
        };
        let (mut sink, mut source) = stream.split();
        let shutdown = self.shared.shutdown_token();

        session.on_open();

        loop {
            tokio::select! {
                biased;

                Some(frame) = frames.recv() => {
                    if let Err(e) = sink.send(WsMessage::Text(frame.into())).await {
                        session.on_transport_error(&e);
                        break;
                    }
                }

                _ = shutdown.cancelled() => {
                    debug!("Logical disconnect, closing {}", self.url);
                    drain_outbound(&mut sink, &mut frames).await;
                    if let Err(e) = sink.close().await {
                        debug!("Error while closing the socket: {}", e);
                    }
                    break;
                }

                incoming = source.next() => match incoming {
                    Some(Ok(WsMessage::Text(text))) => session.on_frame(text.as_str()),
                    Some(Ok(WsMessage::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => session.on_frame(text),
                        Err(e) => warn!("Ignoring binary frame that is not UTF-8: {}", e),
                    },
                    Some(Ok(WsMessage::Close(frame))) => {
                        info!("Platform closed the connection: {:?}", frame);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        session.on_transport_error(&e);
                        break;
                    }
                    None => {
                        debug!("Connection stream ended");
                        break;
                    }
                },
            }
        }

        frames.close();
        let task = session.on_close();
        (self.transition(), task)
    }
}

impl Link<Closed> {
    pub(crate) fn state(&self) -> ConnectionState {
        self.shared.state()
    }
}

/// Writes whatever is still queued before the socket goes away
async fn drain_outbound(
    sink: &mut SplitSink<WsStream, WsMessage>,
    frames: &mut mpsc::Receiver<String>,
) {
    while let Ok(frame) = frames.try_recv() {
        if let Err(e) = sink.send(WsMessage::Text(frame.into())).await {
            debug!("Dropping queued frames, socket already gone: {}", e);
            break;
        }
    }
}
