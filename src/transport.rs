//! Signaling transport: one WebSocket connection per call session.
//!
//! The session owns the connection through the [`SignalingTransport`] trait
//! and consumes lifecycle events from an mpsc channel, so tests can drive a
//! session without a network. The concrete implementation speaks JSON text
//! frames over tokio-tungstenite.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, trace, warn};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::envelope::SignalEnvelope;
use crate::error::CallError;

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

/// An event produced by the transport layer. Each underlying event is
/// delivered at most once.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The connection is open; signaling may begin.
    Opened,
    /// A well-formed envelope arrived.
    Message(SignalEnvelope),
    /// The connection failed.
    Error(String),
    /// The connection closed. Suppressed after an explicit local close so
    /// teardown never runs twice.
    Closed,
}

/// Represents an active signaling connection.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Sends one envelope. When the socket is no longer open this logs a
    /// warning and drops the message; it never fails.
    async fn send(&self, envelope: &SignalEnvelope);

    /// Closes the connection. Idempotent.
    async fn close(&self);
}

/// A factory responsible for opening signaling connections.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Opens a connection and returns it along with its event stream.
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn SignalingTransport>, mpsc::Receiver<TransportEvent>), CallError>;
}

/// WebSocket signaling transport.
pub struct WsSignalingTransport {
    ws_sink: Arc<Mutex<Option<WsSink>>>,
    locally_closed: Arc<AtomicBool>,
}

#[async_trait]
impl SignalingTransport for WsSignalingTransport {
    async fn send(&self, envelope: &SignalEnvelope) {
        let mut sink_guard = self.ws_sink.lock().await;
        let Some(sink) = sink_guard.as_mut() else {
            warn!(
                "Dropping {} message: signaling socket is not open",
                envelope.label()
            );
            return;
        };

        let json = envelope.to_json();
        debug!("--> {} ({} bytes)", envelope.label(), json.len());
        if let Err(e) = sink.send(Message::text(json)).await {
            warn!("Failed to send {} message: {e}", envelope.label());
        }
    }

    async fn close(&self) {
        if self.locally_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mut sink) = self.ws_sink.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
        }
        debug!("Signaling socket closed locally");
    }
}

/// Factory for [`WsSignalingTransport`].
#[derive(Default)]
pub struct WsTransportFactory {
    /// Handshake bound. `None` reproduces the original client, which waited
    /// indefinitely.
    pub connect_timeout: Option<Duration>,
}

impl WsTransportFactory {
    pub fn new(connect_timeout: Option<Duration>) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl TransportFactory for WsTransportFactory {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn SignalingTransport>, mpsc::Receiver<TransportEvent>), CallError> {
        debug!("Dialing signaling endpoint {url}");
        let connect = connect_async(url);
        let (ws, _response) = match self.connect_timeout {
            Some(bound) => tokio::time::timeout(bound, connect)
                .await
                .map_err(|_| CallError::Transport(format!("handshake timed out after {bound:?}")))?
                .map_err(|e| CallError::Transport(e.to_string()))?,
            None => connect.await.map_err(|e| CallError::Transport(e.to_string()))?,
        };

        let (sink, stream) = ws.split();
        let (events_tx, events_rx) = mpsc::channel(100);
        let locally_closed = Arc::new(AtomicBool::new(false));

        let transport = Arc::new(WsSignalingTransport {
            ws_sink: Arc::new(Mutex::new(Some(sink))),
            locally_closed: locally_closed.clone(),
        });

        // The session observes the open through the same channel as
        // everything else, keeping event ordering trivial.
        let _ = events_tx.send(TransportEvent::Opened).await;

        tokio::task::spawn(read_pump(stream, events_tx, locally_closed));

        Ok((transport, events_rx))
    }
}

async fn read_pump(
    mut stream: WsStream,
    events_tx: mpsc::Sender<TransportEvent>,
    locally_closed: Arc<AtomicBool>,
) {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                trace!("<-- {} bytes", text.len());
                match SignalEnvelope::parse(text.as_str()) {
                    Ok(envelope) => {
                        debug!("<-- {}", envelope.label());
                        if events_tx
                            .send(TransportEvent::Message(envelope))
                            .await
                            .is_err()
                        {
                            warn!("Session dropped its event channel, closing read pump");
                            return;
                        }
                    }
                    // Unknown or malformed frames are dropped here and never
                    // reach the state machine.
                    Err(e) => warn!("Ignoring unparseable signaling frame: {e}"),
                }
            }
            Some(Ok(Message::Close(_))) => {
                trace!("Received close frame");
                break;
            }
            Some(Ok(_)) => trace!("Ignoring non-text frame"),
            Some(Err(e)) => {
                if !locally_closed.load(Ordering::Acquire) {
                    error!("Error reading from signaling socket: {e}");
                    let _ = events_tx.send(TransportEvent::Error(e.to_string())).await;
                }
                return;
            }
            None => {
                trace!("Signaling stream ended");
                break;
            }
        }
    }

    if !locally_closed.load(Ordering::Acquire) {
        let _ = events_tx.send(TransportEvent::Closed).await;
    }
}
