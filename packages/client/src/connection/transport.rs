//! Channel transport
//!
//! One live bidirectional connection to the agent. The [`Transport`] trait is
//! the seam the daemon (and the tests) program against; [`WsTransport`] is
//! the only concrete implementation. Inbound text frames are decoded here and
//! forwarded as [`TransportEvent`]s; everything above this module works with
//! typed events only.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::connection::protocol::{AgentFrame, Command};
use crate::error::ChannelError;

/// What the transport reports upward to the dispatcher.
#[derive(Debug)]
pub enum TransportEvent {
    Frame(AgentFrame),
    Error(String),
    Closed,
}

/// The persistent-channel contract: connect, disconnect, send. Connection
/// lifecycle and inbound frames surface through the event channel supplied
/// at construction.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection to `url`, releasing any previous connection first
    /// so frames are never delivered twice across a reconnect.
    async fn connect(&self, url: &str) -> Result<(), ChannelError>;

    /// Tear down the live connection, if any.
    async fn disconnect(&self);

    /// Send one text command.
    async fn send(&self, command: Command) -> Result<(), ChannelError>;
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Websocket transport over tokio-tungstenite.
pub struct WsTransport {
    events: mpsc::Sender<TransportEvent>,
    writer: Mutex<Option<WsSink>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl WsTransport {
    pub fn new(events: mpsc::Sender<TransportEvent>) -> Self {
        Self {
            events,
            writer: Mutex::new(None),
            reader: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, url: &str) -> Result<(), ChannelError> {
        self.disconnect().await;

        debug!(url = %url, "connecting websocket channel");
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;
        let (write, mut read) = stream.split();
        *self.writer.lock().await = Some(write);

        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            while let Some(item) = read.next().await {
                match item {
                    Ok(Message::Text(text)) => match AgentFrame::parse(&text) {
                        Ok(frame) => {
                            if events.send(TransportEvent::Frame(frame)).await.is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, "discarding unparseable frame");
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        let _ = events.send(TransportEvent::Error(err.to_string())).await;
                        break;
                    }
                }
            }
            let _ = events.send(TransportEvent::Closed).await;
        });
        *self.reader.lock().await = Some(handle);
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }
        if let Some(mut write) = self.writer.lock().await.take() {
            let _ = write.close().await;
        }
    }

    async fn send(&self, command: Command) -> Result<(), ChannelError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ChannelError::NotConnected)?;
        debug!(command = %command, "sending channel command");
        writer
            .send(Message::Text(command.to_string()))
            .await
            .map_err(|e| ChannelError::Send(e.to_string()))
    }
}
