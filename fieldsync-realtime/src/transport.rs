//! Message-oriented transport channels.
//!
//! A [`Connector`] opens one channel to an endpoint and hands back a
//! [`Connection`]: a bounded sender for outbound text frames and a stream of
//! inbound text frames. The stream ending, or yielding an error, means the
//! channel closed.

use async_trait::async_trait;
use fieldsync_core::TransportError;
use futures_util::stream::BoxStream;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace};

/// One open channel.
pub struct Connection {
    pub outbound: mpsc::Sender<String>,
    pub inbound: BoxStream<'static, Result<String, TransportError>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("outbound_closed", &self.outbound.is_closed())
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &str) -> Result<Connection, TransportError>;
}

/// WebSocket connector over `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    outbound_buffer: usize,
}

impl WsConnector {
    pub fn new(outbound_buffer: usize) -> Self {
        Self {
            outbound_buffer: outbound_buffer.max(1),
        }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &str) -> Result<Connection, TransportError> {
        let (stream, _) = tokio_tungstenite::connect_async(endpoint)
            .await
            .map_err(|err| TransportError::ConnectFailed {
                endpoint: endpoint.to_string(),
                reason: err.to_string(),
            })?;
        let (mut sink, stream) = stream.split();

        let (outbound, mut frames) = mpsc::channel::<String>(self.outbound_buffer);
        tokio::spawn(async move {
            while let Some(text) = frames.recv().await {
                if let Err(err) = sink.send(Message::Text(text)).await {
                    debug!(error = %err, "WebSocket write failed, closing writer");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let inbound = stream
            .filter_map(|message| async move {
                match message {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    Ok(Message::Close(frame)) => {
                        trace!(?frame, "WebSocket close frame received");
                        Some(Err(TransportError::Closed))
                    }
                    Ok(_) => None,
                    Err(err) => Some(Err(TransportError::Io {
                        reason: err.to_string(),
                    })),
                }
            })
            .boxed();

        Ok(Connection { outbound, inbound })
    }
}
