//! WebSocket transport over tokio-tungstenite.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Transport, TransportLink};
use crate::error::TransportError;
use crate::frame::WireMessage;

/// Inbound queue depth per socket.
const INBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Transport for WebSocketTransport {
    async fn open(&self) -> Result<TransportLink, TransportError> {
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(TransportError::from_tungstenite)?;
        debug!(url = %self.url, "websocket open");

        let (mut ws_write, mut ws_read) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WireMessage>();
        let (in_tx, in_rx) = mpsc::channel::<WireMessage>(INBOUND_CAPACITY);
        let cancel = CancellationToken::new();

        // Writer: drain outbound channel → socket
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    msg = out_rx.recv() => {
                        let Some(msg) = msg else { break };
                        let frame = match msg {
                            WireMessage::Text(text) => Message::Text(text.into()),
                            WireMessage::Binary(bytes) => Message::Binary(bytes.into()),
                        };
                        if let Err(e) = ws_write.send(frame).await {
                            warn!("websocket write error: {}", e);
                            break;
                        }
                    }
                }
            }
            let _ = ws_write.close().await;
            writer_cancel.cancel();
        });

        // Reader: socket → inbound channel
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    msg = ws_read.next() => {
                        let wire = match msg {
                            Some(Ok(Message::Text(text))) => {
                                WireMessage::Text(text.as_str().to_string())
                            }
                            Some(Ok(Message::Binary(bytes))) => WireMessage::Binary(bytes.to_vec()),
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                warn!("websocket read error: {}", e);
                                break;
                            }
                        };
                        if in_tx.send(wire).await.is_err() {
                            break;
                        }
                    }
                }
            }
            // dropping in_tx tells the driver the socket is gone
            reader_cancel.cancel();
        });

        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
            cancel,
        })
    }
}
