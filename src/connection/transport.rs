// Transport abstraction for the realtime channel.
//
// A Transport opens one link at a time; the link is a pair of mpsc channels
// carrying text frames. The WebSocket implementation pumps the socket into
// the channels so the connection driver never touches the socket directly,
// and tests can stand in an in-memory transport.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::error::ConnectionError;

/// One live link. The inbound channel closing signals link loss.
pub struct TransportLink {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self) -> Result<TransportLink, ConnectionError>;
}

const LINK_CHANNEL_CAPACITY: usize = 64;

pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        WebSocketTransport { url: url.into() }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self) -> Result<TransportLink, ConnectionError> {
        let (socket, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;
        debug!("WebSocket connected to {}", self.url);

        let (mut sink, mut stream) = socket.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(LINK_CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<String>(LINK_CHANNEL_CAPACITY);

        // Writer pump: drains outbound frames into the socket.
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = sink.send(WsMessage::Text(text)).await {
                    warn!("WebSocket write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Reader pump: forwards text frames; dropping in_tx on exit closes
        // the inbound channel and tells the driver the link is gone.
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => {
                        if in_tx.send(text).await.is_err() {
                            break;
                        }
                    }
                    Ok(WsMessage::Close(reason)) => {
                        debug!("WebSocket closed by peer: {:?}", reason);
                        break;
                    }
                    Ok(_) => {} // ping/pong and binary frames are not used
                    Err(e) => {
                        warn!("WebSocket read failed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
