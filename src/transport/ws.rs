//! Real `RawTransport`/`TransportFactory` backed by `tokio-tungstenite`.
//!
//! The wire shape is a hand-rolled socket.io-like envelope (see
//! [`crate::protocol::SocketFrame`]); there's no socket.io crate involved,
//! just a WebSocket connection carrying `{"event": ..., "data": ...}` text
//! frames, one per line of JSON.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::protocol::{Namespace, SocketFrame};

use super::{RawTransport, TransportError, TransportFactory};

/// A `tokio-tungstenite` socket bound to one namespace path.
pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

#[async_trait]
impl RawTransport for WsTransport {
    async fn send(&mut self, frame: SocketFrame) -> Result<(), TransportError> {
        let text = serde_json::to_string(&frame).map_err(TransportError::from_display)?;
        self.stream.send(Message::Text(text.into())).await.map_err(TransportError::from_display)
    }

    async fn recv(&mut self) -> Option<Result<SocketFrame, TransportError>> {
        loop {
            let message = self.stream.next().await?;
            match message {
                Ok(Message::Text(text)) => {
                    return Some(serde_json::from_str(text.as_str()).map_err(TransportError::from_display));
                }
                Ok(Message::Close(_)) => return None,
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Binary(_)) | Ok(Message::Frame(_)) => {
                    continue;
                }
                Err(err) => return Some(Err(TransportError::from_display(err))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

/// Opens real `WsTransport` sockets against a `ws(s)://` origin.
#[derive(Debug, Default)]
pub struct WsTransportFactory;

#[async_trait]
impl TransportFactory for WsTransportFactory {
    async fn connect(&self, ws_origin: &str, namespace: &Namespace) -> Result<Box<dyn RawTransport>, TransportError> {
        let url = format!("{ws_origin}{}", namespace.path());
        let (stream, _response) = connect_async(url).await.map_err(TransportError::from_display)?;
        Ok(Box::new(WsTransport { stream }))
    }
}
