use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};

use domain::{ClientFrame, ServerFrame};

use crate::error::SessionError;
use crate::transport::{Connection, Transport};

/// 基于 tokio-tungstenite 的 WebSocket 传输
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self) -> Result<Box<dyn Connection>, SessionError> {
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(SessionError::transport)?;
        tracing::debug!(url = %self.url, "WebSocket 已连接");
        Ok(Box::new(WsConnection { stream }))
    }
}

struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&mut self, frame: ClientFrame) -> Result<(), SessionError> {
        let payload =
            serde_json::to_string(&frame).map_err(|err| SessionError::Protocol(err.to_string()))?;
        self.stream
            .send(WsMessage::Text(payload.into()))
            .await
            .map_err(SessionError::transport)
    }

    async fn recv(&mut self) -> Result<Option<ServerFrame>, SessionError> {
        loop {
            let Some(message) = self.stream.next().await else {
                return Ok(None);
            };
            match message.map_err(SessionError::transport)? {
                WsMessage::Text(text) => {
                    return serde_json::from_str(text.as_str())
                        .map(Some)
                        .map_err(|err| SessionError::Protocol(err.to_string()))
                }
                WsMessage::Binary(bytes) => {
                    return serde_json::from_slice(&bytes)
                        .map(Some)
                        .map_err(|err| SessionError::Protocol(err.to_string()))
                }
                WsMessage::Close(_) => return Ok(None),
                _ => continue,
            }
        }
    }
}
