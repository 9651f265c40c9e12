//! Listener side of the push connection.

use crate::broadcast::{ControlFrame, StatusMessage};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// One message received from the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerMessage {
    Audio(Bytes),
    Status(StatusMessage),
}

#[async_trait]
pub trait ListenerTransport: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn ListenerStream>>;
}

#[async_trait]
pub trait ListenerStream: Send {
    /// Next message, or `None` once the server has closed the connection.
    async fn next_message(&mut self) -> Result<Option<ListenerMessage>>;

    async fn close(&mut self);
}

/// Connects to a relay's `/listen` WebSocket endpoint.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
    connect_timeout: Duration,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ListenerTransport for WebSocketTransport {
    async fn connect(&self) -> Result<Box<dyn ListenerStream>> {
        let (socket, _) = tokio::time::timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(self.url.as_str()),
        )
        .await
        .with_context(|| format!("Timed out connecting to {}", self.url))?
        .with_context(|| format!("Failed to connect to {}", self.url))?;

        debug!("Connected to {}", self.url);
        Ok(Box::new(WebSocketListenerStream { socket }))
    }
}

struct WebSocketListenerStream {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl ListenerStream for WebSocketListenerStream {
    async fn next_message(&mut self) -> Result<Option<ListenerMessage>> {
        loop {
            let message = match self.socket.next().await {
                Some(message) => message.context("WebSocket receive failed")?,
                None => return Ok(None),
            };

            match message {
                Message::Binary(data) => return Ok(Some(ListenerMessage::Audio(Bytes::from(data)))),
                Message::Text(text) => match parse_control(&text) {
                    Ok(status) => return Ok(Some(ListenerMessage::Status(status))),
                    Err(e) => debug!("Ignoring control frame: {:#}", e),
                },
                Message::Close(_) => return Ok(None),
                _ => {}
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.socket.close(None).await;
        let _ = self.socket.flush().await;
    }
}

/// Decode a text frame from the relay.
pub fn parse_control(text: &str) -> Result<StatusMessage> {
    match serde_json::from_str::<ControlFrame>(text) {
        Ok(ControlFrame::Status(status)) => Ok(status),
        Err(e) => bail!("unrecognised control frame {:?}: {}", text, e),
    }
}
