//! Thin wrapper around `tokio-tungstenite` that splits a connection into
//! reader and writer halves for use in `tokio::select!` loops.

use anyhow::{Context, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Received WebSocket message.
#[derive(Debug)]
pub enum WsMessage {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close { code: u16, reason: String },
}

/// Write half of a WebSocket connection.
pub struct WsWriter {
    sink: SplitSink<WsStream, tungstenite::Message>,
}

impl WsWriter {
    pub async fn send_text(&mut self, text: String) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Text(text))
            .await
            .context("WebSocket send_text failed")
    }

    pub async fn send_pong(&mut self, data: Vec<u8>) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Pong(data))
            .await
            .context("WebSocket send_pong failed")
    }

    /// Send a close frame and flush.
    pub async fn close(&mut self) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Close(None))
            .await
            .context("WebSocket send_close failed")?;
        self.sink.close().await.context("WebSocket close failed")
    }
}

/// Read half of a WebSocket connection.
pub struct WsReader {
    stream: SplitStream<WsStream>,
}

impl WsReader {
    /// Next message, or `None` once the stream has ended. Raw frames are
    /// skipped.
    pub async fn recv(&mut self) -> Option<Result<WsMessage>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(anyhow::anyhow!("WebSocket read error: {e}"))),
            };
            return Some(Ok(match message {
                tungstenite::Message::Text(text) => WsMessage::Text(text.to_string()),
                tungstenite::Message::Binary(data) => WsMessage::Binary(data.to_vec()),
                tungstenite::Message::Ping(data) => WsMessage::Ping(data.to_vec()),
                tungstenite::Message::Pong(data) => WsMessage::Pong(data.to_vec()),
                tungstenite::Message::Close(frame) => {
                    let (code, reason) = frame
                        .map(|cf| (cf.code.into(), cf.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    WsMessage::Close { code, reason }
                }
                tungstenite::Message::Frame(_) => continue,
            }));
        }
    }
}

/// Perform the WebSocket handshake against `url`.
pub async fn connect(url: &str) -> Result<(WsWriter, WsReader)> {
    let (ws_stream, _response) = tokio_tungstenite::connect_async(url)
        .await
        .with_context(|| format!("WebSocket connect to {url} failed"))?;

    let (sink, stream) = ws_stream.split();
    Ok((WsWriter { sink }, WsReader { stream }))
}

/// Convert an HTTP(S) URL to the WS(S) scheme; `ws://` and `wss://` pass through.
pub fn http_to_ws_scheme(url: &str) -> String {
    if url.starts_with("wss://") || url.starts_with("ws://") {
        url.to_string()
    } else {
        url.replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_to_ws_scheme() {
        assert_eq!(http_to_ws_scheme("https://relay.example"), "wss://relay.example");
        assert_eq!(http_to_ws_scheme("http://127.0.0.1:8080/ws"), "ws://127.0.0.1:8080/ws");
        assert_eq!(http_to_ws_scheme("ws://already"), "ws://already");
    }
}
