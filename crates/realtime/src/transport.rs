//! Socket transport abstraction.
//!
//! The channel state machine only needs to open a socket, exchange text frames
//! and close it. [`WsTransport`] is the production implementation on top of
//! `tokio-tungstenite`; tests substitute scripted transports.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message,
};
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::{RealtimeError, Result};

/// Opens sockets to the realtime endpoint.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, url: &str) -> Result<Box<dyn Socket>>;
}

/// An open text-frame socket.
#[async_trait]
pub trait Socket: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Next inbound text frame. `None` once the peer closed the stream.
    async fn next_text(&mut self) -> Option<Result<String>>;

    async fn close(&mut self);
}

/// WebSocket transport backed by `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, url: &str) -> Result<Box<dyn Socket>> {
        let parsed = Url::parse(url).map_err(|e| RealtimeError::InvalidUrl(e.to_string()))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(RealtimeError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                parsed.scheme()
            )));
        }

        let (stream, response) = connect_async(url).await?;
        debug!(status = %response.status(), host = ?parsed.host_str(), "Realtime socket opened");
        Ok(Box::new(WsSocket { stream }))
    }
}

struct WsSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Socket for WsSocket {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.stream.send(Message::text(text)).await?;
        Ok(())
    }

    async fn next_text(&mut self) -> Option<Result<String>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Some(Ok(text)),
                    Err(e) => warn!(error = %e, len = bytes.len(), "Dropping non UTF-8 binary frame"),
                },
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "Realtime socket closed by peer");
                    return None;
                }
                // Pings are answered by tungstenite on the next read/write.
                Ok(other) => trace!(len = other.len(), "Skipping control frame"),
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "Error while closing realtime socket");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_non_websocket_urls() {
        let result = WsTransport.open("https://example.com/realtime").await;
        assert!(matches!(result, Err(RealtimeError::InvalidUrl(_))));

        let result = WsTransport.open("not a url").await;
        assert!(matches!(result, Err(RealtimeError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_non_utf8_binary_frame_is_dropped_without_reconnect() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::time::Duration;

        use serde_json::json;
        use tokio::net::TcpListener;

        use crate::channel::{RealtimeChannel, RealtimeConfig};
        use crate::event::{ConnectionStatus, RealtimeEvent};
        use crate::frame::Frame;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let accepts = Arc::new(AtomicUsize::new(0));
        let counter = accepts.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let nth = counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                    // Join frame.
                    let _ = ws.next().await;
                    if nth == 0 {
                        ws.send(Message::binary(vec![0xff, 0xfe, 0x00])).await.unwrap();
                        let update = Frame::new(
                            "user:u1",
                            "delivery_update",
                            json!({"title": "Picked up", "message": "On its way"}),
                        );
                        ws.send(Message::text(update.to_text().unwrap())).await.unwrap();
                    }
                    while let Some(Ok(_)) = ws.next().await {}
                });
            }
        });

        let channel = RealtimeChannel::with_websocket(
            RealtimeConfig::new(url, RealtimeConfig::user_topic("u1"))
                .with_heartbeat_interval(Duration::ZERO),
        );
        let mut events = channel.subscribe();
        let mut status = channel.watch_status();
        channel.connect();

        let update = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let RealtimeEvent::DeliveryUpdate(update) = events.recv().await.unwrap() {
                    break update;
                }
            }
        })
        .await
        .expect("delivery update after the binary frame");
        assert_eq!(update.title, "Picked up");

        // A dropped connection would reconnect after the 1 s base delay.
        status.mark_unchanged();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(accepts.load(Ordering::SeqCst), 1);
        assert!(!status.has_changed().unwrap());
        assert_eq!(channel.status(), ConnectionStatus::Connected);

        channel.disconnect().await;
    }
}
