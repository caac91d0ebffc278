//! WebSocket signaling channel
//!
//! Connects to the chat backend's conversation sockets
//! (`/ws/channel/<id>/?token=...`, `/ws/dm/<group>/?token=...`). Only text
//! frames carry traffic; pings are answered and a close frame ends the
//! inbound stream.

use crate::signaling::{SignalingChannel, SignalingError};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;

/// URL of a workspace channel's socket
#[must_use]
pub fn channel_url(base: &str, channel_id: &str, token: &str) -> String {
    conversation_url(base, "channel", channel_id, token)
}

/// URL of a direct-message group's socket
#[must_use]
pub fn dm_url(base: &str, group_id: &str, token: &str) -> String {
    conversation_url(base, "dm", group_id, token)
}

fn conversation_url(base: &str, kind: &str, id: &str, token: &str) -> String {
    format!(
        "{}/ws/{}/{}/?token={}",
        base.trim_end_matches('/'),
        kind,
        urlencoding::encode(id),
        urlencoding::encode(token)
    )
}

/// Signaling channel over one WebSocket connection
pub struct WsSignalingChannel {
    outbound: mpsc::UnboundedSender<tungstenite::Message>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    open: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl WsSignalingChannel {
    /// Connect to a conversation socket
    ///
    /// # Errors
    ///
    /// Returns error if the WebSocket handshake fails
    #[tracing::instrument(skip(url))]
    pub async fn connect(url: &str) -> Result<Self, SignalingError> {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| SignalingError::TransportError(e.to_string()))?;
        tracing::info!("Signaling socket connected");

        let (mut ws_tx, mut ws_rx) = ws.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<tungstenite::Message>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));

        let writer_open = Arc::clone(&open);
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, tungstenite::Message::Close(_));
                if let Err(e) = ws_tx.send(message).await {
                    tracing::warn!(error = %e, "Signaling socket write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
            writer_open.store(false, Ordering::SeqCst);
        });

        let reader_open = Arc::clone(&open);
        let pong = outbound.clone();
        let reader = tokio::spawn(async move {
            while let Some(message) = ws_rx.next().await {
                let message = match message {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::warn!(error = %e, "Signaling socket read failed");
                        break;
                    }
                };
                match message {
                    tungstenite::Message::Text(text) => {
                        if inbound_tx.send(text).is_err() {
                            break;
                        }
                    }
                    tungstenite::Message::Ping(payload) => {
                        let _ = pong.send(tungstenite::Message::Pong(payload));
                    }
                    tungstenite::Message::Close(frame) => {
                        tracing::info!(frame = ?frame, "Signaling socket closed by server");
                        break;
                    }
                    _ => {}
                }
            }
            reader_open.store(false, Ordering::SeqCst);
        });

        Ok(Self {
            outbound,
            inbound: tokio::sync::Mutex::new(inbound),
            open,
            reader,
        })
    }

    /// Start the closing handshake; inbound frames end once the server confirms
    pub fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.outbound.send(tungstenite::Message::Close(None));
        }
    }
}

#[async_trait]
impl SignalingChannel for WsSignalingChannel {
    async fn send_text(&self, frame: String) -> Result<(), SignalingError> {
        if !self.is_open() {
            return Err(SignalingError::ChannelClosed);
        }
        self.outbound
            .send(tungstenite::Message::Text(frame))
            .map_err(|_| SignalingError::ChannelClosed)
    }

    async fn receive_text(&self) -> Option<String> {
        self.inbound.lock().await.recv().await
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for WsSignalingChannel {
    fn drop(&mut self) {
        self.close();
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversation_urls() {
        assert_eq!(
            channel_url("ws://localhost:8000/", "12", "abc"),
            "ws://localhost:8000/ws/channel/12/?token=abc"
        );
        assert_eq!(
            dm_url("wss://chat.example.org", "g7", "t"),
            "wss://chat.example.org/ws/dm/g7/?token=t"
        );
    }

    #[test]
    fn test_token_is_percent_encoded() {
        assert_eq!(
            channel_url("ws://localhost:8000", "12", "a&b#c+d=/e f"),
            "ws://localhost:8000/ws/channel/12/?token=a%26b%23c%2Bd%3D%2Fe%20f"
        );
        assert_eq!(
            dm_url("ws://localhost:8000", "team/x", "t"),
            "ws://localhost:8000/ws/dm/team%2Fx/?token=t"
        );
    }
}
