use super::{SignalMessage, SignalingChannel, Subscribers};
use crate::error::SignalingError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Сигнальный канал поверх WebSocket (JSON текстовые кадры)
pub struct WsSignaling {
    outgoing: mpsc::UnboundedSender<Message>,
    subscribers: Arc<Subscribers>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl WsSignaling {
    pub async fn connect(url: &str) -> Result<Self, SignalingError> {
        info!("Connecting to signaling relay {}", url);
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| SignalingError::Transport(e.to_string()))?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(frame) = outgoing_rx.recv().await {
                if let Err(e) = ws_tx.send(frame).await {
                    warn!("Failed to write signaling frame: {}", e);
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        let subscribers = Arc::new(Subscribers::default());
        let inbound = subscribers.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_rx.next().await {
                match frame {
                    Ok(Message::Text(text)) => match SignalMessage::parse(&text) {
                        Ok(message) => {
                            debug!("relay -> client: {}", message.event_name());
                            inbound.dispatch(message);
                        }
                        Err(e) => warn!("Dropping signaling frame: {}", e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Signaling connection error: {}", e);
                        break;
                    }
                }
            }
            info!("Signaling connection closed");
            inbound.close();
        });

        Ok(Self {
            outgoing,
            subscribers,
            reader,
            writer,
        })
    }
}

#[async_trait]
impl SignalingChannel for WsSignaling {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<SignalMessage> {
        self.subscribers.subscribe()
    }

    async fn send(&self, message: SignalMessage) -> Result<(), SignalingError> {
        let text = message.to_json()?;
        self.outgoing
            .send(Message::Text(text))
            .map_err(|_| SignalingError::Closed)
    }

    async fn leave(&self, room_id: &str) {
        // ретранслятор чистит комнату по endCall или обрыву соединения
        debug!("Leaving room {}", room_id);
    }
}

impl Drop for WsSignaling {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}
