use super::relay::{Relay, Route};
use super::SignalMessage;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Раздаёт ретранслятор по WebSocket, пока жив listener
pub async fn serve_ws(listener: TcpListener, relay: Arc<Relay>) -> std::io::Result<()> {
    info!("Signaling relay listening on {}", listener.local_addr()?);
    loop {
        let (stream, addr) = listener.accept().await?;
        let relay = relay.clone();
        tokio::spawn(async move {
            debug!("New signaling connection from {}", addr);
            handle_connection(stream, relay).await;
            debug!("Signaling connection from {} finished", addr);
        });
    }
}

async fn handle_connection(stream: TcpStream, relay: Arc<Relay>) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake failed: {}", e);
            return;
        }
    };
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    // Канал для отправки сообщений обратно этому клиенту
    let (tx, mut rx) = mpsc::unbounded_channel::<SignalMessage>();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match message.to_json() {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to encode {}: {}", message.event_name(), e);
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let route: Route = Arc::new(tx);
    // (room, user) последнего join на этом соединении
    let mut joined: Option<(String, String)> = None;

    while let Some(frame) = ws_rx.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!("Signaling socket error: {}", e);
                break;
            }
        };
        let message = match SignalMessage::parse(&text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping signaling frame: {}", e);
                continue;
            }
        };

        let sender = if let SignalMessage::Join { room_id, user_id } = &message {
            joined = Some((room_id.clone(), user_id.clone()));
            user_id.clone()
        } else if let Some((_, user_id)) = &joined {
            user_id.clone()
        } else {
            warn!("Dropping {} before call:join", message.event_name());
            continue;
        };
        let ended = matches!(message, SignalMessage::End { .. });

        if let Err(e) = relay.handle(&sender, &route, message) {
            warn!("Relay rejected message from {}: {}", sender, e);
        }
        if ended {
            joined = None;
        }
    }

    if let Some((room_id, user_id)) = joined {
        info!("User {} dropped from room {}", user_id, room_id);
        relay.disconnect(&room_id, &user_id, &route);
    }
    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::{SignalingChannel, WsSignaling};
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn relays_between_websocket_clients() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let relay = Relay::new();
        tokio::spawn(serve_ws(listener, relay.clone()));

        let url = format!("ws://{}", addr);
        let a = WsSignaling::connect(&url).await.unwrap();
        let b = WsSignaling::connect(&url).await.unwrap();
        let mut a_rx = a.subscribe();
        let mut b_rx = b.subscribe();

        a.send(SignalMessage::Join {
            room_id: "r1".into(),
            user_id: "a".into(),
        })
        .await
        .unwrap();
        // ждём, пока ретранслятор обработает первый join
        for _ in 0..50 {
            if relay.members("r1").len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        b.send(SignalMessage::Join {
            room_id: "r1".into(),
            user_id: "b".into(),
        })
        .await
        .unwrap();

        let got = timeout(Duration::from_secs(5), a_rx.recv()).await.unwrap();
        assert_eq!(
            got,
            Some(SignalMessage::ParticipantJoined {
                room_id: "r1".into(),
                user_id: "b".into()
            })
        );
        let got = timeout(Duration::from_secs(5), b_rx.recv()).await.unwrap();
        assert_eq!(
            got,
            Some(SignalMessage::ParticipantJoined {
                room_id: "r1".into(),
                user_id: "a".into()
            })
        );

        drop(a);
        let got = timeout(Duration::from_secs(5), b_rx.recv()).await.unwrap();
        assert_eq!(
            got,
            Some(SignalMessage::End {
                room_id: "r1".into(),
                user_id: "a".into()
            })
        );
    }

    async fn wait_members(relay: &Relay, room: &str, count: usize) {
        for _ in 0..100 {
            if relay.members(room).len() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("room {} never reached {} members", room, count);
    }

    #[tokio::test]
    async fn closing_replaced_socket_keeps_rejoined_member() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let relay = Relay::new();
        tokio::spawn(serve_ws(listener, relay.clone()));
        let url = format!("ws://{}", addr);
        let join = |user: &str| SignalMessage::Join {
            room_id: "r1".into(),
            user_id: user.into(),
        };

        let b = WsSignaling::connect(&url).await.unwrap();
        let mut b_rx = b.subscribe();
        b.send(join("b")).await.unwrap();
        wait_members(&relay, "r1", 1).await;

        let old_a = WsSignaling::connect(&url).await.unwrap();
        old_a.send(join("a")).await.unwrap();
        let got = timeout(Duration::from_secs(5), b_rx.recv()).await.unwrap();
        assert_eq!(got, Some(join_announce("a")));

        // a вошёл заново с нового сокета, старый закрывается позже
        let new_a = WsSignaling::connect(&url).await.unwrap();
        let mut new_a_rx = new_a.subscribe();
        new_a.send(join("a")).await.unwrap();
        let got = timeout(Duration::from_secs(5), new_a_rx.recv()).await.unwrap();
        assert_eq!(got, Some(join_announce("b")));
        let got = timeout(Duration::from_secs(5), b_rx.recv()).await.unwrap();
        assert_eq!(got, Some(join_announce("a")));

        drop(old_a);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(b_rx.try_recv().is_err());
        let mut members = relay.members("r1");
        members.sort();
        assert_eq!(members, vec!["a".to_string(), "b".to_string()]);

        // закрытие живого сокета по-прежнему завершает звонок
        drop(new_a);
        let got = timeout(Duration::from_secs(5), b_rx.recv()).await.unwrap();
        assert_eq!(
            got,
            Some(SignalMessage::End {
                room_id: "r1".into(),
                user_id: "a".into()
            })
        );
        assert_eq!(relay.members("r1"), vec!["b".to_string()]);
    }

    fn join_announce(user: &str) -> SignalMessage {
        SignalMessage::ParticipantJoined {
            room_id: "r1".into(),
            user_id: user.into(),
        }
    }
}
