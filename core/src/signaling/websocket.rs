// WebSocket relay dialer (tokio-tungstenite)

use super::client::{RelayDialer, RelayFrame, RelayLink};
use anyhow::Context;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

/// Dials `ws://` / `wss://` relays.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketDialer;

#[async_trait]
impl RelayDialer for WebSocketDialer {
    async fn dial(&self, address: &str) -> anyhow::Result<RelayLink> {
        let (ws_stream, _) = connect_async(address)
            .await
            .with_context(|| format!("failed to connect to relay {}", address))?;
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = ws_write.send(Message::Text(text)).await {
                    warn!("Relay write failed: {}", e);
                    break;
                }
            }
            // Sender dropped: tell the relay we are leaving.
            let _ = ws_write.close().await;
            debug!("Relay writer finished");
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                let frame = match msg {
                    Ok(Message::Text(text)) => RelayFrame::Text(text),
                    Ok(Message::Binary(bytes)) => {
                        RelayFrame::Text(String::from_utf8_lossy(&bytes).into_owned())
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = in_tx.send(RelayFrame::Error(e.to_string()));
                        break;
                    }
                };
                if in_tx.send(frame).is_err() {
                    return;
                }
            }
            let _ = in_tx.send(RelayFrame::Closed);
        });

        Ok(RelayLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::client::SignalingClient;
    use crate::signaling::protocol::{parse_inbound, Inbound, Signal};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    async fn next_frame(link: &mut mpsc::UnboundedReceiver<RelayFrame>) -> RelayFrame {
        timeout(WAIT, link.recv())
            .await
            .expect("timed out waiting for a relay frame")
            .expect("frame stream ended")
    }

    #[tokio::test]
    async fn test_join_frames_and_close_over_a_real_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("ws://{}", listener.local_addr().unwrap());
        let (joined_tx, joined_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let first = ws.next().await.unwrap().unwrap();
            joined_tx.send(first.into_text().unwrap()).unwrap();
            ws.send(Message::Text("hello".to_string())).await.unwrap();
            ws.send(Message::Binary(b"bytes".to_vec())).await.unwrap();
            ws.close(None).await.unwrap();
        });

        let mut client = SignalingClient::new(Arc::new(WebSocketDialer), "standup");
        let connection = client.begin(&address).unwrap();
        let link = WebSocketDialer.dial(&address).await.unwrap();
        let mut inbound = client
            .established(connection, link)
            .unwrap()
            .expect("link accepted");

        let joined = timeout(WAIT, joined_rx).await.unwrap().unwrap();
        match parse_inbound(&joined) {
            Inbound::Signal(Signal::Join { room }) => assert_eq!(room, "standup"),
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(next_frame(&mut inbound).await, RelayFrame::Text("hello".into()));
        assert_eq!(next_frame(&mut inbound).await, RelayFrame::Text("bytes".into()));
        assert_eq!(next_frame(&mut inbound).await, RelayFrame::Closed);
    }

    #[tokio::test]
    async fn test_dial_refused_names_the_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let err = WebSocketDialer.dial(&address).await.unwrap_err();
        assert!(format!("{:#}", err).contains(&address));
    }
}
