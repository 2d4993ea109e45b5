use async_trait::async_trait;
use futures::{SinkExt, StreamExt, stream::SplitSink};
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::{
    net::TcpStream,
    sync::{Mutex, mpsc},
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};
use url::Url;

use super::{OutboundTransport, TransportError};
use crate::definitions::WireMessage;

pub(crate) const SCHEME_WS: &str = "ws";
pub(crate) const SCHEME_WSS: &str = "wss";

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// WebSocket transport keeping one persistent socket per endpoint. Messages
/// the peer pushes back on a socket are handed to the `inbound` channel.
#[derive(Clone)]
pub struct WsTransport {
    sockets: Arc<Mutex<HashMap<String, (u64, WsSink)>>>,
    next_id: Arc<AtomicU64>,
    inbound: mpsc::UnboundedSender<WireMessage>,
}

impl WsTransport {
    pub fn new(inbound: mpsc::UnboundedSender<WireMessage>) -> Self {
        Self {
            sockets: Default::default(),
            next_id: Default::default(),
            inbound,
        }
    }

    async fn connect(&self, url: &Url) -> Result<(u64, WsSink), TransportError> {
        let (stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Websocket(url.to_string(), Box::new(e)))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sink, mut receiver) = stream.split();

        let inbound = self.inbound.clone();
        let sockets = self.sockets.clone();
        let endpoint = url.to_string();

        tokio::spawn(async move {
            while let Some(Ok(message)) = receiver.next().await {
                let data = match message {
                    Message::Binary(bytes) => bytes.to_vec(),
                    Message::Text(text) => text.as_bytes().to_vec(),
                    Message::Close(_) => break,
                    _ => continue,
                };

                if inbound.send(data).is_err() {
                    break;
                }
            }

            let mut sockets = sockets.lock().await;
            if sockets.get(&endpoint).is_some_and(|(current, _)| *current == id) {
                sockets.remove(&endpoint);
            }

            tracing::debug!("websocket to {endpoint} closed");
        });

        Ok((id, sink))
    }

    /// Number of open outbound sockets
    pub async fn open_sockets(&self) -> usize {
        self.sockets.lock().await.len()
    }
}

#[async_trait]
impl OutboundTransport for WsTransport {
    fn schemes(&self) -> &[&'static str] {
        &[SCHEME_WS, SCHEME_WSS]
    }

    async fn send(
        &self,
        url: &Url,
        message: &[u8],
    ) -> Result<Option<WireMessage>, TransportError> {
        let endpoint = url.to_string();
        let mut sockets = self.sockets.lock().await;

        if let Some((_, sink)) = sockets.get_mut(&endpoint) {
            if sink.send(Message::binary(message.to_vec())).await.is_ok() {
                return Ok(None);
            }

            tracing::debug!("websocket to {endpoint} went away, reconnecting");
            sockets.remove(&endpoint);
        }

        let (id, mut sink) = self.connect(url).await?;
        sink.send(Message::binary(message.to_vec()))
            .await
            .map_err(|e| TransportError::Websocket(endpoint.clone(), Box::new(e)))?;

        sockets.insert(endpoint, (id, sink));

        Ok(None)
    }
}
