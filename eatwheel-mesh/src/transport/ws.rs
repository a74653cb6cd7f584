//! WebSocket transport.
//!
//! Handshake, one text frame each way before any peer traffic:
//! ```text
//! dialer                        listener
//!   │── connect ws://… ──────────►│
//!   │── {"peerId": dialer} ──────►│
//!   │◄────── {"peerId": listener}─│
//!   │         (link open)         │
//! ```
//!
//! The dialer checks that the listener answers with the id it meant to reach.
//! A [`Directory`] maps device ids to the URL they listen on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use eatwheel_core::PeerId;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async, WebSocketStream};
use url::Url;

use super::{Channel, Transport};
use crate::config::MeshConfig;
use crate::error::LinkError;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Hello {
    peer_id: PeerId,
}

/// Where each device can be reached.
#[derive(Debug, Clone, Default)]
pub struct Directory {
    entries: Arc<RwLock<HashMap<PeerId, Url>>>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, peer_id: impl Into<PeerId>, url: Url) {
        self.entries.write().await.insert(peer_id.into(), url);
    }

    pub async fn lookup(&self, peer_id: &str) -> Option<Url> {
        self.entries.read().await.get(peer_id).cloned()
    }

    pub async fn remove(&self, peer_id: &str) -> Option<Url> {
        self.entries.write().await.remove(peer_id)
    }
}

#[derive(Debug, Clone)]
pub struct WsTransport {
    directory: Directory,
    bind_addr: String,
    handshake_timeout: Duration,
    buffer: usize,
}

impl WsTransport {
    pub fn new(directory: Directory, bind_addr: impl Into<String>, config: &MeshConfig) -> Self {
        Self {
            directory,
            bind_addr: bind_addr.into(),
            handshake_timeout: config.handshake_timeout,
            buffer: config.link_buffer,
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.bind_addr
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }
}

impl Transport for WsTransport {
    async fn dial(&self, local: &PeerId, remote: &PeerId) -> Result<Channel, LinkError> {
        let url = self
            .directory
            .lookup(remote)
            .await
            .ok_or_else(|| LinkError::Unreachable(remote.clone()))?;

        let handshake = async {
            let (mut ws, _) = connect_async(url.as_str())
                .await
                .map_err(|e| LinkError::Unreachable(format!("{remote}: {e}")))?;
            write_hello(&mut ws, local).await?;
            let hello = read_hello(&mut ws).await?;
            if &hello.peer_id != remote {
                return Err(LinkError::Handshake(format!(
                    "expected {remote}, reached {}",
                    hello.peer_id
                )));
            }
            Ok::<_, LinkError>(ws)
        };
        let ws = timeout(self.handshake_timeout, handshake)
            .await
            .map_err(|_| LinkError::Timeout)??;

        debug!("{local} dialed {remote} at {url}");
        Ok(spawn_pumps(ws, remote.clone(), self.buffer))
    }

    async fn listen(&self, local: &PeerId) -> Result<mpsc::Receiver<Channel>, LinkError> {
        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .map_err(|e| LinkError::Transport(e.to_string()))?;
        info!("{local} listening on {}", self.bind_addr);

        let (tx, rx) = mpsc::channel(self.buffer);
        let local = local.clone();
        let handshake_timeout = self.handshake_timeout;
        let buffer = self.buffer;

        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = tx.closed() => break,
                    accepted = listener.accept() => accepted,
                };
                let (stream, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("Accept failed: {e}");
                        continue;
                    }
                };

                let tx = tx.clone();
                let local = local.clone();
                tokio::spawn(async move {
                    match timeout(handshake_timeout, accept_handshake(stream, &local)).await {
                        Ok(Ok((ws, remote))) => {
                            debug!("Accepted {remote} from {addr}");
                            let _ = tx.send(spawn_pumps(ws, remote, buffer)).await;
                        }
                        Ok(Err(e)) => warn!("Handshake from {addr} failed: {e}"),
                        Err(_) => warn!("Handshake from {addr} timed out"),
                    }
                });
            }
            debug!("{local} stopped listening");
        });

        Ok(rx)
    }
}

async fn accept_handshake(
    stream: TcpStream,
    local: &PeerId,
) -> Result<(WebSocketStream<TcpStream>, PeerId), LinkError> {
    let mut ws = accept_async(stream)
        .await
        .map_err(|e| LinkError::Handshake(e.to_string()))?;
    let hello = read_hello(&mut ws).await?;
    if hello.peer_id.is_empty() || &hello.peer_id == local {
        return Err(LinkError::Handshake(format!("bad peer id {:?}", hello.peer_id)));
    }
    write_hello(&mut ws, local).await?;
    Ok((ws, hello.peer_id))
}

async fn write_hello<S>(ws: &mut WebSocketStream<S>, local: &PeerId) -> Result<(), LinkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = serde_json::to_string(&Hello {
        peer_id: local.clone(),
    })
    .map_err(|e| LinkError::Handshake(e.to_string()))?;
    ws.send(Message::Text(hello.into()))
        .await
        .map_err(|e| LinkError::Handshake(e.to_string()))
}

async fn read_hello<S>(ws: &mut WebSocketStream<S>) -> Result<Hello, LinkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(msg) = ws.next().await {
        match msg.map_err(|e| LinkError::Handshake(e.to_string()))? {
            Message::Text(text) => {
                return serde_json::from_str(text.as_str())
                    .map_err(|e| LinkError::Handshake(e.to_string()));
            }
            Message::Close(_) => break,
            _ => continue,
        }
    }
    Err(LinkError::Handshake("closed before hello".into()))
}

/// Bridge a socket to a [`Channel`] with one writer and one reader task.
fn spawn_pumps<S>(ws: WebSocketStream<S>, remote: PeerId, buffer: usize) -> Channel
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(buffer);
    let (in_tx, in_rx) = mpsc::channel::<String>(buffer);

    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let peer = remote.clone();
    tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if in_tx.send(text.as_str().to_owned()).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        debug!("WebSocket to {peer} ended");
    });

    Channel {
        remote,
        tx: out_tx,
        rx: in_rx,
    }
}
