//! Point-to-point transports between devices.
//!
//! A transport hands the coordinator a [`Channel`] per established link: two
//! ordered text pipes, one per direction. When the remote goes away the
//! inbound receiver ends; dropping the outbound sender tears the link down.
//!
//! - [`MemoryTransport`] — in-process rendezvous, for tests and embedding
//! - [`WsTransport`]     — WebSocket over TCP via tokio-tungstenite

use std::future::Future;

use eatwheel_core::PeerId;
use tokio::sync::mpsc;

use crate::error::LinkError;

pub mod memory;
pub mod ws;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use ws::{Directory, WsTransport};

/// An established, handshaken link to one remote device.
#[derive(Debug)]
pub struct Channel {
    pub remote: PeerId,
    pub tx: mpsc::Sender<String>,
    pub rx: mpsc::Receiver<String>,
}

impl Channel {
    /// Two channels wired back to back.
    pub fn pair(a: impl Into<PeerId>, b: impl Into<PeerId>, buffer: usize) -> (Channel, Channel) {
        let (a_tx, b_rx) = mpsc::channel(buffer);
        let (b_tx, a_rx) = mpsc::channel(buffer);
        // Each side's `remote` names the other end.
        let at_a = Channel {
            remote: b.into(),
            tx: a_tx,
            rx: a_rx,
        };
        let at_b = Channel {
            remote: a.into(),
            tx: b_tx,
            rx: b_rx,
        };
        (at_a, at_b)
    }
}

pub trait Transport: Send + Sync + 'static {
    /// Open a link from `local` to `remote`, including the handshake.
    fn dial(
        &self,
        local: &PeerId,
        remote: &PeerId,
    ) -> impl Future<Output = Result<Channel, LinkError>> + Send;

    /// Start accepting links addressed to `local`.
    fn listen(
        &self,
        local: &PeerId,
    ) -> impl Future<Output = Result<mpsc::Receiver<Channel>, LinkError>> + Send;
}
