//! In-process transport. Devices rendezvous through a shared [`MemoryNetwork`].

use std::collections::HashMap;
use std::sync::Arc;

use eatwheel_core::PeerId;
use log::debug;
use tokio::sync::{mpsc, Mutex};

use super::{Channel, Transport};
use crate::error::LinkError;

/// Registry of listening devices.
#[derive(Debug)]
pub struct MemoryNetwork {
    listeners: Mutex<HashMap<PeerId, mpsc::Sender<Channel>>>,
    buffer: usize,
}

impl MemoryNetwork {
    pub fn new(buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            listeners: Mutex::new(HashMap::new()),
            buffer,
        })
    }

    /// Take a device off the network. Existing links are unaffected; new
    /// dials to it fail.
    pub async fn unregister(&self, peer_id: &str) -> bool {
        self.listeners.lock().await.remove(peer_id).is_some()
    }

    pub async fn is_listening(&self, peer_id: &str) -> bool {
        self.listeners
            .lock()
            .await
            .get(peer_id)
            .is_some_and(|l| !l.is_closed())
    }
}

#[derive(Debug, Clone)]
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
}

impl MemoryTransport {
    pub fn new(network: Arc<MemoryNetwork>) -> Self {
        Self { network }
    }

    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }
}

impl Transport for MemoryTransport {
    async fn dial(&self, local: &PeerId, remote: &PeerId) -> Result<Channel, LinkError> {
        let listener = self
            .network
            .listeners
            .lock()
            .await
            .get(remote)
            .cloned()
            .ok_or_else(|| LinkError::Unreachable(remote.clone()))?;

        let (ours, theirs) = Channel::pair(local.clone(), remote.clone(), self.network.buffer);
        listener
            .send(theirs)
            .await
            .map_err(|_| LinkError::Unreachable(remote.clone()))?;
        debug!("{local} dialed {remote} in memory");
        Ok(ours)
    }

    async fn listen(&self, local: &PeerId) -> Result<mpsc::Receiver<Channel>, LinkError> {
        let (tx, rx) = mpsc::channel(self.network.buffer);
        self.network.listeners.lock().await.insert(local.clone(), tx);
        Ok(rx)
    }
}
