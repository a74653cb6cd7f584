//! Device-level relay between tabs and the network.
//!
//! Every tab on a device shares one [`coordinator`] that owns the links. A tab
//! talks to it through a [`TabPort`]:
//! - commands go over an mpsc, with a oneshot reply when one is expected
//! - everything the coordinator hears arrives on the same-origin
//!   [`BroadcastChannel`], where tabs also post their own local changes

use std::sync::Arc;

use eatwheel_core::PeerId;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::broadcast::BroadcastChannel;
use crate::error::{MeshError, Result};
use crate::protocol::PeerMessage;

pub mod coordinator;
pub mod message;

pub use coordinator::{load_or_create_identity, spawn_coordinator, RelayHandle};
pub use message::{ChannelMessage, RelayCommand, RelayReply, RelayRequest, RelayStatus, TabId};

/// One tab's connection to the coordinator.
#[derive(Debug, Clone)]
pub struct TabPort {
    tab_id: TabId,
    peer_id: PeerId,
    commands: mpsc::Sender<RelayRequest>,
    channel: BroadcastChannel,
}

impl TabPort {
    pub(crate) fn new(
        tab_id: TabId,
        peer_id: PeerId,
        commands: mpsc::Sender<RelayRequest>,
        channel: BroadcastChannel,
    ) -> Self {
        Self {
            tab_id,
            peer_id,
            commands,
            channel,
        }
    }

    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    /// The device id, shared by every tab.
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn channel(&self) -> &BroadcastChannel {
        &self.channel
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<str>> {
        self.channel.subscribe()
    }

    pub fn publish(&self, message: &ChannelMessage) -> Result<usize> {
        Ok(self.channel.post(message)?)
    }

    async fn request(&self, command: RelayCommand) -> Result<RelayReply> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(RelayRequest {
                command,
                reply: Some(tx),
            })
            .await
            .map_err(|_| MeshError::CoordinatorGone)?;
        rx.await.map_err(|_| MeshError::CoordinatorGone)
    }

    async fn tell(&self, command: RelayCommand) -> Result<()> {
        self.commands
            .send(RelayRequest {
                command,
                reply: None,
            })
            .await
            .map_err(|_| MeshError::CoordinatorGone)
    }

    pub async fn status(&self) -> Result<RelayStatus> {
        match self.request(RelayCommand::Status).await? {
            RelayReply::Status(status) => Ok(status),
            other => Err(MeshError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    pub async fn connect(&self, peer_id: impl Into<PeerId>) -> Result<RelayReply> {
        self.request(RelayCommand::Connect {
            peer_id: peer_id.into(),
        })
        .await
    }

    pub async fn send(&self, peer_id: impl Into<PeerId>, message: PeerMessage) -> Result<()> {
        self.tell(RelayCommand::Send {
            peer_id: peer_id.into(),
            message,
        })
        .await
    }

    pub async fn broadcast(&self, peers: Vec<PeerId>, message: PeerMessage) -> Result<()> {
        self.tell(RelayCommand::Broadcast { peers, message }).await
    }

    pub async fn register_known_peers(&self, peers: Vec<PeerId>) -> Result<()> {
        self.tell(RelayCommand::RegisterKnownPeers { peers }).await
    }
}
