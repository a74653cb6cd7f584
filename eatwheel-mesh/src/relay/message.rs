//! Device-local messages between tabs and the coordinator.
//!
//! None of these ever cross the network. Commands travel over an mpsc to the
//! coordinator; [`ChannelMessage`]s are posted as JSON strings on the
//! same-origin [`BroadcastChannel`](crate::broadcast::BroadcastChannel).

use std::sync::Arc;

use eatwheel_core::PeerId;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::ProtocolError;
use crate::protocol::PeerMessage;

/// Identifies one tab (session) on the device.
pub type TabId = String;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum RelayCommand {
    Status,
    Connect { peer_id: PeerId },
    Send { peer_id: PeerId, message: PeerMessage },
    /// Send to every open link among `peers`.
    Broadcast { peers: Vec<PeerId>, message: PeerMessage },
    /// Dial every listed peer that is not already linked.
    RegisterKnownPeers { peers: Vec<PeerId> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatus {
    pub peer_id: PeerId,
    /// Sorted ids of devices with an open link.
    pub open_peers: Vec<PeerId>,
}

impl RelayStatus {
    pub fn peer_count(&self) -> usize {
        self.open_peers.len()
    }

    pub fn is_linked(&self, peer_id: &str) -> bool {
        self.open_peers.iter().any(|p| p == peer_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum RelayReply {
    Status(RelayStatus),
    Accepted,
    Rejected(String),
}

/// A command plus the slot its reply goes to. Fire-and-forget commands
/// carry no reply slot.
#[derive(Debug)]
pub struct RelayRequest {
    pub command: RelayCommand,
    pub reply: Option<oneshot::Sender<RelayReply>>,
}

/// Everything posted on the same-origin channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ChannelMessage {
    /// A validated message received from a remote device.
    Peer { from: PeerId, message: PeerMessage },
    PeerOpened { peer_id: PeerId },
    PeerClosed { peer_id: PeerId },
    /// A tab's own mutation, for its sibling tabs.
    LocalChange { origin: TabId, message: PeerMessage },
    /// A tab left a room; siblings drop it too.
    LeftConnection { origin: TabId, connection_id: String },
    CollectionInsert {
        origin: TabId,
        collection: String,
        key: String,
        value: serde_json::Value,
    },
    CollectionUpdate {
        origin: TabId,
        collection: String,
        key: String,
        value: serde_json::Value,
    },
    CollectionDelete {
        origin: TabId,
        collection: String,
        key: String,
    },
}

impl ChannelMessage {
    pub fn encode(&self) -> Result<Arc<str>, ProtocolError> {
        serde_json::to_string(self)
            .map(Arc::from)
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Parse a channel post. Embedded peer messages are validated too.
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        let msg: Self = serde_json::from_str(raw).map_err(|e| ProtocolError::Decode(e.to_string()))?;
        match &msg {
            ChannelMessage::Peer { message, .. } | ChannelMessage::LocalChange { message, .. } => {
                message.validate()?
            }
            _ => {}
        }
        Ok(msg)
    }

    /// Tab that posted this, for messages tabs post themselves.
    pub fn origin(&self) -> Option<&str> {
        match self {
            ChannelMessage::LocalChange { origin, .. }
            | ChannelMessage::LeftConnection { origin, .. }
            | ChannelMessage::CollectionInsert { origin, .. }
            | ChannelMessage::CollectionUpdate { origin, .. }
            | ChannelMessage::CollectionDelete { origin, .. } => Some(origin),
            _ => None,
        }
    }
}
