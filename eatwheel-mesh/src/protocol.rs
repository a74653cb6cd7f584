//! Peer-to-peer wire protocol.
//!
//! One JSON text frame per message, adjacently tagged:
//! ```text
//! { "type": "updated-eatery",
//!   "data": { "connectionId": "…", "eatery": { "id": "…", "name": "…", "updatedAt": 1 } } }
//! ```
//!
//! Every inbound frame goes through [`PeerMessage::decode`], which parses and
//! then [`validate`](PeerMessage::validate)s. A frame that fails either step is
//! never partially applied.

use eatwheel_core::{Connection, ConnectionInfo, Eatery, EateryScore, EateryVeto, PeerId, User};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Names a room without carrying any of its data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRef {
    pub connection_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnownPeers {
    pub connection_id: String,
    pub peers: Vec<PeerId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EateryChange {
    pub connection_id: String,
    pub eatery: Eatery,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserChange {
    pub connection_id: String,
    pub user: User,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreChange {
    pub connection_id: String,
    pub eatery_score: EateryScore,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VetoChange {
    pub connection_id: String,
    pub eatery_veto: EateryVeto,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionChange {
    pub connection_id: String,
    pub connection: ConnectionInfo,
}

/// Every message one device may send another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PeerMessage {
    #[serde(rename = "request-known-peers")]
    RequestKnownPeers(RoomRef),
    #[serde(rename = "known-peers")]
    KnownPeers(KnownPeers),
    #[serde(rename = "request-storage")]
    RequestStorage(RoomRef),
    /// Full snapshot of one room.
    #[serde(rename = "storage")]
    Storage(Connection),
    #[serde(rename = "updated-eatery")]
    UpdatedEatery(EateryChange),
    #[serde(rename = "updated-user")]
    UpdatedUser(UserChange),
    #[serde(rename = "updated-eateryScore")]
    UpdatedEateryScore(ScoreChange),
    #[serde(rename = "updated-eateryVeto")]
    UpdatedEateryVeto(VetoChange),
    #[serde(rename = "updated-connection")]
    UpdatedConnection(ConnectionChange),
    #[serde(rename = "removed-user")]
    RemovedUser(UserChange),
    #[serde(rename = "removed-eatery")]
    RemovedEatery(EateryChange),
}

impl PeerMessage {
    pub fn request_known_peers(connection_id: impl Into<String>) -> Self {
        Self::RequestKnownPeers(RoomRef {
            connection_id: connection_id.into(),
        })
    }

    pub fn known_peers(connection_id: impl Into<String>, peers: Vec<PeerId>) -> Self {
        Self::KnownPeers(KnownPeers {
            connection_id: connection_id.into(),
            peers,
        })
    }

    pub fn request_storage(connection_id: impl Into<String>) -> Self {
        Self::RequestStorage(RoomRef {
            connection_id: connection_id.into(),
        })
    }

    /// Wire tag, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RequestKnownPeers(_) => "request-known-peers",
            Self::KnownPeers(_) => "known-peers",
            Self::RequestStorage(_) => "request-storage",
            Self::Storage(_) => "storage",
            Self::UpdatedEatery(_) => "updated-eatery",
            Self::UpdatedUser(_) => "updated-user",
            Self::UpdatedEateryScore(_) => "updated-eateryScore",
            Self::UpdatedEateryVeto(_) => "updated-eateryVeto",
            Self::UpdatedConnection(_) => "updated-connection",
            Self::RemovedUser(_) => "removed-user",
            Self::RemovedEatery(_) => "removed-eatery",
        }
    }

    /// The room this message is about.
    pub fn connection_id(&self) -> &str {
        match self {
            Self::RequestKnownPeers(r) | Self::RequestStorage(r) => &r.connection_id,
            Self::KnownPeers(k) => &k.connection_id,
            Self::Storage(c) => &c.id,
            Self::UpdatedEatery(c) | Self::RemovedEatery(c) => &c.connection_id,
            Self::UpdatedUser(c) | Self::RemovedUser(c) => &c.connection_id,
            Self::UpdatedEateryScore(c) => &c.connection_id,
            Self::UpdatedEateryVeto(c) => &c.connection_id,
            Self::UpdatedConnection(c) => &c.connection_id,
        }
    }

    /// Whether this message carries a record mutation.
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            Self::RequestKnownPeers(_) | Self::KnownPeers(_) | Self::RequestStorage(_) | Self::Storage(_)
        )
    }

    /// Structural checks that serde alone cannot express.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let kind = self.kind();
        let invalid = |reason: &str| ProtocolError::Invalid {
            kind,
            reason: reason.to_string(),
        };

        if self.connection_id().is_empty() {
            return Err(invalid("empty connection id"));
        }

        match self {
            Self::RequestKnownPeers(_) | Self::RequestStorage(_) => Ok(()),
            Self::KnownPeers(k) => {
                if k.peers.iter().any(|p| p.is_empty()) {
                    return Err(invalid("empty peer id"));
                }
                Ok(())
            }
            Self::Storage(conn) => {
                let s = &conn.settings;
                if s.eateries.iter().any(|e| e.id.is_empty())
                    || s.users.iter().any(|u| u.id.is_empty())
                    || s.known_peers.iter().any(|p| p.is_empty())
                {
                    return Err(invalid("empty record id in snapshot"));
                }
                if s.eatery_scores.iter().any(|sc| !valid_score(sc)) {
                    return Err(invalid("bad score in snapshot"));
                }
                if s.eatery_vetoes.iter().any(|v| v.user_id.is_empty() || v.eatery_id.is_empty()) {
                    return Err(invalid("empty veto key in snapshot"));
                }
                Ok(())
            }
            Self::UpdatedEatery(c) => non_empty(&c.eatery.id).ok_or_else(|| invalid("empty eatery id")),
            Self::UpdatedUser(c) => non_empty(&c.user.id).ok_or_else(|| invalid("empty user id")),
            Self::RemovedEatery(c) => {
                non_empty(&c.eatery.id).ok_or_else(|| invalid("empty eatery id"))?;
                if !c.eatery.deleted {
                    return Err(invalid("removal without tombstone"));
                }
                Ok(())
            }
            Self::RemovedUser(c) => {
                non_empty(&c.user.id).ok_or_else(|| invalid("empty user id"))?;
                if !c.user.deleted {
                    return Err(invalid("removal without tombstone"));
                }
                Ok(())
            }
            Self::UpdatedEateryScore(c) => {
                if !valid_score(&c.eatery_score) {
                    return Err(invalid("empty key or non-finite score"));
                }
                Ok(())
            }
            Self::UpdatedEateryVeto(c) => {
                if c.eatery_veto.user_id.is_empty() || c.eatery_veto.eatery_id.is_empty() {
                    return Err(invalid("empty veto key"));
                }
                Ok(())
            }
            Self::UpdatedConnection(_) => Ok(()),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Parse and validate one inbound frame.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        let msg: Self = serde_json::from_str(frame).map_err(|e| ProtocolError::Decode(e.to_string()))?;
        msg.validate()?;
        Ok(msg)
    }
}

fn non_empty(id: &str) -> Option<()> {
    (!id.is_empty()).then_some(())
}

fn valid_score(score: &EateryScore) -> bool {
    !score.user_id.is_empty() && !score.eatery_id.is_empty() && score.score.is_finite()
}
