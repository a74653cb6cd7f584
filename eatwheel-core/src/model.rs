//! Room data model.
//!
//! Persisted and wire layout (camelCase JSON):
//! ```text
//! Connection
//! ├── id
//! └── settings
//!     ├── connection    { name, updatedAt }
//!     ├── eateries      [ { id, name, updatedAt, _deleted? } ]
//!     ├── users         [ { id, name, email, updatedAt, _deleted? } ]
//!     ├── eateryScores  [ { userId, eateryId, score, updatedAt, _deleted? } ]
//!     ├── eateryVetoes  [ { userId, eateryId, updatedAt, _deleted? } ]
//!     └── knownPeers    [ peer id ]
//! ```
//!
//! Records are never physically removed. `_deleted: true` is a tombstone and
//! takes part in last-writer-wins like any other version.

use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::hash::Hash;

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Network identity of a device.
pub type PeerId = String;

/// A versioned record that merges by `(key, updated_at)`.
pub trait Record: Clone {
    /// Identity of the record within its collection.
    type Key: Eq + Hash + Clone + Debug;

    fn key(&self) -> Self::Key;

    fn updated_at(&self) -> Timestamp;

    /// Whether this version is a tombstone.
    fn is_deleted(&self) -> bool {
        false
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// A restaurant candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Eatery {
    pub id: String,
    pub name: String,
    pub updated_at: Timestamp,
    #[serde(rename = "_deleted", default, skip_serializing_if = "is_false")]
    pub deleted: bool,
}

impl Eatery {
    pub fn new(id: impl Into<String>, name: impl Into<String>, updated_at: Timestamp) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            updated_at,
            deleted: false,
        }
    }
}

impl Record for Eatery {
    type Key = String;

    fn key(&self) -> String {
        self.id.clone()
    }

    fn updated_at(&self) -> Timestamp {
        self.updated_at
    }

    fn is_deleted(&self) -> bool {
        self.deleted
    }
}

/// A participant of a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    pub updated_at: Timestamp,
    #[serde(rename = "_deleted", default, skip_serializing_if = "is_false")]
    pub deleted: bool,
}

impl User {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        email: Option<String>,
        updated_at: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email,
            updated_at,
            deleted: false,
        }
    }
}

impl Record for User {
    type Key = String;

    fn key(&self) -> String {
        self.id.clone()
    }

    fn updated_at(&self) -> Timestamp {
        self.updated_at
    }

    fn is_deleted(&self) -> bool {
        self.deleted
    }
}

/// One participant's score for one eatery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EateryScore {
    pub user_id: String,
    pub eatery_id: String,
    pub score: f64,
    pub updated_at: Timestamp,
    #[serde(rename = "_deleted", default, skip_serializing_if = "is_false")]
    pub deleted: bool,
}

impl EateryScore {
    pub fn new(
        user_id: impl Into<String>,
        eatery_id: impl Into<String>,
        score: f64,
        updated_at: Timestamp,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            eatery_id: eatery_id.into(),
            score,
            updated_at,
            deleted: false,
        }
    }
}

impl Record for EateryScore {
    type Key = (String, String);

    fn key(&self) -> (String, String) {
        (self.user_id.clone(), self.eatery_id.clone())
    }

    fn updated_at(&self) -> Timestamp {
        self.updated_at
    }

    fn is_deleted(&self) -> bool {
        self.deleted
    }
}

/// "Never pick this for me." A live veto is one that is not deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EateryVeto {
    pub user_id: String,
    pub eatery_id: String,
    pub updated_at: Timestamp,
    #[serde(rename = "_deleted", default, skip_serializing_if = "is_false")]
    pub deleted: bool,
}

impl EateryVeto {
    pub fn new(user_id: impl Into<String>, eatery_id: impl Into<String>, updated_at: Timestamp) -> Self {
        Self {
            user_id: user_id.into(),
            eatery_id: eatery_id.into(),
            updated_at,
            deleted: false,
        }
    }
}

impl Record for EateryVeto {
    type Key = (String, String);

    fn key(&self) -> (String, String) {
        (self.user_id.clone(), self.eatery_id.clone())
    }

    fn updated_at(&self) -> Timestamp {
        self.updated_at
    }

    fn is_deleted(&self) -> bool {
        self.deleted
    }
}

/// Room-level metadata, merged as a singleton record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub name: String,
    pub updated_at: Timestamp,
}

impl Record for ConnectionInfo {
    type Key = ();

    fn key(&self) {}

    fn updated_at(&self) -> Timestamp {
        self.updated_at
    }
}

/// Everything a room owns. Missing collections deserialize as empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSettings {
    pub connection: ConnectionInfo,
    #[serde(default)]
    pub eateries: Vec<Eatery>,
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub eatery_scores: Vec<EateryScore>,
    #[serde(default)]
    pub eatery_vetoes: Vec<EateryVeto>,
    #[serde(default)]
    pub known_peers: Vec<PeerId>,
}

/// A room: the top-level replicated unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub settings: ConnectionSettings,
}

impl Connection {
    /// An empty room with the given id and display name.
    pub fn new(id: impl Into<String>, name: impl Into<String>, updated_at: Timestamp) -> Self {
        Self {
            id: id.into(),
            settings: ConnectionSettings {
                connection: ConnectionInfo {
                    name: name.into(),
                    updated_at,
                },
                eateries: Vec::new(),
                users: Vec::new(),
                eatery_scores: Vec::new(),
                eatery_vetoes: Vec::new(),
                known_peers: Vec::new(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.connection.name
    }

    pub fn eatery(&self, id: &str) -> Option<&Eatery> {
        self.settings.eateries.iter().find(|e| e.id == id)
    }

    pub fn user(&self, id: &str) -> Option<&User> {
        self.settings.users.iter().find(|u| u.id == id)
    }

    pub fn score(&self, user_id: &str, eatery_id: &str) -> Option<&EateryScore> {
        self.settings
            .eatery_scores
            .iter()
            .find(|s| s.user_id == user_id && s.eatery_id == eatery_id)
    }

    pub fn veto(&self, user_id: &str, eatery_id: &str) -> Option<&EateryVeto> {
        self.settings
            .eatery_vetoes
            .iter()
            .find(|v| v.user_id == user_id && v.eatery_id == eatery_id)
    }

    pub fn knows_peer(&self, peer_id: &str) -> bool {
        self.settings.known_peers.iter().any(|p| p == peer_id)
    }
}
