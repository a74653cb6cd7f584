//! The device-local replica of every joined room.
//!
//! Two write paths, never mixed:
//!
//! ```text
//! local mutation ──► stamp updatedAt ──► assign in place ──► persist
//! remote record  ──► MergeEngine (LWW) ──► assign winner ──► persist if changed
//! ```
//!
//! Local writes need no merge: they are stamped past the version they
//! replace, so they are always the newest copy this device has seen.
//!
//! Removals are tombstones. Removing an eatery or a participant also
//! tombstones the scores and vetoes that reference it, using the same
//! timestamp, and the same cascade runs when a tombstone arrives remotely so
//! every replica derives the same children.

use std::sync::Arc;

use log::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::merge::{merge_connection, merge_known_peers, resolve, Resolution};
use crate::model::{
    Connection, ConnectionInfo, Eatery, EateryScore, EateryVeto, PeerId, Record, Timestamp, User,
};
use crate::storage::{Storage, StorageExt};
use crate::Result;

/// A tombstoned record plus the dependents tombstoned with it.
#[derive(Debug, Clone, PartialEq)]
pub struct Removal<T> {
    pub record: T,
    pub scores: Vec<EateryScore>,
    pub vetoes: Vec<EateryVeto>,
}

/// Authoritative list of rooms on this device.
pub struct Replica {
    connections: Vec<Connection>,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
}

impl Replica {
    /// Load the persisted rooms from `storage`.
    pub fn open(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Result<Self> {
        let connections = storage.load_connections()?;
        info!("Replica opened with {} connection(s)", connections.len());
        Ok(Self {
            connections,
            storage,
            clock,
        })
    }

    fn persist(&self) -> Result<()> {
        self.storage.save_connections(&self.connections)
    }

    // ─── Queries ──────────────────────────────────────────────────────

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn connection(&self, id: &str) -> Option<&Connection> {
        self.connections.iter().find(|c| c.id == id)
    }

    pub fn has_connection(&self, id: &str) -> bool {
        self.connection(id).is_some()
    }

    pub fn active_eateries(&self, connection_id: &str) -> Vec<&Eatery> {
        self.connection(connection_id)
            .map(|c| c.settings.eateries.iter().filter(|e| !e.deleted).collect())
            .unwrap_or_default()
    }

    pub fn active_users(&self, connection_id: &str) -> Vec<&User> {
        self.connection(connection_id)
            .map(|c| c.settings.users.iter().filter(|u| !u.deleted).collect())
            .unwrap_or_default()
    }

    /// Live scores whose participant and eatery are both live.
    pub fn active_scores(&self, connection_id: &str) -> Vec<&EateryScore> {
        let Some(conn) = self.connection(connection_id) else {
            return Vec::new();
        };
        conn.settings
            .eatery_scores
            .iter()
            .filter(|s| !s.deleted && is_live_pair(conn, &s.user_id, &s.eatery_id))
            .collect()
    }

    /// Live vetoes whose participant and eatery are both live.
    pub fn active_vetoes(&self, connection_id: &str) -> Vec<&EateryVeto> {
        let Some(conn) = self.connection(connection_id) else {
            return Vec::new();
        };
        conn.settings
            .eatery_vetoes
            .iter()
            .filter(|v| !v.deleted && is_live_pair(conn, &v.user_id, &v.eatery_id))
            .collect()
    }

    pub fn known_peers(&self, connection_id: &str) -> &[PeerId] {
        self.connection(connection_id)
            .map(|c| c.settings.known_peers.as_slice())
            .unwrap_or_default()
    }

    /// Ids of every room that lists `peer_id` among its known peers.
    pub fn connections_with_peer(&self, peer_id: &str) -> Vec<String> {
        self.connections
            .iter()
            .filter(|c| c.knows_peer(peer_id))
            .map(|c| c.id.clone())
            .collect()
    }

    // ─── Local mutations ──────────────────────────────────────────────

    /// Create a new room owned by nobody in particular.
    pub fn create_connection(&mut self, name: &str) -> Result<Connection> {
        let connection = Connection::new(
            Uuid::new_v4().to_string(),
            name,
            stamp(self.clock.as_ref(), 0),
        );
        self.connections.push(connection.clone());
        info!("Created connection {} ({name})", connection.id);
        self.persist()?;
        Ok(connection)
    }

    pub fn rename_connection(&mut self, connection_id: &str, name: &str) -> Result<Option<ConnectionInfo>> {
        let Some(conn) = find_mut(&mut self.connections, connection_id) else {
            return Ok(None);
        };
        let info = &mut conn.settings.connection;
        info.name = name.to_string();
        info.updated_at = stamp(self.clock.as_ref(), info.updated_at);
        let renamed = info.clone();
        self.persist()?;
        Ok(Some(renamed))
    }

    /// Forget a room on this device only. Other devices keep their copy.
    pub fn leave_connection(&mut self, connection_id: &str) -> Result<bool> {
        let before = self.connections.len();
        self.connections.retain(|c| c.id != connection_id);
        if self.connections.len() == before {
            return Ok(false);
        }
        info!("Left connection {connection_id}");
        self.persist()?;
        Ok(true)
    }

    pub fn add_eatery(&mut self, connection_id: &str, name: &str) -> Result<Option<Eatery>> {
        let Some(conn) = find_mut(&mut self.connections, connection_id) else {
            return Ok(None);
        };
        let eatery = Eatery::new(Uuid::new_v4().to_string(), name, stamp(self.clock.as_ref(), 0));
        conn.settings.eateries.push(eatery.clone());
        debug!("Added eatery {} to {connection_id}", eatery.id);
        self.persist()?;
        Ok(Some(eatery))
    }

    pub fn update_eatery(&mut self, connection_id: &str, eatery_id: &str, name: &str) -> Result<Option<Eatery>> {
        let Some(conn) = find_mut(&mut self.connections, connection_id) else {
            return Ok(None);
        };
        let Some(eatery) = conn.settings.eateries.iter_mut().find(|e| e.id == eatery_id) else {
            return Ok(None);
        };
        eatery.name = name.to_string();
        eatery.updated_at = stamp(self.clock.as_ref(), eatery.updated_at);
        let updated = eatery.clone();
        self.persist()?;
        Ok(Some(updated))
    }

    /// Tombstone an eatery and every score and veto given to it.
    pub fn remove_eatery(&mut self, connection_id: &str, eatery_id: &str) -> Result<Option<Removal<Eatery>>> {
        let Some(conn) = find_mut(&mut self.connections, connection_id) else {
            return Ok(None);
        };
        let Some(current) = conn.eatery(eatery_id) else {
            return Ok(None);
        };
        let newest = newest_dependent(conn, |_, eatery| eatery == eatery_id).max(current.updated_at);
        let at = stamp(self.clock.as_ref(), newest);

        let Some(eatery) = conn.settings.eateries.iter_mut().find(|e| e.id == eatery_id) else {
            return Ok(None);
        };
        eatery.deleted = true;
        eatery.updated_at = at;
        let record = eatery.clone();
        let (scores, vetoes) = cascade(conn, at, |_, eatery| eatery == eatery_id);
        debug!(
            "Removed eatery {eatery_id} from {connection_id} ({} scores, {} vetoes)",
            scores.len(),
            vetoes.len()
        );
        self.persist()?;
        Ok(Some(Removal { record, scores, vetoes }))
    }

    pub fn add_user(&mut self, connection_id: &str, name: &str, email: Option<String>) -> Result<Option<User>> {
        let Some(conn) = find_mut(&mut self.connections, connection_id) else {
            return Ok(None);
        };
        let user = User::new(Uuid::new_v4().to_string(), name, email, stamp(self.clock.as_ref(), 0));
        conn.settings.users.push(user.clone());
        debug!("Added user {} to {connection_id}", user.id);
        self.persist()?;
        Ok(Some(user))
    }

    pub fn update_user(
        &mut self,
        connection_id: &str,
        user_id: &str,
        name: &str,
        email: Option<String>,
    ) -> Result<Option<User>> {
        let Some(conn) = find_mut(&mut self.connections, connection_id) else {
            return Ok(None);
        };
        let Some(user) = conn.settings.users.iter_mut().find(|u| u.id == user_id) else {
            return Ok(None);
        };
        user.name = name.to_string();
        user.email = email;
        user.updated_at = stamp(self.clock.as_ref(), user.updated_at);
        let updated = user.clone();
        self.persist()?;
        Ok(Some(updated))
    }

    /// Tombstone a participant and every score and veto they gave.
    pub fn remove_user(&mut self, connection_id: &str, user_id: &str) -> Result<Option<Removal<User>>> {
        let Some(conn) = find_mut(&mut self.connections, connection_id) else {
            return Ok(None);
        };
        let Some(current) = conn.user(user_id) else {
            return Ok(None);
        };
        let newest = newest_dependent(conn, |user, _| user == user_id).max(current.updated_at);
        let at = stamp(self.clock.as_ref(), newest);

        let Some(user) = conn.settings.users.iter_mut().find(|u| u.id == user_id) else {
            return Ok(None);
        };
        user.deleted = true;
        user.updated_at = at;
        let record = user.clone();
        let (scores, vetoes) = cascade(conn, at, |user, _| user == user_id);
        debug!("Removed user {user_id} from {connection_id}");
        self.persist()?;
        Ok(Some(Removal { record, scores, vetoes }))
    }

    /// Set (or revive) a participant's score for an eatery.
    ///
    /// Both the participant and the eatery must exist and be live.
    pub fn set_score(
        &mut self,
        connection_id: &str,
        user_id: &str,
        eatery_id: &str,
        score: f64,
    ) -> Result<Option<EateryScore>> {
        let Some(conn) = find_mut(&mut self.connections, connection_id) else {
            return Ok(None);
        };
        if !is_live_pair(conn, user_id, eatery_id) {
            return Ok(None);
        }
        let scores = &mut conn.settings.eatery_scores;
        let updated = match scores
            .iter_mut()
            .find(|s| s.user_id == user_id && s.eatery_id == eatery_id)
        {
            Some(existing) => {
                existing.score = score;
                existing.deleted = false;
                existing.updated_at = stamp(self.clock.as_ref(), existing.updated_at);
                existing.clone()
            }
            None => {
                let created = EateryScore::new(user_id, eatery_id, score, stamp(self.clock.as_ref(), 0));
                scores.push(created.clone());
                created
            }
        };
        self.persist()?;
        Ok(Some(updated))
    }

    /// Flip a participant's veto on an eatery.
    pub fn toggle_veto(&mut self, connection_id: &str, user_id: &str, eatery_id: &str) -> Result<Option<EateryVeto>> {
        let Some(conn) = find_mut(&mut self.connections, connection_id) else {
            return Ok(None);
        };
        if !is_live_pair(conn, user_id, eatery_id) {
            return Ok(None);
        }
        let vetoes = &mut conn.settings.eatery_vetoes;
        let toggled = match vetoes
            .iter_mut()
            .find(|v| v.user_id == user_id && v.eatery_id == eatery_id)
        {
            Some(existing) => {
                existing.deleted = !existing.deleted;
                existing.updated_at = stamp(self.clock.as_ref(), existing.updated_at);
                existing.clone()
            }
            None => {
                let created = EateryVeto::new(user_id, eatery_id, stamp(self.clock.as_ref(), 0));
                vetoes.push(created.clone());
                created
            }
        };
        self.persist()?;
        Ok(Some(toggled))
    }

    // ─── Remote application (always through the merge engine) ─────────

    /// Merge a full room snapshot, adopting it when the room is unknown.
    ///
    /// Whether an unknown room may be adopted at all is the caller's call.
    pub fn apply_connection(&mut self, incoming: &Connection) -> Result<bool> {
        let position = self.connections.iter().position(|c| c.id == incoming.id);
        let merged = merge_connection(position.map(|i| &self.connections[i]), incoming);
        if !merged.changed {
            return Ok(false);
        }
        match position {
            Some(i) => self.connections[i] = merged.value,
            None => {
                info!("Adopted connection {} from snapshot", incoming.id);
                self.connections.push(merged.value);
            }
        }
        self.persist()?;
        Ok(true)
    }

    pub fn apply_connection_info(&mut self, connection_id: &str, incoming: &ConnectionInfo) -> Result<bool> {
        let Some(conn) = find_mut(&mut self.connections, connection_id) else {
            return Ok(false);
        };
        if resolve(Some(&conn.settings.connection), incoming) == Resolution::KeepExisting {
            return Ok(false);
        }
        conn.settings.connection = incoming.clone();
        self.persist()?;
        Ok(true)
    }

    /// Merge one eatery version. A winning tombstone cascades to dependents.
    pub fn apply_eatery(&mut self, connection_id: &str, incoming: &Eatery) -> Result<bool> {
        let Some(conn) = find_mut(&mut self.connections, connection_id) else {
            return Ok(false);
        };
        if !merge_into(&mut conn.settings.eateries, incoming) {
            return Ok(false);
        }
        if incoming.deleted {
            let eatery_id = incoming.id.as_str();
            cascade(conn, incoming.updated_at, |_, eatery| eatery == eatery_id);
        }
        self.persist()?;
        Ok(true)
    }

    /// Merge one participant version. A winning tombstone cascades to dependents.
    pub fn apply_user(&mut self, connection_id: &str, incoming: &User) -> Result<bool> {
        let Some(conn) = find_mut(&mut self.connections, connection_id) else {
            return Ok(false);
        };
        if !merge_into(&mut conn.settings.users, incoming) {
            return Ok(false);
        }
        if incoming.deleted {
            let user_id = incoming.id.as_str();
            cascade(conn, incoming.updated_at, |user, _| user == user_id);
        }
        self.persist()?;
        Ok(true)
    }

    pub fn apply_score(&mut self, connection_id: &str, incoming: &EateryScore) -> Result<bool> {
        let Some(conn) = find_mut(&mut self.connections, connection_id) else {
            return Ok(false);
        };
        if !merge_into(&mut conn.settings.eatery_scores, incoming) {
            return Ok(false);
        }
        self.persist()?;
        Ok(true)
    }

    pub fn apply_veto(&mut self, connection_id: &str, incoming: &EateryVeto) -> Result<bool> {
        let Some(conn) = find_mut(&mut self.connections, connection_id) else {
            return Ok(false);
        };
        if !merge_into(&mut conn.settings.eatery_vetoes, incoming) {
            return Ok(false);
        }
        self.persist()?;
        Ok(true)
    }

    /// Union `peers` into a room's known peers. Returns the ids that were new.
    pub fn add_known_peers(&mut self, connection_id: &str, peers: &[PeerId]) -> Result<Vec<PeerId>> {
        let Some(conn) = find_mut(&mut self.connections, connection_id) else {
            return Ok(Vec::new());
        };
        let before = conn.settings.known_peers.len();
        let merged = merge_known_peers(&conn.settings.known_peers, peers);
        if !merged.changed {
            return Ok(Vec::new());
        }
        let learned = merged.value[before..].to_vec();
        conn.settings.known_peers = merged.value;
        debug!("Connection {connection_id} learned {} peer(s)", learned.len());
        self.persist()?;
        Ok(learned)
    }
}

/// Stamp for a write replacing a version stamped `previous`.
fn stamp(clock: &dyn Clock, previous: Timestamp) -> Timestamp {
    clock.now().max(previous.saturating_add(1))
}

fn find_mut<'a>(connections: &'a mut [Connection], id: &str) -> Option<&'a mut Connection> {
    connections.iter_mut().find(|c| c.id == id)
}

fn is_live_pair(conn: &Connection, user_id: &str, eatery_id: &str) -> bool {
    conn.user(user_id).is_some_and(|u| !u.deleted) && conn.eatery(eatery_id).is_some_and(|e| !e.deleted)
}

/// In-place LWW merge of one record into a collection.
fn merge_into<T: Record>(records: &mut Vec<T>, incoming: &T) -> bool {
    let key = incoming.key();
    match records.iter().position(|r| r.key() == key) {
        Some(i) => {
            if resolve(Some(&records[i]), incoming) == Resolution::TakeIncoming {
                records[i] = incoming.clone();
                return true;
            }
            false
        }
        None => {
            if resolve(None, incoming) == Resolution::TakeIncoming {
                records.push(incoming.clone());
                return true;
            }
            false
        }
    }
}

fn newest_dependent(conn: &Connection, matches: impl Fn(&str, &str) -> bool) -> Timestamp {
    let scores = conn
        .settings
        .eatery_scores
        .iter()
        .filter(|s| matches(&s.user_id, &s.eatery_id))
        .map(|s| s.updated_at);
    let vetoes = conn
        .settings
        .eatery_vetoes
        .iter()
        .filter(|v| matches(&v.user_id, &v.eatery_id))
        .map(|v| v.updated_at);
    scores.chain(vetoes).max().unwrap_or(0)
}

/// Tombstone live scores and vetoes matched by `matches` that are older than `at`.
fn cascade(
    conn: &mut Connection,
    at: Timestamp,
    matches: impl Fn(&str, &str) -> bool,
) -> (Vec<EateryScore>, Vec<EateryVeto>) {
    let mut scores = Vec::new();
    for score in &mut conn.settings.eatery_scores {
        if !score.deleted && score.updated_at < at && matches(&score.user_id, &score.eatery_id) {
            score.deleted = true;
            score.updated_at = at;
            scores.push(score.clone());
        }
    }
    let mut vetoes = Vec::new();
    for veto in &mut conn.settings.eatery_vetoes {
        if !veto.deleted && veto.updated_at < at && matches(&veto.user_id, &veto.eatery_id) {
            veto.deleted = true;
            veto.updated_at = at;
            vetoes.push(veto.clone());
        }
    }
    (scores, vetoes)
}
