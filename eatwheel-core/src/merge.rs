//! Last-writer-wins merge of records, collections and whole rooms.
//!
//! Rules:
//! - A version replaces another only with a strictly greater `updated_at`.
//! - Ties keep the version already applied.
//! - Tombstones are ordinary versions, so an older live copy can never
//!   resurrect a newer tombstone, and a newer live copy can un-delete.
//! - Keys only ever get added; nothing absent from an incoming payload is
//!   removed locally.
//!
//! All functions are pure. Callers persist the result.
//!
//! Reference: Shapiro et al. — "A comprehensive study of CRDTs", LWW-Register

use std::collections::HashMap;

use crate::model::{Connection, ConnectionSettings, PeerId, Record};

/// Which side of a merge wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    KeepExisting,
    TakeIncoming,
}

/// A merge result together with whether it differs from the local input.
#[derive(Debug, Clone, PartialEq)]
pub struct Merged<T> {
    pub value: T,
    pub changed: bool,
}

impl<T> Merged<T> {
    fn unchanged(value: T) -> Self {
        Self { value, changed: false }
    }
}

/// Decide between the local version (if any) and an incoming one.
///
/// An absent local version counts as `updated_at == 0`.
pub fn resolve<T: Record>(existing: Option<&T>, incoming: &T) -> Resolution {
    let current = existing.map_or(0, Record::updated_at);
    if incoming.updated_at() > current {
        Resolution::TakeIncoming
    } else {
        Resolution::KeepExisting
    }
}

/// Merge a single record. Returns the winner, or `None` when there was no
/// local version and the incoming one does not beat the zero timestamp.
pub fn merge_record<T: Record>(existing: Option<&T>, incoming: &T) -> Option<T> {
    match resolve(existing, incoming) {
        Resolution::TakeIncoming => Some(incoming.clone()),
        Resolution::KeepExisting => existing.cloned(),
    }
}

/// Merge two collections by key, producing the union of keys.
///
/// Local order is preserved; keys seen only in `incoming` are appended in
/// their incoming order.
pub fn merge_collection<T: Record>(existing: &[T], incoming: &[T]) -> Merged<Vec<T>> {
    let mut merged = existing.to_vec();
    let mut index: HashMap<T::Key, usize> = merged
        .iter()
        .enumerate()
        .map(|(i, record)| (record.key(), i))
        .collect();
    let mut changed = false;

    for record in incoming {
        match index.get(&record.key()) {
            Some(&i) => {
                if resolve(Some(&merged[i]), record) == Resolution::TakeIncoming {
                    merged[i] = record.clone();
                    changed = true;
                }
            }
            None => {
                if resolve(None, record) == Resolution::TakeIncoming {
                    index.insert(record.key(), merged.len());
                    merged.push(record.clone());
                    changed = true;
                }
            }
        }
    }

    Merged { value: merged, changed }
}

/// Union of two known-peer lists. Never drops an entry.
pub fn merge_known_peers(existing: &[PeerId], incoming: &[PeerId]) -> Merged<Vec<PeerId>> {
    let mut merged = existing.to_vec();
    let mut changed = false;
    for peer in incoming {
        if peer.is_empty() || merged.contains(peer) {
            continue;
        }
        merged.push(peer.clone());
        changed = true;
    }
    Merged { value: merged, changed }
}

/// Merge a full room snapshot into the local copy.
///
/// With no local copy the snapshot is adopted, keeping one record per key.
pub fn merge_connection(existing: Option<&Connection>, incoming: &Connection) -> Merged<Connection> {
    let Some(local) = existing else {
        return Merged {
            value: adopt(incoming),
            changed: true,
        };
    };

    let ours = &local.settings;
    let theirs = &incoming.settings;

    let connection = match resolve(Some(&ours.connection), &theirs.connection) {
        Resolution::TakeIncoming => Merged {
            value: theirs.connection.clone(),
            changed: true,
        },
        Resolution::KeepExisting => Merged::unchanged(ours.connection.clone()),
    };
    let eateries = merge_collection(&ours.eateries, &theirs.eateries);
    let users = merge_collection(&ours.users, &theirs.users);
    let eatery_scores = merge_collection(&ours.eatery_scores, &theirs.eatery_scores);
    let eatery_vetoes = merge_collection(&ours.eatery_vetoes, &theirs.eatery_vetoes);
    let known_peers = merge_known_peers(&ours.known_peers, &theirs.known_peers);

    let changed = connection.changed
        || eateries.changed
        || users.changed
        || eatery_scores.changed
        || eatery_vetoes.changed
        || known_peers.changed;

    Merged {
        value: Connection {
            id: local.id.clone(),
            settings: ConnectionSettings {
                connection: connection.value,
                eateries: eateries.value,
                users: users.value,
                eatery_scores: eatery_scores.value,
                eatery_vetoes: eatery_vetoes.value,
                known_peers: known_peers.value,
            },
        },
        changed,
    }
}

/// Collapse duplicate keys in a snapshot nobody here holds yet.
fn adopt(incoming: &Connection) -> Connection {
    let theirs = &incoming.settings;
    Connection {
        id: incoming.id.clone(),
        settings: ConnectionSettings {
            connection: theirs.connection.clone(),
            eateries: merge_collection(&[], &theirs.eateries).value,
            users: merge_collection(&[], &theirs.users).value,
            eatery_scores: merge_collection(&[], &theirs.eatery_scores).value,
            eatery_vetoes: merge_collection(&[], &theirs.eatery_vetoes).value,
            known_peers: merge_known_peers(&[], &theirs.known_peers).value,
        },
    }
}
