//! A tab's sync session: gossip, joins and local edits.
//!
//! ```text
//!  local edit ─► Replica ─► LocalChange ──► BroadcastChannel ──► sibling tabs
//!                   │
//!                   └─────► TabPort::broadcast ─► coordinator ─► known peers
//!
//!  BroadcastChannel ─► listener task ─► gossip handlers ─► Replica (merge)
//! ```
//!
//! The listener handles one channel message at a time and holds the replica
//! lock for the whole handler, so every message applies atomically. Lock
//! order is replica, then pending joins, then the redialer.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::ControlFlow;
use std::sync::{Arc, Weak};

use eatwheel_core::{
    Clock, Connection, ConnectionInfo, Eatery, EateryScore, EateryVeto, PeerId, Removal, Replica,
    Storage, User,
};
use log::{debug, error, info, trace, warn};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use url::Url;

use crate::broadcast::BroadcastChannel;
use crate::config::MeshConfig;
use crate::error::{MeshError, Result};
use crate::protocol::{
    ConnectionChange, EateryChange, KnownPeers, PeerMessage, RoomRef, ScoreChange, UserChange,
    VetoChange,
};
use crate::relay::{ChannelMessage, RelayReply, RelayStatus, TabId, TabPort};
use crate::retry::{Backoff, Redialer, RetryPolicy, RetryTask};
use crate::share::ShareLink;

// ─── Local collections ────────────────────────────────────────────────────

/// Free-form JSON collections kept in step across the tabs of one device.
///
/// Nothing here reaches the network.
#[derive(Debug)]
pub struct LocalCollections {
    origin: TabId,
    channel: BroadcastChannel,
    entries: RwLock<HashMap<String, BTreeMap<String, serde_json::Value>>>,
}

impl LocalCollections {
    fn new(origin: TabId, channel: BroadcastChannel) -> Self {
        Self {
            origin,
            channel,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Add `key`. Returns `false` if it already exists.
    pub async fn insert(&self, collection: &str, key: &str, value: serde_json::Value) -> Result<bool> {
        {
            let mut entries = self.entries.write().await;
            let items = entries.entry(collection.to_string()).or_default();
            if items.contains_key(key) {
                return Ok(false);
            }
            items.insert(key.to_string(), value.clone());
        }
        self.channel.post(&ChannelMessage::CollectionInsert {
            origin: self.origin.clone(),
            collection: collection.to_string(),
            key: key.to_string(),
            value,
        })?;
        Ok(true)
    }

    /// Replace `key`. Returns `false` if it does not exist.
    pub async fn update(&self, collection: &str, key: &str, value: serde_json::Value) -> Result<bool> {
        {
            let mut entries = self.entries.write().await;
            let Some(slot) = entries.get_mut(collection).and_then(|items| items.get_mut(key)) else {
                return Ok(false);
            };
            *slot = value.clone();
        }
        self.channel.post(&ChannelMessage::CollectionUpdate {
            origin: self.origin.clone(),
            collection: collection.to_string(),
            key: key.to_string(),
            value,
        })?;
        Ok(true)
    }

    pub async fn delete(&self, collection: &str, key: &str) -> Result<bool> {
        let removed = self
            .entries
            .write()
            .await
            .get_mut(collection)
            .and_then(|items| items.remove(key))
            .is_some();
        if removed {
            self.channel.post(&ChannelMessage::CollectionDelete {
                origin: self.origin.clone(),
                collection: collection.to_string(),
                key: key.to_string(),
            })?;
        }
        Ok(removed)
    }

    pub async fn get(&self, collection: &str, key: &str) -> Option<serde_json::Value> {
        self.entries
            .read()
            .await
            .get(collection)
            .and_then(|items| items.get(key))
            .cloned()
    }

    /// Keys of `collection`, sorted.
    pub async fn keys(&self, collection: &str) -> Vec<String> {
        self.entries
            .read()
            .await
            .get(collection)
            .map(|items| items.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Apply a sibling tab's change. Inserts and updates both upsert.
    async fn apply(&self, message: ChannelMessage) {
        let mut entries = self.entries.write().await;
        match message {
            ChannelMessage::CollectionInsert {
                collection, key, value, ..
            }
            | ChannelMessage::CollectionUpdate {
                collection, key, value, ..
            } => {
                entries.entry(collection).or_default().insert(key, value);
            }
            ChannelMessage::CollectionDelete { collection, key, .. } => {
                if let Some(items) = entries.get_mut(&collection) {
                    items.remove(&key);
                }
            }
            _ => {}
        }
    }
}

// ─── Session ──────────────────────────────────────────────────────────────

#[derive(Debug)]
struct PendingJoin {
    peer: PeerId,
    task: RetryTask,
}

struct Shared {
    replica: Mutex<Replica>,
    port: TabPort,
    config: MeshConfig,
    pending: Mutex<HashMap<String, PendingJoin>>,
    collections: LocalCollections,
    redialer: Mutex<Redialer>,
}

/// One tab's replica, wired to the device coordinator.
pub struct SyncSession {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncSession {
    /// Load the replica from `storage` and start listening on the port's channel.
    pub fn open(
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        port: TabPort,
        config: MeshConfig,
    ) -> Result<Self> {
        let replica = Replica::open(storage, clock)?;
        let rx = port.subscribe();
        let collections = LocalCollections::new(port.tab_id().to_string(), port.channel().clone());
        let redialer = Redialer::new(Backoff::new(config.redial_base, config.redial_cap));
        info!(
            "Session {} on {} opened with {} connection(s)",
            port.tab_id(),
            port.peer_id(),
            replica.connections().len()
        );
        let shared = Arc::new(Shared {
            replica: Mutex::new(replica),
            port,
            config,
            pending: Mutex::new(HashMap::new()),
            collections,
            redialer: Mutex::new(redialer),
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(listen(shared.clone(), rx, shutdown_rx.clone())),
            tokio::spawn(redial_loop(shared.clone(), shutdown_rx)),
        ];
        Ok(Self {
            shared,
            shutdown,
            tasks,
        })
    }

    pub fn peer_id(&self) -> &str {
        self.shared.port.peer_id()
    }

    pub fn tab_id(&self) -> &str {
        self.shared.port.tab_id()
    }

    pub fn collections(&self) -> &LocalCollections {
        &self.shared.collections
    }

    /// Run `f` against the current replica.
    pub async fn read<R>(&self, f: impl FnOnce(&Replica) -> R) -> R {
        f(&*self.shared.replica.lock().await)
    }

    pub async fn connection(&self, connection_id: &str) -> Option<Connection> {
        self.read(|r| r.connection(connection_id).cloned()).await
    }

    pub async fn status(&self) -> Result<RelayStatus> {
        self.shared.port.status().await
    }

    /// Number of devices this device has an open link to.
    pub async fn peer_count(&self) -> Result<usize> {
        Ok(self.status().await?.peer_count())
    }

    /// Invitation to `connection_id` that points back at this device.
    pub async fn share_link(&self, connection_id: &str, base: &Url) -> Option<Url> {
        if !self.read(|r| r.has_connection(connection_id)).await {
            return None;
        }
        Some(ShareLink::new(connection_id, self.peer_id()).to_url(base))
    }

    // ─── Rooms ────────────────────────────────────────────────────────

    pub async fn create_connection(&self, name: &str) -> Result<Connection> {
        let mut replica = self.shared.replica.lock().await;
        let connection = replica.create_connection(name)?;
        self.shared
            .publish_local(PeerMessage::Storage(connection.clone()))?;
        Ok(connection)
    }

    /// Join the room named by `link`, fetching it from the link's device.
    ///
    /// Returns once the request loop is running. The room appears locally
    /// when the first snapshot arrives.
    pub async fn join(&self, link: &ShareLink) -> Result<()> {
        let shared = &self.shared;
        if link.peer_id == shared.port.peer_id() {
            return Err(MeshError::InvalidShareLink("link points at this device".into()));
        }
        if let RelayReply::Rejected(reason) = shared.port.connect(link.peer_id.clone()).await? {
            warn!("Could not dial {} to join {}: {reason}", link.peer_id, link.connection_id);
        }
        if shared.replica.lock().await.has_connection(&link.connection_id) {
            debug!("Already holding {}, nothing to join", link.connection_id);
            return Ok(());
        }

        let mut pending = shared.pending.lock().await;
        if pending
            .get(&link.connection_id)
            .is_some_and(|p| !p.task.is_finished())
        {
            return Ok(());
        }
        info!("Joining {} via {}", link.connection_id, link.peer_id);
        let policy = RetryPolicy::fixed(shared.config.storage_retry_interval)
            .with_max_wait(shared.config.storage_max_wait);
        let weak = Arc::downgrade(shared);
        let target = link.clone();
        let task = RetryTask::spawn(policy, move |attempt| {
            request_storage(weak.clone(), target.clone(), attempt)
        });
        pending.insert(
            link.connection_id.clone(),
            PendingJoin {
                peer: link.peer_id.clone(),
                task,
            },
        );
        Ok(())
    }

    pub async fn rename_connection(&self, connection_id: &str, name: &str) -> Result<Option<ConnectionInfo>> {
        let mut replica = self.shared.replica.lock().await;
        let Some(info) = replica.rename_connection(connection_id, name)? else {
            return Ok(None);
        };
        let message = PeerMessage::UpdatedConnection(ConnectionChange {
            connection_id: connection_id.to_string(),
            connection: info.clone(),
        });
        self.shared.emit(&replica, message).await?;
        Ok(Some(info))
    }

    /// Forget a room on every tab of this device and in storage. Peers are
    /// not told.
    pub async fn leave_connection(&self, connection_id: &str) -> Result<bool> {
        let left = self.shared.forget(connection_id).await?;
        self.shared.port.publish(&ChannelMessage::LeftConnection {
            origin: self.tab_id().to_string(),
            connection_id: connection_id.to_string(),
        })?;
        Ok(left)
    }

    // ─── Records ──────────────────────────────────────────────────────

    pub async fn add_eatery(&self, connection_id: &str, name: &str) -> Result<Option<Eatery>> {
        let mut replica = self.shared.replica.lock().await;
        let Some(eatery) = replica.add_eatery(connection_id, name)? else {
            return Ok(None);
        };
        self.shared
            .emit(&replica, eatery_change(PeerMessage::UpdatedEatery, connection_id, &eatery))
            .await?;
        Ok(Some(eatery))
    }

    pub async fn update_eatery(&self, connection_id: &str, eatery_id: &str, name: &str) -> Result<Option<Eatery>> {
        let mut replica = self.shared.replica.lock().await;
        let Some(eatery) = replica.update_eatery(connection_id, eatery_id, name)? else {
            return Ok(None);
        };
        self.shared
            .emit(&replica, eatery_change(PeerMessage::UpdatedEatery, connection_id, &eatery))
            .await?;
        Ok(Some(eatery))
    }

    /// Remove an eatery. Receivers cascade to its scores and vetoes themselves.
    pub async fn remove_eatery(&self, connection_id: &str, eatery_id: &str) -> Result<Option<Removal<Eatery>>> {
        let mut replica = self.shared.replica.lock().await;
        let Some(removal) = replica.remove_eatery(connection_id, eatery_id)? else {
            return Ok(None);
        };
        self.shared
            .emit(
                &replica,
                eatery_change(PeerMessage::RemovedEatery, connection_id, &removal.record),
            )
            .await?;
        Ok(Some(removal))
    }

    pub async fn add_user(&self, connection_id: &str, name: &str, email: Option<String>) -> Result<Option<User>> {
        let mut replica = self.shared.replica.lock().await;
        let Some(user) = replica.add_user(connection_id, name, email)? else {
            return Ok(None);
        };
        self.shared
            .emit(&replica, user_change(PeerMessage::UpdatedUser, connection_id, &user))
            .await?;
        Ok(Some(user))
    }

    pub async fn update_user(
        &self,
        connection_id: &str,
        user_id: &str,
        name: &str,
        email: Option<String>,
    ) -> Result<Option<User>> {
        let mut replica = self.shared.replica.lock().await;
        let Some(user) = replica.update_user(connection_id, user_id, name, email)? else {
            return Ok(None);
        };
        self.shared
            .emit(&replica, user_change(PeerMessage::UpdatedUser, connection_id, &user))
            .await?;
        Ok(Some(user))
    }

    pub async fn remove_user(&self, connection_id: &str, user_id: &str) -> Result<Option<Removal<User>>> {
        let mut replica = self.shared.replica.lock().await;
        let Some(removal) = replica.remove_user(connection_id, user_id)? else {
            return Ok(None);
        };
        self.shared
            .emit(
                &replica,
                user_change(PeerMessage::RemovedUser, connection_id, &removal.record),
            )
            .await?;
        Ok(Some(removal))
    }

    pub async fn set_score(
        &self,
        connection_id: &str,
        user_id: &str,
        eatery_id: &str,
        score: f64,
    ) -> Result<Option<EateryScore>> {
        let mut replica = self.shared.replica.lock().await;
        let Some(eatery_score) = replica.set_score(connection_id, user_id, eatery_id, score)? else {
            return Ok(None);
        };
        let message = PeerMessage::UpdatedEateryScore(ScoreChange {
            connection_id: connection_id.to_string(),
            eatery_score: eatery_score.clone(),
        });
        self.shared.emit(&replica, message).await?;
        Ok(Some(eatery_score))
    }

    pub async fn toggle_veto(&self, connection_id: &str, user_id: &str, eatery_id: &str) -> Result<Option<EateryVeto>> {
        let mut replica = self.shared.replica.lock().await;
        let Some(eatery_veto) = replica.toggle_veto(connection_id, user_id, eatery_id)? else {
            return Ok(None);
        };
        let message = PeerMessage::UpdatedEateryVeto(VetoChange {
            connection_id: connection_id.to_string(),
            eatery_veto: eatery_veto.clone(),
        });
        self.shared.emit(&replica, message).await?;
        Ok(Some(eatery_veto))
    }

    /// Stop the listener, the redial timer and every pending join.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        for task in std::mem::take(&mut self.tasks) {
            let _ = task.await;
        }
        self.shared.pending.lock().await.clear();
        info!("Session {} closed", self.tab_id());
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

fn eatery_change(wrap: fn(EateryChange) -> PeerMessage, connection_id: &str, eatery: &Eatery) -> PeerMessage {
    wrap(EateryChange {
        connection_id: connection_id.to_string(),
        eatery: eatery.clone(),
    })
}

fn user_change(wrap: fn(UserChange) -> PeerMessage, connection_id: &str, user: &User) -> PeerMessage {
    wrap(UserChange {
        connection_id: connection_id.to_string(),
        user: user.clone(),
    })
}

/// One `request-storage` attempt of a join. Stops once the room is held.
///
/// Each attempt dials the link's device again, so a device that comes
/// online after the join started is still reached.
async fn request_storage(shared: Weak<Shared>, link: ShareLink, attempt: u32) -> ControlFlow<()> {
    let Some(shared) = shared.upgrade() else {
        return ControlFlow::Break(());
    };
    if shared.replica.lock().await.has_connection(&link.connection_id) {
        return ControlFlow::Break(());
    }
    trace!(
        "Requesting {} from {} (attempt {})",
        link.connection_id,
        link.peer_id,
        attempt + 1
    );
    let request = PeerMessage::request_storage(link.connection_id.clone());
    let sent = match shared.port.connect(link.peer_id.clone()).await {
        Ok(reply) => {
            if let RelayReply::Rejected(reason) = reply {
                debug!("Dial to {} rejected: {reason}", link.peer_id);
            }
            shared.port.send(link.peer_id.clone(), request).await
        }
        Err(e) => Err(e),
    };
    match sent {
        Ok(()) => ControlFlow::Continue(()),
        Err(e) => {
            warn!("Join of {} abandoned: {e}", link.connection_id);
            ControlFlow::Break(())
        }
    }
}

impl Shared {
    fn local(&self) -> &str {
        self.port.peer_id()
    }

    fn publish_local(&self, message: PeerMessage) -> Result<()> {
        self.port.publish(&ChannelMessage::LocalChange {
            origin: self.port.tab_id().to_string(),
            message,
        })?;
        Ok(())
    }

    /// Tell sibling tabs, then every linked device that knows the room.
    async fn emit(&self, replica: &Replica, message: PeerMessage) -> Result<()> {
        let peers: Vec<PeerId> = replica
            .known_peers(message.connection_id())
            .iter()
            .filter(|p| p.as_str() != self.local())
            .cloned()
            .collect();
        self.publish_local(message.clone())?;
        if !peers.is_empty() {
            self.port.broadcast(peers, message).await?;
        }
        Ok(())
    }

    async fn handle_raw(&self, raw: &str) {
        let message = match ChannelMessage::decode(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping channel message: {e}");
                return;
            }
        };
        if message.origin() == Some(self.port.tab_id()) {
            return;
        }
        let result = match message {
            ChannelMessage::Peer { from, message } => self.handle_peer(from, message).await,
            ChannelMessage::PeerOpened { peer_id } => self.on_peer_opened(peer_id).await,
            ChannelMessage::PeerClosed { peer_id } => {
                debug!("Link to {peer_id} closed");
                Ok(())
            }
            ChannelMessage::LocalChange { message, .. } => self.apply_sibling(message).await,
            ChannelMessage::LeftConnection { connection_id, .. } => {
                self.forget(&connection_id).await.map(|_| ())
            }
            collection_change => {
                self.collections.apply(collection_change).await;
                Ok(())
            }
        };
        if let Err(e) = result {
            error!("Session {} failed to handle message: {e}", self.port.tab_id());
        }
    }

    async fn handle_peer(&self, from: PeerId, message: PeerMessage) -> Result<()> {
        let mut replica = self.replica.lock().await;
        trace!("{} from {from} for {}", message.kind(), message.connection_id());
        match message {
            PeerMessage::RequestKnownPeers(RoomRef { connection_id }) => {
                if !replica.has_connection(&connection_id) {
                    debug!("Ignoring known-peers request for unknown {connection_id}");
                    return Ok(());
                }
                replica.add_known_peers(&connection_id, std::slice::from_ref(&from))?;
                let peers = replica
                    .known_peers(&connection_id)
                    .iter()
                    .filter(|p| **p != from)
                    .cloned()
                    .collect();
                self.port
                    .send(from, PeerMessage::known_peers(connection_id, peers))
                    .await?;
            }
            PeerMessage::KnownPeers(KnownPeers { connection_id, peers }) => {
                if !replica.has_connection(&connection_id) {
                    return Ok(());
                }
                let peers: Vec<PeerId> = peers.into_iter().filter(|p| p != self.local()).collect();
                let learned = replica.add_known_peers(&connection_id, &peers)?;
                if !learned.is_empty() {
                    info!("Learned {} peer(s) for {connection_id} from {from}", learned.len());
                }
                self.port.register_known_peers(peers).await?;
            }
            PeerMessage::RequestStorage(RoomRef { connection_id }) => {
                let Some(snapshot) = replica.connection(&connection_id).cloned() else {
                    debug!("Ignoring storage request for unknown {connection_id}");
                    return Ok(());
                };
                replica.add_known_peers(&connection_id, std::slice::from_ref(&from))?;
                let snapshot = replica.connection(&connection_id).cloned().unwrap_or(snapshot);
                self.port.send(from, PeerMessage::Storage(snapshot)).await?;
            }
            PeerMessage::Storage(mut snapshot) => {
                let connection_id = snapshot.id.clone();
                let held = replica.has_connection(&connection_id);
                let mut pending = self.pending.lock().await;
                if !held
                    && !pending
                        .get(&connection_id)
                        .is_some_and(|p| !p.task.is_finished())
                {
                    debug!("Dropping unsolicited snapshot of {connection_id} from {from}");
                    return Ok(());
                }
                snapshot.settings.known_peers.retain(|p| p != self.local());
                replica.apply_connection(&snapshot)?;
                replica.add_known_peers(&connection_id, std::slice::from_ref(&from))?;
                if pending.remove(&connection_id).is_some() {
                    info!("Joined {connection_id} via {from}");
                }
                drop(pending);

                if let Some(merged) = replica.connection(&connection_id).cloned() {
                    let peers = merged.settings.known_peers.clone();
                    if !held {
                        self.publish_local(PeerMessage::Storage(merged))?;
                    }
                    self.port.register_known_peers(peers).await?;
                }
            }
            mutation if mutation.is_mutation() => {
                if !replica.has_connection(mutation.connection_id()) {
                    debug!(
                        "Dropping {} for unknown {} from {from}",
                        mutation.kind(),
                        mutation.connection_id()
                    );
                    return Ok(());
                }
                if apply_mutation(&mut replica, &mutation)? {
                    debug!("Applied {} from {from}", mutation.kind());
                }
            }
            other => trace!("Ignoring {} from {from}", other.kind()),
        }
        Ok(())
    }

    /// Ask a freshly linked device about every room it shares with us, and
    /// for a snapshot to catch up on edits made while the link was down.
    async fn on_peer_opened(&self, peer: PeerId) -> Result<()> {
        let rooms = self.replica.lock().await.connections_with_peer(&peer);
        for room in rooms {
            self.port
                .send(peer.clone(), PeerMessage::request_known_peers(room.clone()))
                .await?;
            self.port
                .send(peer.clone(), PeerMessage::request_storage(room))
                .await?;
        }

        let joining: Vec<String> = self
            .pending
            .lock()
            .await
            .iter()
            .filter(|(_, join)| join.peer == peer && !join.task.is_finished())
            .map(|(room, _)| room.clone())
            .collect();
        for room in joining {
            self.port
                .send(peer.clone(), PeerMessage::request_storage(room))
                .await?;
        }

        self.redialer.lock().await.reset(&peer);
        Ok(())
    }

    /// Drop a room and any join still fetching it.
    async fn forget(&self, connection_id: &str) -> Result<bool> {
        let mut replica = self.replica.lock().await;
        let left = replica.leave_connection(connection_id)?;
        if let Some(join) = self.pending.lock().await.remove(connection_id) {
            join.task.cancel();
        }
        if left {
            info!("Left {connection_id}");
        }
        Ok(left)
    }

    /// A sibling tab's own change. Snapshots are adopted as-is.
    async fn apply_sibling(&self, message: PeerMessage) -> Result<()> {
        let mut replica = self.replica.lock().await;
        match &message {
            PeerMessage::Storage(snapshot) => {
                replica.apply_connection(snapshot)?;
            }
            PeerMessage::KnownPeers(KnownPeers { connection_id, peers }) => {
                replica.add_known_peers(connection_id, peers)?;
            }
            mutation if mutation.is_mutation() => {
                apply_mutation(&mut replica, mutation)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Re-fetch every room after this tab missed channel messages.
    async fn resync(&self) -> Result<()> {
        let rooms: Vec<(String, Vec<PeerId>)> = {
            let replica = self.replica.lock().await;
            replica
                .connections()
                .iter()
                .map(|c| (c.id.clone(), c.settings.known_peers.clone()))
                .collect()
        };
        for (room, peers) in rooms {
            if !peers.is_empty() {
                self.port
                    .broadcast(peers, PeerMessage::request_storage(room))
                    .await?;
            }
        }
        Ok(())
    }

    /// Dial known peers without an open link, paced per peer.
    async fn redial(&self) -> Result<()> {
        let status = self.port.status().await?;
        let known: BTreeSet<PeerId> = {
            let replica = self.replica.lock().await;
            replica
                .connections()
                .iter()
                .flat_map(|c| c.settings.known_peers.iter().cloned())
                .filter(|p| p != self.local())
                .collect()
        };

        let now = Instant::now();
        let due: Vec<PeerId> = {
            let mut redialer = self.redialer.lock().await;
            known
                .into_iter()
                .filter(|peer| {
                    if status.is_linked(peer) {
                        redialer.reset(peer);
                        false
                    } else {
                        redialer.poll(peer, now)
                    }
                })
                .collect()
        };
        for peer in due {
            debug!("Re-dialing {peer}");
            self.port.connect(peer).await?;
        }
        Ok(())
    }
}

/// Route one mutation through the merge engine.
fn apply_mutation(replica: &mut Replica, message: &PeerMessage) -> eatwheel_core::Result<bool> {
    match message {
        PeerMessage::UpdatedEatery(change) | PeerMessage::RemovedEatery(change) => {
            replica.apply_eatery(&change.connection_id, &change.eatery)
        }
        PeerMessage::UpdatedUser(change) | PeerMessage::RemovedUser(change) => {
            replica.apply_user(&change.connection_id, &change.user)
        }
        PeerMessage::UpdatedEateryScore(change) => replica.apply_score(&change.connection_id, &change.eatery_score),
        PeerMessage::UpdatedEateryVeto(change) => replica.apply_veto(&change.connection_id, &change.eatery_veto),
        PeerMessage::UpdatedConnection(change) => {
            replica.apply_connection_info(&change.connection_id, &change.connection)
        }
        PeerMessage::RequestKnownPeers(_)
        | PeerMessage::KnownPeers(_)
        | PeerMessage::RequestStorage(_)
        | PeerMessage::Storage(_) => Ok(false),
    }
}

async fn listen(shared: Arc<Shared>, mut rx: broadcast::Receiver<Arc<str>>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(raw) => shared.handle_raw(&raw).await,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Session {} skipped {skipped} channel message(s)", shared.port.tab_id());
                    shared.port.channel().record_lagged(skipped);
                    if let Err(e) = shared.resync().await {
                        warn!("Resync failed: {e}");
                    }
                }
                Err(RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn redial_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut ticks = interval(shared.config.redial_base);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticks.tick() => {
                if let Err(e) = shared.redial().await {
                    debug!("Redial pass skipped: {e}");
                    if matches!(e, MeshError::CoordinatorGone) {
                        break;
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{spawn_coordinator, RelayHandle};
    use crate::transport::{MemoryNetwork, MemoryTransport};
    use eatwheel_core::{ManualClock, MemoryStorage, StorageExt};
    use serde_json::json;
    use std::future::Future;
    use std::time::Duration;

    struct Device {
        storage: Arc<MemoryStorage>,
        clock: Arc<ManualClock>,
        relay: RelayHandle,
    }

    impl Device {
        async fn start(network: &Arc<MemoryNetwork>, id: &str) -> Self {
            let storage = Arc::new(MemoryStorage::new());
            storage.save_peer_id(id).unwrap();
            let relay = spawn_coordinator(
                storage.clone(),
                MemoryTransport::new(network.clone()),
                MeshConfig::for_testing(),
            )
            .await
            .unwrap();
            Self {
                storage,
                clock: Arc::new(ManualClock::new(1_000)),
                relay,
            }
        }

        fn tab(&self) -> SyncSession {
            SyncSession::open(
                self.storage.clone(),
                self.clock.clone(),
                self.relay.port(),
                MeshConfig::for_testing(),
            )
            .unwrap()
        }
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_unknown_room_mutations_are_noops() {
        let network = MemoryNetwork::new(16);
        let device = Device::start(&network, "a").await;
        let tab = device.tab();
        assert_eq!(tab.add_eatery("nope", "Pizza").await.unwrap(), None);
        assert_eq!(tab.rename_connection("nope", "x").await.unwrap(), None);
        assert!(tab.remove_user("nope", "u").await.unwrap().is_none());
        assert!(!tab.leave_connection("nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_sibling_tabs_converge() {
        let network = MemoryNetwork::new(16);
        let device = Device::start(&network, "a").await;
        let (tab1, tab2) = (device.tab(), device.tab());
        let (tab1, tab2) = (&tab1, &tab2);

        let room = tab1.create_connection("Lunch").await.unwrap();
        let room_id = room.id.as_str();
        let eatery = tab1.add_eatery(room_id, "Pho").await.unwrap().unwrap();
        let eatery_id = eatery.id.as_str();

        eventually(move || async move { tab2.read(|r| r.active_eateries(room_id).len() == 1).await }).await;
        device.clock.advance(10);
        tab2.update_eatery(room_id, eatery_id, "Pho 24").await.unwrap();
        eventually(move || async move {
            let name = tab1
                .read(|r| r.connection(room_id).and_then(|c| c.eatery(eatery_id)).map(|e| e.name.clone()))
                .await;
            name.as_deref() == Some("Pho 24")
        })
        .await;
    }

    #[tokio::test]
    async fn test_leave_reaches_sibling_tabs_and_storage() {
        let network = MemoryNetwork::new(16);
        let device = Device::start(&network, "a").await;
        let (tab1, tab2) = (device.tab(), device.tab());
        let tab2 = &tab2;

        let gone = tab1.create_connection("Gone").await.unwrap();
        let kept = tab1.create_connection("Kept").await.unwrap();
        let (gone_id, kept_id) = (gone.id.as_str(), kept.id.as_str());
        eventually(move || async move { tab2.read(|r| r.connections().len() == 2).await }).await;

        assert!(tab1.leave_connection(gone_id).await.unwrap());
        eventually(move || async move { !tab2.read(|r| r.has_connection(gone_id)).await }).await;

        // A later write from the sibling must not bring the room back.
        tab2.add_eatery(kept_id, "Bagels").await.unwrap().unwrap();
        let stored: Vec<String> = device
            .storage
            .load_connections()
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(stored, vec![kept.id.clone()]);
    }

    #[tokio::test]
    async fn test_local_collections_follow_sibling_tabs() {
        let network = MemoryNetwork::new(16);
        let device = Device::start(&network, "a").await;
        let (tab1, tab2) = (device.tab(), device.tab());
        let (drafts1, drafts2) = (tab1.collections(), tab2.collections());

        assert!(drafts1.insert("drafts", "k1", json!({"text": "hi"})).await.unwrap());
        assert!(!drafts1.insert("drafts", "k1", json!(null)).await.unwrap());
        eventually(move || async move { drafts2.get("drafts", "k1").await == Some(json!({"text": "hi"})) }).await;

        assert!(drafts2.update("drafts", "k1", json!(2)).await.unwrap());
        eventually(move || async move { drafts1.get("drafts", "k1").await == Some(json!(2)) }).await;

        assert!(drafts1.delete("drafts", "k1").await.unwrap());
        eventually(move || async move { drafts2.keys("drafts").await.is_empty() }).await;
        assert!(!drafts1.update("drafts", "k1", json!(3)).await.unwrap());
    }

    #[tokio::test]
    async fn test_join_rejects_own_link() {
        let network = MemoryNetwork::new(16);
        let device = Device::start(&network, "a").await;
        let tab = device.tab();
        let err = tab.join(&ShareLink::new("r", "a")).await.unwrap_err();
        assert!(matches!(err, MeshError::InvalidShareLink(_)));
    }

    #[tokio::test]
    async fn test_join_fetches_room() {
        let network = MemoryNetwork::new(16);
        let a = Device::start(&network, "a").await;
        let b = Device::start(&network, "b").await;
        let (tab_a, tab_b) = (a.tab(), b.tab());
        let (tab_a, tab_b) = (&tab_a, &tab_b);

        let room = tab_a.create_connection("Dinner").await.unwrap();
        let room_id = room.id.as_str();
        tab_a.add_eatery(room_id, "Tacos").await.unwrap();
        let base = Url::parse("https://eat.example/join").unwrap();
        let url = tab_a.share_link(room_id, &base).await.unwrap();

        tab_b.join(&ShareLink::from_url(&url).unwrap()).await.unwrap();
        eventually(move || async move { tab_b.read(|r| r.has_connection(room_id)).await }).await;

        let joined = tab_b.connection(room_id).await.unwrap();
        assert_eq!(joined.settings.known_peers, vec!["a".to_string()]);
        assert_eq!(joined.settings.eateries.len(), 1);
        eventually(move || async move { tab_a.read(|r| r.known_peers(room_id).to_vec()).await == vec!["b".to_string()] })
            .await;
    }

    #[tokio::test]
    async fn test_unsolicited_snapshot_dropped() {
        let network = MemoryNetwork::new(16);
        let a = Device::start(&network, "a").await;
        let b = Device::start(&network, "b").await;
        let (tab_a, tab_b) = (a.tab(), b.tab());
        let tab_b = &tab_b;
        let room = tab_a.create_connection("Secret").await.unwrap();

        let port_a = a.relay.port();
        port_a.connect("b").await.unwrap();
        eventually(move || async move { tab_b.peer_count().await.unwrap() == 1 }).await;
        port_a.send("b", PeerMessage::Storage(room.clone())).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!tab_b.read(|r| r.has_connection(&room.id)).await);
    }

    #[tokio::test]
    async fn test_share_link_requires_held_room() {
        let network = MemoryNetwork::new(16);
        let device = Device::start(&network, "a").await;
        let tab = device.tab();
        let base = Url::parse("https://eat.example/").unwrap();
        assert!(tab.share_link("missing", &base).await.is_none());
    }
}
