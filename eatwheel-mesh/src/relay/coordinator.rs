//! The per-device coordinator: sole owner of the identity, the transport and
//! the link table.
//!
//! ```text
//!  TabPort ──RelayRequest──┐
//!  TabPort ──RelayRequest──┤
//!                          ▼
//!  transport.listen ──► Coordinator ◄── LinkEvent (dial results, frames, ends)
//!                          │
//!                          └──► BroadcastChannel (peer, peer-opened, peer-closed)
//! ```
//!
//! Runs as a single task and handles one event at a time, so the link table
//! needs no lock. Dials and per-link readers run in their own tasks and report
//! back as [`LinkEvent`]s tagged with the link generation they belong to.

use std::collections::HashMap;
use std::sync::Arc;

use eatwheel_core::{PeerId, Storage, StorageExt};
use log::{debug, info, trace, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

use super::message::{ChannelMessage, RelayCommand, RelayReply, RelayRequest, RelayStatus};
use super::TabPort;
use crate::broadcast::BroadcastChannel;
use crate::config::MeshConfig;
use crate::error::{LinkError, Result};
use crate::link::PeerLink;
use crate::protocol::PeerMessage;
use crate::transport::{Channel, Transport};

#[derive(Debug)]
enum LinkEvent {
    Dialed {
        peer: PeerId,
        generation: u64,
        result: std::result::Result<Channel, LinkError>,
    },
    Frame {
        peer: PeerId,
        generation: u64,
        frame: String,
    },
    Ended {
        peer: PeerId,
        generation: u64,
    },
}

/// Restore the device id from storage, or mint and persist a new one.
pub fn load_or_create_identity(storage: &dyn Storage) -> Result<PeerId> {
    if let Some(peer_id) = storage.load_peer_id()?.filter(|id| !id.is_empty()) {
        return Ok(peer_id);
    }
    let peer_id = Uuid::new_v4().to_string();
    storage.save_peer_id(&peer_id)?;
    info!("Generated device id {peer_id}");
    Ok(peer_id)
}

/// Handle to a running coordinator. Dropping it stops the coordinator.
pub struct RelayHandle {
    peer_id: PeerId,
    commands: mpsc::Sender<RelayRequest>,
    channel: BroadcastChannel,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RelayHandle {
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn channel(&self) -> &BroadcastChannel {
        &self.channel
    }

    /// A new tab's view of the coordinator.
    pub fn port(&self) -> TabPort {
        TabPort::new(
            Uuid::new_v4().to_string(),
            self.peer_id.clone(),
            self.commands.clone(),
            self.channel.clone(),
        )
    }

    /// Stop the coordinator and close every link.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// Start the coordinator for this device.
pub async fn spawn_coordinator<T: Transport>(
    storage: Arc<dyn Storage>,
    transport: T,
    config: MeshConfig,
) -> Result<RelayHandle> {
    let peer_id = load_or_create_identity(storage.as_ref())?;
    let incoming = transport.listen(&peer_id).await?;
    let channel = BroadcastChannel::new(config.channel_capacity);

    let (commands_tx, commands_rx) = mpsc::channel(config.link_buffer);
    let (events_tx, events_rx) = mpsc::channel(config.link_buffer);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let coordinator = Coordinator {
        local: peer_id.clone(),
        transport: Arc::new(transport),
        config,
        channel: channel.clone(),
        links: HashMap::new(),
        next_generation: 0,
        events_tx,
    };
    info!("Coordinator for {peer_id} starting");
    let task = tokio::spawn(coordinator.run(commands_rx, incoming, events_rx, shutdown_rx));

    Ok(RelayHandle {
        peer_id,
        commands: commands_tx,
        channel,
        shutdown: shutdown_tx,
        task,
    })
}

struct Coordinator<T: Transport> {
    local: PeerId,
    transport: Arc<T>,
    config: MeshConfig,
    channel: BroadcastChannel,
    links: HashMap<PeerId, PeerLink>,
    next_generation: u64,
    events_tx: mpsc::Sender<LinkEvent>,
}

impl<T: Transport> Coordinator<T> {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<RelayRequest>,
        mut incoming: mpsc::Receiver<Channel>,
        mut events: mpsc::Receiver<LinkEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                request = commands.recv() => match request {
                    Some(request) => self.handle_request(request),
                    None => break,
                },
                Some(channel) = incoming.recv() => self.accept(channel),
                Some(event) = events.recv() => self.handle_event(event),
                _ = shutdown.changed() => break,
            }
        }

        for link in self.links.values_mut() {
            let was_open = link.is_open();
            let _ = link.close();
            if was_open {
                post(&self.channel, ChannelMessage::PeerClosed {
                    peer_id: link.remote().to_string(),
                });
            }
        }
        info!("Coordinator for {} stopped", self.local);
    }

    // ─── Commands ─────────────────────────────────────────────────────

    fn handle_request(&mut self, request: RelayRequest) {
        let reply = match request.command {
            RelayCommand::Status => RelayReply::Status(self.status()),
            RelayCommand::Connect { peer_id } => self.dial(peer_id),
            RelayCommand::Send { peer_id, message } => self.send_to(&peer_id, &message),
            RelayCommand::Broadcast { peers, message } => {
                let sent = peers
                    .iter()
                    .filter(|peer| matches!(self.send_to(peer, &message), RelayReply::Accepted))
                    .count();
                debug!("Broadcast {} for {} to {sent} link(s)", message.kind(), message.connection_id());
                RelayReply::Accepted
            }
            RelayCommand::RegisterKnownPeers { peers } => {
                for peer in peers {
                    self.dial(peer);
                }
                RelayReply::Accepted
            }
        };
        if let Some(slot) = request.reply {
            let _ = slot.send(reply);
        }
    }

    fn status(&self) -> RelayStatus {
        let mut open_peers: Vec<PeerId> = self
            .links
            .values()
            .filter(|l| l.is_open())
            .map(|l| l.remote().to_string())
            .collect();
        open_peers.sort();
        RelayStatus {
            peer_id: self.local.clone(),
            open_peers,
        }
    }

    fn send_to(&self, peer: &str, message: &PeerMessage) -> RelayReply {
        let Some(link) = self.links.get(peer) else {
            return RelayReply::Rejected(LinkError::Closed.to_string());
        };
        match link.send(message) {
            Ok(()) => {
                trace!("Sent {} to {peer}", message.kind());
                RelayReply::Accepted
            }
            Err(e) => {
                debug!("Not sent {} to {peer}: {e}", message.kind());
                RelayReply::Rejected(e.to_string())
            }
        }
    }

    fn generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Dial unless a link to `peer` is already connecting or open.
    fn dial(&mut self, peer: PeerId) -> RelayReply {
        if peer.is_empty() || peer == self.local {
            return RelayReply::Rejected(format!("refusing to dial {peer:?}"));
        }
        if self.links.get(&peer).is_some_and(|l| l.state().is_active()) {
            trace!("Dial to {peer} suppressed, link active");
            return RelayReply::Accepted;
        }

        let generation = self.generation();
        let mut link = PeerLink::new(peer.clone(), self.local.clone(), generation);
        if let Err(e) = link.begin_dial() {
            return RelayReply::Rejected(e.to_string());
        }
        self.links.insert(peer.clone(), link);
        debug!("{} dialing {peer} (gen {generation})", self.local);

        let transport = self.transport.clone();
        let local = self.local.clone();
        let events = self.events_tx.clone();
        let limit = self.config.handshake_timeout;
        tokio::spawn(async move {
            let result = match timeout(limit, transport.dial(&local, &peer)).await {
                Ok(result) => result,
                Err(_) => Err(LinkError::Timeout),
            };
            let _ = events
                .send(LinkEvent::Dialed {
                    peer,
                    generation,
                    result,
                })
                .await;
        });
        RelayReply::Accepted
    }

    // ─── Links ────────────────────────────────────────────────────────

    fn current(&mut self, peer: &str, generation: u64) -> Option<&mut PeerLink> {
        self.links
            .get_mut(peer)
            .filter(|l| l.generation() == generation)
    }

    /// Whether an inbound link from `existing.remote()` should replace `existing`.
    fn inbound_wins(&self, existing: &PeerLink) -> bool {
        if existing.initiator() == existing.remote() {
            // The same device dialed again; its new link supersedes the old.
            return true;
        }
        // Both sides dialed: the link dialed by the smaller id survives.
        existing.remote() < self.local.as_str()
    }

    fn accept(&mut self, channel: Channel) {
        let remote = channel.remote.clone();
        if remote.is_empty() || remote == self.local {
            warn!("Rejecting inbound link claiming id {remote:?}");
            return;
        }

        if let Some(existing) = self.links.get(&remote) {
            if existing.state().is_active() && !self.inbound_wins(existing) {
                debug!("Keeping own link to {remote}, dropping inbound");
                return;
            }
        }
        if let Some(mut old) = self.links.remove(&remote) {
            let _ = old.close();
        }

        let generation = self.generation();
        let mut link = PeerLink::new(remote.clone(), remote.clone(), generation);
        if let Err(e) = link.begin_dial().and_then(|_| link.open(channel.tx)) {
            warn!("Inbound link from {remote} not opened: {e}");
            return;
        }
        self.links.insert(remote.clone(), link);
        self.pump(remote.clone(), generation, channel.rx);
        post(&self.channel, ChannelMessage::PeerOpened { peer_id: remote });
    }

    fn pump(&self, peer: PeerId, generation: u64, mut rx: mpsc::Receiver<String>) {
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let event = LinkEvent::Frame {
                    peer: peer.clone(),
                    generation,
                    frame,
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
            let _ = events.send(LinkEvent::Ended { peer, generation }).await;
        });
    }

    fn handle_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Dialed {
                peer,
                generation,
                result,
            } => {
                let Some(link) = self.current(&peer, generation) else {
                    debug!("Discarding stale dial result for {peer}");
                    return;
                };
                match result {
                    Ok(channel) => {
                        if let Err(e) = link.open(channel.tx) {
                            warn!("Dialed link to {peer} not opened: {e}");
                            return;
                        }
                        self.pump(peer.clone(), generation, channel.rx);
                        post(&self.channel, ChannelMessage::PeerOpened { peer_id: peer });
                    }
                    Err(e) => {
                        info!("Dial to {peer} failed: {e}");
                        let _ = link.close();
                        self.links.remove(&peer);
                    }
                }
            }
            LinkEvent::Frame {
                peer,
                generation,
                frame,
            } => {
                let Some(link) = self.current(&peer, generation) else {
                    return;
                };
                if let Some(message) = link.receive(&frame) {
                    trace!("Received {} from {peer}", message.kind());
                    post(&self.channel, ChannelMessage::Peer { from: peer, message });
                }
            }
            LinkEvent::Ended { peer, generation } => {
                let Some(link) = self.current(&peer, generation) else {
                    return;
                };
                let was_open = link.is_open();
                let _ = link.close();
                self.links.remove(&peer);
                if was_open {
                    post(&self.channel, ChannelMessage::PeerClosed { peer_id: peer });
                }
            }
        }
    }
}

fn post(channel: &BroadcastChannel, message: ChannelMessage) {
    if let Err(e) = channel.post(&message) {
        warn!("Could not post to channel: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryNetwork, MemoryTransport};
    use eatwheel_core::MemoryStorage;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast;

    async fn device(network: &Arc<MemoryNetwork>, id: &str) -> RelayHandle {
        let storage = Arc::new(MemoryStorage::new());
        storage.save_peer_id(id).unwrap();
        spawn_coordinator(storage, MemoryTransport::new(network.clone()), MeshConfig::for_testing())
            .await
            .unwrap()
    }

    async fn wait_for(
        rx: &mut broadcast::Receiver<Arc<str>>,
        mut pred: impl FnMut(&ChannelMessage) -> bool,
    ) -> ChannelMessage {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let raw = rx.recv().await.unwrap();
                let msg = ChannelMessage::decode(&raw).unwrap();
                if pred(&msg) {
                    return msg;
                }
            }
        })
        .await
        .expect("timed out waiting for channel message")
    }

    fn opened(peer: &str) -> impl FnMut(&ChannelMessage) -> bool + '_ {
        move |m: &ChannelMessage| matches!(m, ChannelMessage::PeerOpened { peer_id } if peer_id == peer)
    }

    #[test]
    fn test_identity_created_once() {
        let storage = MemoryStorage::new();
        let first = load_or_create_identity(&storage).unwrap();
        let second = load_or_create_identity(&storage).unwrap();
        assert_eq!(first, second);
        assert!(Uuid::parse_str(&first).is_ok());
    }

    #[tokio::test]
    async fn test_identity_restored_on_restart() {
        let network = MemoryNetwork::new(16);
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let first = spawn_coordinator(storage.clone(), MemoryTransport::new(network.clone()), MeshConfig::for_testing())
            .await
            .unwrap();
        let id = first.peer_id().to_string();
        first.shutdown().await;

        let second = spawn_coordinator(storage, MemoryTransport::new(network), MeshConfig::for_testing())
            .await
            .unwrap();
        assert_eq!(second.peer_id(), id);
    }

    #[tokio::test]
    async fn test_connect_opens_both_ends() {
        let network = MemoryNetwork::new(16);
        let a = device(&network, "a").await;
        let b = device(&network, "b").await;
        let mut a_rx = a.channel().subscribe();
        let mut b_rx = b.channel().subscribe();

        let reply = a.port().connect("b").await.unwrap();
        assert_eq!(reply, RelayReply::Accepted);
        wait_for(&mut a_rx, opened("b")).await;
        wait_for(&mut b_rx, opened("a")).await;

        assert_eq!(a.port().status().await.unwrap().open_peers, vec!["b"]);
        assert_eq!(b.port().status().await.unwrap().open_peers, vec!["a"]);
    }

    #[tokio::test]
    async fn test_send_reaches_remote_channel() {
        let network = MemoryNetwork::new(16);
        let a = device(&network, "a").await;
        let b = device(&network, "b").await;
        let mut a_rx = a.channel().subscribe();
        let mut b_rx = b.channel().subscribe();

        a.port().connect("b").await.unwrap();
        wait_for(&mut a_rx, opened("b")).await;
        a.port().send("b", PeerMessage::request_storage("room")).await.unwrap();

        let msg = wait_for(&mut b_rx, |m| matches!(m, ChannelMessage::Peer { .. })).await;
        assert_eq!(
            msg,
            ChannelMessage::Peer {
                from: "a".into(),
                message: PeerMessage::request_storage("room"),
            }
        );
    }

    #[tokio::test]
    async fn test_dial_self_rejected() {
        let network = MemoryNetwork::new(16);
        let a = device(&network, "a").await;
        assert!(matches!(a.port().connect("a").await.unwrap(), RelayReply::Rejected(_)));
        assert!(matches!(a.port().connect("").await.unwrap(), RelayReply::Rejected(_)));
    }

    #[tokio::test]
    async fn test_dial_unreachable_leaves_no_link() {
        let network = MemoryNetwork::new(16);
        let a = device(&network, "a").await;
        a.port().connect("nobody").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a.port().status().await.unwrap().open_peers.is_empty());
    }

    #[tokio::test]
    async fn test_second_connect_suppressed() {
        let network = MemoryNetwork::new(16);
        let a = device(&network, "a").await;
        let b = device(&network, "b").await;
        let mut b_rx = b.channel().subscribe();

        let port = a.port();
        port.connect("b").await.unwrap();
        port.connect("b").await.unwrap();
        port.register_known_peers(vec!["b".into()]).await.unwrap();
        wait_for(&mut b_rx, opened("a")).await;

        // Only one inbound link ever reached b.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            b_rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        assert_eq!(port.status().await.unwrap().open_peers, vec!["b"]);
    }

    #[tokio::test]
    async fn test_simultaneous_dial_converges() {
        let network = MemoryNetwork::new(16);
        let a = device(&network, "a").await;
        let b = device(&network, "b").await;

        let (pa, pb) = (a.port(), b.port());
        let (ra, rb) = tokio::join!(pa.connect("b"), pb.connect("a"));
        ra.unwrap();
        rb.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let sa = pa.status().await.unwrap();
                let sb = pb.status().await.unwrap();
                if sa.is_linked("b") && sb.is_linked("a") {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // The surviving link carries traffic both ways.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut a_rx = a.channel().subscribe();
        let mut b_rx = b.channel().subscribe();
        pa.send("b", PeerMessage::request_known_peers("r")).await.unwrap();
        pb.send("a", PeerMessage::request_known_peers("r")).await.unwrap();
        wait_for(&mut b_rx, |m| matches!(m, ChannelMessage::Peer { .. })).await;
        wait_for(&mut a_rx, |m| matches!(m, ChannelMessage::Peer { .. })).await;
    }

    #[tokio::test]
    async fn test_remote_shutdown_posts_peer_closed() {
        let network = MemoryNetwork::new(16);
        let a = device(&network, "a").await;
        let b = device(&network, "b").await;
        let mut a_rx = a.channel().subscribe();

        a.port().connect("b").await.unwrap();
        wait_for(&mut a_rx, opened("b")).await;
        b.shutdown().await;

        wait_for(&mut a_rx, |m| {
            matches!(m, ChannelMessage::PeerClosed { peer_id } if peer_id == "b")
        })
        .await;
        assert!(a.port().status().await.unwrap().open_peers.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_frames_dropped_link_stays_open() {
        let network = MemoryNetwork::new(16);
        let raw = MemoryTransport::new(network.clone());
        let mut fake_incoming = raw.listen(&"fake".to_string()).await.unwrap();

        let a = device(&network, "a").await;
        let mut a_rx = a.channel().subscribe();
        a.port().connect("fake").await.unwrap();
        let fake = fake_incoming.recv().await.unwrap();
        wait_for(&mut a_rx, opened("fake")).await;

        fake.tx.send("garbage".into()).await.unwrap();
        fake.tx
            .send(r#"{"type":"removed-user","data":{"connectionId":"r","user":{"id":"u","name":"x","updatedAt":1}}}"#.into())
            .await
            .unwrap();
        fake.tx
            .send(PeerMessage::request_storage("r").encode().unwrap())
            .await
            .unwrap();

        let msg = wait_for(&mut a_rx, |m| matches!(m, ChannelMessage::Peer { .. })).await;
        assert_eq!(
            msg,
            ChannelMessage::Peer {
                from: "fake".into(),
                message: PeerMessage::request_storage("r"),
            }
        );
        assert!(a.port().status().await.unwrap().is_linked("fake"));
    }

    #[tokio::test]
    async fn test_send_to_unlinked_peer_rejected() {
        let network = MemoryNetwork::new(16);
        let a = device(&network, "a").await;
        let reply = a
            .port()
            .request(RelayCommand::Send {
                peer_id: "b".into(),
                message: PeerMessage::request_storage("r"),
            })
            .await
            .unwrap();
        assert_eq!(reply, RelayReply::Rejected(LinkError::Closed.to_string()));
    }
}
