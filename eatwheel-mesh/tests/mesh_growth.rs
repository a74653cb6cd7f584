//! End-to-end gossip tests over the in-memory transport.
//!
//! Each device runs a real coordinator and one or more sessions; devices only
//! ever learn about each other through share links and gossip.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use eatwheel_core::{Connection, ManualClock, MemoryStorage, StorageExt};
use eatwheel_mesh::{
    spawn_coordinator, MemoryNetwork, MemoryTransport, MeshConfig, RelayHandle, ShareLink,
    SyncSession,
};
use tokio::time::Instant;
use url::Url;

struct Device {
    storage: Arc<MemoryStorage>,
    clock: Arc<ManualClock>,
    relay: RelayHandle,
}

impl Device {
    async fn start(network: &Arc<MemoryNetwork>, id: &str) -> Self {
        let storage = Arc::new(MemoryStorage::new());
        storage.save_peer_id(id).unwrap();
        Self::start_with(network, storage, Arc::new(ManualClock::new(1_000))).await
    }

    async fn start_with(network: &Arc<MemoryNetwork>, storage: Arc<MemoryStorage>, clock: Arc<ManualClock>) -> Self {
        let relay = spawn_coordinator(
            storage.clone(),
            MemoryTransport::new(network.clone()),
            MeshConfig::for_testing(),
        )
        .await
        .unwrap();
        Self { storage, clock, relay }
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

fn base() -> Url {
    Url::parse("https://eat.example/join").unwrap()
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn join(joiner: &SyncSession, host: &SyncSession, room_id: &str) {
    let url = host.share_link(room_id, &base()).await.unwrap();
    joiner.join(&ShareLink::from_url(&url).unwrap()).await.unwrap();
    eventually("join", move || async move { joiner.read(|r| r.has_connection(room_id)).await }).await;
}

async fn eatery_name(tab: &SyncSession, room_id: &str, eatery_id: &str) -> Option<String> {
    tab.read(|r| {
        r.connection(room_id)
            .and_then(|c| c.eatery(eatery_id))
            .map(|e| e.name.clone())
    })
    .await
}

#[tokio::test]
async fn test_basic_convergence() {
    let _ = env_logger::builder().is_test(true).try_init();
    let network = MemoryNetwork::new(32);
    let (a, b) = (Device::start(&network, "dev-a").await, Device::start(&network, "dev-b").await);
    let (tab_a, tab_b) = (a.tab(), b.tab());
    let (tab_a, tab_b) = (&tab_a, &tab_b);

    let room = tab_a.create_connection("Lunch").await.unwrap();
    let room_id = room.id.as_str();
    join(tab_b, tab_a, room_id).await;

    let user = tab_b.add_user(room_id, "Ana", None).await.unwrap().unwrap();
    let eatery = tab_a.add_eatery(room_id, "Ramen").await.unwrap().unwrap();
    let (user_id, eatery_id) = (user.id.as_str(), eatery.id.as_str());

    eventually("user on a", move || async move { tab_a.read(|r| r.active_users(room_id).len() == 1).await }).await;
    eventually("eatery on b", move || async move { tab_b.read(|r| r.active_eateries(room_id).len() == 1).await })
        .await;

    tab_a.set_score(room_id, user_id, eatery_id, 4.0).await.unwrap().unwrap();
    eventually("score on b", move || async move { tab_b.read(|r| r.active_scores(room_id).len() == 1).await }).await;

    let on_a = tab_a.connection(room_id).await.unwrap();
    let on_b = tab_b.connection(room_id).await.unwrap();
    assert_eq!(on_a.settings.eateries, on_b.settings.eateries);
    assert_eq!(on_a.settings.users, on_b.settings.users);
    assert_eq!(on_a.settings.eatery_scores, on_b.settings.eatery_scores);
}

#[tokio::test]
async fn test_mesh_grows_through_gossip() {
    let _ = env_logger::builder().is_test(true).try_init();
    let network = MemoryNetwork::new(32);
    let a = Device::start(&network, "dev-a").await;
    let b = Device::start(&network, "dev-b").await;
    let c = Device::start(&network, "dev-c").await;
    let (tab_a, tab_b, tab_c) = (a.tab(), b.tab(), c.tab());
    let (tab_a, tab_b, tab_c) = (&tab_a, &tab_b, &tab_c);

    let room = tab_a.create_connection("Team lunch").await.unwrap();
    let room_id = room.id.as_str();
    join(tab_b, tab_a, room_id).await;
    join(tab_c, tab_b, room_id).await;

    // C only ever saw B's link, yet ends up linked to A.
    eventually("a linked to c", move || async move { tab_a.status().await.unwrap().is_linked("dev-c") }).await;
    eventually("a knows c", move || async move {
        tab_a.read(|r| r.known_peers(room_id).contains(&"dev-c".to_string())).await
    })
    .await;
    let on_c = tab_c.connection(room_id).await.unwrap();
    assert!(on_c.knows_peer("dev-a") && on_c.knows_peer("dev-b"));
    assert!(!on_c.knows_peer("dev-c"));

    let eatery = tab_a.add_eatery(room_id, "Dumplings").await.unwrap().unwrap();
    let eatery_id = eatery.id.as_str();
    eventually("eatery on c", move || async move {
        eatery_name(tab_c, room_id, eatery_id).await.as_deref() == Some("Dumplings")
    })
    .await;

    c.clock.set(5_000);
    tab_c.update_eatery(room_id, eatery_id, "Dumpling House").await.unwrap();
    for tab in [tab_a, tab_b] {
        eventually("rename everywhere", move || async move {
            eatery_name(tab, room_id, eatery_id).await.as_deref() == Some("Dumpling House")
        })
        .await;
    }
}

#[tokio::test]
async fn test_concurrent_renames_converge() {
    let network = MemoryNetwork::new(32);
    let (a, b) = (Device::start(&network, "dev-a").await, Device::start(&network, "dev-b").await);
    let (tab_a, tab_b) = (a.tab(), b.tab());
    let (tab_a, tab_b) = (&tab_a, &tab_b);

    let room = tab_a.create_connection("Friday").await.unwrap();
    let room_id = room.id.as_str();
    join(tab_b, tab_a, room_id).await;

    a.clock.set(2_000);
    b.clock.set(3_000);
    let (renamed_a, renamed_b) = tokio::join!(
        tab_a.rename_connection(room_id, "Friday pizza"),
        tab_b.rename_connection(room_id, "Friday sushi"),
    );
    renamed_a.unwrap().unwrap();
    renamed_b.unwrap().unwrap();

    for tab in [tab_a, tab_b] {
        eventually("later rename wins", move || async move {
            tab.read(|r| r.connection(room_id).map(|c| c.name() == "Friday sushi"))
                .await
                .unwrap_or(false)
        })
        .await;
    }
}

#[tokio::test]
async fn test_newer_delete_wins_and_cascades() {
    let network = MemoryNetwork::new(32);
    let (a, b) = (Device::start(&network, "dev-a").await, Device::start(&network, "dev-b").await);
    let (tab_a, tab_b) = (a.tab(), b.tab());
    let (tab_a, tab_b) = (&tab_a, &tab_b);

    let room = tab_a.create_connection("Brunch").await.unwrap();
    let room_id = room.id.as_str();
    let eatery = tab_a.add_eatery(room_id, "Diner").await.unwrap().unwrap();
    let user = tab_a.add_user(room_id, "Bo", Some("bo@example.com".into())).await.unwrap().unwrap();
    tab_a.set_score(room_id, &user.id, &eatery.id, 3.0).await.unwrap().unwrap();
    join(tab_b, tab_a, room_id).await;
    let eatery_id = eatery.id.as_str();

    a.clock.set(2_000);
    b.clock.set(5_000);
    tab_a.update_eatery(room_id, eatery_id, "Diner 2").await.unwrap();
    tab_b.remove_eatery(room_id, eatery_id).await.unwrap().unwrap();

    for tab in [tab_a, tab_b] {
        eventually("tombstone everywhere", move || async move {
            tab.read(|r| r.active_eateries(room_id).is_empty() && r.active_scores(room_id).is_empty())
                .await
        })
        .await;
        let conn = tab.connection(room_id).await.unwrap();
        let tombstone = conn.eatery(eatery_id).unwrap();
        assert!(tombstone.deleted);
        assert_eq!(tombstone.updated_at, 5_000);
    }
}

#[tokio::test]
async fn test_rooms_stay_isolated() {
    let network = MemoryNetwork::new(32);
    let (a, b) = (Device::start(&network, "dev-a").await, Device::start(&network, "dev-b").await);
    let (tab_a, tab_b) = (a.tab(), b.tab());
    let tab_b = &tab_b;

    let shared = tab_a.create_connection("Shared").await.unwrap();
    let private = tab_a.create_connection("Private").await.unwrap();
    join(tab_b, &tab_a, &shared.id).await;

    tab_a.add_eatery(&private.id, "Secret spot").await.unwrap().unwrap();
    let shared_id = shared.id.as_str();
    tab_a.add_eatery(shared_id, "Public spot").await.unwrap().unwrap();
    eventually("shared edit arrives", move || async move {
        tab_b.read(|r| r.active_eateries(shared_id).len() == 1).await
    })
    .await;

    assert_eq!(tab_b.read(|r| r.connections().len()).await, 1);
    assert!(!tab_b.read(|r| r.has_connection(&private.id)).await);
}

#[tokio::test]
async fn test_shared_peer_does_not_leak_other_rooms() {
    let network = MemoryNetwork::new(32);
    let a = Device::start(&network, "dev-a").await;
    let b = Device::start(&network, "dev-b").await;
    let c = Device::start(&network, "dev-c").await;
    let (tab_a, tab_b, tab_c) = (a.tab(), b.tab(), c.tab());
    let (tab_a, tab_b, tab_c) = (&tab_a, &tab_b, &tab_c);

    let open = tab_a.create_connection("Open").await.unwrap();
    let closed = tab_a.create_connection("Closed").await.unwrap();
    let (open_id, closed_id) = (open.id.as_str(), closed.id.as_str());
    tab_a.add_eatery(closed_id, "Members only").await.unwrap().unwrap();
    join(tab_b, tab_a, open_id).await;
    join(tab_b, tab_a, closed_id).await;
    join(tab_c, tab_b, open_id).await;
    eventually("a linked to c", move || async move { tab_a.status().await.unwrap().is_linked("dev-c") }).await;

    a.clock.set(2_000);
    tab_a.add_eatery(closed_id, "Late addition").await.unwrap().unwrap();
    tab_a.add_eatery(open_id, "Everyone welcome").await.unwrap().unwrap();
    eventually("closed edit on b", move || async move {
        tab_b.read(|r| r.active_eateries(closed_id).len() == 2).await
    })
    .await;
    eventually("open edit on c", move || async move {
        tab_c.read(|r| r.active_eateries(open_id).len() == 1).await
    })
    .await;

    assert!(!tab_c.read(|r| r.has_connection(closed_id)).await);
    assert_eq!(tab_c.read(|r| r.connections().len()).await, 1);
    assert!(tab_c.read(|r| r.known_peers(closed_id).is_empty()).await);
    let stored = c.storage.load_connections().unwrap();
    assert!(stored.iter().all(|conn| conn.id != closed_id));
    for tab in [tab_a, tab_b] {
        let peers = tab.read(|r| r.known_peers(closed_id).to_vec()).await;
        assert!(!peers.contains(&"dev-c".to_string()));
    }
}

#[tokio::test]
async fn test_join_waits_for_late_host() {
    let network = MemoryNetwork::new(32);
    let b = Device::start(&network, "dev-b").await;
    let tab_b = b.tab();
    let tab_b = &tab_b;

    let host_storage = Arc::new(MemoryStorage::new());
    host_storage.save_peer_id("dev-a").unwrap();
    host_storage
        .save_connections(&[Connection::new("late-room", "Late lunch", 500)])
        .unwrap();

    tab_b.join(&ShareLink::new("late-room", "dev-a")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!tab_b.read(|r| r.has_connection("late-room")).await);

    let a = Device::start_with(&network, host_storage, Arc::new(ManualClock::new(1_000))).await;
    let _tab_a = a.tab();
    eventually("room fetched from late host", move || async move {
        tab_b.read(|r| r.has_connection("late-room")).await
    })
    .await;
    assert!(tab_b.status().await.unwrap().is_linked("dev-a"));
    let joined = tab_b.connection("late-room").await.unwrap();
    assert_eq!(joined.name(), "Late lunch");
    assert_eq!(joined.settings.known_peers, vec!["dev-a".to_string()]);
}

#[tokio::test]
async fn test_sibling_tab_sees_joined_room_and_remote_edits() {
    let network = MemoryNetwork::new(32);
    let (a, b) = (Device::start(&network, "dev-a").await, Device::start(&network, "dev-b").await);
    let tab_a = a.tab();
    let (tab_b1, tab_b2) = (b.tab(), b.tab());
    let tab_b2 = &tab_b2;

    let room = tab_a.create_connection("Offsite").await.unwrap();
    let room_id = room.id.as_str();
    join(&tab_b1, &tab_a, room_id).await;
    eventually("sibling adopts room", move || async move { tab_b2.read(|r| r.has_connection(room_id)).await })
        .await;

    tab_a.add_eatery(room_id, "Food truck").await.unwrap().unwrap();
    eventually("remote edit reaches sibling", move || async move {
        tab_b2.read(|r| r.active_eateries(room_id).len() == 1).await
    })
    .await;
}

#[tokio::test]
async fn test_restarted_device_catches_up() {
    let network = MemoryNetwork::new(32);
    let a = Device::start(&network, "dev-a").await;
    let b = Device::start(&network, "dev-b").await;
    let tab_a = a.tab();
    let tab_a = &tab_a;
    let tab_b = b.tab();

    let room = tab_a.create_connection("Daily").await.unwrap();
    let room_id = room.id.as_str();
    join(&tab_b, tab_a, room_id).await;

    let Device { storage, clock, relay } = b;
    tab_b.shutdown().await;
    relay.shutdown().await;
    eventually("a sees b leave", move || async move { !tab_a.status().await.unwrap().is_linked("dev-b") }).await;

    // Made while B is offline.
    let eatery = tab_a.add_eatery(room_id, "Noodles").await.unwrap().unwrap();
    let eatery_id = eatery.id.as_str();

    let b = Device::start_with(&network, storage, clock).await;
    let tab_b = b.tab();
    let tab_b = &tab_b;
    assert!(tab_b.read(|r| r.has_connection(room_id)).await);
    eventually("missed edit arrives", move || async move {
        eatery_name(tab_b, room_id, eatery_id).await.as_deref() == Some("Noodles")
    })
    .await;
}
