//! # eatwheel-mesh — Serverless peer mesh for eatwheel rooms
//!
//! Every device holds full copies of the rooms it joined and gossips with the
//! other devices that hold them. There is no server: a share link names a room
//! and one device to fetch it from, and the mesh grows from there.
//!
//! ## Architecture
//!
//! ```text
//!   tab ── SyncSession ──┐                         ┌── SyncSession ── tab
//!   tab ── SyncSession ──┤  BroadcastChannel (per  ├── SyncSession ── tab
//!                        │  device, same-origin)   │
//!                 ┌──────┴──────┐           ┌──────┴──────┐
//!                 │ Coordinator │ ◄───────► │ Coordinator │
//!                 │  device A   │  PeerLink │  device B   │
//!                 └──────┬──────┘  (JSON)   └──────┬──────┘
//!                        │                         │
//!                 MemoryTransport / WsTransport    │
//!                        │                         │
//!                   RocksStorage              RocksStorage
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire messages between devices
//! - [`link`] — Per-remote link state machine
//! - [`transport`] — In-memory and WebSocket transports
//! - [`relay`] — Per-device coordinator and the tab-side port
//! - [`broadcast`] — Same-origin channel shared by the tabs of one device
//! - [`session`] — Gossip handlers, joins and local edits
//! - [`retry`] — Cancelable retry loops and re-dial backoff
//! - [`share`] — Invitation links
//! - [`storage`] — RocksDB backend for [`eatwheel_core::Storage`]
//! - [`config`] — Timers and buffer sizes

pub mod broadcast;
pub mod config;
pub mod error;
pub mod link;
pub mod protocol;
pub mod relay;
pub mod retry;
pub mod session;
pub mod share;
pub mod storage;
pub mod transport;

pub use broadcast::{BroadcastChannel, ChannelStats};
pub use config::MeshConfig;
pub use error::{LinkError, MeshError, ProtocolError, Result};
pub use link::{LinkState, PeerLink};
pub use protocol::{
    ConnectionChange, EateryChange, KnownPeers, PeerMessage, RoomRef, ScoreChange, UserChange,
    VetoChange,
};
pub use relay::{
    load_or_create_identity, spawn_coordinator, ChannelMessage, RelayCommand, RelayHandle,
    RelayReply, RelayStatus, TabId, TabPort,
};
pub use retry::{Backoff, Redialer, RetryOutcome, RetryPolicy, RetryTask};
pub use session::{LocalCollections, SyncSession};
pub use share::ShareLink;
pub use storage::{RocksStorage, StoreConfig};
pub use transport::{Channel, Directory, MemoryNetwork, MemoryTransport, Transport, WsTransport};
