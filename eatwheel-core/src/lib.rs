//! # eatwheel-core — Room data model and last-writer-wins replication
//!
//! Everything a device needs to hold its copy of the rooms it joined and to
//! reconcile copies arriving from other devices. No networking lives here.
//!
//! ## Architecture
//!
//! ```text
//!  local edit                       remote message
//!      │                                  │
//!      ▼                                  ▼
//! ┌─────────────┐  stamp + assign   ┌─────────────┐
//! │   Replica   │ ◄──────────────── │ MergeEngine │  (pure, LWW by updatedAt)
//! │ Vec<Conn..> │                   └─────────────┘
//! └──────┬──────┘
//!        │ whole list, JSON
//!        ▼
//! ┌─────────────┐
//! │   Storage   │  (MemoryStorage here, RocksDB in eatwheel-mesh)
//! └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`model`] — Rooms ("connections") and the four record families
//! - [`merge`] — Pure merge functions
//! - [`replica`] — The device-local source of truth
//! - [`storage`] — Key-value persistence trait and in-memory backend
//! - [`clock`] — Injectable wall clock
//!
//! Reference: Kleppmann — DDIA, Chapter 5 (Handling Write Conflicts, LWW)

pub mod clock;
pub mod merge;
pub mod model;
pub mod replica;
pub mod storage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use merge::{
    merge_collection, merge_connection, merge_known_peers, merge_record, resolve, Merged,
    Resolution,
};
pub use model::{
    Connection, ConnectionInfo, ConnectionSettings, Eatery, EateryScore, EateryVeto, PeerId,
    Record, Timestamp, User,
};
pub use replica::{Removal, Replica};
pub use storage::{MemoryStorage, Storage, StorageExt, StoreError, CONNECTIONS_KEY, PEER_ID_KEY};

/// Result alias for fallible core operations.
pub type Result<T> = std::result::Result<T, StoreError>;
