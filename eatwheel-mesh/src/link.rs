//! One logical channel to one remote device.
//!
//! ```text
//!   Idle ──dial──► Connecting ──handshake──► Open
//!    │                 │                      │
//!    └─────────────────┴──────────close───────┴──► Closed
//! ```
//!
//! `Closed` is terminal. A reconnect builds a new link with a new generation
//! so late events from the old one can be told apart and ignored.

use std::fmt;

use eatwheel_core::PeerId;
use log::{info, warn};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::LinkError;
use crate::protocol::PeerMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    Idle,
    Connecting,
    Open,
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Idle => "idle",
            LinkState::Connecting => "connecting",
            LinkState::Open => "open",
            LinkState::Closed => "closed",
        };
        f.write_str(name)
    }
}

impl LinkState {
    fn can_become(self, next: LinkState) -> bool {
        matches!(
            (self, next),
            (LinkState::Idle, LinkState::Connecting)
                | (LinkState::Connecting, LinkState::Open)
                | (LinkState::Idle, LinkState::Closed)
                | (LinkState::Connecting, LinkState::Closed)
                | (LinkState::Open, LinkState::Closed)
        )
    }

    /// Connecting or open. A second dial to the same device is suppressed.
    pub fn is_active(self) -> bool {
        matches!(self, LinkState::Connecting | LinkState::Open)
    }
}

/// A link to `remote`, owned by the coordinator.
#[derive(Debug)]
pub struct PeerLink {
    remote: PeerId,
    /// Device that initiated the dial.
    initiator: PeerId,
    generation: u64,
    state: LinkState,
    outbound: Option<mpsc::Sender<String>>,
}

impl PeerLink {
    pub fn new(remote: impl Into<PeerId>, initiator: impl Into<PeerId>, generation: u64) -> Self {
        Self {
            remote: remote.into(),
            initiator: initiator.into(),
            generation,
            state: LinkState::Idle,
            outbound: None,
        }
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn initiator(&self) -> &str {
        &self.initiator
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == LinkState::Open
    }

    fn transition(&mut self, next: LinkState) -> Result<(), LinkError> {
        if !self.state.can_become(next) {
            return Err(LinkError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    pub fn begin_dial(&mut self) -> Result<(), LinkError> {
        self.transition(LinkState::Connecting)
    }

    /// Handshake succeeded. Frames written to `outbound` reach the remote.
    pub fn open(&mut self, outbound: mpsc::Sender<String>) -> Result<(), LinkError> {
        self.transition(LinkState::Open)?;
        self.outbound = Some(outbound);
        info!("Link to {} open (gen {})", self.remote, self.generation);
        Ok(())
    }

    /// Drop the outbound half. The remote sees its receiver end.
    pub fn close(&mut self) -> Result<(), LinkError> {
        self.transition(LinkState::Closed)?;
        self.outbound = None;
        info!("Link to {} closed (gen {})", self.remote, self.generation);
        Ok(())
    }

    /// Queue one message. Never blocks and never retries.
    pub fn send(&self, message: &PeerMessage) -> Result<(), LinkError> {
        let Some(outbound) = self.outbound.as_ref().filter(|_| self.is_open()) else {
            return Err(LinkError::Closed);
        };
        let frame = message
            .encode()
            .map_err(|e| LinkError::Transport(e.to_string()))?;
        outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => LinkError::Saturated,
            TrySendError::Closed(_) => LinkError::Closed,
        })
    }

    /// Decode one inbound frame. Invalid frames are logged and dropped; the
    /// link stays open.
    pub fn receive(&self, frame: &str) -> Option<PeerMessage> {
        if !self.is_open() {
            return None;
        }
        match PeerMessage::decode(frame) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!("Dropping frame from {}: {e}", self.remote);
                None
            }
        }
    }
}
