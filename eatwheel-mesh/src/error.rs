//! Error types for the mesh layer.

use eatwheel_core::StoreError;
use thiserror::Error;

use crate::link::LinkState;

/// Encoding or validation failure of a wire or channel message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Encode error: {0}")]
    Encode(String),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Invalid {kind} message: {reason}")]
    Invalid { kind: &'static str, reason: String },
}

/// Failure of a single peer link.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Link is not open")]
    Closed,
    #[error("Illegal link transition {from} -> {to}")]
    IllegalTransition { from: LinkState, to: LinkState },
    #[error("Outbound buffer full")]
    Saturated,
    #[error("Peer unreachable: {0}")]
    Unreachable(String),
    #[error("Handshake timed out")]
    Timeout,
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Top-level error for mesh operations.
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Link error: {0}")]
    Link(#[from] LinkError),
    #[error("Coordinator is gone")]
    CoordinatorGone,
    #[error("Unexpected relay reply: {0}")]
    UnexpectedReply(String),
    #[error("Invalid share link: {0}")]
    InvalidShareLink(String),
}

pub type Result<T> = std::result::Result<T, MeshError>;
