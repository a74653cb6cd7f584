//! Invitation links.
//!
//! `https://host/join?connectionId=<room>&peerId=<device>` names the room to
//! join and a device that already holds it.

use eatwheel_core::PeerId;
use url::Url;

use crate::error::{MeshError, Result};

const CONNECTION_PARAM: &str = "connectionId";
const PEER_PARAM: &str = "peerId";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareLink {
    pub connection_id: String,
    /// Bootstrap device.
    pub peer_id: PeerId,
}

impl ShareLink {
    pub fn new(connection_id: impl Into<String>, peer_id: impl Into<PeerId>) -> Self {
        Self {
            connection_id: connection_id.into(),
            peer_id: peer_id.into(),
        }
    }

    /// `base` with this link's parameters set. Other query pairs are kept.
    pub fn to_url(&self, base: &Url) -> Url {
        let mut url = base.clone();
        let kept: Vec<(String, String)> = base
            .query_pairs()
            .filter(|(k, _)| k != CONNECTION_PARAM && k != PEER_PARAM)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        url.query_pairs_mut()
            .clear()
            .extend_pairs(kept)
            .append_pair(CONNECTION_PARAM, &self.connection_id)
            .append_pair(PEER_PARAM, &self.peer_id);
        url
    }

    pub fn from_url(url: &Url) -> Result<Self> {
        let mut connection_id = None;
        let mut peer_id = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                CONNECTION_PARAM => connection_id = Some(value.into_owned()),
                PEER_PARAM => peer_id = Some(value.into_owned()),
                _ => {}
            }
        }
        let connection_id = connection_id
            .filter(|v| !v.is_empty())
            .ok_or_else(|| MeshError::InvalidShareLink(format!("missing {CONNECTION_PARAM}")))?;
        let peer_id = peer_id
            .filter(|v| !v.is_empty())
            .ok_or_else(|| MeshError::InvalidShareLink(format!("missing {PEER_PARAM}")))?;
        Ok(Self {
            connection_id,
            peer_id,
        })
    }

    pub fn parse(input: &str) -> Result<Self> {
        let url = Url::parse(input).map_err(|e| MeshError::InvalidShareLink(e.to_string()))?;
        Self::from_url(&url)
    }
}
