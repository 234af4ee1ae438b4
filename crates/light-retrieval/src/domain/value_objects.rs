//! # Domain Value Objects
//!
//! Identifiers and small immutable types shared by every component.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// 32-byte SHA-256 hash.
pub type Hash = [u8; 32];

/// Stable identity of a remote node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    /// Create a node id from raw bytes.
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..6]))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

/// Dialable server address (`host:port` or an enode-style URL).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerAddr(String);

impl ServerAddr {
    /// Wrap an address string.
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    /// Address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical identifier of a logical data need.
///
/// Two requests with equal keys ask for the same data and share one
/// pending retrieval.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey(Hash);

impl RequestKey {
    /// Wrap a precomputed key.
    pub fn new(hash: Hash) -> Self {
        Self(hash)
    }

    /// Derive a key from a domain tag and the canonical request bytes.
    pub fn derive(tag: &str, canonical: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update((tag.len() as u32).to_be_bytes());
        hasher.update(tag.as_bytes());
        hasher.update(canonical);
        Self(hasher.finalize().into())
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &Hash {
        &self.0
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..6]))
    }
}

impl fmt::Debug for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestKey({})", self)
    }
}

/// Handle of one distribution slot. Doubles as the wire request id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId(pub u64);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Capability predicate used when choosing peers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PeerFilter {
    /// Only peers whose advertised head is at least this height.
    pub min_head_height: u64,
    /// Only peers speaking at least this protocol version.
    pub min_protocol_version: u32,
    /// Only peers that serve light-client requests.
    pub require_light_serving: bool,
}

impl PeerFilter {
    /// Accept every registered peer.
    pub fn any() -> Self {
        Self::default()
    }

    /// Accept peers that serve light-client requests.
    pub fn light_serving() -> Self {
        Self {
            require_light_serving: true,
            ..Self::default()
        }
    }

    /// Additionally require a head height of at least `height`.
    pub fn with_min_head(mut self, height: u64) -> Self {
        self.min_head_height = height;
        self
    }
}

/// SHA-256 of a byte slice.
pub fn sha256(data: &[u8]) -> Hash {
    Sha256::digest(data).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_key_is_deterministic() {
        let a = RequestKey::derive("header", b"abc");
        let b = RequestKey::derive("header", b"abc");
        assert_eq!(a, b);
    }

    #[test]
    fn test_request_key_tag_separates_domains() {
        let a = RequestKey::derive("header", b"abc");
        let b = RequestKey::derive("receipts", b"abc");
        assert_ne!(a, b);
    }

    #[test]
    fn test_node_id_display_is_short_hex() {
        let id = NodeId::new([0xab; 32]);
        assert_eq!(id.to_string(), "abababababab");
    }

    #[test]
    fn test_server_addr_serializes_transparently() {
        let addr = ServerAddr::new("10.0.0.1:30303");
        assert_eq!(serde_json::to_string(&addr).unwrap(), "\"10.0.0.1:30303\"");
    }
}
