//! Typed chain-data requests and their wire encoding.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::verify::{receipts_root, validate_hash};
use crate::domain::{Hash, PeerFilter, RequestKey, RetrieveError};
use crate::ports::ResponseValidator;
use crate::retriever::RetrieveRequest;

/// A chain-data need served on demand.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OdrRequest {
    /// Block header by hash.
    Header {
        /// SHA-256 of the encoded header.
        hash: Hash,
    },
    /// State trie node by root and path.
    StateNode {
        /// State root the path is relative to.
        root: Hash,
        /// Nibble path from the root.
        path: Vec<u8>,
        /// Expected SHA-256 of the node encoding.
        node_hash: Hash,
    },
    /// All receipts of a block.
    Receipts {
        /// Block the receipts belong to.
        block_hash: Hash,
        /// Height of that block.
        block_number: u64,
        /// Merkle root committing to the receipts.
        receipts_root: Hash,
    },
}

/// Verified chain data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OdrResponse {
    /// Encoded header.
    Header(Vec<u8>),
    /// Encoded trie node.
    StateNode(Vec<u8>),
    /// Encoded receipts in block order.
    Receipts(Vec<Vec<u8>>),
}

impl OdrRequest {
    /// Domain tag used in the request key.
    pub fn tag(&self) -> &'static str {
        match self {
            OdrRequest::Header { .. } => "header",
            OdrRequest::StateNode { .. } => "state-node",
            OdrRequest::Receipts { .. } => "receipts",
        }
    }

    /// Peers able to serve this request.
    pub fn filter(&self) -> PeerFilter {
        match self {
            OdrRequest::Receipts { block_number, .. } => {
                PeerFilter::light_serving().with_min_head(*block_number)
            }
            _ => PeerFilter::light_serving(),
        }
    }

    /// Reject requests that cannot be answered verifiably.
    pub fn check(&self) -> Result<(), RetrieveError> {
        let zero = [0u8; 32];
        let commitment = match self {
            OdrRequest::Header { hash } => hash,
            OdrRequest::StateNode { node_hash, .. } => node_hash,
            OdrRequest::Receipts { receipts_root, .. } => receipts_root,
        };
        if *commitment == zero {
            return Err(RetrieveError::MalformedRequest(format!(
                "{} request has an empty commitment",
                self.tag()
            )));
        }
        Ok(())
    }

    /// Wire payload.
    pub fn encode(&self) -> Result<Vec<u8>, RetrieveError> {
        bincode::serialize(self).map_err(|e| RetrieveError::MalformedRequest(e.to_string()))
    }

    /// Build the retrieval for this need.
    pub fn to_retrieve_request(&self) -> Result<RetrieveRequest, RetrieveError> {
        self.check()?;
        let payload = self.encode()?;
        let key = RequestKey::derive(self.tag(), &payload);
        Ok(RetrieveRequest::new(key, payload).with_filter(self.filter()))
    }

    /// Validation predicate for responses to this request.
    pub fn validator(&self) -> Arc<dyn ResponseValidator> {
        match self.clone() {
            OdrRequest::Header { hash } => {
                Arc::new(move |bytes: &[u8]| validate_hash(bytes, &hash, "header"))
            }
            OdrRequest::StateNode { node_hash, .. } => {
                Arc::new(move |bytes: &[u8]| validate_hash(bytes, &node_hash, "state node"))
            }
            OdrRequest::Receipts { receipts_root: expected, .. } => {
                Arc::new(move |bytes: &[u8]| {
                    let receipts: Vec<Vec<u8>> = bincode::deserialize(bytes)
                        .map_err(|e| format!("undecodable receipts: {}", e))?;
                    if receipts_root(&receipts) == expected {
                        Ok(())
                    } else {
                        Err("receipts root mismatch".to_string())
                    }
                })
            }
        }
    }

    /// Decode a validated response.
    pub fn decode_response(&self, bytes: Vec<u8>) -> Result<OdrResponse, RetrieveError> {
        Ok(match self {
            OdrRequest::Header { .. } => OdrResponse::Header(bytes),
            OdrRequest::StateNode { .. } => OdrResponse::StateNode(bytes),
            OdrRequest::Receipts { .. } => {
                let receipts = bincode::deserialize(&bytes)
                    .map_err(|e| RetrieveError::MalformedRequest(format!("receipts: {}", e)))?;
                OdrResponse::Receipts(receipts)
            }
        })
    }
}

/// Wire encoding of a receipts response.
pub fn encode_receipts(receipts: &[Vec<u8>]) -> Result<Vec<u8>, RetrieveError> {
    bincode::serialize(receipts)
        .map_err(|e| RetrieveError::MalformedRequest(format!("receipts: {}", e)))
}
