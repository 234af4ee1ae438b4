//! # On-Demand Retrieval
//!
//! Maps chain-data needs (header by hash, state node by root and path,
//! receipts by block) onto retrievals, supplies their validation predicates
//! and decodes verified responses.

mod request;
mod verify;

pub use request::{encode_receipts, OdrRequest, OdrResponse};
pub use verify::{merkle_root, receipts_root, validate_hash};

use async_trait::async_trait;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::domain::{Hash, RetrieveError};
use crate::ports::OdrBackend;
use crate::retriever::RetrieveManager;

/// ODR front end over the retrieve manager.
#[derive(Clone)]
pub struct LightOdr {
    manager: RetrieveManager,
}

impl LightOdr {
    /// Create an ODR layer issuing retrievals through `manager`.
    pub fn new(manager: RetrieveManager) -> Self {
        Self { manager }
    }

    /// Underlying retrieve manager.
    pub fn manager(&self) -> &RetrieveManager {
        &self.manager
    }

    /// Retrieve and verify one piece of chain data.
    pub async fn retrieve(&self, request: OdrRequest) -> Result<OdrResponse, RetrieveError> {
        let retrieval = request.to_retrieve_request()?;
        let bytes = self.manager.retrieve(retrieval, request.validator()).await?;
        request.decode_response(bytes)
    }

    /// Like [`LightOdr::retrieve`], giving up with `Timeout` after `timeout`.
    ///
    /// Giving up only removes this caller; others waiting on the same data
    /// are unaffected.
    pub async fn retrieve_with_timeout(
        &self,
        request: OdrRequest,
        timeout: Duration,
    ) -> Result<OdrResponse, RetrieveError> {
        let retrieval = request.to_retrieve_request()?;
        let waiter = self.manager.join(retrieval, request.validator())?;
        let bytes = tokio::time::timeout(timeout, waiter)
            .await
            .map_err(|_| RetrieveError::Timeout)??;
        request.decode_response(bytes)
    }

    /// Retrieve independent needs concurrently.
    ///
    /// Responses come back in request order. The first failure observed is
    /// returned and the remaining retrievals are abandoned.
    pub async fn retrieve_batch(
        &self,
        requests: Vec<OdrRequest>,
    ) -> Result<Vec<OdrResponse>, RetrieveError> {
        let count = requests.len();
        let mut set = JoinSet::new();
        for (index, request) in requests.into_iter().enumerate() {
            let odr = self.clone();
            set.spawn(async move { (index, odr.retrieve(request).await) });
        }

        let mut responses: Vec<Option<OdrResponse>> = (0..count).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, Ok(response))) => responses[index] = Some(response),
                Ok((index, Err(e))) => {
                    warn!(index, error = %e, "[light] Batch retrieval failed");
                    set.abort_all();
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, "[light] Batch retrieval task ended abnormally");
                    set.abort_all();
                    return Err(RetrieveError::Canceled);
                }
            }
        }
        Ok(responses.into_iter().flatten().collect())
    }

    /// Fetch a header by hash.
    pub async fn header(&self, hash: Hash) -> Result<Vec<u8>, RetrieveError> {
        match self.retrieve(OdrRequest::Header { hash }).await? {
            OdrResponse::Header(bytes) => Ok(bytes),
            other => Err(unexpected(&other)),
        }
    }

    /// Fetch a state trie node.
    pub async fn state_node(
        &self,
        root: Hash,
        path: Vec<u8>,
        node_hash: Hash,
    ) -> Result<Vec<u8>, RetrieveError> {
        match self
            .retrieve(OdrRequest::StateNode {
                root,
                path,
                node_hash,
            })
            .await?
        {
            OdrResponse::StateNode(bytes) => Ok(bytes),
            other => Err(unexpected(&other)),
        }
    }

    /// Fetch a block's receipts.
    pub async fn receipts(
        &self,
        block_hash: Hash,
        block_number: u64,
        receipts_root: Hash,
    ) -> Result<Vec<Vec<u8>>, RetrieveError> {
        match self
            .retrieve(OdrRequest::Receipts {
                block_hash,
                block_number,
                receipts_root,
            })
            .await?
        {
            OdrResponse::Receipts(receipts) => Ok(receipts),
            other => Err(unexpected(&other)),
        }
    }

    /// Cancel every outstanding retrieval and refuse new ones.
    pub fn stop(&self) -> usize {
        let canceled = self.manager.stop();
        info!(canceled, "[light] ODR stopped");
        canceled
    }
}

fn unexpected(response: &OdrResponse) -> RetrieveError {
    RetrieveError::MalformedRequest(format!("unexpected response kind: {:?}", response))
}

#[async_trait]
impl OdrBackend for LightOdr {
    async fn retrieve(&self, request: OdrRequest) -> Result<OdrResponse, RetrieveError> {
        LightOdr::retrieve(self, request).await
    }

    async fn retrieve_batch(
        &self,
        requests: Vec<OdrRequest>,
    ) -> Result<Vec<OdrResponse>, RetrieveError> {
        LightOdr::retrieve_batch(self, requests).await
    }

    fn stop(&self) {
        LightOdr::stop(self);
    }
}
