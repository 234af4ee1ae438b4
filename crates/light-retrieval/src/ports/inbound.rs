//! # Inbound Ports
//!
//! APIs the retrieval core offers to the chain and transaction-pool layers.

use async_trait::async_trait;

use crate::domain::{RetrieveError, Transaction};
use crate::odr::{OdrRequest, OdrResponse};
use crate::relay::RelayReport;

/// On-demand chain data - inbound port.
#[async_trait]
pub trait OdrBackend: Send + Sync {
    /// Retrieve and verify one need. Waits until a terminal outcome.
    async fn retrieve(&self, request: OdrRequest) -> Result<OdrResponse, RetrieveError>;

    /// Retrieve independent needs concurrently, failing on the first failure.
    async fn retrieve_batch(
        &self,
        requests: Vec<OdrRequest>,
    ) -> Result<Vec<OdrResponse>, RetrieveError>;

    /// Cancel every outstanding retrieval.
    fn stop(&self);
}

/// Transaction broadcast - inbound port.
#[async_trait]
pub trait TxRelayApi: Send + Sync {
    /// Best-effort relay of locally created transactions.
    async fn relay(&self, transactions: &[Transaction]) -> RelayReport;
}
