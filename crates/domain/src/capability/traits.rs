use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::model::{EthAddress, OrderEvent, TransactionRecord};

/// Common result alias for collaborator calls.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// JSON document produced or consumed by a collaborator. The gateway passes
/// it through without interpreting it.
pub type Payload = serde_json::Value;

/// Query parameters in deterministic order, after address normalization.
pub type QueryParams = BTreeMap<String, String>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("resource not found")]
    NotFound,
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn from_source(err: impl std::fmt::Display) -> Self {
        Self::Internal(err.to_string())
    }
}

#[async_trait]
pub trait StakingDataService: Send + Sync {
    async fn pools(&self, query: &QueryParams) -> ServiceResult<Payload>;
    async fn pool(&self, pool_id: &str) -> ServiceResult<Payload>;
    async fn epochs(&self, query: &QueryParams) -> ServiceResult<Payload>;
    async fn stats(&self) -> ServiceResult<Payload>;
    async fn delegator(&self, address: &EthAddress) -> ServiceResult<Payload>;
}

#[async_trait]
pub trait OrderBookService: Send + Sync {
    async fn orders(&self, query: &QueryParams) -> ServiceResult<Payload>;
    async fn order(&self, order_hash: &str) -> ServiceResult<Payload>;
    async fn orderbook(&self, query: &QueryParams) -> ServiceResult<Payload>;
    async fn post_order(&self, order: Payload) -> ServiceResult<()>;
    async fn post_orders(&self, orders: Vec<Payload>) -> ServiceResult<()>;
}

#[async_trait]
pub trait MetaTransactionService: Send + Sync {
    async fn price(&self, query: &QueryParams) -> ServiceResult<Payload>;
    async fn quote(&self, query: &QueryParams) -> ServiceResult<Payload>;
    async fn status(&self, tx_hash: &str) -> ServiceResult<TransactionRecord>;
}

#[async_trait]
pub trait SwapService: Send + Sync {
    async fn quote(&self, query: &QueryParams) -> ServiceResult<Payload>;
    async fn price(&self, query: &QueryParams) -> ServiceResult<Payload>;
    async fn sources(&self) -> ServiceResult<Payload>;
    async fn tokens(&self) -> ServiceResult<Payload>;
}

/// Renders the process metrics in the Prometheus text exposition format.
pub trait MetricsService: Send + Sync {
    fn render(&self) -> String;
}

/// Live connection to the order event bus. Each call returns an independent
/// receiver; reconnection is the client's own concern.
pub trait EventBusClient: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<OrderEvent>;
}
