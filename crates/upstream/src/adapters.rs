//! Capability adapters that forward collaborator calls to an upstream HTTP
//! backend. Each adapter is a thin mapping from trait method to endpoint.

use async_trait::async_trait;
use gateway_domain::capability::{
    MetaTransactionService, OrderBookService, Payload, QueryParams, ServiceResult,
    StakingDataService, SwapService,
};
use gateway_domain::model::{EthAddress, TransactionRecord};

use crate::client::{path_segment, UpstreamClient};

fn no_query() -> QueryParams {
    QueryParams::new()
}

pub struct HttpStakingService {
    client: UpstreamClient,
}

impl HttpStakingService {
    pub fn new(client: UpstreamClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StakingDataService for HttpStakingService {
    async fn pools(&self, query: &QueryParams) -> ServiceResult<Payload> {
        self.client.get_json("pools", query).await
    }

    async fn pool(&self, pool_id: &str) -> ServiceResult<Payload> {
        self.client
            .get_json(&format!("pools/{}", path_segment(pool_id)?), &no_query())
            .await
    }

    async fn epochs(&self, query: &QueryParams) -> ServiceResult<Payload> {
        self.client.get_json("epochs", query).await
    }

    async fn stats(&self) -> ServiceResult<Payload> {
        self.client.get_json("stats", &no_query()).await
    }

    async fn delegator(&self, address: &EthAddress) -> ServiceResult<Payload> {
        self.client
            .get_json(&format!("delegator/{}", address.as_str()), &no_query())
            .await
    }
}

pub struct HttpOrderBookService {
    client: UpstreamClient,
}

impl HttpOrderBookService {
    pub fn new(client: UpstreamClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl OrderBookService for HttpOrderBookService {
    async fn orders(&self, query: &QueryParams) -> ServiceResult<Payload> {
        self.client.get_json("orders", query).await
    }

    async fn order(&self, order_hash: &str) -> ServiceResult<Payload> {
        self.client
            .get_json(&format!("order/{}", path_segment(order_hash)?), &no_query())
            .await
    }

    async fn orderbook(&self, query: &QueryParams) -> ServiceResult<Payload> {
        self.client.get_json("orderbook", query).await
    }

    async fn post_order(&self, order: Payload) -> ServiceResult<()> {
        self.client.post_json("order", &order).await
    }

    async fn post_orders(&self, orders: Vec<Payload>) -> ServiceResult<()> {
        self.client.post_json("orders", &orders).await
    }
}

pub struct HttpMetaTransactionService {
    client: UpstreamClient,
}

impl HttpMetaTransactionService {
    pub fn new(client: UpstreamClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MetaTransactionService for HttpMetaTransactionService {
    async fn price(&self, query: &QueryParams) -> ServiceResult<Payload> {
        self.client.get_json("price", query).await
    }

    async fn quote(&self, query: &QueryParams) -> ServiceResult<Payload> {
        self.client.get_json("quote", query).await
    }

    async fn status(&self, tx_hash: &str) -> ServiceResult<TransactionRecord> {
        self.client
            .get_json(&format!("status/{}", path_segment(tx_hash)?), &no_query())
            .await
    }
}

pub struct HttpSwapService {
    client: UpstreamClient,
}

impl HttpSwapService {
    pub fn new(client: UpstreamClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SwapService for HttpSwapService {
    async fn quote(&self, query: &QueryParams) -> ServiceResult<Payload> {
        self.client.get_json("quote", query).await
    }

    async fn price(&self, query: &QueryParams) -> ServiceResult<Payload> {
        self.client.get_json("price", query).await
    }

    async fn sources(&self) -> ServiceResult<Payload> {
        self.client.get_json("sources", &no_query()).await
    }

    async fn tokens(&self) -> ServiceResult<Payload> {
        self.client.get_json("tokens", &no_query()).await
    }
}
