//! Upstream collaborators for the gateway: HTTP adapters for each
//! capability and the event-bus feed. `build_dependencies` turns the
//! upstream configuration into the dependency bundle the API bootstraps from.

pub mod adapters;
pub mod client;
pub mod event_bus;

use std::sync::Arc;

use gateway_domain::capability::{AppDependencies, Capability, MetricsService, StreamOptions};
use gateway_domain::config::UpstreamConfig;
use thiserror::Error;
use tracing::error;

pub use adapters::{
    HttpMetaTransactionService, HttpOrderBookService, HttpStakingService, HttpSwapService,
};
pub use client::UpstreamClient;
pub use event_bus::EventBusFeed;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("invalid upstream url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("event bus error: {0}")]
    EventBus(String),
}

/// Builds the dependency bundle. Optional capabilities whose upstream is not
/// configured are left out; an unreachable event bus leaves the client
/// absent so the stream bootstrap can refuse to start.
pub async fn build_dependencies(
    config: &UpstreamConfig,
    metrics: Option<Arc<dyn MetricsService>>,
    stream_options: StreamOptions,
) -> Result<AppDependencies, UpstreamError> {
    let timeout = config.request_timeout();
    let client = |capability, url: &str| UpstreamClient::new(capability, url, timeout);

    let mut dependencies = AppDependencies::new(
        Arc::new(HttpStakingService::new(client(
            Capability::Staking,
            config.staking_url(),
        )?)),
        Arc::new(HttpOrderBookService::new(client(
            Capability::OrderBook,
            config.order_book_url(),
        )?)),
    )
    .with_stream_options(stream_options);

    if let Some(url) = config.meta_txn_url() {
        dependencies = dependencies.with_meta_transaction_service(Arc::new(
            HttpMetaTransactionService::new(client(Capability::MetaTransaction, url)?),
        ));
    }
    if let Some(url) = config.swap_url() {
        dependencies = dependencies
            .with_swap_service(Arc::new(HttpSwapService::new(client(Capability::Swap, url)?)));
    }
    if let Some(metrics) = metrics {
        dependencies = dependencies.with_metrics_service(metrics);
    }

    match config.event_bus_url() {
        Some(url) => match EventBusFeed::connect(url).await {
            Ok(feed) => dependencies = dependencies.with_event_bus_client(feed),
            Err(err) => error!(%err, "could not establish event bus connection"),
        },
        None => error!("no event bus url configured"),
    }

    Ok(dependencies)
}
