//! Collaborator contracts mounted by the gateway and the bundle that carries
//! them into the bootstrap.

mod traits;

use std::{sync::Arc, time::Duration};

use strum_macros::{AsRefStr, Display, IntoStaticStr};

pub use traits::*;

/// One independently mountable backend function exposed by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Capability {
    Staking,
    OrderBook,
    MetaTransaction,
    Swap,
    Metrics,
}

impl Capability {
    pub fn name(self) -> &'static str {
        self.into()
    }
}

const DEFAULT_STREAM_PATH: &str = "/ws";
const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

/// Configuration handed to the real-time stream alongside the event-bus
/// client. Opaque to everything but the stream itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOptions {
    path: String,
    heartbeat_interval: Duration,
}

impl StreamOptions {
    pub fn new(path: impl Into<String>, heartbeat_interval: Duration) -> Self {
        let mut path = path.into();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        Self {
            path,
            heartbeat_interval: heartbeat_interval.max(Duration::from_millis(1)),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Clients silent for longer than two heartbeats are dropped.
    pub fn client_timeout(&self) -> Duration {
        self.heartbeat_interval * 2
    }
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_PATH, DEFAULT_HEARTBEAT)
    }
}

/// Service handles available to the orchestrator at startup. Staking and
/// order-book services are always constructed; every other handle is an
/// explicit `Option` so an absent capability is distinguishable from a
/// present one at the type level.
#[derive(Clone)]
pub struct AppDependencies {
    pub staking_data_service: Arc<dyn StakingDataService>,
    pub order_book_service: Arc<dyn OrderBookService>,
    pub meta_transaction_service: Option<Arc<dyn MetaTransactionService>>,
    pub swap_service: Option<Arc<dyn SwapService>>,
    pub metrics_service: Option<Arc<dyn MetricsService>>,
    pub event_bus_client: Option<Arc<dyn EventBusClient>>,
    pub stream_options: StreamOptions,
}

impl AppDependencies {
    pub fn new(
        staking_data_service: Arc<dyn StakingDataService>,
        order_book_service: Arc<dyn OrderBookService>,
    ) -> Self {
        Self {
            staking_data_service,
            order_book_service,
            meta_transaction_service: None,
            swap_service: None,
            metrics_service: None,
            event_bus_client: None,
            stream_options: StreamOptions::default(),
        }
    }

    pub fn with_meta_transaction_service(
        mut self,
        service: Arc<dyn MetaTransactionService>,
    ) -> Self {
        self.meta_transaction_service = Some(service);
        self
    }

    pub fn with_swap_service(mut self, service: Arc<dyn SwapService>) -> Self {
        self.swap_service = Some(service);
        self
    }

    pub fn with_metrics_service(mut self, service: Arc<dyn MetricsService>) -> Self {
        self.metrics_service = Some(service);
        self
    }

    pub fn with_event_bus_client(mut self, client: Arc<dyn EventBusClient>) -> Self {
        self.event_bus_client = Some(client);
        self
    }

    pub fn with_stream_options(mut self, options: StreamOptions) -> Self {
        self.stream_options = options;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_options_normalize_path() {
        let options = StreamOptions::new("orders", Duration::from_secs(5));
        assert_eq!(options.path(), "/orders");
        assert_eq!(options.client_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn capability_names_are_snake_case() {
        assert_eq!(Capability::MetaTransaction.as_ref(), "meta_transaction");
        assert_eq!(Capability::OrderBook.to_string(), "order_book");
    }
}
