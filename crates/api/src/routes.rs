//! Capability mounting for the primary and metrics listeners.

use std::sync::Arc;

use actix_web::{
    body::MessageBody,
    dev::{ServiceFactory, ServiceRequest, ServiceResponse},
    middleware::{from_fn, Logger},
    web, App, Error,
};
use metrics::gauge;
use tracing::{error, info};

use gateway_domain::capability::{
    AppDependencies, Capability, MetaTransactionService, MetricsService, OrderBookService,
    StakingDataService, SwapService,
};
use gateway_domain::services::{RateLimitConfig, RateLimiter};

use crate::handlers::{
    meta_transaction_router, metrics_router, not_found, root_handler, sra_router, staking_router,
    swap_router,
};
use crate::middleware::{cors, enforce_rate_limit, json_config, normalize_addresses, query_config};
use crate::stream::EventStreamService;

pub const ROOT_PATH: &str = "/";
pub const STAKING_PATH: &str = "/staking";
pub const SRA_PATH: &str = "/sra/v4";
pub const META_TRANSACTION_PATH: &str = "/meta_transaction/v1";
pub const SWAP_PATH: &str = "/swap/v1";
pub const METRICS_PATH: &str = "/metrics";

/// Where the metrics router lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricsHost {
    /// Mounted on the primary listener.
    CoHosted,
    /// Served by a dedicated listener on the metrics port; not-found on the
    /// primary listener.
    Separate,
}

pub fn select_metrics_host(primary_port: u16, metrics_port: u16) -> MetricsHost {
    if primary_port == metrics_port {
        MetricsHost::CoHosted
    } else {
        MetricsHost::Separate
    }
}

#[derive(Clone)]
enum Mount {
    Staking(Arc<dyn StakingDataService>),
    OrderBook(Arc<dyn OrderBookService>),
    MetaTransaction(Arc<dyn MetaTransactionService>, Option<RateLimiter>),
    Swap(Arc<dyn SwapService>),
    Metrics(Arc<dyn MetricsService>),
}

impl Mount {
    fn capability(&self) -> Capability {
        match self {
            Mount::Staking(_) => Capability::Staking,
            Mount::OrderBook(_) => Capability::OrderBook,
            Mount::MetaTransaction(..) => Capability::MetaTransaction,
            Mount::Swap(_) => Capability::Swap,
            Mount::Metrics(_) => Capability::Metrics,
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            Mount::Staking(_) => STAKING_PATH,
            Mount::OrderBook(_) => SRA_PATH,
            Mount::MetaTransaction(..) => META_TRANSACTION_PATH,
            Mount::Swap(_) => SWAP_PATH,
            Mount::Metrics(_) => METRICS_PATH,
        }
    }

    fn register(&self, cfg: &mut web::ServiceConfig) {
        let scope = web::scope(self.prefix());
        match self {
            Mount::Staking(service) => {
                cfg.service(scope.configure(staking_router(Arc::clone(service))));
            }
            Mount::OrderBook(service) => {
                cfg.service(scope.configure(sra_router(Arc::clone(service))));
            }
            Mount::MetaTransaction(service, None) => {
                cfg.service(scope.configure(meta_transaction_router(Arc::clone(service))));
            }
            Mount::MetaTransaction(service, Some(limiter)) => {
                cfg.service(
                    scope
                        .app_data(web::Data::new(limiter.clone()))
                        .wrap(from_fn(enforce_rate_limit))
                        .configure(meta_transaction_router(Arc::clone(service))),
                );
            }
            Mount::Swap(service) => {
                cfg.service(scope.configure(swap_router(Arc::clone(service))));
            }
            Mount::Metrics(service) => {
                cfg.service(scope.configure(metrics_router(Arc::clone(service))));
            }
        }
    }
}

fn degraded(capability: Capability, notice: &str) {
    error!(capability = capability.name(), "{notice}");
    gauge!("gateway_capability_mounted", "capability" => capability.name()).set(0.0);
}

/// Mount decisions for one listener, resolved once at startup and cloned
/// into every worker.
#[derive(Clone, Default)]
pub struct RouteTable {
    mounts: Vec<Mount>,
}

impl RouteTable {
    /// Decides what the primary listener serves. Staking and order-book are
    /// always mounted; each other capability is mounted only when its handle
    /// is present, otherwise a degradation notice is logged and its prefix
    /// resolves to not-found.
    pub fn compose(
        deps: &AppDependencies,
        meta_txn_rate_limit: Option<&RateLimitConfig>,
        metrics_host: MetricsHost,
    ) -> Self {
        let mut mounts = vec![
            Mount::Staking(Arc::clone(&deps.staking_data_service)),
            Mount::OrderBook(Arc::clone(&deps.order_book_service)),
        ];

        match &deps.meta_transaction_service {
            Some(service) => {
                let limiter = meta_txn_rate_limit.map(|config| {
                    info!(
                        strategy = config.strategy().as_ref(),
                        max_requests = config.max_requests(),
                        "rate limiting meta transaction requests"
                    );
                    RateLimiter::new(config.clone())
                });
                mounts.push(Mount::MetaTransaction(Arc::clone(service), limiter));
            }
            None => degraded(
                Capability::MetaTransaction,
                "API running without meta transactions service",
            ),
        }

        match &deps.swap_service {
            Some(service) => mounts.push(Mount::Swap(Arc::clone(service))),
            None => degraded(Capability::Swap, "API running without swap service"),
        }

        match (&deps.metrics_service, metrics_host) {
            (Some(service), MetricsHost::CoHosted) => {
                mounts.push(Mount::Metrics(Arc::clone(service)));
            }
            (Some(_), MetricsHost::Separate) => {
                info!("metrics will be served on the dedicated metrics listener");
            }
            (None, _) => degraded(Capability::Metrics, "API running without metrics service"),
        }

        let table = Self { mounts };
        table.report_mounted();
        table
    }

    /// Table for the dedicated metrics listener.
    pub fn metrics_only(service: Arc<dyn MetricsService>) -> Self {
        let table = Self {
            mounts: vec![Mount::Metrics(service)],
        };
        table.report_mounted();
        table
    }

    /// Mounted prefixes in mount order.
    pub fn prefixes(&self) -> Vec<&'static str> {
        self.mounts.iter().map(Mount::prefix).collect()
    }

    pub fn is_mounted(&self, capability: Capability) -> bool {
        self.mounts.iter().any(|mount| mount.capability() == capability)
    }

    pub fn configure(&self, cfg: &mut web::ServiceConfig) {
        for mount in &self.mounts {
            mount.register(cfg);
        }
    }

    fn report_mounted(&self) {
        for mount in &self.mounts {
            let capability = mount.capability();
            info!(capability = capability.name(), prefix = mount.prefix(), "mounted");
            gauge!("gateway_capability_mounted", "capability" => capability.name()).set(1.0);
        }
    }
}

/// Application served by the primary listener: the middleware pipeline,
/// the liveness route, every mounted capability and, once attached, the
/// real-time stream.
pub fn primary_app(
    routes: RouteTable,
    stream: Option<EventStreamService>,
) -> App<
    impl ServiceFactory<
        ServiceRequest,
        Config = (),
        Response = ServiceResponse<impl MessageBody>,
        Error = Error,
        InitError = (),
    >,
> {
    App::new()
        .wrap(from_fn(normalize_addresses))
        .wrap(cors())
        .wrap(Logger::default())
        .app_data(json_config())
        .app_data(query_config())
        .route(ROOT_PATH, web::get().to(root_handler))
        .configure(|cfg| {
            routes.configure(cfg);
            if let Some(stream) = &stream {
                stream.configure(cfg);
            }
        })
        .default_service(web::to(not_found))
}

/// Application served by the dedicated metrics listener.
pub fn metrics_app(
    routes: RouteTable,
) -> App<
    impl ServiceFactory<
        ServiceRequest,
        Config = (),
        Response = ServiceResponse<impl MessageBody>,
        Error = Error,
        InitError = (),
    >,
> {
    App::new()
        .wrap(Logger::default())
        .configure(|cfg| routes.configure(cfg))
        .default_service(web::to(not_found))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_ports_share_the_listener() {
        assert_eq!(select_metrics_host(3000, 3000), MetricsHost::CoHosted);
        assert_eq!(select_metrics_host(3000, 8080), MetricsHost::Separate);
        assert_eq!(select_metrics_host(0, 0), MetricsHost::CoHosted);
    }
}
