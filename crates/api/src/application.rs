use std::{net::SocketAddr, net::TcpListener, sync::Arc};

use actix_web::{
    dev::{Server, ServerHandle},
    HttpServer,
};
use thiserror::Error;
use tracing::info;

use gateway_domain::capability::{AppDependencies, MetricsService};
use gateway_domain::config::{ConfigError, RuntimeConfig, UpstreamConfig};
use gateway_domain::services::telemetry::{init_telemetry, TelemetryConfig, TelemetryError};
use gateway_upstream::{build_dependencies, UpstreamError};

use crate::routes::{metrics_app, primary_app, select_metrics_host, MetricsHost, RouteTable};
use crate::stream::{self, StreamBootstrapError};
use crate::supervisor::Supervisor;

const TELEMETRY_PREFIX: &str = "GATEWAY";
const METRICS_WORKERS: usize = 1;

pub async fn run() -> Result<(), BootstrapError> {
    // 1. Telemetry first so that every later fault has a subscriber to land in.
    let telemetry = init_telemetry(&TelemetryConfig::from_env(TELEMETRY_PREFIX))?;

    // 2. Fault handling, then configuration.
    let supervisor = Supervisor::new().install(&telemetry);
    let config = RuntimeConfig::load_from_env()?;
    let upstream = UpstreamConfig::load_from_env()?;

    // 3. Dependency bundle. The telemetry guard doubles as the metrics service.
    let metrics: Arc<dyn MetricsService> = Arc::new(telemetry);
    let deps =
        build_dependencies(&upstream, Some(metrics), config.stream_options().clone()).await?;

    // 4. Listeners, mounts and the real-time stream.
    let gateway = start(deps, &config, supervisor).await?;
    gateway.serve().await;

    Ok(())
}

/// Opens the listeners and mounts every capability in bootstrap order.
/// Nothing accepts connections until the real-time stream is attached; if it
/// cannot be, the bound sockets are dropped and the error is returned after
/// the supervisor's terminator has been asked to exit. A listener that fails
/// to bind is reported to the supervisor and startup carries on without it.
pub async fn start(
    deps: AppDependencies,
    config: &RuntimeConfig,
    supervisor: Arc<Supervisor>,
) -> Result<RunningGateway, BootstrapError> {
    let primary_listener = TcpListener::bind((config.http_host(), config.http_port()))
        .and_then(|listener| listener.local_addr().map(|addr| (listener, addr)));
    let primary_listener = match primary_listener {
        Ok((listener, addr)) => {
            info!(primary_addr = %addr, "API (HTTP) listening");
            Some((listener, addr))
        }
        Err(err) => {
            supervisor.listener_error("primary", &err);
            None
        }
    };

    let metrics_host = select_metrics_host(config.http_port(), config.metrics_port());
    let routes = RouteTable::compose(&deps, config.meta_txn_rate_limit(), metrics_host);

    let metrics_server = match (metrics_host, deps.metrics_service.clone()) {
        (MetricsHost::Separate, Some(service)) => {
            let metrics_routes = RouteTable::metrics_only(service);
            match HttpServer::new(move || metrics_app(metrics_routes.clone()))
                .workers(METRICS_WORKERS)
                .bind((config.http_host(), config.metrics_port()))
            {
                Ok(server) => {
                    let addr = server.addrs().first().copied();
                    info!(addr = ?addr, "metrics server listening");
                    Some((server, addr))
                }
                Err(err) => {
                    supervisor.listener_error("metrics", &err);
                    None
                }
            }
        }
        _ => None,
    };

    let stream = stream::attach(&deps, &supervisor)?;

    let primary = primary_listener.and_then(|(listener, addr)| {
        let server = HttpServer::new(move || primary_app(routes.clone(), Some(stream.clone())))
            .workers(config.workers())
            .keep_alive(config.keep_alive_timeout())
            .client_request_timeout(config.headers_timeout())
            .listen(listener);
        match server {
            Ok(server) => Some((server.run(), addr)),
            Err(err) => {
                supervisor.listener_error("primary", &err);
                None
            }
        }
    });
    let metrics = metrics_server.map(|(server, addr)| (server.run(), addr));

    Ok(RunningGateway {
        primary,
        metrics,
        supervisor,
    })
}

/// Listeners that have been started and are accepting connections.
pub struct RunningGateway {
    primary: Option<(Server, SocketAddr)>,
    metrics: Option<(Server, Option<SocketAddr>)>,
    supervisor: Arc<Supervisor>,
}

impl RunningGateway {
    pub fn primary_addr(&self) -> Option<SocketAddr> {
        self.primary.as_ref().map(|(_, addr)| *addr)
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics.as_ref().and_then(|(_, addr)| *addr)
    }

    pub fn handles(&self) -> Vec<ServerHandle> {
        let primary = self.primary.as_ref().map(|(server, _)| server.handle());
        let metrics = self.metrics.as_ref().map(|(server, _)| server.handle());
        primary.into_iter().chain(metrics).collect()
    }

    /// Runs every listener until it stops. Listener errors are reported to
    /// the supervisor and do not end the other listener. Returns at once when
    /// no listener could be opened.
    pub async fn serve(self) {
        let supervisor = self.supervisor;
        let primary = self.primary.map(|(server, _)| {
            Arc::clone(&supervisor).watch_listener("primary", server)
        });
        let metrics = self.metrics.map(|(server, _)| {
            Arc::clone(&supervisor).watch_listener("metrics", server)
        });
        match (primary, metrics) {
            (Some(primary), Some(metrics)) => {
                tokio::join!(primary, metrics);
            }
            (Some(primary), None) => primary.await,
            (None, Some(metrics)) => metrics.await,
            (None, None) => {}
        }
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),
    #[error("upstream error: {0}")]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Stream(#[from] StreamBootstrapError),
}
