//! `KeyRelayServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::http::{HeaderValue, Method, header};
use axum::routing::{get, post};
use keyrelay_relay::Relay;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::routes;
use crate::rpc::registry::MethodRegistry;
use crate::shutdown::ShutdownCoordinator;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The relay every client goes through.
    pub relay: Arc<Relay>,
    /// RPC method registry.
    pub registry: Arc<MethodRegistry>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Renders `/metrics`.
    pub metrics: PrometheusHandle,
    /// When the server started.
    pub start_time: Instant,
}

/// The relay's client-facing server.
pub struct KeyRelayServer {
    state: AppState,
}

impl KeyRelayServer {
    /// Create a server in front of `relay`.
    pub fn new(
        config: ServerConfig,
        relay: Arc<Relay>,
        registry: MethodRegistry,
        metrics: PrometheusHandle,
    ) -> Self {
        let shutdown = Arc::new(ShutdownCoordinator::new(Arc::clone(&relay)));
        Self {
            state: AppState {
                relay,
                registry: Arc::new(registry),
                config: Arc::new(config),
                shutdown,
                metrics,
                start_time: Instant::now(),
            },
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(routes::banner))
            .route("/health", get(routes::health))
            .route("/metrics", get(routes::metrics))
            .route("/publish", post(routes::publish))
            .route("/query", get(routes::query))
            .route("/connect", post(routes::connect))
            .route("/ws", get(routes::ws_upgrade))
            .with_state(self.state.clone())
            .layer(cors_layer(&self.state.config.client_origin))
            .layer(TraceLayer::new_for_http())
    }

    /// Bind and serve in the background.
    ///
    /// Returns the bound address and the serve task, which finishes once the
    /// shutdown coordinator fires and in-flight requests drain.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(self.state.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let token = self.state.shutdown.token();

        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "server terminated with error");
            }
        });
        info!(%addr, "keyrelay server listening");
        Ok((addr, handle))
    }

    /// The relay.
    pub fn relay(&self) -> &Arc<Relay> {
        &self.state.relay
    }

    /// The shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    /// The method registry.
    pub fn registry(&self) -> &Arc<MethodRegistry> {
        &self.state.registry
    }
}

fn cors_layer(origin: &str) -> CorsLayer {
    let allow_origin = match HeaderValue::from_str(origin) {
        Ok(value) => AllowOrigin::exact(value),
        Err(_) => {
            warn!(origin, "invalid client origin, cross-origin requests disabled");
            AllowOrigin::list(Vec::<HeaderValue>::new())
        }
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
}
