//! Gateway Server
//!
//! HTTP server exposing the routing registry over RESTful JSON and SSE.
//! Self-contained: all external dependencies (the storage back-end) are
//! injected through the constructor, so the server is testable against
//! either back-end.

mod events;
mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, put};
use axum::Router;
use routemux_core::RoutingStore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Gateway server configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Enable CORS for browser access
    pub enable_cors: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            enable_cors: false,
        }
    }
}

impl GatewayConfig {
    /// Get the socket address
    pub fn addr(&self) -> SocketAddr {
        format!("{}:{}", self.host, self.port)
            .parse()
            .expect("Invalid address")
    }
}

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RoutingStore>,
}

/// The routing API server.
pub struct GatewayServer {
    config: GatewayConfig,
    store: Arc<dyn RoutingStore>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, store: Arc<dyn RoutingStore>) -> Self {
        Self { config, store }
    }

    /// Build the Axum router.
    pub fn build_router(&self) -> Router {
        let state = AppState {
            store: self.store.clone(),
        };

        let mut router = Router::new()
            .route("/health", get(handlers::health))
            .route(
                "/routing/v1/routes",
                get(handlers::list_routes)
                    .post(handlers::upsert_routes)
                    .delete(handlers::delete_routes),
            )
            .route("/routing/v1/events", get(events::http_events))
            .route(
                "/routing/v1/tcp_routes",
                get(handlers::list_tcp_routes)
                    .post(handlers::upsert_tcp_routes)
                    .delete(handlers::delete_tcp_routes),
            )
            .route("/routing/v1/tcp_routes/events", get(events::tcp_events))
            .route("/routing/v1/router_groups", get(handlers::list_router_groups))
            .route(
                "/routing/v1/router_groups/{guid}",
                put(handlers::update_router_group),
            )
            .with_state(state)
            .layer(TraceLayer::new_for_http());

        if self.config.enable_cors {
            let cors = CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any);
            router = router.layer(cors);
        }

        router
    }

    /// Run the gateway server until the listener fails.
    pub async fn run(self) -> std::io::Result<()> {
        let addr = self.config.addr();
        info!("[Gateway] Starting on {}", addr);

        let router = self.build_router();
        let listener = tokio::net::TcpListener::bind(addr).await?;

        info!("[Gateway] Ready to accept connections");
        axum::serve(listener, router).await
    }

    /// Start the server in the background.
    pub fn spawn(self) -> tokio::task::JoinHandle<std::io::Result<()>> {
        tokio::spawn(async move { self.run().await })
    }
}
