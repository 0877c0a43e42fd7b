//! HTTP server
//!
//! One axum router carrying the command-plane WebSocket (`/ws`), the
//! one-shot request facade (`/api/*`) and health/metrics.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::command_routes::command_routes;
use super::config::HttpServerConfig;
use super::observability_routes::health_routes;
use super::realtime_routes::realtime_routes;
use crate::command_plane::CommandPlane;

pub struct HttpServer {
    config: HttpServerConfig,
    router: Router,
}

impl HttpServer {
    pub fn with_config(config: HttpServerConfig, plane: Arc<CommandPlane>) -> Self {
        let router = Self::build_router(&config, plane);
        Self { config, router }
    }

    fn build_router(config: &HttpServerConfig, plane: Arc<CommandPlane>) -> Router {
        let cors = if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect();

            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods(Any)
                .allow_headers(Any)
        };

        Router::new()
            .merge(health_routes(Arc::clone(&plane)))
            .merge(realtime_routes(Arc::clone(&plane)))
            .nest("/api", command_routes(plane))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
    }

    pub fn socket_addr(&self) -> String {
        self.config.socket_addr()
    }

    /// Get the router (for testing)
    pub fn router(self) -> Router {
        self.router
    }

    /// Bind the configured address and serve until ctrl-c.
    pub async fn start(self) -> io::Result<()> {
        let addr: SocketAddr = self.config.socket_addr().parse().map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid listen address {}: {}", self.config.socket_addr(), e),
            )
        })?;

        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "serving HTTP facade and command plane");
        tracing::info!("command plane: ws://{}/ws", addr);
        self.serve(listener).await
    }

    /// Serve on an already bound listener until ctrl-c.
    pub async fn serve(self, listener: TcpListener) -> io::Result<()> {
        axum::serve(listener, self.router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutdown requested");
            })
            .await
    }
}
