//! HTTP surface
//!
//! # Endpoints
//!
//! - `/ws` - command-plane WebSocket
//! - `/health`, `/metrics` - liveness and counters
//! - `/api/status`, `/api/lock`, `/api/logs`, `/api/health` - read-only queries
//! - `POST /api/recording/{start,stop}`, `POST /api/preview/{start,stop,restart}`

pub mod command_routes;
pub mod config;
pub mod observability_routes;
pub mod realtime_routes;
pub mod server;

pub use config::HttpServerConfig;
pub use server::HttpServer;
