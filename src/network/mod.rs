//! Network layer for Tapedeck
//!
//! Inbound HTTP and HTTPS listeners with bounded concurrency, static routes,
//! and the outbound client used while recording.

mod client;
mod connection_pool;
mod handler;
mod http;
mod static_files;
mod tls;

pub use client::{UpstreamClient, UpstreamRequest};
pub use connection_pool::{ConnectionGuard, ConnectionPool};
pub use handler::NetworkHandler;
pub use http::HttpHandler;
pub use static_files::StaticRoutes;
pub use tls::build_acceptor;

/// Graceful shutdown timeout
pub const SHUTDOWN_TIMEOUT_MS: u64 = 5000;
