use std::sync::atomic::AtomicU32;
use std::sync::Arc;

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod transport;

use config::Settings;
use services::{ClientIpResolver, PayloadBuffer, RateLimiter, ResultsStore, StreamManager, WsFanout};

/// Size of the circular source used by the HTTP `/download` handler (spec
/// §4.4), distinct from the 1 MiB buffer the raw transport server owns.
pub const HTTP_DOWNLOAD_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;

/// Shared application state threaded through every handler and middleware.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub client_ip: Arc<ClientIpResolver>,
    pub rate_limiter: Arc<RateLimiter>,
    pub stream_manager: Arc<StreamManager>,
    pub ws_fanout: Arc<WsFanout>,
    pub results_store: Arc<ResultsStore>,
    pub transport: Arc<transport::TransportServer>,
    pub download_payload: PayloadBuffer,
    pub active_downloads: Arc<AtomicU32>,
    pub active_uploads: Arc<AtomicU32>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
