mod client_ip;
mod payload;
mod rate_limiter;
mod results_store;
mod stream_manager;
mod ws_fanout;

pub use client_ip::ClientIpResolver;
pub use payload::{BufferPool, PayloadBuffer};
pub use rate_limiter::{Admission, RateLimiter};
pub use results_store::{ResultsStore, SavedResultInput};
pub use stream_manager::{MetricsEvent, StreamManager};
pub use ws_fanout::WsFanout;
