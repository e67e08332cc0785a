mod results;
mod stream;

pub use results::SavedResult;
pub use stream::{
    Direction, MetricsSnapshot, Protocol, StreamConfig, StreamMode, StreamStatus, StreamState,
};
