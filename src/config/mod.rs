mod settings;

pub use settings::{
    CapacityConfig, CorsConfig, RateLimitConfig, ResultsStoreConfig, ServerConfig,
    Settings, SpeedtestConfig, StreamManagerConfig, TransportConfig, TrustConfig,
    WebSocketConfig,
};
