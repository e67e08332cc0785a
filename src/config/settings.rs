use anyhow::{Context, Result};
use ipnet::IpNet;
use std::time::Duration;

/// Server bind configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
    pub tcp_port: u16,
    pub udp_port: u16,
}

/// Concurrency/admission limits derived from configured capacity.
#[derive(Debug, Clone)]
pub struct CapacityConfig {
    pub capacity_gbps: f64,
    /// `max(50, capacity_gbps * 8)` unless explicitly overridden.
    pub max_concurrent_http: u32,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub max_tcp_connections: u32,
    pub max_udp_senders: u32,
    pub max_test_duration: Duration,
    pub udp_client_idle_timeout: Duration,
    pub udp_sweep_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct SpeedtestConfig {
    pub max_download_duration: Duration,
    pub max_upload_duration: Duration,
    pub min_chunk_bytes: usize,
    pub max_chunk_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct StreamManagerConfig {
    pub max_streams: usize,
    pub max_streams_per_ip: usize,
    pub max_parallel_streams: u32,
    pub retention: Duration,
    pub cleanup_interval: Duration,
    pub metrics_update_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub global_per_min: u32,
    pub per_ip_per_min: u32,
    pub cleanup_interval: Duration,
    pub ip_ttl: Duration,
    pub max_ip_entries: usize,
}

#[derive(Debug, Clone)]
pub struct TrustConfig {
    pub trust_forwarded_headers: bool,
    pub trusted_proxy_cidrs: Vec<IpNet>,
}

#[derive(Debug, Clone)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ResultsStoreConfig {
    pub data_dir: String,
    pub retention: Duration,
    pub max_stored: Option<u64>,
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub capacity: CapacityConfig,
    pub transport: TransportConfig,
    pub speedtest: SpeedtestConfig,
    pub stream_manager: StreamManagerConfig,
    pub websocket: WebSocketConfig,
    pub rate_limit: RateLimitConfig,
    pub trust: TrustConfig,
    pub cors: CorsConfig,
    pub results_store: ResultsStoreConfig,
}

/// Parse a required-or-defaulted env var. A *missing* variable falls back to
/// `default`; a *present but malformed* variable is a fatal startup error —
/// we never silently substitute a default for a bad value.
fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid value for {key}={raw:?}: {e}")),
        Err(std::env::VarError::NotPresent) => Ok(default),
        Err(std::env::VarError::NotUnicode(_)) => {
            Err(anyhow::anyhow!("{key} is not valid unicode"))
        }
    }
}

fn parse_env_secs(key: &str, default_secs: u64) -> Result<Duration> {
    parse_env::<u64>(key, default_secs).map(Duration::from_secs)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_csv_cidrs(key: &str) -> Result<Vec<IpNet>> {
    let raw = std::env::var(key).unwrap_or_default();
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<IpNet>()
                .with_context(|| format!("{key} contains an invalid CIDR: {s:?}"))
        })
        .collect()
}

fn parse_csv(key: &str, default: &str) -> Vec<String> {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Settings {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let capacity_gbps = parse_env::<f64>("CAPACITY_GBPS", 1.0)?;
        if !(capacity_gbps.is_finite() && capacity_gbps > 0.0) {
            anyhow::bail!("CAPACITY_GBPS must be a positive finite number, got {capacity_gbps}");
        }
        let derived_admission = (capacity_gbps * 8.0).ceil() as u32;
        let max_concurrent_http =
            parse_env::<u32>("MAX_CONCURRENT_HTTP", derived_admission.max(50))?;

        let global_per_min = parse_env::<u32>("RATE_LIMIT_GLOBAL_PER_MIN", 6000)?;
        let max_ip_entries_default = (global_per_min as usize * 20).max(10_000);

        let retention_days = parse_env::<u32>("RESULTS_RETENTION_DAYS", 90)?;

        let max_stored = match std::env::var("RESULTS_MAX_STORED") {
            Ok(raw) => Some(
                raw.trim()
                    .parse::<u64>()
                    .map_err(|e| anyhow::anyhow!("invalid RESULTS_MAX_STORED={raw:?}: {e}"))?,
            ),
            Err(_) => None,
        };

        let trust_forwarded_headers = parse_env::<bool>("TRUST_FORWARDED_HEADERS", false)?;
        let trusted_proxy_cidrs = parse_csv_cidrs("TRUSTED_PROXY_CIDRS")?;

        Ok(Self {
            server: ServerConfig {
                host: env_string("HOST", "0.0.0.0"),
                http_port: parse_env::<u16>("HTTP_PORT", 8080)?,
                tcp_port: parse_env::<u16>("TCP_PORT", 8081)?,
                udp_port: parse_env::<u16>("UDP_PORT", 8082)?,
            },
            capacity: CapacityConfig {
                capacity_gbps,
                max_concurrent_http,
            },
            transport: TransportConfig {
                max_tcp_connections: parse_env::<u32>(
                    "MAX_TCP_CONNECTIONS",
                    max_concurrent_http,
                )?,
                max_udp_senders: parse_env::<u32>("MAX_UDP_SENDERS", max_concurrent_http)?,
                max_test_duration: parse_env_secs("MAX_TEST_DURATION_SECS", 300)?,
                udp_client_idle_timeout: parse_env_secs("UDP_CLIENT_IDLE_TIMEOUT_SECS", 30)?,
                udp_sweep_interval: parse_env_secs("UDP_SWEEP_INTERVAL_SECS", 10)?,
            },
            speedtest: SpeedtestConfig {
                max_download_duration: parse_env_secs("MAX_DOWNLOAD_DURATION_SECS", 10)?,
                max_upload_duration: parse_env_secs("MAX_UPLOAD_DURATION_SECS", 10)?,
                min_chunk_bytes: parse_env::<usize>("MIN_DOWNLOAD_CHUNK_BYTES", 65_536)?,
                max_chunk_bytes: parse_env::<usize>("MAX_DOWNLOAD_CHUNK_BYTES", 4_194_304)?,
            },
            stream_manager: StreamManagerConfig {
                max_streams: parse_env::<usize>("MAX_STREAMS", 1000)?,
                max_streams_per_ip: parse_env::<usize>("MAX_STREAMS_PER_IP", 10)?,
                max_parallel_streams: parse_env::<u32>("MAX_PARALLEL_STREAMS", 8)?,
                retention: parse_env_secs("STREAM_RETENTION_SECS", 300)?,
                cleanup_interval: parse_env_secs("STREAM_CLEANUP_INTERVAL_SECS", 10)?,
                metrics_update_interval: Duration::from_millis(parse_env::<u64>(
                    "METRICS_UPDATE_INTERVAL_MS",
                    1000,
                )?),
            },
            websocket: WebSocketConfig {
                ping_interval: parse_env_secs("WS_PING_INTERVAL_SECS", 15)?,
                write_timeout: parse_env_secs("WS_WRITE_TIMEOUT_SECS", 5)?,
                max_frame_bytes: parse_env::<usize>("WS_MAX_FRAME_BYTES", 4096)?,
            },
            rate_limit: RateLimitConfig {
                global_per_min,
                per_ip_per_min: parse_env::<u32>("RATE_LIMIT_PER_IP_PER_MIN", 300)?,
                cleanup_interval: parse_env_secs("RATE_LIMIT_CLEANUP_INTERVAL_SECS", 300)?,
                ip_ttl: parse_env_secs("RATE_LIMIT_IP_TTL_SECS", 900)?,
                max_ip_entries: parse_env::<usize>(
                    "RATE_LIMIT_MAX_IP_ENTRIES",
                    max_ip_entries_default,
                )?,
            },
            trust: TrustConfig {
                trust_forwarded_headers,
                trusted_proxy_cidrs,
            },
            cors: CorsConfig {
                allowed_origins: parse_csv("CORS_ALLOWED_ORIGINS", "*"),
            },
            results_store: ResultsStoreConfig {
                data_dir: env_string("DATA_DIR", "./data"),
                retention: Duration::from_secs(retention_days as u64 * 86_400),
                max_stored,
                sweep_interval: parse_env_secs("RESULTS_SWEEP_INTERVAL_SECS", 3600)?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_var_falls_back_to_default() {
        std::env::remove_var("HTTP_PORT_TEST_MISSING");
        let port = parse_env::<u16>("HTTP_PORT_TEST_MISSING", 8080).unwrap();
        assert_eq!(port, 8080);
    }

    #[test]
    fn malformed_var_is_fatal_not_default() {
        std::env::set_var("ST_TEST_BOGUS_PORT", "not-a-number");
        let err = parse_env::<u16>("ST_TEST_BOGUS_PORT", 8080).unwrap_err();
        assert!(err.to_string().contains("ST_TEST_BOGUS_PORT"));
        std::env::remove_var("ST_TEST_BOGUS_PORT");
    }

    #[test]
    fn bad_cidr_is_fatal() {
        std::env::set_var("ST_TEST_BAD_CIDR", "not-a-cidr");
        let err = parse_csv_cidrs("ST_TEST_BAD_CIDR").unwrap_err();
        assert!(err.to_string().contains("invalid CIDR"));
        std::env::remove_var("ST_TEST_BAD_CIDR");
    }
}
