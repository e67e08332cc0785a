use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Quic,
}

impl std::str::FromStr for Protocol {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "quic" => Ok(Protocol::Quic),
            other => Err(AppError::InvalidConfig(format!(
                "unknown protocol {other:?}, expected tcp|udp|quic"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Download,
    Upload,
    Bidirectional,
}

impl std::str::FromStr for Direction {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "download" => Ok(Direction::Download),
            "upload" => Ok(Direction::Upload),
            "bidirectional" => Ok(Direction::Bidirectional),
            other => Err(AppError::InvalidConfig(format!(
                "unknown direction {other:?}, expected download|upload|bidirectional"
            ))),
        }
    }
}

/// Surface distinction only — `mode: client` vs `mode: proxy` in the
/// `/stream/start` request body does not change the internal `StartStream`
/// effect, only whether the response carries raw test-server addresses. See
/// spec §9 Open Questions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    Client,
    Proxy,
}

impl Default for StreamMode {
    fn default() -> Self {
        StreamMode::Client
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Pending,
    Starting,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl StreamStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StreamStatus::Completed | StreamStatus::Failed | StreamStatus::Cancelled
        )
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

/// Immutable once constructed — validated before any [`StreamState`] exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub id: String,
    pub protocol: Protocol,
    pub direction: Direction,
    /// Test duration.
    pub duration: Duration,
    /// Parallel-stream count, 1..=max_parallel_streams.
    pub streams: u32,
    /// Packet/chunk size in bytes, 64..=9000.
    pub packet_size: u32,
    pub client_ip: String,
    pub start_time: DateTime<Utc>,
    pub mode: StreamMode,
}

impl StreamConfig {
    /// Validates protocol, direction, packet size, and duration before any
    /// session state is created (spec §3 StreamConfig invariant).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Option<String>,
        protocol: Protocol,
        direction: Direction,
        duration_secs: u64,
        streams: u32,
        packet_size: u32,
        client_ip: String,
        mode: StreamMode,
        max_duration: Duration,
        max_parallel_streams: u32,
    ) -> Result<Self, AppError> {
        if duration_secs == 0 || Duration::from_secs(duration_secs) > max_duration {
            return Err(AppError::InvalidConfig(format!(
                "duration must be in 1..={} seconds",
                max_duration.as_secs()
            )));
        }
        if streams == 0 || streams > max_parallel_streams {
            return Err(AppError::InvalidConfig(format!(
                "streams must be in 1..={max_parallel_streams}"
            )));
        }
        if !(64..=9000).contains(&packet_size) {
            return Err(AppError::InvalidConfig(
                "packet_size must be in 64..=9000".to_string(),
            ));
        }

        Ok(Self {
            id: id.filter(|s| !s.is_empty()).unwrap_or_else(|| Uuid::new_v4().to_string()),
            protocol,
            direction,
            duration: Duration::from_secs(duration_secs),
            streams,
            packet_size,
            client_ip,
            start_time: Utc::now(),
            mode,
        })
    }
}

/// Instantaneous snapshot of a session's measured performance. Cumulative
/// counters (bytes, packets) are monotone across snapshots for one session;
/// instantaneous rates are not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub instantaneous_mbps: f64,
    pub rolling_avg_mbps: f64,
    pub latency_min_ms: f64,
    pub latency_avg_ms: f64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_max_ms: f64,
    pub jitter_ms: f64,
    pub packet_loss_pct: f64,
    pub bytes_transferred: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub timestamp: DateTime<Utc>,
}

impl Default for MetricsSnapshot {
    fn default() -> Self {
        Self {
            instantaneous_mbps: 0.0,
            rolling_avg_mbps: 0.0,
            latency_min_ms: 0.0,
            latency_avg_ms: 0.0,
            latency_p50_ms: 0.0,
            latency_p95_ms: 0.0,
            latency_max_ms: 0.0,
            jitter_ms: 0.0,
            packet_loss_pct: 0.0,
            bytes_transferred: 0,
            packets_sent: 0,
            packets_received: 0,
            timestamp: Utc::now(),
        }
    }
}

/// Mutable session record, owned exclusively by the stream manager.
/// Observers only ever see deep-copied snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamState {
    pub config: StreamConfig,
    pub status: StreamStatus,
    pub progress: f64,
    pub metrics: MetricsSnapshot,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl StreamState {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            status: StreamStatus::Pending,
            progress: 0.0,
            metrics: MetricsSnapshot::default(),
            start_time: None,
            end_time: None,
            error: None,
        }
    }

    pub fn elapsed(&self) -> Duration {
        match self.start_time {
            Some(t) => {
                let secs = (Utc::now() - t).num_milliseconds().max(0) as f64 / 1000.0;
                Duration::from_secs_f64(secs)
            }
            None => Duration::ZERO,
        }
    }
}
