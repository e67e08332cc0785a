use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::task::JoinHandle;

use crate::config::StreamManagerConfig;
use crate::error::AppError;
use crate::models::{MetricsSnapshot, StreamConfig, StreamState, StreamStatus};

/// One event per broadcast tick, non-blocking-sent onto a bounded channel.
/// A slow consumer (the WebSocket fan-out) simply misses ticks — spec §4.5
/// and §9 document this as intentional: the fan-out resyncs on the next
/// tick, and terminal events are delivered at-most-once anyway via the
/// fan-out's own dedupe (§4.6).
#[derive(Debug, Clone)]
pub struct MetricsEvent {
    pub stream_id: String,
    pub status: StreamStatus,
    pub snapshot: MetricsSnapshot,
    pub progress: f64,
    pub config: StreamConfig,
    pub error: Option<String>,
}

struct Inner {
    streams: RwLock<HashMap<String, StreamState>>,
    active_by_ip: RwLock<HashMap<String, usize>>,
    config: StreamManagerConfig,
}

/// In-memory registry of logical test sessions (spec §4.5). `StreamState` is
/// owned exclusively here; every getter returns a deep copy.
pub struct StreamManager {
    inner: Arc<Inner>,
    metrics_tx: mpsc::Sender<MetricsEvent>,
    metrics_rx: tokio::sync::Mutex<Option<mpsc::Receiver<MetricsEvent>>>,
    stop: Arc<Notify>,
    stopped: std::sync::atomic::AtomicBool,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl StreamManager {
    pub fn new(config: StreamManagerConfig) -> Self {
        let (tx, rx) = mpsc::channel(1024);
        Self {
            inner: Arc::new(Inner {
                streams: RwLock::new(HashMap::new()),
                active_by_ip: RwLock::new(HashMap::new()),
                config,
            }),
            metrics_tx: tx,
            metrics_rx: tokio::sync::Mutex::new(Some(rx)),
            stop: Arc::new(Notify::new()),
            stopped: std::sync::atomic::AtomicBool::new(false),
            tasks: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Take the receiver side once — the caller (the WS fan-out wiring in
    /// `main`) owns draining it.
    pub async fn take_metrics_receiver(&self) -> Option<mpsc::Receiver<MetricsEvent>> {
        self.metrics_rx.lock().await.take()
    }

    pub async fn create_stream(&self, config: StreamConfig) -> Result<StreamState, AppError> {
        let ip = config.client_ip.clone();
        let id = config.id.clone();

        let mut streams = self.inner.streams.write().await;
        if streams.len() >= self.inner.config.max_streams {
            return Err(AppError::ResourceExhausted(
                "max concurrent streams reached".to_string(),
            ));
        }
        if streams.contains_key(&id) {
            return Err(AppError::StreamAlreadyExists(id));
        }

        let mut by_ip = self.inner.active_by_ip.write().await;
        let count = by_ip.get(&ip).copied().unwrap_or(0);
        if count >= self.inner.config.max_streams_per_ip {
            return Err(AppError::ResourceExhausted(format!(
                "per-IP stream cap reached for {ip}"
            )));
        }

        let state = StreamState::new(config);
        streams.insert(id, state.clone());
        by_ip.insert(ip, count + 1);

        Ok(state)
    }

    pub async fn start_stream(&self, id: &str) -> Result<StreamState, AppError> {
        let mut streams = self.inner.streams.write().await;
        let state = streams
            .get_mut(id)
            .ok_or_else(|| AppError::StreamNotFound(id.to_string()))?;

        if state.status.is_terminal() {
            return Err(AppError::StreamNotFound(id.to_string()));
        }

        state.status = StreamStatus::Running;
        state.start_time = Some(Utc::now());
        Ok(state.clone())
    }

    pub async fn update_metrics(
        &self,
        id: &str,
        metrics: MetricsSnapshot,
    ) -> Result<StreamState, AppError> {
        let mut streams = self.inner.streams.write().await;
        let state = streams
            .get_mut(id)
            .ok_or_else(|| AppError::StreamNotFound(id.to_string()))?;

        if state.status.is_terminal() {
            // Writes against a sink status are silent no-ops (spec §3).
            return Ok(state.clone());
        }

        let elapsed_secs = state
            .start_time
            .map(|t| (Utc::now() - t).num_milliseconds().max(0) as f64 / 1000.0)
            .unwrap_or(0.0);
        let total_secs = state.config.duration.as_secs_f64().max(f64::EPSILON);
        state.progress = (elapsed_secs / total_secs * 100.0).min(100.0);
        state.metrics = metrics;
        Ok(state.clone())
    }

    async fn finish(
        &self,
        id: &str,
        metrics: Option<MetricsSnapshot>,
        status: StreamStatus,
        error: Option<String>,
    ) -> Result<StreamState, AppError> {
        debug_assert!(status.is_terminal());
        let mut streams = self.inner.streams.write().await;
        let state = streams
            .get_mut(id)
            .ok_or_else(|| AppError::StreamNotFound(id.to_string()))?;

        if state.status.is_terminal() {
            return Ok(state.clone());
        }

        if let Some(m) = metrics {
            state.metrics = m;
        }
        state.status = status;
        state.progress = 100.0;
        state.end_time = Some(Utc::now());
        state.error = error;

        let snapshot = state.clone();
        drop(streams);
        self.release_ip_slot(&snapshot.config.client_ip).await;
        Ok(snapshot)
    }

    pub async fn complete_stream(
        &self,
        id: &str,
        metrics: MetricsSnapshot,
    ) -> Result<StreamState, AppError> {
        self.finish(id, Some(metrics), StreamStatus::Completed, None)
            .await
    }

    pub async fn fail_stream(
        &self,
        id: &str,
        metrics: Option<MetricsSnapshot>,
        error: String,
    ) -> Result<StreamState, AppError> {
        self.finish(id, metrics, StreamStatus::Failed, Some(error))
            .await
    }

    pub async fn cancel_stream(&self, id: &str) -> Result<StreamState, AppError> {
        self.finish(id, None, StreamStatus::Cancelled, None).await
    }

    pub async fn get(&self, id: &str) -> Result<StreamState, AppError> {
        self.inner
            .streams
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::StreamNotFound(id.to_string()))
    }

    pub async fn active_count(&self) -> usize {
        self.inner
            .streams
            .read()
            .await
            .values()
            .filter(|s| s.status.is_active())
            .count()
    }

    async fn release_ip_slot(&self, ip: &str) {
        let mut by_ip = self.inner.active_by_ip.write().await;
        if let Some(count) = by_ip.get_mut(ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                by_ip.remove(ip);
            }
        }
    }

    /// Spawns the cleanup and broadcast background tasks (spec §4.5).
    pub fn start(self: &Arc<Self>) {
        let cleanup_manager = Arc::clone(self);
        let cleanup_stop = Arc::clone(&self.stop);
        let cleanup_interval = self.inner.config.cleanup_interval;
        let cleanup_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => cleanup_manager.run_cleanup().await,
                    _ = cleanup_stop.notified() => break,
                }
            }
        });

        let broadcast_manager = Arc::clone(self);
        let broadcast_stop = Arc::clone(&self.stop);
        let broadcast_interval = self.inner.config.metrics_update_interval;
        let broadcast_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(broadcast_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => broadcast_manager.run_broadcast().await,
                    _ = broadcast_stop.notified() => break,
                }
            }
        });

        // Note: `start` may be called more than once only by programmer
        // error; tasks accumulate in that case rather than panicking.
        if let Ok(mut tasks) = self.tasks.try_lock() {
            tasks.push(cleanup_handle);
            tasks.push(broadcast_handle);
        }
    }

    async fn run_cleanup(&self) {
        let now = Utc::now();
        let grace = Duration::from_secs(30);
        let mut to_remove = Vec::new();

        {
            let streams = self.inner.streams.read().await;
            for (id, state) in streams.iter() {
                match state.status {
                    StreamStatus::Running | StreamStatus::Starting => {
                        if let Some(start) = state.start_time {
                            let deadline = state.config.duration + grace;
                            if (now - start).num_milliseconds().max(0) as u64
                                > deadline.as_millis() as u64
                            {
                                to_remove.push((id.clone(), true));
                            }
                        }
                    }
                    StreamStatus::Pending => {
                        // Never started within 30s of creation: drop it.
                        if (now - state.config.start_time).num_seconds() > 30 {
                            to_remove.push((id.clone(), false));
                        }
                    }
                    _ if state.status.is_terminal() => {
                        if let Some(end) = state.end_time {
                            if (now - end).num_milliseconds().max(0) as u64
                                > self.inner.config.retention.as_millis() as u64
                            {
                                to_remove.push((id.clone(), false));
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        if to_remove.is_empty() {
            return;
        }

        let mut streams = self.inner.streams.write().await;
        for (id, force_fail) in to_remove {
            if let Some(mut state) = streams.remove(&id) {
                if force_fail {
                    state.status = StreamStatus::Failed;
                    state.end_time = Some(now);
                    state.error = Some("timed out".to_string());
                    tracing::warn!(stream_id = %id, "forced stream to failed: exceeded duration+grace");
                }
                drop(streams);
                self.release_ip_slot(&state.config.client_ip).await;
                streams = self.inner.streams.write().await;
            }
        }
    }

    async fn run_broadcast(&self) {
        let snapshot: Vec<StreamState> = {
            let streams = self.inner.streams.read().await;
            streams
                .values()
                .filter(|s| {
                    matches!(
                        s.status,
                        StreamStatus::Running
                            | StreamStatus::Starting
                            | StreamStatus::Completed
                            | StreamStatus::Failed
                    )
                })
                .cloned()
                .collect()
        };

        for state in snapshot {
            let event = MetricsEvent {
                stream_id: state.config.id.clone(),
                status: state.status,
                snapshot: state.metrics.clone(),
                progress: state.progress,
                config: state.config.clone(),
                error: state.error.clone(),
            };
            // Non-blocking: a full channel (slow WS fan-out consumer) simply
            // drops this tick rather than stalling the manager.
            if self.metrics_tx.try_send(event).is_err() {
                tracing::trace!(stream_id = %state.config.id, "metrics broadcast channel full, dropping tick");
            }
        }
    }

    pub async fn stop(&self) {
        if self
            .stopped
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return;
        }
        self.stop.notify_waiters();
        let mut tasks = self.tasks.lock().await;
        for handle in tasks.drain(..) {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, Protocol, StreamMode};
    use std::time::Duration as StdDuration;

    fn cfg() -> StreamManagerConfig {
        StreamManagerConfig {
            max_streams: 10,
            max_streams_per_ip: 2,
            max_parallel_streams: 8,
            retention: StdDuration::from_secs(300),
            cleanup_interval: StdDuration::from_secs(10),
            metrics_update_interval: StdDuration::from_secs(1),
        }
    }

    fn mk_config(ip: &str) -> StreamConfig {
        StreamConfig::new(
            None,
            Protocol::Tcp,
            Direction::Download,
            10,
            1,
            1500,
            ip.to_string(),
            StreamMode::Client,
            StdDuration::from_secs(300),
            8,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn per_ip_cap_enforced() {
        let mgr = StreamManager::new(cfg());
        mgr.create_stream(mk_config("1.1.1.1")).await.unwrap();
        mgr.create_stream(mk_config("1.1.1.1")).await.unwrap();
        let err = mgr.create_stream(mk_config("1.1.1.1")).await.unwrap_err();
        assert!(matches!(err, AppError::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn duplicate_id_rejected() {
        let mgr = StreamManager::new(cfg());
        let mut config = mk_config("2.2.2.2");
        config.id = "dup".to_string();
        mgr.create_stream(config.clone()).await.unwrap();
        let err = mgr.create_stream(config).await.unwrap_err();
        assert!(matches!(err, AppError::StreamAlreadyExists(_)));
    }

    #[tokio::test]
    async fn terminal_state_is_sink_for_updates() {
        let mgr = StreamManager::new(cfg());
        let state = mgr.create_stream(mk_config("3.3.3.3")).await.unwrap();
        mgr.start_stream(&state.config.id).await.unwrap();
        mgr.complete_stream(&state.config.id, MetricsSnapshot::default())
            .await
            .unwrap();

        let after = mgr
            .update_metrics(&state.config.id, MetricsSnapshot::default())
            .await
            .unwrap();
        assert_eq!(after.status, StreamStatus::Completed);

        let again = mgr.cancel_stream(&state.config.id).await.unwrap();
        assert_eq!(again.status, StreamStatus::Completed);
    }

    #[tokio::test]
    async fn complete_releases_ip_slot() {
        let mgr = StreamManager::new(cfg());
        let state = mgr.create_stream(mk_config("4.4.4.4")).await.unwrap();
        mgr.start_stream(&state.config.id).await.unwrap();
        mgr.complete_stream(&state.config.id, MetricsSnapshot::default())
            .await
            .unwrap();
        // The slot should be free again — two more creates now succeed.
        mgr.create_stream(mk_config("4.4.4.4")).await.unwrap();
        mgr.create_stream(mk_config("4.4.4.4")).await.unwrap();
    }

    #[tokio::test]
    async fn session_accounting_matches_active_statuses() {
        let mgr = StreamManager::new(cfg());
        let a = mgr.create_stream(mk_config("5.5.5.5")).await.unwrap();
        let b = mgr.create_stream(mk_config("5.5.5.5")).await.unwrap();
        assert_eq!(mgr.active_count().await, 2);
        mgr.cancel_stream(&a.config.id).await.unwrap();
        assert_eq!(mgr.active_count().await, 1);
        mgr.fail_stream(&b.config.id, None, "boom".to_string())
            .await
            .unwrap();
        assert_eq!(mgr.active_count().await, 0);
    }

    #[tokio::test]
    async fn not_found_for_unknown_id() {
        let mgr = StreamManager::new(cfg());
        let err = mgr.start_stream("nope").await.unwrap_err();
        assert!(matches!(err, AppError::StreamNotFound(_)));
    }
}
