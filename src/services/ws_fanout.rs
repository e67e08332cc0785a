use axum::extract::ws::Message;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};

use crate::models::{StreamConfig, StreamStatus};
use crate::services::stream_manager::MetricsEvent;

struct Connection {
    id: u64,
    tx: mpsc::Sender<Message>,
}

#[derive(Serialize)]
struct ConnectedFrame<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    stream_id: &'a str,
    time: chrono::DateTime<Utc>,
}

#[derive(Serialize)]
struct MetricsFrame<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    stream_id: &'a str,
    progress: f64,
    elapsed_secs: f64,
    remaining_secs: f64,
    metrics: &'a crate::models::MetricsSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    results: Option<ResultsPayload<'a>>,
}

#[derive(Serialize)]
struct ResultsPayload<'a> {
    config: &'a StreamConfig,
    metrics: &'a crate::models::MetricsSnapshot,
}

/// Per-session client set, periodic keepalives, at-most-once terminal event
/// delivery (spec §4.6).
pub struct WsFanout {
    connections: RwLock<HashMap<String, Vec<Connection>>>,
    last_terminal_sent: RwLock<HashMap<String, StreamStatus>>,
    write_timeout: Duration,
    ping_interval: Duration,
    next_conn_id: AtomicU64,
    stop: Arc<Notify>,
    stopped: std::sync::atomic::AtomicBool,
    ping_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WsFanout {
    pub fn new(write_timeout: Duration, ping_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            connections: RwLock::new(HashMap::new()),
            last_terminal_sent: RwLock::new(HashMap::new()),
            write_timeout,
            ping_interval,
            next_conn_id: AtomicU64::new(1),
            stop: Arc::new(Notify::new()),
            stopped: std::sync::atomic::AtomicBool::new(false),
            ping_task: Mutex::new(None),
        })
    }

    pub fn start_ping_task(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let stop = Arc::clone(&self.stop);
        let interval = self.ping_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => this.ping_all().await,
                    _ = stop.notified() => break,
                }
            }
        });
        if let Ok(mut guard) = self.ping_task.try_lock() {
            *guard = Some(handle);
        }
    }

    async fn ping_all(&self) {
        let conns = self.connections.read().await;
        for conns_for_stream in conns.values() {
            for conn in conns_for_stream {
                let _ = conn.tx.try_send(Message::Ping(Vec::new().into()));
            }
        }
    }

    /// Registers a new connection for `stream_id`, sends the one-shot
    /// `connected` frame, and returns the connection id used to unregister.
    pub async fn register(&self, stream_id: &str, tx: mpsc::Sender<Message>) -> u64 {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);

        let frame = ConnectedFrame {
            kind: "connected",
            stream_id,
            time: Utc::now(),
        };
        if let Ok(json) = serde_json::to_string(&frame) {
            let _ = tx.try_send(Message::Text(json.into()));
        }

        let mut conns = self.connections.write().await;
        conns
            .entry(stream_id.to_string())
            .or_default()
            .push(Connection { id, tx });
        id
    }

    pub async fn unregister(&self, stream_id: &str, conn_id: u64) {
        let mut conns = self.connections.write().await;
        if let Some(list) = conns.get_mut(stream_id) {
            list.retain(|c| c.id != conn_id);
            if list.is_empty() {
                conns.remove(stream_id);
            }
        }
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    /// Compose and deliver a metrics/terminal frame for one broadcast tick.
    /// Terminal events are deduplicated against `last_terminal_sent` so a
    /// given terminal status is written to each subscriber exactly once,
    /// regardless of how many times the manager's broadcast loop re-observes
    /// the same terminal state (spec §4.6).
    pub async fn broadcast_metrics(&self, event: MetricsEvent) {
        let kind = match event.status {
            StreamStatus::Completed => "complete",
            StreamStatus::Failed => "error",
            _ => "metrics",
        };

        if event.status.is_terminal() {
            let mut last = self.last_terminal_sent.write().await;
            if last.get(&event.stream_id) == Some(&event.status) {
                return;
            }
            last.insert(event.stream_id.clone(), event.status);
        }

        let elapsed = event
            .config
            .duration
            .as_secs_f64()
            .min(event.progress / 100.0 * event.config.duration.as_secs_f64());
        let remaining = (event.config.duration.as_secs_f64() - elapsed).max(0.0);

        let results = matches!(event.status, StreamStatus::Completed).then(|| ResultsPayload {
            config: &event.config,
            metrics: &event.snapshot,
        });

        let frame = MetricsFrame {
            kind,
            stream_id: &event.stream_id,
            progress: event.progress,
            elapsed_secs: elapsed,
            remaining_secs: remaining,
            metrics: &event.snapshot,
            error: event.error.as_deref(),
            results,
        };

        let json = match serde_json::to_string(&frame) {
            Ok(j) => j,
            Err(_) => return,
        };

        let conns = self.connections.read().await;
        if let Some(list) = conns.get(&event.stream_id) {
            for conn in list {
                let _ = conn.tx.try_send(Message::Text(json.clone().into()));
            }
        }
    }

    pub async fn close(&self) {
        if self
            .stopped
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return;
        }
        self.stop.notify_waiters();
        if let Some(handle) = self.ping_task.lock().await.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, MetricsSnapshot, Protocol, StreamMode};
    use std::time::Duration as StdDuration;

    fn mk_event(stream_id: &str, status: StreamStatus) -> MetricsEvent {
        let config = StreamConfig::new(
            Some(stream_id.to_string()),
            Protocol::Tcp,
            Direction::Download,
            10,
            1,
            1500,
            "1.2.3.4".to_string(),
            StreamMode::Client,
            StdDuration::from_secs(300),
            8,
        )
        .unwrap();
        MetricsEvent {
            stream_id: stream_id.to_string(),
            status,
            snapshot: MetricsSnapshot::default(),
            progress: 100.0,
            config,
            error: None,
        }
    }

    #[tokio::test]
    async fn terminal_event_delivered_exactly_once() {
        let fanout = WsFanout::new(StdDuration::from_secs(5), StdDuration::from_secs(15));
        let (tx, mut rx) = mpsc::channel(16);
        fanout.register("s1", tx).await;

        fanout
            .broadcast_metrics(mk_event("s1", StreamStatus::Completed))
            .await;
        fanout
            .broadcast_metrics(mk_event("s1", StreamStatus::Completed))
            .await;
        fanout
            .broadcast_metrics(mk_event("s1", StreamStatus::Completed))
            .await;

        // First recv is the "connected" frame, second is the one "complete"
        // frame; nothing else should be queued.
        let _connected = rx.recv().await.unwrap();
        let complete = rx.recv().await.unwrap();
        assert!(matches!(complete, Message::Text(_)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregister_stops_delivery() {
        let fanout = WsFanout::new(StdDuration::from_secs(5), StdDuration::from_secs(15));
        let (tx, mut rx) = mpsc::channel(16);
        let id = fanout.register("s2", tx).await;
        fanout.unregister("s2", id).await;

        fanout
            .broadcast_metrics(mk_event("s2", StreamStatus::Running))
            .await;

        let _connected = rx.recv().await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
