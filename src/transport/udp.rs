use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::time::{timeout, Instant};

use super::TransportServer;

const RECV_TIMEOUT: Duration = Duration::from_millis(500);
const SEND_DEADLINE: Duration = Duration::from_millis(200);
const SENDER_YIELD_INTERVAL: Duration = Duration::from_millis(2);
const IDLE_TIMEOUT_SECS: i64 = 30;
const MAX_DATAGRAM: usize = 2048;
const PACKET_SIZE: usize = 1400;

/// Per-peer UDP session state. `last_seen_nanos` is a monotonic-epoch
/// nanosecond stamp written by the reader and read by the sender, so the two
/// never need to share a lock for the hot path (spec §4.3 "UDP client
/// state").
pub(super) struct UdpClient {
    downloading: AtomicBool,
    sender_active: AtomicBool,
    received_bytes: AtomicU64,
    last_seen_nanos: AtomicI64,
}

impl UdpClient {
    fn new(now_nanos: i64) -> Self {
        Self {
            downloading: AtomicBool::new(false),
            sender_active: AtomicBool::new(false),
            received_bytes: AtomicU64::new(0),
            last_seen_nanos: AtomicI64::new(now_nanos),
        }
    }

    fn touch(&self, now_nanos: i64) {
        self.last_seen_nanos.store(now_nanos, Ordering::Relaxed);
    }

    fn idle_secs(&self, now_nanos: i64) -> i64 {
        (now_nanos - self.last_seen_nanos.load(Ordering::Relaxed)) / 1_000_000_000
    }
}

pub(super) type ClientMap = RwLock<HashMap<SocketAddr, Arc<UdpClient>>>;

fn now_nanos(epoch: Instant) -> i64 {
    Instant::now().duration_since(epoch).as_nanos() as i64
}

impl TransportServer {
    pub(super) async fn udp_reader_loop(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let clients: Arc<ClientMap> = self.udp_clients();
        let epoch = Instant::now();
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            if self.is_stopping() {
                break;
            }
            let recv = timeout(RECV_TIMEOUT, socket.recv_from(&mut buf)).await;
            let (n, peer) = match recv {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "udp recv error");
                    continue;
                }
                Err(_) => continue,
            };
            if n == 0 {
                continue;
            }

            let now = now_nanos(epoch);
            let client = self.get_or_create_udp_client(&clients, peer, &socket, epoch, now).await;
            let Some(client) = client else {
                continue; // sender cap reached, datagram dropped
            };
            client.touch(now);

            match buf[0] {
                b'D' => client.downloading.store(true, Ordering::Relaxed),
                b'U' => {
                    client.received_bytes.fetch_add(n as u64, Ordering::Relaxed);
                }
                b'S' => client.downloading.store(false, Ordering::Relaxed),
                _ => {
                    let _ = socket.send_to(&buf[..n], peer).await;
                }
            }
        }
    }

    async fn get_or_create_udp_client(
        self: &Arc<Self>,
        clients: &Arc<ClientMap>,
        peer: SocketAddr,
        socket: &Arc<UdpSocket>,
        epoch: Instant,
        now: i64,
    ) -> Option<Arc<UdpClient>> {
        {
            let map = clients.read().await;
            if let Some(existing) = map.get(&peer) {
                return Some(Arc::clone(existing));
            }
        }

        let mut map = clients.write().await;
        if let Some(existing) = map.get(&peer) {
            return Some(Arc::clone(existing));
        }

        let prev = self.active_udp_senders.fetch_add(1, Ordering::SeqCst);
        if prev + 1 > self.config.max_udp_senders {
            self.active_udp_senders.fetch_sub(1, Ordering::SeqCst);
            return None;
        }

        let client = Arc::new(UdpClient::new(now));
        client.sender_active.store(true, Ordering::SeqCst);
        map.insert(peer, Arc::clone(&client));
        drop(map);

        let this = Arc::clone(self);
        let sender_client = Arc::clone(&client);
        let socket = Arc::clone(socket);
        let clients = Arc::clone(clients);
        tokio::spawn(async move {
            this.udp_sender_loop(sender_client, peer, socket, clients, epoch).await;
        });

        Some(client)
    }

    async fn udp_sender_loop(
        &self,
        client: Arc<UdpClient>,
        peer: SocketAddr,
        socket: Arc<UdpSocket>,
        clients: Arc<ClientMap>,
        epoch: Instant,
    ) {
        let mut offset = 0usize;
        let mut chunk = vec![0u8; PACKET_SIZE];

        loop {
            if self.is_stopping() {
                break;
            }

            let now = now_nanos(epoch);
            if client.idle_secs(now) > IDLE_TIMEOUT_SECS {
                break;
            }

            if client.downloading.load(Ordering::Relaxed) {
                self.payload.fill_slice(offset, &mut chunk);
                offset = offset.wrapping_add(PACKET_SIZE);
                match timeout(SEND_DEADLINE, socket.send_to(&chunk, peer)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(_)) => break,
                    Err(_) => {} // write deadline elapsed, retry next tick
                }
            }

            tokio::time::sleep(SENDER_YIELD_INTERVAL).await;
        }

        client.sender_active.store(false, Ordering::SeqCst);
        self.active_udp_senders.fetch_sub(1, Ordering::SeqCst);
        clients.write().await.remove(&peer);
    }

    pub(super) async fn udp_sweep_loop(self: Arc<Self>) {
        let clients = self.udp_clients();
        let epoch = Instant::now();
        let mut ticker = tokio::time::interval(self.config.udp_sweep_interval);
        loop {
            ticker.tick().await;
            if self.is_stopping() {
                break;
            }
            let now = now_nanos(epoch);
            let mut map = clients.write().await;
            map.retain(|_, client| {
                let idle = client.idle_secs(now) > IDLE_TIMEOUT_SECS;
                let no_sender = !client.sender_active.load(Ordering::Relaxed);
                !(idle && no_sender)
            });
        }
    }

    fn udp_clients(&self) -> Arc<ClientMap> {
        Arc::clone(&self.udp_clients_map)
    }
}
