mod tcp;
mod udp;

use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;

use crate::config::{Settings, TransportConfig};
use crate::error::AppError;
use crate::services::{BufferPool, PayloadBuffer};

const PAYLOAD_SIZE: usize = 1024 * 1024; // 1 MiB circular payload (spec §4.3)
const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Owns the TCP and UDP listeners, the random payload buffer, and the
/// recv-buffer pool. The only process-wide state in this service besides
/// the listening sockets lives here (spec §9 "global singletons" note).
pub struct TransportServer {
    config: TransportConfig,
    payload: PayloadBuffer,
    recv_pool: Arc<BufferPool>,
    active_tcp_connections: Arc<AtomicU32>,
    active_udp_senders: Arc<AtomicU32>,
    udp_clients_map: Arc<udp::ClientMap>,
    stop: Arc<Notify>,
    stopped: std::sync::atomic::AtomicBool,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl TransportServer {
    pub fn new(settings: &Settings) -> Self {
        Self {
            config: settings.transport.clone(),
            payload: PayloadBuffer::generate(PAYLOAD_SIZE),
            recv_pool: Arc::new(BufferPool::new(RECV_BUFFER_SIZE, 16)),
            active_tcp_connections: Arc::new(AtomicU32::new(0)),
            active_udp_senders: Arc::new(AtomicU32::new(0)),
            udp_clients_map: Arc::new(RwLock::new(HashMap::new())),
            stop: Arc::new(Notify::new()),
            stopped: std::sync::atomic::AtomicBool::new(false),
            tasks: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn active_tcp_connections(&self) -> u32 {
        self.active_tcp_connections.load(Ordering::Relaxed)
    }

    pub fn active_udp_senders(&self) -> u32 {
        self.active_udp_senders.load(Ordering::Relaxed)
    }

    /// Binds both listeners and spawns the accept/reader loops. Bind
    /// failures are a startup-time `ConnectionFailed` error (spec §7).
    pub async fn run(self: &Arc<Self>, host: &str, tcp_port: u16, udp_port: u16) -> Result<(), AppError> {
        let tcp_addr: SocketAddr = format!("{host}:{tcp_port}")
            .parse()
            .map_err(|e| AppError::ConnectionFailed(format!("invalid tcp bind addr: {e}")))?;
        let udp_addr: SocketAddr = format!("{host}:{udp_port}")
            .parse()
            .map_err(|e| AppError::ConnectionFailed(format!("invalid udp bind addr: {e}")))?;

        let tcp_listener = TcpListener::bind(tcp_addr)
            .await
            .map_err(|e| AppError::ConnectionFailed(format!("tcp bind {tcp_addr}: {e}")))?;

        let udp_socket = bind_udp(udp_addr)
            .map_err(|e| AppError::ConnectionFailed(format!("udp bind {udp_addr}: {e}")))?;

        tracing::info!(%tcp_addr, %udp_addr, "transport server listening");

        let this = Arc::clone(self);
        let tcp_handle = tokio::spawn(async move { this.tcp_accept_loop(tcp_listener).await });

        let udp_socket = Arc::new(udp_socket);
        let reader_count = num_cpus::get().clamp(2, 4);
        let mut udp_handles = Vec::with_capacity(reader_count);
        for _ in 0..reader_count {
            let this = Arc::clone(self);
            let socket = Arc::clone(&udp_socket);
            udp_handles.push(tokio::spawn(async move { this.udp_reader_loop(socket).await }));
        }

        let sweep_this = Arc::clone(self);
        let sweep_handle = tokio::spawn(async move { sweep_this.udp_sweep_loop().await });

        let mut tasks = self.tasks.lock().await;
        tasks.push(tcp_handle);
        tasks.extend(udp_handles);
        tasks.push(sweep_handle);

        Ok(())
    }

    /// Idempotent. Cancels the root context, waits for spawned tasks. Safe
    /// to call concurrently (spec §4.3 "Shutdown").
    pub async fn close(&self) {
        if self
            .stopped
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return;
        }
        self.stop.notify_waiters();
        let mut tasks = self.tasks.lock().await;
        for handle in tasks.drain(..) {
            handle.abort();
            let _ = handle.await;
        }
    }

    fn is_stopping(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

fn bind_udp(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::DGRAM, Some(SockProtocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.set_recv_buffer_size(4 * 1024 * 1024).ok();
    socket.set_send_buffer_size(4 * 1024 * 1024).ok();
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}
