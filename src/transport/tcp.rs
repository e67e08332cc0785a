use socket2::SockRef;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Instant};

use super::TransportServer;

const ACCEPT_TIMEOUT: Duration = Duration::from_millis(500);
const CMD_READ_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_DEADLINE_CADENCE: Duration = Duration::from_secs(1);
const GRACE: Duration = Duration::from_secs(30);

impl TransportServer {
    pub(super) async fn tcp_accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            if self.is_stopping() {
                break;
            }
            let accepted = timeout(ACCEPT_TIMEOUT, listener.accept()).await;
            let (stream, peer) = match accepted {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "tcp accept error");
                    if is_listener_closed(&e) {
                        break;
                    }
                    continue;
                }
                Err(_) => continue, // accept deadline elapsed, loop to re-check stop
            };

            if let Err(e) = tune_socket(&stream) {
                tracing::debug!(error = %e, "tcp socket tuning failed");
            }

            let prev = self.active_tcp_connections.fetch_add(1, Ordering::SeqCst);
            if prev + 1 > self.config.max_tcp_connections {
                self.active_tcp_connections.fetch_sub(1, Ordering::SeqCst);
                drop(stream);
                continue;
            }

            let this = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = this.handle_tcp_connection(stream, peer.to_string()).await {
                    tracing::debug!(error = %e, %peer, "tcp connection ended with error");
                }
                this.active_tcp_connections.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }

    async fn handle_tcp_connection(&self, mut stream: TcpStream, peer: String) -> io::Result<()> {
        let deadline = Instant::now() + self.config.max_test_duration + GRACE;

        let mut cmd = [0u8; 1];
        match timeout(CMD_READ_TIMEOUT, stream.read_exact(&mut cmd)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Ok(()), // no command arrived in time, just drop
        }

        tracing::debug!(%peer, command = cmd[0] as char, "tcp session");

        match cmd[0] {
            b'D' => self.tcp_download(stream, deadline).await,
            b'U' => self.tcp_upload(stream, deadline).await,
            b'B' => self.tcp_bidirectional(stream, deadline).await,
            _ => self.tcp_echo(stream, deadline).await,
        }
    }

    async fn tcp_download(&self, mut stream: TcpStream, deadline: Instant) -> io::Result<()> {
        let chunk_size = 64 * 1024;
        let mut chunk = vec![0u8; chunk_size];
        let mut offset = 0usize;

        loop {
            if Instant::now() >= deadline {
                return Ok(());
            }
            self.payload.fill_slice(offset, &mut chunk);
            offset = offset.wrapping_add(chunk_size);

            // Refresh the write deadline on a ~1s cadence, never past the overall deadline.
            let step_deadline = deadline.min(Instant::now() + WRITE_DEADLINE_CADENCE);
            match timeout(step_deadline.saturating_duration_since(Instant::now()), stream.write_all(&chunk)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => continue, // write-cadence deadline elapsed; outer loop re-checks overall deadline
            }
        }
    }

    async fn tcp_upload(&self, mut stream: TcpStream, deadline: Instant) -> io::Result<()> {
        let mut buf = self.recv_pool.acquire().await;
        let result = loop {
            if Instant::now() >= deadline {
                break Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now()).min(WRITE_DEADLINE_CADENCE);
            match timeout(remaining, stream.read(&mut buf)).await {
                Ok(Ok(0)) => break Ok(()), // EOF
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => break Err(e),
                Err(_) => continue,
            }
        };
        self.recv_pool.release(buf).await;
        result
    }

    async fn tcp_bidirectional(&self, stream: TcpStream, deadline: Instant) -> io::Result<()> {
        let (mut reader_half, mut writer_half) = stream.into_split();
        let buf_pool = Arc::clone(&self.recv_pool);
        let payload = self.payload.clone();

        let reader = async move {
            let mut buf = buf_pool.acquire().await;
            loop {
                if Instant::now() >= deadline {
                    break;
                }
                let remaining = deadline.saturating_duration_since(Instant::now()).min(WRITE_DEADLINE_CADENCE);
                match timeout(remaining, reader_half.read(&mut buf)).await {
                    Ok(Ok(0)) => break,
                    Ok(Ok(_)) => continue,
                    Ok(Err(_)) => break,
                    Err(_) => continue,
                }
            }
            buf_pool.release(buf).await;
        };

        let writer = async move {
            let chunk_size = 64 * 1024;
            let mut chunk = vec![0u8; chunk_size];
            let mut offset = 0usize;
            loop {
                if Instant::now() >= deadline {
                    break;
                }
                payload.fill_slice(offset, &mut chunk);
                offset = offset.wrapping_add(chunk_size);
                let remaining = deadline.saturating_duration_since(Instant::now()).min(WRITE_DEADLINE_CADENCE);
                match timeout(remaining, writer_half.write_all(&chunk)).await {
                    Ok(Ok(())) => continue,
                    Ok(Err(_)) => break,
                    Err(_) => continue,
                }
            }
        };

        tokio::select! {
            _ = reader => {}
            _ = writer => {}
        }
        Ok(())
    }

    async fn tcp_echo(&self, mut stream: TcpStream, deadline: Instant) -> io::Result<()> {
        let mut buf = self.recv_pool.acquire().await;
        let result = loop {
            if Instant::now() >= deadline {
                break Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now()).min(WRITE_DEADLINE_CADENCE);
            match timeout(remaining, stream.read(&mut buf)).await {
                Ok(Ok(0)) => break Ok(()),
                Ok(Ok(n)) => {
                    if let Err(e) = stream.write_all(&buf[..n]).await {
                        break Err(e);
                    }
                }
                Ok(Err(e)) => break Err(e),
                Err(_) => continue,
            }
        };
        self.recv_pool.release(buf).await;
        result
    }
}

fn tune_socket(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let sock = SockRef::from(stream);
    sock.set_recv_buffer_size(256 * 1024).ok();
    sock.set_send_buffer_size(256 * 1024).ok();
    Ok(())
}

fn is_listener_closed(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected
    )
}
