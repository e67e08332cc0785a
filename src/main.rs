use std::net::SocketAddr;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::TcpListener;
use tower::Service;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use throughput_server::config::Settings;
use throughput_server::services::{
    ClientIpResolver, PayloadBuffer, RateLimiter, ResultsStore, StreamManager, WsFanout,
};
use throughput_server::transport::TransportServer;
use throughput_server::{routes, AppState, HTTP_DOWNLOAD_PAYLOAD_SIZE};

/// Cap on how long a connection may spend sending request headers before the
/// server drops it (spec §5: mitigates slowloris-style connections that trickle
/// headers in one byte at a time). `axum::serve` leaves this unset, so the
/// server is built directly on `hyper_util`'s low-level connection builder.
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the shutdown path waits for in-flight connections to finish on
/// their own before giving up and exiting anyway.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "throughput_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Arc::new(Settings::load()?);
    tracing::info!("starting throughput measurement server");

    let client_ip = Arc::new(ClientIpResolver::new(&settings.trust));
    let rate_limiter = Arc::new(RateLimiter::new(settings.rate_limit.clone()));

    let stream_manager = Arc::new(StreamManager::new(settings.stream_manager.clone()));
    stream_manager.start();

    let ws_fanout = WsFanout::new(
        settings.websocket.write_timeout,
        settings.websocket.ping_interval,
    );
    ws_fanout.start_ping_task();

    let results_store = Arc::new(ResultsStore::open(settings.results_store.clone()).await?);
    results_store.start_sweeper();

    let transport = Arc::new(TransportServer::new(&settings));
    transport
        .run(
            &settings.server.host,
            settings.server.tcp_port,
            settings.server.udp_port,
        )
        .await?;

    // Drain the manager's broadcast channel into the WS fan-out (spec §4.5 /
    // §4.6 wiring — the manager and fan-out are otherwise decoupled).
    if let Some(mut metrics_rx) = stream_manager.take_metrics_receiver().await {
        let fanout = Arc::clone(&ws_fanout);
        tokio::spawn(async move {
            while let Some(event) = metrics_rx.recv().await {
                fanout.broadcast_metrics(event).await;
            }
        });
    }

    let state = AppState {
        settings: Arc::clone(&settings),
        client_ip,
        rate_limiter,
        stream_manager: Arc::clone(&stream_manager),
        ws_fanout: Arc::clone(&ws_fanout),
        results_store: Arc::clone(&results_store),
        transport: Arc::clone(&transport),
        download_payload: PayloadBuffer::generate(HTTP_DOWNLOAD_PAYLOAD_SIZE),
        active_downloads: Arc::new(AtomicU32::new(0)),
        active_uploads: Arc::new(AtomicU32::new(0)),
        started_at: chrono::Utc::now(),
    };

    let app = routes::build(state);

    let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.http_port)
        .parse()?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "http server listening");

    serve(listener, app, shutdown_signal()).await;

    tracing::info!("shutting down");
    transport.close().await;
    ws_fanout.close().await;
    stream_manager.stop().await;
    results_store.close().await;

    Ok(())
}

/// Stands in for `axum::serve`. Accepts connections directly so each one can
/// be built with a header-read timeout, and tracks in-flight connections so
/// shutdown can wait for them to drain instead of cutting them off.
async fn serve(listener: TcpListener, app: axum::Router, shutdown: impl std::future::Future<Output = ()>) {
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
    let graceful = GracefulShutdown::new();
    let mut shutdown = std::pin::pin!(shutdown);

    loop {
        let (socket, remote_addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to accept connection");
                    continue;
                }
            },
            _ = &mut shutdown => {
                tracing::info!("http server: no longer accepting new connections");
                break;
            }
        };

        let tower_service = match make_service.clone().call(remote_addr).await {
            Ok(service) => service,
            Err(infallible) => match infallible {},
        };

        let mut builder = auto::Builder::new(TokioExecutor::new());
        builder.http1().header_read_timeout(Some(HEADER_READ_TIMEOUT));

        let conn = builder.serve_connection_with_upgrades(
            TokioIo::new(socket),
            hyper::service::service_fn(move |request: Request<Incoming>| {
                tower_service.clone().call(request)
            }),
        );
        let conn = graceful.watch(conn.into_owned());

        tokio::spawn(async move {
            if let Err(err) = conn.await {
                tracing::warn!(error = %err, %remote_addr, "connection error");
            }
        });
    }

    drop(listener);

    tokio::select! {
        _ = graceful.shutdown() => {
            tracing::debug!("all connections closed gracefully");
        }
        _ = tokio::time::sleep(SHUTDOWN_DRAIN_TIMEOUT) => {
            tracing::warn!("graceful shutdown timed out, exiting with connections still open");
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
