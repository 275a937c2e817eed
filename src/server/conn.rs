//! Accept loops and per-connection HTTP serving.
//!
//! Every connection runs on its own task with a header-read bound and an
//! idle bound. TLS handshakes happen on that task as well, so a peer that
//! never finishes its handshake only holds its own connection.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::{pin, Pin};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_native_tls::TlsAcceptor;
use tracing::{debug, warn};

use crate::config::ServerConfig;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed `accept`, e.g. when the process is out of descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
pub struct ConnTimeouts {
    pub header_read: Duration,
    pub idle: Duration,
}

impl ConnTimeouts {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            header_read: config.header_read_timeout(),
            idle: config.idle_timeout(),
        }
    }
}

impl Default for ConnTimeouts {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

/// Next connection on `listener`. Accept errors are logged and retried.
pub async fn accept(listener: &TcpListener) -> (TcpStream, SocketAddr) {
    retry_accept(|| listener.accept()).await
}

async fn retry_accept<T, F, Fut>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                warn!("accept failed, retrying in {ACCEPT_BACKOFF:?}: {e}");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// Serves `router` over plain HTTP until the task is dropped.
pub async fn serve(listener: TcpListener, router: Router, timeouts: ConnTimeouts) {
    loop {
        let (stream, peer) = accept(&listener).await;
        tokio::spawn(serve_connection(stream, router.clone(), timeouts, peer));
    }
}

/// Serves `router` over TLS until the task is dropped.
pub async fn serve_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    router: Router,
    timeouts: ConnTimeouts,
) {
    loop {
        let (stream, peer) = accept(&listener).await;
        let acceptor = acceptor.clone();
        let router = router.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => serve_connection(tls, router, timeouts, peer).await,
                Ok(Err(e)) => debug!("TLS handshake with {peer} failed: {e}"),
                Err(_) => debug!("TLS handshake with {peer} timed out"),
            }
        });
    }
}

async fn serve_connection<I>(io: I, router: Router, timeouts: ConnTimeouts, peer: SocketAddr)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (io, activity) = track(io);
    let io = TokioIo::new(io);

    let mut builder = Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(timeouts.header_read);
    let mut conn = pin!(builder.serve_connection(io, TowerToHyperService::new(router)));

    let mut closing = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!("connection {peer}: {e}");
                }
                break;
            }
            _ = until_idle(&activity, timeouts.idle), if !closing => {
                debug!("connection {peer} idle for {:?}, closing", timeouts.idle);
                conn.as_mut().graceful_shutdown();
                closing = true;
            }
        }
    }
}

/// Wraps `io` so every byte read or written counts as activity.
pub(crate) fn track<I>(io: I) -> (Tracked<I>, Arc<Activity>) {
    let activity = Arc::new(Activity::new());
    let tracked = Tracked {
        inner: io,
        activity: activity.clone(),
    };
    (tracked, activity)
}

/// Resolves once nothing has moved for `idle`.
pub(crate) async fn until_idle(activity: &Activity, idle: Duration) {
    loop {
        let quiet = activity.idle_for();
        if quiet >= idle {
            return;
        }
        tokio::time::sleep(idle - quiet).await;
    }
}

/// Time of the last byte moved on a connection.
pub(crate) struct Activity {
    start: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.start.elapsed().as_millis() as u64;
        self.last_ms.store(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.start.elapsed().saturating_sub(last)
    }
}

/// Stream wrapper that records activity on every read and write.
pub(crate) struct Tracked<I> {
    inner: I,
    activity: Arc<Activity>,
}

impl<I: AsyncRead + Unpin> AsyncRead for Tracked<I> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if buf.filled().len() > before {
            self.activity.touch();
        }
        result
    }
}

impl<I: AsyncWrite + Unpin> AsyncWrite for Tracked<I> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write(cx, buf);
        if matches!(result, Poll::Ready(Ok(n)) if n > 0) {
            self.activity.touch();
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
