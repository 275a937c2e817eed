//! Raw TCP hops that never see plaintext.
//!
//! `passthrough` carries the inbound TLS listener to the enclave, where TLS
//! terminates. `connect_proxy` answers `CONNECT host:port` so the enclave's
//! outbound HTTPS stays end-to-end encrypted.

use std::time::Duration;

use anyhow::Result;
use tokio::io::{copy_bidirectional, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::server::conn::{accept, track, until_idle};

/// Upper bound on a CONNECT request head.
const MAX_HEAD: usize = 8 * 1024;

/// Bounds for one raw hop: opening it, and how long it may sit silent.
#[derive(Debug, Clone, Copy)]
pub struct HopTimeouts {
    pub dial: Duration,
    pub idle: Duration,
}

/// Pipes every accepted connection to `upstream`, byte for byte.
pub async fn passthrough(
    listener: TcpListener,
    upstream: String,
    timeouts: HopTimeouts,
) -> Result<()> {
    info!(
        "TLS passthrough listening on {} -> {upstream}",
        listener.local_addr()?
    );
    loop {
        let (inbound, peer) = accept(&listener).await;
        let upstream = upstream.clone();
        tokio::spawn(async move {
            let outbound = match dial(&upstream, timeouts.dial).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("passthrough for {peer}: {e}");
                    return;
                }
            };
            pipe(inbound, outbound, &upstream, timeouts.idle).await;
        });
    }
}

/// Serves HTTP `CONNECT` tunnels.
pub async fn connect_proxy(listener: TcpListener, timeouts: HopTimeouts) -> Result<()> {
    info!("CONNECT proxy listening on {}", listener.local_addr()?);
    loop {
        let (inbound, peer) = accept(&listener).await;
        tokio::spawn(async move {
            if let Err(e) = tunnel(inbound, timeouts).await {
                debug!("CONNECT from {peer}: {e}");
            }
        });
    }
}

async fn tunnel(mut inbound: TcpStream, timeouts: HopTimeouts) -> Result<()> {
    let timeout = timeouts.dial;
    let head = match tokio::time::timeout(timeout, read_head(&mut inbound)).await {
        Ok(head) => head?,
        Err(_) => anyhow::bail!("timed out reading request head"),
    };
    let target = match parse_connect(&head) {
        Some(target) => target,
        None => {
            inbound
                .write_all(b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\n\r\n")
                .await?;
            anyhow::bail!("not a CONNECT request");
        }
    };

    let outbound = match dial(&target, timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            inbound
                .write_all(b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n")
                .await?;
            return Err(e);
        }
    };
    inbound
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    debug!("tunnel open to {target}");
    pipe(inbound, outbound, &target, timeouts.idle).await;
    Ok(())
}

/// Reads up to and including the blank line ending the request head.
async fn read_head(stream: &mut TcpStream) -> Result<String> {
    let mut head = Vec::with_capacity(512);
    let mut byte = [0u8; 1];
    // Byte-wise so nothing past the head is consumed before the tunnel opens.
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_HEAD {
            anyhow::bail!("request head exceeds {MAX_HEAD} bytes");
        }
        if stream.read(&mut byte).await? == 0 {
            anyhow::bail!("connection closed before request head ended");
        }
        head.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

/// `host:port` of a `CONNECT host:port HTTP/1.x` request line.
fn parse_connect(head: &str) -> Option<String> {
    let line = head.lines().next()?;
    let mut parts = line.split_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    let version = parts.next()?;
    if !method.eq_ignore_ascii_case("CONNECT") || !version.starts_with("HTTP/1.") {
        return None;
    }
    let (host, port) = target.rsplit_once(':')?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return None;
    }
    Some(target.to_string())
}

async fn dial(addr: &str, timeout: Duration) -> Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => anyhow::bail!("connecting to {addr}: {e}"),
        Err(_) => anyhow::bail!("connecting to {addr}: timed out after {timeout:?}"),
    }
}

/// Copies both ways until either side closes or nothing moves for `idle`.
async fn pipe(a: TcpStream, mut b: TcpStream, label: &str, idle: Duration) {
    let (mut a, activity) = track(a);
    tokio::select! {
        result = copy_bidirectional(&mut a, &mut b) => match result {
            Ok((up, down)) => debug!("{label}: closed after {up}B up, {down}B down"),
            Err(e) => debug!("{label}: {e}"),
        },
        _ = until_idle(&activity, idle) => debug!("{label}: idle for {idle:?}, closing"),
    }
}
