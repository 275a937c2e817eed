//! Untrusted relay between the network and the enclave.
//!
//! The enclave has no network of its own. Inbound traffic reaches it through
//! `reverse` (plain HTTP), `tunnel::passthrough` (TLS, terminated inside the
//! enclave) and `socket` (length-framed messages). Outbound traffic leaves
//! through `forward` (HTTP forward proxy) and `tunnel::connect_proxy` (CONNECT
//! tunnels for HTTPS). Every hop has its own timeout.

pub mod forward;
pub mod reverse;
pub mod socket;
pub mod tunnel;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::Json;
use axum::response::{IntoResponse, Response};
use futures::future::{try_join_all, BoxFuture, FutureExt};
use tokio::net::TcpListener;
use tracing::info;

use crate::api::ErrorResponse;
use crate::capability::builtin::http_get::default_client_builder;
use crate::config::{EnclaveConfig, ProxyConfig, ServerConfig};
use crate::server::conn::{self, ConnTimeouts};

/// Largest body a relay hop buffers.
pub const MAX_RELAY_BODY: usize = 16 * 1024 * 1024;

/// Headers that describe one connection and must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

pub(crate) fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Client the enclave uses for every outbound call: plain HTTP goes to the
/// forward proxy, HTTPS is tunnelled through the CONNECT proxy.
pub fn proxied_client(out_addr: &str, out_addr_tls: &str) -> Result<reqwest::Client> {
    let http = reqwest::Proxy::http(format!("http://{out_addr}"))
        .with_context(|| format!("invalid forward proxy address '{out_addr}'"))?;
    let https = reqwest::Proxy::https(format!("http://{out_addr_tls}"))
        .with_context(|| format!("invalid tunnel proxy address '{out_addr_tls}'"))?;
    default_client_builder()
        .proxy(http)
        .proxy(https)
        .build()
        .context("building proxied client")
}

/// Client a relay hop uses to reach its next hop directly.
pub(crate) fn hop_client(timeout: std::time::Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .no_proxy()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .context("building relay client")
}

/// `502` with the relay's error body.
pub(crate) fn bad_gateway(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

/// Binds every relay listener and runs them until one fails.
pub async fn run(
    proxy: &ProxyConfig,
    enclave: &EnclaveConfig,
    server: &ServerConfig,
) -> Result<()> {
    let hop = proxy.hop_timeout();
    let timeouts = ConnTimeouts::from_config(server);
    let raw_hop = tunnel::HopTimeouts {
        dial: hop,
        idle: timeouts.idle,
    };

    let inbound = bind(&proxy.in_addr).await?;
    let inbound_tls = bind(&proxy.in_addr_tls).await?;
    let outbound = bind(&proxy.out_addr).await?;
    let outbound_tls = bind(&proxy.out_addr_tls).await?;
    let socket_bridge = bind(&proxy.socket_addr).await?;

    let reverse = reverse::router(Arc::new(reverse::ReverseProxy::new(&enclave.addr, hop)?));
    let forward = forward::router(Arc::new(forward::ForwardProxy::new(hop)?));
    let bridge = socket::bridge_router(Arc::new(socket::SocketBridge::new(
        &enclave.socket_addr,
        hop,
        hop,
    )));

    info!(
        "relay up: in={} in_tls={} out={} out_tls={} socket={}",
        proxy.in_addr, proxy.in_addr_tls, proxy.out_addr, proxy.out_addr_tls, proxy.socket_addr
    );

    let listeners: Vec<BoxFuture<'static, Result<()>>> = vec![
        serve(inbound, reverse, timeouts).boxed(),
        tunnel::passthrough(inbound_tls, enclave.addr_tls.clone(), raw_hop).boxed(),
        serve(outbound, forward, timeouts).boxed(),
        tunnel::connect_proxy(outbound_tls, raw_hop).boxed(),
        serve(socket_bridge, bridge, timeouts).boxed(),
    ];
    try_join_all(listeners).await?;
    Ok(())
}

async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))
}

async fn serve(
    listener: TcpListener,
    router: axum::Router,
    timeouts: ConnTimeouts,
) -> Result<()> {
    conn::serve(listener, router, timeouts).await;
    Ok(())
}
