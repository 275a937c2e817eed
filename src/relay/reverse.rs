//! Inbound hop: public HTTP listener forwarding every request to the
//! enclave's handler listener.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, Method, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tracing::{debug, warn};

use super::{bad_gateway, hop_client, is_hop_by_hop, MAX_RELAY_BODY};

pub struct ReverseProxy {
    upstream: String,
    client: reqwest::Client,
}

impl ReverseProxy {
    /// `upstream` is the enclave's `host:port`.
    pub fn new(upstream: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            upstream: format!("http://{upstream}"),
            client: hop_client(timeout)?,
        })
    }
}

pub fn router(proxy: Arc<ReverseProxy>) -> Router {
    Router::new()
        .fallback(relay)
        .layer(DefaultBodyLimit::max(MAX_RELAY_BODY))
        .with_state(proxy)
}

async fn relay(
    State(proxy): State<Arc<ReverseProxy>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let target = format!("{}{path}", proxy.upstream);
    debug!("relaying {method} {path} to enclave");

    let request = proxy
        .client
        .request(method, &target)
        .headers(end_to_end(&headers))
        .body(body);

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            warn!("enclave unreachable at {target}: {e}");
            return bad_gateway("enclave unreachable");
        }
    };

    let status = response.status();
    let headers = end_to_end(response.headers());
    match response.bytes().await {
        Ok(bytes) => (status, headers, bytes).into_response(),
        Err(e) => {
            warn!("reading enclave response from {target}: {e}");
            bad_gateway("reading enclave response")
        }
    }
}

/// Copy of `headers` without the hop-by-hop ones.
pub(crate) fn end_to_end(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter().filter(|(n, _)| !is_hop_by_hop(n.as_str())) {
        out.append(name.clone(), value.clone());
    }
    out
}
