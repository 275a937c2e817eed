//! Outbound hop: HTTP forward proxy for the enclave's plain-HTTP calls.
//!
//! Requests arrive in absolute form (`GET http://host/path HTTP/1.1`), as
//! sent by a client configured with `reqwest::Proxy::http`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tracing::{debug, warn};

use super::reverse::end_to_end;
use super::{bad_gateway, hop_client, MAX_RELAY_BODY};
use crate::api::ErrorResponse;

pub struct ForwardProxy {
    client: reqwest::Client,
}

impl ForwardProxy {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: hop_client(timeout)?,
        })
    }
}

pub fn router(proxy: Arc<ForwardProxy>) -> Router {
    Router::new()
        .fallback(forward)
        .layer(DefaultBodyLimit::max(MAX_RELAY_BODY))
        .with_state(proxy)
}

async fn forward(
    State(proxy): State<Arc<ForwardProxy>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if uri.scheme_str() != Some("http") || uri.authority().is_none() {
        return (
            StatusCode::BAD_REQUEST,
            axum::Json(ErrorResponse {
                error: "absolute http URI required".into(),
            }),
        )
            .into_response();
    }
    let target = uri.to_string();
    debug!("forwarding {method} {target}");

    let request = proxy
        .client
        .request(method, &target)
        .headers(end_to_end(&headers))
        .body(body);
    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            warn!("outbound call to {target} failed: {e}");
            return bad_gateway("upstream unreachable");
        }
    };

    let status = response.status();
    let headers = end_to_end(response.headers());
    match response.bytes().await {
        Ok(bytes) => (status, headers, bytes).into_response(),
        Err(e) => {
            warn!("reading response from {target}: {e}");
            bad_gateway("reading upstream response")
        }
    }
}
