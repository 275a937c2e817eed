//! Message socket between the relay and the enclave.
//!
//! Frames are a `u32` big-endian length followed by the payload. The enclave
//! answers every frame with one frame holding the JSON of an
//! [`AttestationResponse`] (or an [`ErrorResponse`]) over the payload.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::bad_gateway;
use crate::api::{AttestationResponse, ErrorResponse};
use crate::attestation::{AttestOptions, Attester};
use crate::server::conn::accept;

pub const MAX_FRAME: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("socket I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("peer closed the connection")]
    Closed,
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), SocketError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME {
        return Err(SocketError::FrameTooLarge(payload.len()));
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, SocketError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(SocketError::Closed),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME {
        return Err(SocketError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

// ── Client side ─────────────────────────────────────────

/// Connection to a message socket, opened lazily on the first exchange.
pub struct SocketClient {
    dest: String,
    conn: Option<TcpStream>,
}

impl SocketClient {
    pub fn new(dest: impl Into<String>) -> Self {
        Self {
            dest: dest.into(),
            conn: None,
        }
    }

    /// Sends one frame and reads the reply on the same connection.
    ///
    /// The stream is handed back for reuse only after a complete exchange,
    /// so a caller that gives up midway never leaves a reply queued for the
    /// next one. Connecting and writing are each bounded by `send_timeout`,
    /// the reply by `receive_timeout`.
    pub async fn exchange(
        &mut self,
        payload: &[u8],
        send_timeout: Duration,
        receive_timeout: Duration,
    ) -> Result<Vec<u8>, SocketError> {
        let mut conn = match self.conn.take() {
            Some(conn) => conn,
            None => {
                debug!("connecting to message socket {}", self.dest);
                let connect =
                    async { TcpStream::connect(&self.dest).await.map_err(SocketError::from) };
                with_timeout(send_timeout, connect).await?
            }
        };
        with_timeout(send_timeout, write_frame(&mut conn, payload)).await?;
        let reply = with_timeout(receive_timeout, read_frame(&mut conn)).await?;
        self.conn = Some(conn);
        Ok(reply)
    }
}

async fn with_timeout<T>(
    timeout: Duration,
    fut: impl std::future::Future<Output = Result<T, SocketError>>,
) -> Result<T, SocketError> {
    tokio::time::timeout(timeout, fut)
        .await
        .unwrap_or(Err(SocketError::Timeout(timeout)))
}

// ── HTTP bridge (relay side) ────────────────────────────

/// Turns an HTTP POST into one socket exchange with the enclave.
pub struct SocketBridge {
    client: Mutex<SocketClient>,
    send_timeout: Duration,
    receive_timeout: Duration,
}

impl SocketBridge {
    pub fn new(dest: &str, send_timeout: Duration, receive_timeout: Duration) -> Self {
        Self {
            client: Mutex::new(SocketClient::new(dest)),
            send_timeout,
            receive_timeout,
        }
    }

    /// One request/reply pair; concurrent callers queue on the connection.
    pub async fn exchange(&self, payload: &[u8]) -> Result<Vec<u8>, SocketError> {
        let mut client = self.client.lock().await;
        client
            .exchange(payload, self.send_timeout, self.receive_timeout)
            .await
    }
}

pub fn bridge_router(bridge: Arc<SocketBridge>) -> Router {
    Router::new()
        .fallback(bridge_request)
        .layer(DefaultBodyLimit::max(MAX_FRAME))
        .with_state(bridge)
}

async fn bridge_request(State(bridge): State<Arc<SocketBridge>>, body: Bytes) -> Response {
    let reply = match bridge.exchange(&body).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!("message socket exchange failed: {e}");
            return bad_gateway("enclave socket unavailable");
        }
    };
    if let Ok(response) = serde_json::from_slice::<AttestationResponse>(&reply) {
        return Json(response).into_response();
    }
    match serde_json::from_slice::<ErrorResponse>(&reply) {
        Ok(error) => (StatusCode::INTERNAL_SERVER_ERROR, Json(error)).into_response(),
        Err(e) => {
            warn!("undecodable reply on message socket: {e}");
            bad_gateway("undecodable enclave reply")
        }
    }
}

// ── Enclave side ────────────────────────────────────────

/// Attests every payload received on `listener` and replies on the same connection.
pub async fn serve_attester(
    listener: TcpListener,
    attester: Arc<dyn Attester>,
    attest_timeout: Duration,
) -> anyhow::Result<()> {
    info!("message socket listening on {}", listener.local_addr()?);
    loop {
        let (stream, peer) = accept(&listener).await;
        let attester = attester.clone();
        tokio::spawn(async move {
            match answer(stream, attester, attest_timeout).await {
                Ok(()) | Err(SocketError::Closed) => debug!("message socket {peer} closed"),
                Err(e) => warn!("message socket {peer}: {e}"),
            }
        });
    }
}

async fn answer(
    mut stream: TcpStream,
    attester: Arc<dyn Attester>,
    attest_timeout: Duration,
) -> Result<(), SocketError> {
    loop {
        let payload = read_frame(&mut stream).await?;
        let reply = attest_payload(attester.clone(), payload, attest_timeout).await;
        write_frame(&mut stream, &reply).await?;
    }
}

async fn attest_payload(
    attester: Arc<dyn Attester>,
    payload: Vec<u8>,
    timeout: Duration,
) -> Vec<u8> {
    let job = tokio::task::spawn_blocking(move || {
        attester.attest(AttestOptions::new().with_user_data(payload))
    });
    let reply = match tokio::time::timeout(timeout, job).await {
        Ok(Ok(Ok(attestation))) => serde_json::to_vec(&AttestationResponse { attestation }),
        outcome => {
            match outcome {
                Ok(Ok(Err(e))) => warn!("attesting socket payload: {e}"),
                Ok(Err(e)) => warn!("attestation task failed: {e}"),
                _ => warn!("attesting socket payload timed out after {timeout:?}"),
            }
            serde_json::to_vec(&ErrorResponse {
                error: "attesting".into(),
            })
        }
    };
    reply.unwrap_or_else(|_| br#"{"error":"encoding result"}"#.to_vec())
}
