//! Attest-wrap-respond handlers.
//!
//! Every handler runs the same pipeline: decode the body, do the work
//! ("evaluate"), serialize what was produced, attest it, respond. The first
//! failing stage ends the request with a short `{"error": ...}` body; the
//! detail only goes to the log.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{FromRequest, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info};
use uuid::Uuid;

use super::AppState;
use crate::api::{
    AttestationResponse, AttestedResult, CertRequest, CertResponse, ErrorResponse,
    ExpressionRequest, ExpressionResponse, HttpCallRequest, HttpCallResponse, UserDataRequest,
};
use crate::attestation::{AttestError, AttestOptions, AttestResult};
use crate::capability::builtin::http_get::{read_capped, MAX_RESPONSE_SIZE};
use crate::engine::ExpressionEngine;
use crate::error::{EngineError, TransportError};

/// Longest env excerpt written to the log for a failed evaluation.
const LOGGED_ENV_CHARS: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("decoding request: {0}")]
    Decode(String),

    #[error("executing expression: {0}")]
    Evaluate(#[from] EngineError),

    #[error("calling upstream: {0}")]
    Upstream(#[from] TransportError),

    #[error("encoding result: {0}")]
    Encode(String),

    #[error("attesting: {0}")]
    Attest(#[from] AttestError),

    #[error("attesting: timed out after {0:?}")]
    AttestTimeout(Duration),

    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    #[error("{0} is not available")]
    Unavailable(&'static str),

    #[error("internal error: {0}")]
    Internal(String),
}

impl HandlerError {
    /// Message returned to the caller: the stage plus a detail-free kind.
    pub fn public_message(&self) -> String {
        match self {
            HandlerError::Decode(_) => "decoding request".to_string(),
            HandlerError::Evaluate(e) => format!("executing expression: {}", e.kind()),
            HandlerError::Upstream(TransportError::Status { status, .. }) => {
                format!("calling upstream: status {status}")
            }
            HandlerError::Upstream(_) => "calling upstream".to_string(),
            HandlerError::Encode(_) => "encoding result".to_string(),
            HandlerError::Attest(_) => "attesting".to_string(),
            HandlerError::AttestTimeout(_) => "attesting: deadline exceeded".to_string(),
            HandlerError::RequestTimeout(_) => "deadline exceeded".to_string(),
            HandlerError::Unavailable(what) => format!("{what} is not available"),
            HandlerError::Internal(_) => "internal error".to_string(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            HandlerError::Evaluate(EngineError::DeadlineExceeded(_))
            | HandlerError::AttestTimeout(_)
            | HandlerError::RequestTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            HandlerError::Upstream(_) => StatusCode::BAD_GATEWAY,
            HandlerError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.public_message(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}

/// Request body as raw bytes. Failing to read it, the size limit included,
/// is a decode error like any other.
pub struct RawBody(pub Bytes);

impl<S: Send + Sync> FromRequest<S> for RawBody {
    type Rejection = HandlerError;

    async fn from_request(request: Request, state: &S) -> Result<Self, Self::Rejection> {
        Bytes::from_request(request, state)
            .await
            .map(RawBody)
            .map_err(|e| HandlerError::Decode(e.body_text()))
    }
}

// ── Expression evaluation ───────────────────────────────

pub async fn attest_rhai(
    State(state): State<Arc<AppState>>,
    RawBody(body): RawBody,
) -> Result<Json<ExpressionResponse>, HandlerError> {
    attest_expression(&state, state.rhai.as_ref(), &body).await.map(Json)
}

pub async fn attest_jinja(
    State(state): State<Arc<AppState>>,
    RawBody(body): RawBody,
) -> Result<Json<ExpressionResponse>, HandlerError> {
    attest_expression(&state, state.jinja.as_ref(), &body).await.map(Json)
}

async fn attest_expression(
    state: &AppState,
    engine: &dyn ExpressionEngine,
    body: &[u8],
) -> Result<ExpressionResponse, HandlerError> {
    let request_id = Uuid::new_v4();
    let request: ExpressionRequest = decode(body).inspect_err(|e| {
        error!(%request_id, language = engine.language(), "{e}");
    })?;

    debug!(%request_id, language = engine.language(), expression = %request.expression, "evaluating");
    match evaluate_and_attest(state, engine, &request).await {
        Ok(response) => {
            info!(%request_id, language = engine.language(), "attested expression result");
            Ok(response)
        }
        Err(e) => {
            let env = Value::Object(request.env.clone()).to_string();
            error!(
                %request_id,
                language = engine.language(),
                expression = %request.expression,
                env = %truncate(&env, LOGGED_ENV_CHARS),
                "{e}"
            );
            Err(e)
        }
    }
}

async fn evaluate_and_attest(
    state: &AppState,
    engine: &dyn ExpressionEngine,
    request: &ExpressionRequest,
) -> Result<ExpressionResponse, HandlerError> {
    let output = engine
        .execute(state.eval_timeout, &request.expression, &request.env)
        .await?;

    let result = AttestedResult {
        expression: request.expression.clone(),
        env: Value::Object(request.env.clone()),
        output,
    };
    let canonical = result
        .canonical_bytes()
        .map_err(|e| HandlerError::Encode(e.to_string()))?;

    let attestation = attest(state, AttestOptions::new().with_user_data(canonical)).await?;
    Ok(ExpressionResponse {
        attestation,
        result,
    })
}

// ── Outbound calls ──────────────────────────────────────

/// Performs the call through the relay and attests SHA-256 of the body.
pub async fn attest_http_call(
    State(state): State<Arc<AppState>>,
    RawBody(body): RawBody,
) -> Result<Json<HttpCallResponse>, HandlerError> {
    let request_id = Uuid::new_v4();
    let result = async {
        let request: HttpCallRequest = decode(&body)?;
        let response = outbound_call(&state.http, &request).await?;
        let digest = Sha256::digest(&response).to_vec();
        let attestation = attest(&state, AttestOptions::new().with_user_data(digest)).await?;
        Ok::<_, HandlerError>(HttpCallResponse {
            attestation,
            response,
        })
    }
    .await;
    log_outcome(request_id, "http call", &result);
    result.map(Json)
}

/// Performs the call through the relay and attests the full body.
pub async fn attest_https_call(
    State(state): State<Arc<AppState>>,
    RawBody(body): RawBody,
) -> Result<Json<AttestationResponse>, HandlerError> {
    let request_id = Uuid::new_v4();
    let result = async {
        let request: HttpCallRequest = decode(&body)?;
        let response = outbound_call(&state.http, &request).await?;
        let attestation = attest(&state, AttestOptions::new().with_user_data(response)).await?;
        Ok::<_, HandlerError>(AttestationResponse { attestation })
    }
    .await;
    log_outcome(request_id, "https call", &result);
    result.map(Json)
}

async fn outbound_call(
    client: &reqwest::Client,
    request: &HttpCallRequest,
) -> Result<Vec<u8>, HandlerError> {
    let method = reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes())
        .map_err(|e| HandlerError::Decode(format!("invalid method: {e}")))?;
    let url = url::Url::parse(&request.url)
        .map_err(|e| HandlerError::Decode(format!("invalid url: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(HandlerError::Decode(format!(
            "unsupported scheme '{}'",
            url.scheme()
        )));
    }

    let response = client
        .request(method, url)
        .send()
        .await
        .map_err(TransportError::from)?;
    let status = response.status();
    let body = read_capped(response, MAX_RESPONSE_SIZE).await?;
    if !status.is_success() {
        return Err(TransportError::Status {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&body).into_owned(),
        }
        .into());
    }
    Ok(body)
}

// ── Raw attestations ────────────────────────────────────

pub async fn attest_user_data(
    State(state): State<Arc<AppState>>,
    RawBody(body): RawBody,
) -> Result<Json<AttestationResponse>, HandlerError> {
    let request_id = Uuid::new_v4();
    let result = async {
        let request: UserDataRequest = decode_or_default(&body)?;
        let options = AttestOptions::new()
            .with_user_data(request.userdata)
            .with_nonce(request.nonce);
        let attestation = attest(&state, options).await?;
        Ok::<_, HandlerError>(AttestationResponse { attestation })
    }
    .await;
    log_outcome(request_id, "user data", &result);
    result.map(Json)
}

/// Attests the fingerprint of the enclave's TLS certificate.
pub async fn attest_cert(
    State(state): State<Arc<AppState>>,
    RawBody(body): RawBody,
) -> Result<Json<CertResponse>, HandlerError> {
    let request_id = Uuid::new_v4();
    let result = async {
        let cert = state
            .cert
            .clone()
            .ok_or(HandlerError::Unavailable("TLS certificate"))?;
        let request: CertRequest = decode_or_default(&body)?;
        let options = AttestOptions::new()
            .with_user_data(cert.fingerprint())
            .with_nonce(request.nonce);
        let attestation = attest(&state, options).await?;
        Ok::<_, HandlerError>(CertResponse {
            attestation,
            cert_chain: cert.chain().iter().map(|der| STANDARD.encode(der)).collect(),
        })
    }
    .await;
    log_outcome(request_id, "certificate", &result);
    result.map(Json)
}

// ── Helpers ─────────────────────────────────────────────

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, HandlerError> {
    serde_json::from_slice(body).map_err(|e| HandlerError::Decode(e.to_string()))
}

/// Like [`decode`], but an empty body means "all fields absent".
fn decode_or_default<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, HandlerError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    decode(body)
}

/// Runs the attester on a blocking thread under the configured timeout.
async fn attest(state: &AppState, options: AttestOptions) -> Result<AttestResult, HandlerError> {
    let attester = state.attester.clone();
    let task = tokio::task::spawn_blocking(move || attester.attest(options));
    match tokio::time::timeout(state.attest_timeout, task).await {
        Ok(Ok(result)) => Ok(result?),
        Ok(Err(e)) => Err(HandlerError::Internal(format!("attestation task failed: {e}"))),
        Err(_) => Err(HandlerError::AttestTimeout(state.attest_timeout)),
    }
}

fn log_outcome<T>(request_id: Uuid, kind: &str, result: &Result<T, HandlerError>) {
    match result {
        Ok(_) => info!(%request_id, "attested {kind}"),
        Err(e) => error!(%request_id, "{kind}: {e}"),
    }
}

/// Truncates at a character boundary, marking the cut.
fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_message_hides_detail() {
        let err = HandlerError::Evaluate(EngineError::Compile("secret_var not found".into()));
        assert_eq!(err.public_message(), "executing expression: compile error");
        assert!(err.to_string().contains("secret_var"));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_attest_error_message() {
        let err = HandlerError::Attest(AttestError::Generate("device busy".into()));
        assert_eq!(err.public_message(), "attesting");
        assert!(err.status_code().is_server_error());
    }

    #[test]
    fn test_deadline_maps_to_gateway_timeout() {
        let err = HandlerError::Evaluate(EngineError::DeadlineExceeded(Duration::from_secs(1)));
        assert_eq!(err.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(err.public_message(), "executing expression: deadline exceeded");
    }

    #[test]
    fn test_every_status_is_server_error() {
        let errors = [
            HandlerError::Decode("x".into()),
            HandlerError::Upstream(TransportError::Connection("refused".into())),
            HandlerError::Encode("x".into()),
            HandlerError::AttestTimeout(Duration::from_secs(1)),
            HandlerError::RequestTimeout(Duration::from_secs(1)),
            HandlerError::Unavailable("TLS certificate"),
            HandlerError::Internal("x".into()),
        ];
        for err in errors {
            assert!(err.status_code().is_server_error(), "{err}");
        }
    }

    #[test]
    fn test_decode_or_default_accepts_empty_body() {
        let req: UserDataRequest = decode_or_default(b"").unwrap();
        assert_eq!(req, UserDataRequest::default());
        let req: UserDataRequest = decode_or_default(b"  \n").unwrap();
        assert_eq!(req, UserDataRequest::default());
        assert!(decode_or_default::<UserDataRequest>(b"{not json").is_err());
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdef", 3), "abc...");
        assert_eq!(truncate("ééééé", 2), "éé...");
    }
}
