//! Caller-side client for the attested handlers.
//!
//! Requests go to the relay's public listeners. Nothing the enclave returns
//! is trusted until its attestation verifies; [`Client::establish_attested_tls`]
//! applies the same rule to the enclave's TLS certificate.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::api::{
    AttestationResponse, CertRequest, CertResponse, ErrorResponse, ExpressionRequest,
    ExpressionResponse, HttpCallRequest, HttpCallResponse, UserDataRequest, ATTEST_CERT_PATH,
    ATTEST_HTTPS_CALL_PATH, ATTEST_HTTP_CALL_PATH, ATTEST_JINJA_PATH, ATTEST_RHAI_PATH,
    ATTEST_USER_DATA_PATH,
};
use crate::attestation::{AttestError, VerifiedResult, Verifier, VerifyOptions};
use crate::error::TransportError;
use crate::server::tls::fingerprint;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("verifying attestation: {0}")]
    Attestation(#[from] AttestError),

    /// The attestation verified but binds different bytes than the response carries.
    #[error("attested data does not match {0}")]
    Mismatch(&'static str),

    #[error("certificate chain: {0}")]
    Certificate(String),
}

pub struct Client {
    host: String,
    http: reqwest::Client,
    timeout: Duration,
}

impl Client {
    /// `host` is a base URL such as `http://127.0.0.1:8080`.
    pub fn new(host: impl Into<String>) -> Result<Self, TransportError> {
        Self::with_timeout(host, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(host: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            host: host.into().trim_end_matches('/').to_string(),
            http,
            timeout,
        })
    }

    /// Trusts exactly the given DER certificates for TLS, dropping the system roots.
    pub fn add_cert_chain(&mut self, chain_der: &[Vec<u8>]) -> Result<(), ClientError> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .tls_built_in_root_certs(false);
        for (i, der) in chain_der.iter().enumerate() {
            let cert = reqwest::Certificate::from_der(der)
                .map_err(|e| ClientError::Certificate(format!("parsing certificate {i}: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        self.http = builder.build().map_err(TransportError::from)?;
        Ok(())
    }

    pub async fn attest_rhai(
        &self,
        expression: &str,
        env: Map<String, Value>,
    ) -> Result<ExpressionResponse, TransportError> {
        let request = ExpressionRequest {
            expression: expression.to_string(),
            env,
        };
        self.post(ATTEST_RHAI_PATH, &request).await
    }

    pub async fn attest_jinja(
        &self,
        expression: &str,
        env: Map<String, Value>,
    ) -> Result<ExpressionResponse, TransportError> {
        let request = ExpressionRequest {
            expression: expression.to_string(),
            env,
        };
        self.post(ATTEST_JINJA_PATH, &request).await
    }

    pub async fn attest_http_call(
        &self,
        method: &str,
        url: &str,
    ) -> Result<HttpCallResponse, TransportError> {
        let request = HttpCallRequest {
            method: method.to_string(),
            url: url.to_string(),
        };
        self.post(ATTEST_HTTP_CALL_PATH, &request).await
    }

    /// Must be sent over a client set up by [`Client::establish_attested_tls`].
    pub async fn attest_https_call(
        &self,
        method: &str,
        url: &str,
    ) -> Result<AttestationResponse, TransportError> {
        let request = HttpCallRequest {
            method: method.to_string(),
            url: url.to_string(),
        };
        self.post(ATTEST_HTTPS_CALL_PATH, &request).await
    }

    pub async fn attest_user_data(
        &self,
        nonce: &[u8],
        user_data: &[u8],
    ) -> Result<AttestationResponse, TransportError> {
        let request = UserDataRequest {
            nonce: nonce.to_vec(),
            userdata: user_data.to_vec(),
        };
        self.post(ATTEST_USER_DATA_PATH, &request).await
    }

    pub async fn attest_cert_chain(&self, nonce: &[u8]) -> Result<CertResponse, TransportError> {
        let request = CertRequest {
            nonce: nonce.to_vec(),
        };
        self.post(ATTEST_CERT_PATH, &request).await
    }

    /// Bootstraps TLS trust through attestation.
    ///
    /// Fetches the enclave's certificate chain over this client, checks that
    /// the attestation verifies (with a fresh nonce) and binds the leaf's
    /// fingerprint, then returns a client for `tls_host` trusting only that chain.
    pub async fn establish_attested_tls(
        &self,
        tls_host: &str,
        verifier: Arc<dyn Verifier>,
        options: VerifyOptions,
    ) -> Result<Client, ClientError> {
        let nonce: [u8; 16] = rand::random();
        let response = self.attest_cert_chain(&nonce).await?;

        let chain = response
            .cert_chain
            .iter()
            .map(|b64| STANDARD.decode(b64))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ClientError::Certificate(format!("decoding chain: {e}")))?;
        let leaf = chain
            .first()
            .ok_or_else(|| ClientError::Certificate("empty chain".into()))?;

        let attestation = response.attestation;
        let verified =
            verify_blocking(verifier, attestation, options.with_nonce(nonce.to_vec())).await?;
        if verified.user_data != fingerprint(leaf) {
            return Err(ClientError::Mismatch("certificate fingerprint"));
        }
        info!("enclave certificate verified by attestation");

        let mut tls = Client::with_timeout(tls_host, self.timeout)?;
        tls.add_cert_chain(&chain)?;
        Ok(tls)
    }

    async fn post<Req, Resp>(&self, path: &str, request: &Req) -> Result<Resp, TransportError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = format!("{}{path}", self.host);
        debug!("POST {url}");
        let body = serde_json::to_vec(request).map_err(|e| TransportError::Encode(e.to_string()))?;
        let response = self
            .http
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(|e| self.transport_error(e))?;
        if !status.is_success() {
            let message = serde_json::from_slice::<ErrorResponse>(&bytes)
                .map(|e| e.error)
                .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).into_owned());
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: message,
            });
        }
        serde_json::from_slice(&bytes).map_err(|e| TransportError::Decode(e.to_string()))
    }

    fn transport_error(&self, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else {
            e.into()
        }
    }
}

/// Verifies an expression response: the report must verify and bind exactly
/// the canonical bytes of the record returned next to it.
pub fn verify_expression_result(
    verifier: &dyn Verifier,
    response: &ExpressionResponse,
    options: VerifyOptions,
) -> Result<VerifiedResult, ClientError> {
    let verified = verifier.verify(&response.attestation, options)?;
    let canonical = response
        .result
        .canonical_bytes()
        .map_err(|e| TransportError::Decode(e.to_string()))?;
    if verified.user_data != canonical {
        return Err(ClientError::Mismatch("expression result"));
    }
    Ok(verified)
}

async fn verify_blocking(
    verifier: Arc<dyn Verifier>,
    attestation: crate::attestation::AttestResult,
    options: VerifyOptions,
) -> Result<VerifiedResult, ClientError> {
    tokio::task::spawn_blocking(move || verifier.verify(&attestation, options))
        .await
        .map_err(|e| ClientError::Certificate(format!("verification task failed: {e}")))?
        .map_err(ClientError::from)
}
