//! Wire types shared by the enclave handlers and the client.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::attestation::{base64_bytes, AttestResult};

pub const ATTEST_RHAI_PATH: &str = "/attest-rhai";
pub const ATTEST_JINJA_PATH: &str = "/attest-jinja";
pub const ATTEST_HTTP_CALL_PATH: &str = "/attest-http-call";
pub const ATTEST_HTTPS_CALL_PATH: &str = "/attest-https-call";
pub const ATTEST_USER_DATA_PATH: &str = "/attest-user-data";
pub const ATTEST_CERT_PATH: &str = "/attest-cert";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpressionRequest {
    pub expression: String,
    #[serde(default)]
    pub env: Map<String, Value>,
}

/// The record that gets attested.
///
/// Its canonical form is `serde_json::to_vec` of this struct: fields in
/// declaration order, object keys sorted, no whitespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttestedResult {
    pub expression: String,
    pub env: Value,
    pub output: Value,
}

impl AttestedResult {
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpressionResponse {
    pub attestation: AttestResult,
    pub result: AttestedResult,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpCallRequest {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
}

/// `/attest-http-call` result: the report binds SHA-256 of `response`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpCallResponse {
    pub attestation: AttestResult,
    #[serde(with = "base64_bytes")]
    pub response: Vec<u8>,
}

/// Response carrying only a report (the bound bytes travel inside it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationResponse {
    pub attestation: AttestResult,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserDataRequest {
    #[serde(default, with = "base64_bytes")]
    pub nonce: Vec<u8>,
    #[serde(default, with = "base64_bytes")]
    pub userdata: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CertRequest {
    #[serde(default, with = "base64_bytes")]
    pub nonce: Vec<u8>,
}

/// `/attest-cert` result: the report binds the SHA-256 fingerprint of the
/// leaf certificate (`cert_chain[0]`, DER, base64).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertResponse {
    pub attestation: AttestResult,
    pub cert_chain: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
