//! Attestation seam.
//!
//! `Attester` binds bytes (user data, nonce) into a report signed by the
//! isolated environment; `Verifier` checks such a report and hands the bound
//! bytes back. Both are synchronous and may be slow, so callers on the async
//! side run them through `spawn_blocking`.

pub mod notee;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use notee::{NoTeeAttester, NoTeeVerifier};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AttestError {
    #[error("unsupported attestation platform '{0}'")]
    UnsupportedPlatform(String),

    #[error("generating report: {0}")]
    Generate(String),

    #[error("malformed report: {0}")]
    Malformed(String),

    /// The report parsed but does not satisfy the verification options.
    #[error("verification failed: {0}")]
    Rejected(String),
}

/// What to bind into a new report.
#[derive(Debug, Clone, Default)]
pub struct AttestOptions {
    pub user_data: Vec<u8>,
    pub nonce: Vec<u8>,
}

impl AttestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user_data(mut self, user_data: impl Into<Vec<u8>>) -> Self {
        self.user_data = user_data.into();
        self
    }

    pub fn with_nonce(mut self, nonce: impl Into<Vec<u8>>) -> Self {
        self.nonce = nonce.into();
        self
    }
}

/// Constraints a report must satisfy to verify.
#[derive(Debug, Clone, Default)]
pub struct VerifyOptions {
    /// Expected identity measurement; any measurement is accepted when `None`.
    pub measurement: Option<String>,
    /// Expected nonce; not checked when `None`.
    pub nonce: Option<Vec<u8>>,
    /// Accept reports produced in debug mode.
    pub debug: bool,
}

impl VerifyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_measurement(mut self, measurement: impl Into<String>) -> Self {
        self.measurement = Some(measurement.into());
        self
    }

    pub fn with_nonce(mut self, nonce: impl Into<Vec<u8>>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

/// An opaque report as returned to callers (`{"report": "<base64>"}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttestResult {
    #[serde(with = "base64_bytes")]
    pub report: Vec<u8>,
}

/// Contents of a report that passed verification.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedResult {
    pub user_data: Vec<u8>,
    pub nonce: Vec<u8>,
    pub measurement: String,
    pub debug: bool,
    pub timestamp: DateTime<Utc>,
}

pub trait Attester: Send + Sync {
    fn attest(&self, options: AttestOptions) -> Result<AttestResult, AttestError>;
}

pub trait Verifier: Send + Sync {
    fn verify(
        &self,
        attestation: &AttestResult,
        options: VerifyOptions,
    ) -> Result<VerifiedResult, AttestError>;
}

// ── Platforms ───────────────────────────────────────────

/// Attestation backend selected by `[attestation] platform`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// No isolated environment: reports are integrity-checked but unsigned.
    NoTee,
}

impl Platform {
    pub fn attester(&self, measurement: &str) -> Arc<dyn Attester> {
        match self {
            Platform::NoTee => Arc::new(NoTeeAttester::new(measurement)),
        }
    }

    pub fn verifier(&self) -> Arc<dyn Verifier> {
        match self {
            Platform::NoTee => Arc::new(NoTeeVerifier),
        }
    }
}

impl FromStr for Platform {
    type Err = AttestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "notee" | "none" => Ok(Platform::NoTee),
            other => Err(AttestError::UnsupportedPlatform(other.to_string())),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::NoTee => f.write_str("notee"),
        }
    }
}

/// Serde adapter storing bytes as standard base64 strings.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
