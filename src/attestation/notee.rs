//! `notee` platform: reports for running outside any isolated environment.
//!
//! A report is JSON carrying the bound bytes plus a SHA-256 digest of its
//! own body. The digest catches corruption in transit; it is not a
//! signature, and anybody can forge a `notee` report. Reports are therefore
//! always flagged `debug` and only verify when debug reports are allowed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{
    base64_bytes, AttestError, AttestOptions, AttestResult, Attester, VerifiedResult, Verifier,
    VerifyOptions,
};

const PLATFORM: &str = "notee";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReportBody {
    platform: String,
    measurement: String,
    #[serde(with = "base64_bytes")]
    user_data: Vec<u8>,
    #[serde(with = "base64_bytes")]
    nonce: Vec<u8>,
    debug: bool,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Report {
    body: ReportBody,
    digest: String,
}

fn digest(body: &ReportBody) -> Result<String, serde_json::Error> {
    Ok(hex::encode(Sha256::digest(serde_json::to_vec(body)?)))
}

pub struct NoTeeAttester {
    measurement: String,
}

impl NoTeeAttester {
    pub fn new(measurement: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
        }
    }
}

impl Attester for NoTeeAttester {
    fn attest(&self, options: AttestOptions) -> Result<AttestResult, AttestError> {
        let body = ReportBody {
            platform: PLATFORM.to_string(),
            measurement: self.measurement.clone(),
            user_data: options.user_data,
            nonce: options.nonce,
            debug: true,
            timestamp: Utc::now(),
        };
        let digest = digest(&body).map_err(|e| AttestError::Generate(e.to_string()))?;
        let report = serde_json::to_vec(&Report { body, digest })
            .map_err(|e| AttestError::Generate(e.to_string()))?;
        Ok(AttestResult { report })
    }
}

pub struct NoTeeVerifier;

impl Verifier for NoTeeVerifier {
    fn verify(
        &self,
        attestation: &AttestResult,
        options: VerifyOptions,
    ) -> Result<VerifiedResult, AttestError> {
        let report: Report = serde_json::from_slice(&attestation.report)
            .map_err(|e| AttestError::Malformed(e.to_string()))?;
        let body = report.body;

        if body.platform != PLATFORM {
            return Err(AttestError::Rejected(format!(
                "report is for platform '{}'",
                body.platform
            )));
        }
        let expected = digest(&body).map_err(|e| AttestError::Malformed(e.to_string()))?;
        if expected != report.digest {
            return Err(AttestError::Rejected("digest mismatch".into()));
        }
        if body.debug && !options.debug {
            return Err(AttestError::Rejected("debug-mode report not allowed".into()));
        }
        if let Some(measurement) = &options.measurement {
            if *measurement != body.measurement {
                return Err(AttestError::Rejected(format!(
                    "measurement '{}' does not match expected '{measurement}'",
                    body.measurement
                )));
            }
        }
        if let Some(nonce) = &options.nonce {
            if *nonce != body.nonce {
                return Err(AttestError::Rejected("nonce mismatch".into()));
            }
        }

        Ok(VerifiedResult {
            user_data: body.user_data,
            nonce: body.nonce,
            measurement: body.measurement,
            debug: body.debug,
            timestamp: body.timestamp,
        })
    }
}
