//! Error taxonomy shared by the engines, handlers, client and relay.
//!
//! Every stage fails closed: the first error short-circuits the rest of the
//! pipeline and is reported as a single short message. Details go to the log.

use std::time::Duration;

/// A whitelisted function's own failure.
///
/// Capability errors are data inside the evaluators: each engine converts
/// them into its native error value so they surface as [`EngineError::Execution`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CapabilityError {
    /// The caller passed the wrong number or shape of arguments.
    #[error("invalid arguments: {0}")]
    InvalidArgument(String),

    /// The function ran and failed (upstream status, decode failure, ...).
    #[error("{0}")]
    Failed(String),

    /// The evaluation that made this call already ran past its deadline.
    #[error("evaluation abandoned after deadline")]
    Abandoned,

    /// No capability is registered under this name.
    #[error("unknown capability: {0}")]
    Unknown(String),
}

/// Failure of [`crate::engine::ExpressionEngine::execute`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    /// Syntax error, unknown identifier, arity overflow. Never invokes a capability.
    #[error("compile error: {0}")]
    Compile(String),

    /// Runtime failure of the expression, including capability errors.
    #[error("execution error: {0}")]
    Execution(String),

    #[error("deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),
}

impl EngineError {
    /// Short, detail-free label used in user-visible responses.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Compile(_) => "compile error",
            EngineError::Execution(_) => "execution error",
            EngineError::DeadlineExceeded(_) => "deadline exceeded",
        }
    }
}

/// Upstream or connection failure between two processes.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The peer answered with a non-success status.
    #[error("non-success response: {status}")]
    Status { status: u16, body: String },

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The peer answered but the payload could not be decoded.
    #[error("decoding response: {0}")]
    Decode(String),

    #[error("encoding request: {0}")]
    Encode(String),

    #[error("response body exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Connection(format!("timeout: {e}"))
        } else if e.is_decode() {
            TransportError::Decode(e.to_string())
        } else {
            TransportError::Connection(e.to_string())
        }
    }
}
