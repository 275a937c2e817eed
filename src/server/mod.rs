//! Enclave HTTP surface: the attested handlers on a plain listener and the
//! HTTPS-call handler on a TLS listener terminated inside the enclave.

pub mod conn;
pub mod handlers;
pub mod tls;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use tokio::net::TcpListener;
use tokio_native_tls::TlsAcceptor;
use tracing::info;

use crate::api::{
    ATTEST_CERT_PATH, ATTEST_HTTPS_CALL_PATH, ATTEST_HTTP_CALL_PATH, ATTEST_JINJA_PATH,
    ATTEST_RHAI_PATH, ATTEST_USER_DATA_PATH,
};
use crate::attestation::Attester;
use crate::capability::CapabilityRegistry;
use crate::config::ServerConfig;
use crate::engine::jinja::JinjaEngine;
use crate::engine::rhai::RhaiEngine;
use crate::engine::ExpressionEngine;
use handlers::HandlerError;
use conn::ConnTimeouts;
use tls::CertBundle;

/// Shared, read-only state of every handler.
pub struct AppState {
    pub rhai: Arc<dyn ExpressionEngine>,
    pub jinja: Arc<dyn ExpressionEngine>,
    pub attester: Arc<dyn Attester>,
    /// Client for outbound calls (goes through the relay inside the enclave)
    pub http: reqwest::Client,
    /// Certificate served by the TLS listener, if one runs
    pub cert: Option<Arc<CertBundle>>,
    pub eval_timeout: Duration,
    pub attest_timeout: Duration,
}

impl AppState {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        attester: Arc<dyn Attester>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            rhai: Arc::new(RhaiEngine::new(registry.clone())),
            jinja: Arc::new(JinjaEngine::new(registry)),
            attester,
            http,
            cert: None,
            eval_timeout: Duration::from_secs(10),
            attest_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_cert(mut self, cert: Arc<CertBundle>) -> Self {
        self.cert = Some(cert);
        self
    }

    pub fn with_timeouts(mut self, eval: Duration, attest: Duration) -> Self {
        self.eval_timeout = eval;
        self.attest_timeout = attest;
        self
    }
}

/// Handlers served on the plain listener.
pub fn router(state: Arc<AppState>, limits: &ServerConfig) -> Router {
    let routes = Router::new()
        .route(ATTEST_RHAI_PATH, post(handlers::attest_rhai))
        .route(ATTEST_JINJA_PATH, post(handlers::attest_jinja))
        .route(ATTEST_HTTP_CALL_PATH, post(handlers::attest_http_call))
        .route(ATTEST_USER_DATA_PATH, post(handlers::attest_user_data))
        .route(ATTEST_CERT_PATH, post(handlers::attest_cert))
        .with_state(state);
    with_limits(routes, limits)
}

/// Handlers served on the TLS listener.
pub fn tls_router(state: Arc<AppState>, limits: &ServerConfig) -> Router {
    let routes = Router::new()
        .route(ATTEST_HTTPS_CALL_PATH, post(handlers::attest_https_call))
        .with_state(state);
    with_limits(routes, limits)
}

fn with_limits(routes: Router, limits: &ServerConfig) -> Router {
    routes
        .layer(middleware::from_fn_with_state(
            limits.request_timeout(),
            request_timeout,
        ))
        .layer(DefaultBodyLimit::max(limits.max_body_bytes))
}

/// Bounds the whole request. Dropping the handler future on expiry also
/// abandons any evaluation it was waiting on.
async fn request_timeout(State(limit): State<Duration>, request: Request, next: Next) -> Response {
    match tokio::time::timeout(limit, next.run(request)).await {
        Ok(response) => response,
        Err(_) => HandlerError::RequestTimeout(limit).into_response(),
    }
}

pub async fn serve(
    listener: TcpListener,
    router: Router,
    timeouts: ConnTimeouts,
) -> anyhow::Result<()> {
    info!("HTTP handlers listening on {}", listener.local_addr()?);
    conn::serve(listener, router, timeouts).await;
    Ok(())
}

pub async fn serve_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    router: Router,
    timeouts: ConnTimeouts,
) -> anyhow::Result<()> {
    info!("TLS handlers listening on {}", listener.local_addr()?);
    conn::serve_tls(listener, acceptor, router, timeouts).await;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::api::{
        AttestationResponse, AttestedResult, CertResponse, ErrorResponse, ExpressionResponse,
        HttpCallResponse,
    };
    use crate::attestation::{
        AttestError, AttestOptions, AttestResult, NoTeeAttester, NoTeeVerifier, Verifier,
        VerifyOptions,
    };
    use crate::capability::builtin::default_registry;
    use crate::capability::builtin::http_get::MAX_RESPONSE_SIZE;
    use crate::capability::FnCapability;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde_json::{json, Value};
    use sha2::{Digest, Sha256};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    pub(crate) struct FailingAttester;

    impl Attester for FailingAttester {
        fn attest(&self, _: AttestOptions) -> Result<AttestResult, AttestError> {
            Err(AttestError::Generate("device unavailable".into()))
        }
    }

    pub(crate) fn test_state(attester: Arc<dyn Attester>) -> AppState {
        let registry = Arc::new(default_registry(reqwest::Client::new()).unwrap());
        AppState::new(registry, attester, reqwest::Client::new())
    }

    /// Serves `router` on a loopback port and returns its base URL.
    pub(crate) async fn spawn(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(conn::serve(listener, router, ConnTimeouts::default()));
        format!("http://{addr}")
    }

    async fn spawn_state(state: AppState) -> String {
        spawn(router(Arc::new(state), &ServerConfig::default())).await
    }

    fn verify(attestation: &AttestResult, options: VerifyOptions) -> Vec<u8> {
        NoTeeVerifier
            .verify(attestation, options.with_debug(true))
            .unwrap()
            .user_data
    }

    #[tokio::test]
    async fn test_user_data_round_trip() {
        let base = spawn_state(test_state(Arc::new(NoTeeAttester::new("dev")))).await;
        let response = reqwest::Client::new()
            .post(format!("{base}{ATTEST_USER_DATA_PATH}"))
            .json(&json!({
                "nonce": STANDARD.encode("nonce"),
                "userdata": STANDARD.encode("hello world"),
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        let body: AttestationResponse = response.json().await.unwrap();
        let user_data = verify(&body.attestation, VerifyOptions::new().with_nonce("nonce"));
        assert_eq!(user_data, b"hello world");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_expression_calls_stub_backend() {
        let backend = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
            .mount(&backend)
            .await;
        let base = spawn_state(test_state(Arc::new(NoTeeAttester::new("dev")))).await;

        for route in [ATTEST_RHAI_PATH, ATTEST_JINJA_PATH] {
            let response = reqwest::Client::new()
                .post(format!("{base}{route}"))
                .json(&json!({
                    "expression": "httpGet(url)",
                    "env": {"url": format!("{}/status", backend.uri())},
                }))
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), 200, "{route}");

            let body: ExpressionResponse = response.json().await.unwrap();
            assert_eq!(body.result.output, json!({"status": "ok"}));
            let user_data = verify(&body.attestation, VerifyOptions::new());
            assert_eq!(user_data, body.result.canonical_bytes().unwrap());
        }
    }

    #[tokio::test]
    async fn test_sprintf_expression_attests_canonical_record() {
        let base = spawn_state(test_state(Arc::new(NoTeeAttester::new("dev")))).await;
        let response = reqwest::Client::new()
            .post(format!("{base}{ATTEST_JINJA_PATH}"))
            .json(&json!({
                "expression": "sprintf(greet, names[0])",
                "env": {"greet": "Hello, %v!", "names": ["world", "you"]},
            }))
            .send()
            .await
            .unwrap();
        let body: ExpressionResponse = response.json().await.unwrap();
        let expected = AttestedResult {
            expression: "sprintf(greet, names[0])".into(),
            env: json!({"greet": "Hello, %v!", "names": ["world", "you"]}),
            output: json!("Hello, world!"),
        };
        assert_eq!(body.result, expected);
        assert_eq!(
            verify(&body.attestation, VerifyOptions::new()),
            expected.canonical_bytes().unwrap()
        );
    }

    #[tokio::test]
    async fn test_attestation_failure_is_reported() {
        let base = spawn_state(test_state(Arc::new(FailingAttester))).await;
        let response = reqwest::Client::new()
            .post(format!("{base}{ATTEST_RHAI_PATH}"))
            .json(&json!({"expression": "1 + 1", "env": {}}))
            .send()
            .await
            .unwrap();
        assert!(response.status().is_server_error());

        let body: Value = response.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("attesting"));
        assert!(body.get("attestation").is_none());
        assert!(!body.to_string().contains("device unavailable"));
    }

    #[tokio::test]
    async fn test_decode_error() {
        let base = spawn_state(test_state(Arc::new(NoTeeAttester::new("dev")))).await;
        let response = reqwest::Client::new()
            .post(format!("{base}{ATTEST_RHAI_PATH}"))
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 500);
        let body: ErrorResponse = response.json().await.unwrap();
        assert_eq!(body.error, "decoding request");
    }

    #[tokio::test]
    async fn test_compile_error_short_message() {
        let base = spawn_state(test_state(Arc::new(NoTeeAttester::new("dev")))).await;
        let response = reqwest::Client::new()
            .post(format!("{base}{ATTEST_RHAI_PATH}"))
            .json(&json!({"expression": "secret_name + 1", "env": {}}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 500);
        let body: ErrorResponse = response.json().await.unwrap();
        assert_eq!(body.error, "executing expression: compile error");
    }

    #[tokio::test]
    async fn test_post_only() {
        let base = spawn_state(test_state(Arc::new(NoTeeAttester::new("dev")))).await;
        let response = reqwest::get(format!("{base}{ATTEST_USER_DATA_PATH}"))
            .await
            .unwrap();
        assert_eq!(response.status(), 405);
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let mut registry = CapabilityRegistry::new();
        registry
            .register(Arc::new(FnCapability::new("pause", |_: &[Value]| {
                std::thread::sleep(Duration::from_millis(500));
                Ok(Value::Null)
            })))
            .unwrap();
        let state = AppState::new(
            Arc::new(registry),
            Arc::new(NoTeeAttester::new("dev")),
            reqwest::Client::new(),
        );
        let limits = ServerConfig {
            request_timeout_secs: 0,
            ..ServerConfig::default()
        };
        let base = spawn(router(Arc::new(state), &limits)).await;

        let response = reqwest::Client::new()
            .post(format!("{base}{ATTEST_RHAI_PATH}"))
            .json(&json!({"expression": "pause()"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 504);
    }

    #[tokio::test]
    async fn test_body_limit() {
        let state = test_state(Arc::new(NoTeeAttester::new("dev")));
        let limits = ServerConfig {
            max_body_bytes: 64,
            ..ServerConfig::default()
        };
        let base = spawn(router(Arc::new(state), &limits)).await;
        let response = reqwest::Client::new()
            .post(format!("{base}{ATTEST_USER_DATA_PATH}"))
            .json(&json!({"userdata": STANDARD.encode(vec![0u8; 1024])}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 500);
        let body: ErrorResponse = response.json().await.unwrap();
        assert_eq!(body.error, "decoding request");
    }

    #[tokio::test]
    async fn test_http_call_attests_body_digest() {
        let backend = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .mount(&backend)
            .await;
        let base = spawn_state(test_state(Arc::new(NoTeeAttester::new("dev")))).await;

        let response = reqwest::Client::new()
            .post(format!("{base}{ATTEST_HTTP_CALL_PATH}"))
            .json(&json!({"url": backend.uri()}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body: HttpCallResponse = response.json().await.unwrap();
        assert_eq!(body.response, b"hello");
        assert_eq!(
            verify(&body.attestation, VerifyOptions::new()),
            Sha256::digest(b"hello").to_vec()
        );
    }

    #[tokio::test]
    async fn test_http_call_upstream_failure() {
        let backend = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("internal detail"))
            .mount(&backend)
            .await;
        let base = spawn_state(test_state(Arc::new(NoTeeAttester::new("dev")))).await;

        let response = reqwest::Client::new()
            .post(format!("{base}{ATTEST_HTTP_CALL_PATH}"))
            .json(&json!({"url": backend.uri()}))
            .send()
            .await
            .unwrap();
        assert!(response.status().is_server_error());
        let body: ErrorResponse = response.json().await.unwrap();
        assert_eq!(body.error, "calling upstream: status 503");
    }

    #[tokio::test]
    async fn test_http_call_oversized_upstream_body() {
        let backend = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200).set_body_bytes(vec![b'x'; MAX_RESPONSE_SIZE + 1]),
            )
            .mount(&backend)
            .await;
        let base = spawn_state(test_state(Arc::new(NoTeeAttester::new("dev")))).await;

        let response = reqwest::Client::new()
            .post(format!("{base}{ATTEST_HTTP_CALL_PATH}"))
            .json(&json!({"url": backend.uri()}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 502);
        let body: ErrorResponse = response.json().await.unwrap();
        assert_eq!(body.error, "calling upstream");
    }

    #[tokio::test]
    async fn test_cert_attestation_binds_fingerprint() {
        let cert = Arc::new(CertBundle::generate("localhost").unwrap());
        let state = test_state(Arc::new(NoTeeAttester::new("dev"))).with_cert(cert.clone());
        let base = spawn_state(state).await;

        let response = reqwest::Client::new()
            .post(format!("{base}{ATTEST_CERT_PATH}"))
            .json(&json!({"nonce": STANDARD.encode("n1")}))
            .send()
            .await
            .unwrap();
        let body: CertResponse = response.json().await.unwrap();
        let leaf = STANDARD.decode(&body.cert_chain[0]).unwrap();
        assert_eq!(leaf, cert.chain()[0]);
        assert_eq!(
            verify(&body.attestation, VerifyOptions::new().with_nonce("n1")),
            tls::fingerprint(&leaf)
        );
    }

    #[tokio::test]
    async fn test_cert_unavailable_without_tls() {
        let base = spawn_state(test_state(Arc::new(NoTeeAttester::new("dev")))).await;
        let response = reqwest::Client::new()
            .post(format!("{base}{ATTEST_CERT_PATH}"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 503);
    }
}
