//! Builtin capability: `httpGet(url)`.
//!
//! Performs a GET and decodes the response body as JSON. Inside the
//! enclave the client is the relay-proxied one, so the request leaves
//! through the outbound proxy.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::capability::Capability;
use crate::error::{CapabilityError, TransportError};

/// Maximum accepted response body (5 MB).
pub(crate) const MAX_RESPONSE_SIZE: usize = 5 * 1024 * 1024;

const READ_TIMEOUT_SECS: u64 = 30;
const CONNECT_TIMEOUT_SECS: u64 = 10;

const USER_AGENT: &str = concat!("attested-eval/", env!("CARGO_PKG_VERSION"));

pub struct HttpGet {
    client: reqwest::Client,
}

impl HttpGet {
    /// Wraps an already configured client (typically the proxied one).
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Builds a direct client with the default timeouts.
    pub fn direct() -> Self {
        Self::new(default_client_builder().build().unwrap_or_else(|_| reqwest::Client::new()))
    }

    async fn fetch(&self, url: &str) -> Result<Value, CapabilityError> {
        debug!("httpGet {url}");

        let response = self.client.get(url).send().await.map_err(|e| {
            warn!("httpGet {url} failed: {e}");
            CapabilityError::Failed(format!("making GET request to '{url}': {e}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(CapabilityError::Failed(format!(
                "received non-success response: {status}"
            )));
        }

        let body = read_capped(response, MAX_RESPONSE_SIZE)
            .await
            .map_err(|e| CapabilityError::Failed(format!("reading response body: {e}")))?;

        serde_json::from_slice(&body)
            .map_err(|e| CapabilityError::Failed(format!("decoding JSON response: {e}")))
    }
}

/// Client builder with the capability's default timeouts and user agent.
pub fn default_client_builder() -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(READ_TIMEOUT_SECS))
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(5))
}

/// Reads a response body, giving up as soon as it grows past `limit`.
pub(crate) async fn read_capped(
    mut response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, TransportError> {
    if response.content_length().is_some_and(|len| len > limit as u64) {
        return Err(TransportError::TooLarge { limit });
    }
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        if body.len() + chunk.len() > limit {
            return Err(TransportError::TooLarge { limit });
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

/// Checks the argument list and returns the validated URL.
fn parse_args(args: &[Value]) -> Result<url::Url, CapabilityError> {
    let [arg] = args else {
        return Err(CapabilityError::InvalidArgument(format!(
            "httpGet takes exactly 1 argument, got {}",
            args.len()
        )));
    };
    let raw = arg.as_str().ok_or_else(|| {
        CapabilityError::InvalidArgument("httpGet url must be a string".into())
    })?;
    let parsed = url::Url::parse(raw)
        .map_err(|e| CapabilityError::InvalidArgument(format!("invalid URL: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(CapabilityError::InvalidArgument(format!(
            "unsupported scheme '{scheme}' (only http/https)"
        ))),
    }
}

impl Capability for HttpGet {
    fn name(&self) -> &str {
        "httpGet"
    }

    fn description(&self) -> &str {
        "GET a URL and return its JSON body"
    }

    fn call(&self, args: &[Value]) -> Result<Value, CapabilityError> {
        let url = parse_args(args)?;
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| CapabilityError::Failed("no async runtime available".into()))?;
        handle.block_on(self.fetch(url.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // ── Argument validation ─────────────────────────────────

    #[test]
    fn test_name() {
        assert_eq!(HttpGet::direct().name(), "httpGet");
    }

    #[test]
    fn test_rejects_wrong_arity() {
        let err = parse_args(&[]).unwrap_err();
        assert!(matches!(err, CapabilityError::InvalidArgument(_)));
        let err = parse_args(&[json!("http://a"), json!("http://b")]).unwrap_err();
        assert!(err.to_string().contains("exactly 1 argument"));
    }

    #[test]
    fn test_rejects_non_string() {
        let err = parse_args(&[json!(42)]).unwrap_err();
        assert!(err.to_string().contains("must be a string"));
    }

    #[test]
    fn test_rejects_invalid_url() {
        let err = parse_args(&[json!("not-a-url")]).unwrap_err();
        assert!(err.to_string().contains("invalid URL"));
    }

    #[test]
    fn test_rejects_unsupported_scheme() {
        let err = parse_args(&[json!("file:///etc/passwd")]).unwrap_err();
        assert!(err.to_string().contains("unsupported scheme 'file'"));
    }

    #[test]
    fn test_no_runtime_is_an_error() {
        let err = HttpGet::direct()
            .call(&[json!("http://127.0.0.1:1/")])
            .unwrap_err();
        assert_eq!(err, CapabilityError::Failed("no async runtime available".into()));
    }

    // ── Fetching ────────────────────────────────────────────

    async fn call_blocking(url: String) -> Result<Value, CapabilityError> {
        tokio::task::spawn_blocking(move || HttpGet::direct().call(&[Value::String(url)]))
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fetches_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
            .mount(&server)
            .await;

        let out = call_blocking(format!("{}/status", server.uri())).await.unwrap();
        assert_eq!(out, json!({"status": "ok"}));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_non_success_status_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = call_blocking(server.uri()).await.unwrap_err();
        assert!(err.to_string().contains("503"), "{err}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_non_json_body_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
            .mount(&server)
            .await;

        let err = call_blocking(server.uri()).await.unwrap_err();
        assert!(err.to_string().contains("decoding JSON"), "{err}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_oversized_body_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200).set_body_bytes(vec![b'1'; MAX_RESPONSE_SIZE + 1]),
            )
            .mount(&server)
            .await;

        let err = call_blocking(server.uri()).await.unwrap_err();
        assert!(err.to_string().contains("exceeds"), "{err}");
    }

    /// Serves one chunked response of `chunks` pieces of `size` bytes, with no Content-Length.
    async fn chunked_server(chunks: usize, size: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let head =
                "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n";
            let _ = stream.write_all(head.as_bytes()).await;
            for _ in 0..chunks {
                let chunk = format!("{size:x}\r\n{}\r\n", "x".repeat(size));
                if stream.write_all(chunk.as_bytes()).await.is_err() {
                    return;
                }
            }
            let _ = stream.write_all(b"0\r\n\r\n").await;
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn test_read_capped_stops_streamed_body() {
        let url = chunked_server(8, 512).await;
        let response = reqwest::get(&url).await.unwrap();
        assert!(response.content_length().is_none());
        let err = read_capped(response, 1024).await.unwrap_err();
        assert!(matches!(err, TransportError::TooLarge { limit: 1024 }), "{err:?}");
    }

    #[tokio::test]
    async fn test_read_capped_within_limit() {
        let url = chunked_server(2, 512).await;
        let response = reqwest::get(&url).await.unwrap();
        assert_eq!(read_capped(response, 1024).await.unwrap().len(), 1024);
    }
}
