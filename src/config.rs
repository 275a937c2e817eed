use serde::Deserialize;
use std::time::Duration;

use crate::attestation::Platform;

pub const DEFAULT_CONFIG_PATH: &str = "config/attested-eval.toml";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub attestation: AttestationConfig,
    pub enclave: EnclaveConfig,
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AttestationConfig {
    /// Only `notee` is built in
    #[serde(default = "default_platform")]
    pub platform: String,
    /// Identity measurement the enclave reports and the client expects
    #[serde(default = "default_measurement")]
    pub measurement: String,
    /// Accept debug-mode reports when verifying
    #[serde(default = "default_verify_debug")]
    pub verify_debug: bool,
}

/// Addresses the isolated process listens on.
#[derive(Debug, Deserialize, Clone)]
pub struct EnclaveConfig {
    /// Plain HTTP handlers
    pub addr: String,
    /// TLS listener (`/attest-https-call`)
    pub addr_tls: String,
    /// Message socket answered with raw attestations
    pub socket_addr: String,
    /// Name the self-signed certificate is issued for
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default = "default_eval_timeout_secs")]
    pub eval_timeout_secs: u64,
    #[serde(default = "default_attest_timeout_secs")]
    pub attest_timeout_secs: u64,
}

/// Addresses of the public-facing relay.
#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Inbound HTTP, forwarded to `enclave.addr`
    pub in_addr: String,
    /// Inbound TLS passthrough to `enclave.addr_tls`
    pub in_addr_tls: String,
    /// Outbound HTTP forward proxy used by the enclave
    pub out_addr: String,
    /// Outbound CONNECT tunnel used by the enclave for https
    pub out_addr_tls: String,
    /// Inbound HTTP bridged onto the enclave message socket
    pub socket_addr: String,
    #[serde(default = "default_hop_timeout_secs")]
    pub hop_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Upper bound on a whole request, evaluation and attestation included
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Time a client gets to send a complete request head
    #[serde(default = "default_header_read_timeout_secs")]
    pub header_read_timeout_secs: u64,
    /// Connections with no traffic for this long are closed
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

/// Caller side, used by the `client` mode.
#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    /// Public HTTP address of the relay
    #[serde(default = "default_client_host")]
    pub host: String,
    /// Public TLS address of the relay; the name must match the enclave certificate
    #[serde(default = "default_client_tls_host")]
    pub tls_host: String,
    #[serde(default = "default_client_timeout_secs")]
    pub timeout_secs: u64,
    /// Attempts at the first request while the relay or enclave starts up
    #[serde(default = "default_client_retries")]
    pub retries: u32,
    /// Expression evaluated by the `client` mode (engine variant A)
    #[serde(default = "default_client_expression")]
    pub expression: String,
    /// URL the enclave fetches over the attested TLS channel, if any
    #[serde(default)]
    pub https_call_url: Option<String>,
}

fn default_platform() -> String {
    "notee".to_string()
}

fn default_measurement() -> String {
    "dev".to_string()
}

fn default_verify_debug() -> bool {
    true
}

fn default_domain() -> String {
    "localhost".to_string()
}

fn default_eval_timeout_secs() -> u64 {
    10
}

fn default_attest_timeout_secs() -> u64 {
    10
}

fn default_hop_timeout_secs() -> u64 {
    30
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_header_read_timeout_secs() -> u64 {
    10
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_client_host() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_client_tls_host() -> String {
    "https://localhost:8443".to_string()
}

fn default_client_timeout_secs() -> u64 {
    30
}

fn default_client_retries() -> u32 {
    5
}

fn default_client_expression() -> String {
    r#"sprintf("attested %v", 42)"#.to_string()
}

impl Default for AttestationConfig {
    fn default() -> Self {
        Self {
            platform: default_platform(),
            measurement: default_measurement(),
            verify_debug: default_verify_debug(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            max_body_bytes: default_max_body_bytes(),
            header_read_timeout_secs: default_header_read_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: default_client_host(),
            tls_host: default_client_tls_host(),
            timeout_secs: default_client_timeout_secs(),
            retries: default_client_retries(),
            expression: default_client_expression(),
            https_call_url: None,
        }
    }
}

impl EnclaveConfig {
    pub fn eval_timeout(&self) -> Duration {
        Duration::from_secs(self.eval_timeout_secs)
    }

    pub fn attest_timeout(&self) -> Duration {
        Duration::from_secs(self.attest_timeout_secs)
    }
}

impl ProxyConfig {
    pub fn hop_timeout(&self) -> Duration {
        Duration::from_secs(self.hop_timeout_secs)
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn header_read_timeout(&self) -> Duration {
        Duration::from_secs(self.header_read_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl ClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Expand environment variables like ${ENCLAVE_HOST}
        let expanded = shellexpand::env(&content)?;
        let config: Config = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    pub fn platform(&self) -> anyhow::Result<Platform> {
        Ok(self.attestation.platform.parse()?)
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.platform()?;
        if self.enclave.eval_timeout_secs == 0 || self.enclave.attest_timeout_secs == 0 {
            anyhow::bail!("enclave timeouts must be at least 1 second");
        }
        if self.server.header_read_timeout_secs == 0 || self.server.idle_timeout_secs == 0 {
            anyhow::bail!("server connection timeouts must be at least 1 second");
        }
        if self.enclave.eval_timeout_secs > self.server.request_timeout_secs {
            anyhow::bail!(
                "enclave.eval_timeout_secs ({}) exceeds server.request_timeout_secs ({})",
                self.enclave.eval_timeout_secs,
                self.server.request_timeout_secs
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
[enclave]
addr = "127.0.0.1:7000"
addr_tls = "127.0.0.1:7443"
socket_addr = "127.0.0.1:7050"

[proxy]
in_addr = "0.0.0.0:8080"
in_addr_tls = "0.0.0.0:8443"
out_addr = "127.0.0.1:8081"
out_addr_tls = "127.0.0.1:8082"
socket_addr = "0.0.0.0:8090"
"#;

    fn load_str(content: &str) -> anyhow::Result<Config> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        Config::load(file.path().to_str().unwrap())
    }

    #[test]
    fn test_load_minimal_uses_defaults() {
        let config = load_str(MINIMAL).unwrap();
        assert_eq!(config.enclave.addr, "127.0.0.1:7000");
        assert_eq!(config.enclave.domain, "localhost");
        assert_eq!(config.enclave.eval_timeout(), Duration::from_secs(10));
        assert_eq!(config.proxy.hop_timeout(), Duration::from_secs(30));
        assert_eq!(config.server.max_body_bytes, 1024 * 1024);
        assert_eq!(config.server.header_read_timeout(), Duration::from_secs(10));
        assert_eq!(config.server.idle_timeout(), Duration::from_secs(60));
        assert_eq!(config.attestation.platform, "notee");
        assert!(config.attestation.verify_debug);
        assert_eq!(config.platform().unwrap(), Platform::NoTee);
        assert_eq!(config.client.host, "http://127.0.0.1:8080");
        assert_eq!(config.client.retries, 5);
    }

    #[test]
    fn test_load_expands_env_vars() {
        std::env::set_var("ATTESTED_EVAL_TEST_MEASUREMENT", "abc123");
        let content = format!(
            "{MINIMAL}\n[attestation]\nmeasurement = \"${{ATTESTED_EVAL_TEST_MEASUREMENT}}\"\n"
        );
        let config = load_str(&content).unwrap();
        assert_eq!(config.attestation.measurement, "abc123");
    }

    #[test]
    fn test_load_rejects_unknown_platform() {
        let content = format!("{MINIMAL}\n[attestation]\nplatform = \"sgx\"\n");
        let err = load_str(&content).unwrap_err();
        assert!(err.to_string().contains("sgx"));
    }

    #[test]
    fn test_load_rejects_eval_timeout_above_request_timeout() {
        let content = MINIMAL.replace(
            "socket_addr = \"127.0.0.1:7050\"",
            "socket_addr = \"127.0.0.1:7050\"\neval_timeout_secs = 60",
        );
        let err = load_str(&content).unwrap_err();
        assert!(err.to_string().contains("eval_timeout_secs"));
    }

    #[test]
    fn test_load_rejects_zero_connection_timeouts() {
        for field in ["header_read_timeout_secs", "idle_timeout_secs"] {
            let content = format!("{MINIMAL}\n[server]\n{field} = 0\n");
            let err = load_str(&content).unwrap_err();
            assert!(err.to_string().contains("connection timeouts"), "{field}");
        }
    }

    #[test]
    fn test_load_missing_addresses_fails() {
        assert!(load_str("[enclave]\naddr = \"127.0.0.1:1\"\n").is_err());
    }

    #[test]
    fn test_shipped_config_loads() {
        let config = Config::load(DEFAULT_CONFIG_PATH).unwrap();
        assert_eq!(config.enclave.addr_tls, "127.0.0.1:7443");
        assert!(config.client.https_call_url.is_none());
        assert!(config.client.expression.starts_with("sprintf("));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(Config::load("/nonexistent/attested-eval.toml").is_err());
    }
}
