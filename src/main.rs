mod api;
mod attestation;
mod backoff;
mod capability;
mod client;
mod config;
mod engine;
mod error;
mod relay;
mod server;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::Map;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::attestation::{Verifier, VerifyOptions};
use crate::backoff::{retry, Backoff};
use crate::capability::builtin::default_registry;
use crate::client::{verify_expression_result, Client};
use crate::config::{Config, DEFAULT_CONFIG_PATH};
use crate::server::conn::ConnTimeouts;
use crate::server::tls::CertBundle;
use crate::server::AppState;

fn print_help() {
    println!(
        "\
attested-eval v{}

Sandboxed expression evaluation with attested results.

USAGE:
    attested-eval <MODE> [CONFIG_PATH]

MODES:
    enclave    Run the attested handlers, the TLS listener and the message socket
    proxy      Run the relay between the network and the enclave
    client     Bootstrap attested TLS and verify a few attested round trips

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: {DEFAULT_CONFIG_PATH}]

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG    Log level filter for tracing
                (e.g. debug, attested_eval=debug,warn)

EXAMPLES:
    attested-eval enclave                          # uses {DEFAULT_CONFIG_PATH}
    attested-eval proxy /etc/attested-eval.toml    # custom config path
    RUST_LOG=debug attested-eval client            # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

#[derive(Debug, Clone, Copy)]
enum Mode {
    Enclave,
    Proxy,
    Client,
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut positional = Vec::new();
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("attested-eval v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => positional.push(arg),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("attested_eval=info")),
        )
        .init();

    let mode = match positional.first().map(String::as_str) {
        Some("enclave") => Mode::Enclave,
        Some("proxy") => Mode::Proxy,
        Some("client") => Mode::Client,
        Some(other) => bail!("unknown mode '{other}' (expected enclave, proxy or client)"),
        None => {
            print_help();
            std::process::exit(2);
        }
    };
    let config_path = positional
        .get(1)
        .cloned()
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    info!("Loading configuration from {config_path}");
    let config = Config::load(&config_path)
        .with_context(|| format!("loading configuration from {config_path}"))?;
    info!("Attestation platform: {}", config.platform()?);

    let run = async {
        match mode {
            Mode::Enclave => run_enclave(&config).await,
            Mode::Proxy => relay::run(&config.proxy, &config.enclave, &config.server).await,
            Mode::Client => run_client(&config).await,
        }
    };

    tokio::select! {
        result = run => {
            if let Err(ref e) = result {
                error!("{mode:?} stopped: {e:#}");
            }
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, exiting");
            Ok(())
        }
    }
}

async fn run_enclave(config: &Config) -> Result<()> {
    let attester = config
        .platform()?
        .attester(&config.attestation.measurement);

    // Every outbound call leaves through the relay.
    let http = relay::proxied_client(&config.proxy.out_addr, &config.proxy.out_addr_tls)?;
    let registry = Arc::new(default_registry(http.clone())?);
    info!(
        "Capabilities: {}",
        registry.names().collect::<Vec<_>>().join(", ")
    );

    let cert = Arc::new(CertBundle::generate(&config.enclave.domain)?);
    info!(
        "TLS certificate for {} (sha256 {})",
        config.enclave.domain,
        hex::encode(cert.fingerprint())
    );
    let acceptor = cert.acceptor()?;

    let state = Arc::new(
        AppState::new(registry, attester.clone(), http)
            .with_cert(cert)
            .with_timeouts(config.enclave.eval_timeout(), config.enclave.attest_timeout()),
    );

    let plain = TcpListener::bind(&config.enclave.addr)
        .await
        .with_context(|| format!("binding {}", config.enclave.addr))?;
    let tls = TcpListener::bind(&config.enclave.addr_tls)
        .await
        .with_context(|| format!("binding {}", config.enclave.addr_tls))?;
    let socket = TcpListener::bind(&config.enclave.socket_addr)
        .await
        .with_context(|| format!("binding {}", config.enclave.socket_addr))?;

    let timeouts = ConnTimeouts::from_config(&config.server);
    tokio::try_join!(
        server::serve(plain, server::router(state.clone(), &config.server), timeouts),
        server::serve_tls(
            tls,
            acceptor,
            server::tls_router(state, &config.server),
            timeouts
        ),
        relay::socket::serve_attester(socket, attester, config.enclave.attest_timeout()),
    )?;
    Ok(())
}

async fn run_client(config: &Config) -> Result<()> {
    let platform = config.platform()?;
    let verifier: Arc<dyn Verifier> = platform.verifier();
    let options = VerifyOptions::new()
        .with_measurement(config.attestation.measurement.clone())
        .with_debug(config.attestation.verify_debug);

    let client = Client::with_timeout(config.client.host.clone(), config.client.timeout())?;
    let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(8), 2);

    let tls = retry(&mut backoff, config.client.retries, "attested TLS bootstrap", || {
        client.establish_attested_tls(&config.client.tls_host, verifier.clone(), options.clone())
    })
    .await?;
    info!("Attested TLS channel to {} established", config.client.tls_host);

    let nonce: [u8; 16] = rand::random();
    let user_data = b"attested-eval client hello";
    let response = client.attest_user_data(&nonce, user_data).await?;
    let verified =
        verifier.verify(&response.attestation, options.clone().with_nonce(nonce.to_vec()))?;
    if verified.user_data != user_data {
        bail!("user data attestation binds different bytes");
    }
    info!(
        "User data attested (measurement {}, at {})",
        verified.measurement, verified.timestamp
    );

    let response = client
        .attest_rhai(&config.client.expression, Map::new())
        .await?;
    verify_expression_result(verifier.as_ref(), &response, options.clone())?;
    info!(
        "{} = {} (attested)",
        response.result.expression, response.result.output
    );

    match &config.client.https_call_url {
        Some(url) => {
            let response = tls.attest_https_call("GET", url).await?;
            let verified = verifier.verify(&response.attestation, options)?;
            info!(
                "GET {url} over the attested channel: {} bytes attested",
                verified.user_data.len()
            );
        }
        None => info!("No client.https_call_url configured, skipping the HTTPS call"),
    }
    Ok(())
}
