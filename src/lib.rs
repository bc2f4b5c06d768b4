//! Orchestrates the mailcrucible application startup and component
//! lifecycle.
//!
//! This library crate loads configuration and wires together the storage
//! backend, the pre-queue policy pipeline, the MX-aware relay manager, the
//! durable queue dispatcher, and the SMTP (plus optional HTTP) edges into
//! one running service. It shuts down gracefully on SIGINT/SIGTERM, giving
//! in-flight sessions and the queue dispatcher a grace period to drain.

pub mod auth;
pub mod bounce;
pub mod codec;
pub mod config;
pub mod edge;
pub mod envelope;
pub mod error;
pub mod health;
pub mod policy;
pub mod queue;
pub mod relay;
pub mod reply;
pub mod sasl;
pub mod smtp;
pub mod storage;
pub mod submit;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info};
use tokio::select;
use tokio_util::sync::CancellationToken;

use auth::StaticCredentialVerifier;
use config::{Config, RelayMode as ConfigRelayMode, StorageBackend};
use edge::{http as http_edge, EdgeConfig};
use policy::Policy;
use queue::{backoff, Queue, QueueConfig};
use relay::{RelayManager, RelayManagerConfig, RelayMode};
use smtp::client::ClientConfig;
use smtp::server::{AuthConfig, PermissiveValidator, ServerConfig};
use storage::{memory::MemoryStorage, filesystem::FilesystemStorage, Storage};

/// Builds the policy pipeline run over every envelope before it reaches
/// storage, per spec.md §4.8: the trace and identity headers always run
/// first, then the operator-configured rewrite/fanout policies.
fn build_policies(config: &Config) -> Vec<Box<dyn Policy>> {
    let mut policies: Vec<Box<dyn Policy>> = vec![
        Box::new(policy::AddReceivedHeader { hostname: config.hostname.clone() }),
        Box::new(policy::AddDateHeader),
        Box::new(policy::AddMessageIdHeader { hostname: config.hostname.clone() }),
    ];

    if !config.forward_rules.is_empty() {
        let rules = config
            .forward_rules
            .iter()
            .filter_map(|(pattern, replacement)| {
                regex::Regex::new(pattern)
                    .map(|re| (re, replacement.clone()))
                    .map_err(|e| error!("forward rule pattern {pattern:?} is invalid, skipping: {e}"))
                    .ok()
            })
            .collect();
        policies.push(Box::new(policy::Forward { rules }));
    }

    if config.split_per_recipient {
        policies.push(Box::new(policy::RecipientSplit));
    }

    policies
}

async fn build_storage(config: &Config) -> Result<Arc<dyn Storage>> {
    match &config.storage_backend {
        StorageBackend::Memory => Ok(MemoryStorage::new()),
        StorageBackend::Filesystem { root } => {
            let storage = FilesystemStorage::open(root)
                .await
                .with_context(|| format!("opening filesystem storage at {root}"))?;
            Ok(Arc::new(storage))
        }
    }
}

/// Builds the outbound TLS connector the relay's pooled client sessions use
/// for opportunistic STARTTLS, trusting the platform's native root store
/// (the same `rustls-native-certs` source the teacher's hyper-rustls client
/// relied on).
fn build_client_tls_connector() -> Result<tokio_rustls::TlsConnector> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        let _ = roots.add(cert);
    }
    let client_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(tokio_rustls::TlsConnector::from(Arc::new(client_config)))
}

fn build_relay_manager(config: &Config) -> Result<Arc<RelayManager>> {
    let mut client_config = ClientConfig::new(config.hostname.clone());
    client_config.tls_connector = Some(build_client_tls_connector()?);

    let mode = match &config.relay_mode {
        ConfigRelayMode::Static { host, port } => RelayMode::Static { host: host.clone(), port: *port },
        ConfigRelayMode::Mx { port } => RelayMode::Mx { port: *port },
    };

    let manager = RelayManager::new(RelayManagerConfig {
        mode,
        concurrent_connections: config.relay_concurrent_connections,
        idle_timeout: Duration::from_secs(config.relay_idle_timeout_secs),
        client: Arc::new(client_config),
        forced_hosts: config.relay_forced_hosts.clone(),
    })?;
    Ok(Arc::new(manager))
}

/// Loads a PEM certificate chain and private key from disk for STARTTLS.
async fn load_tls_material(cert_path: &str, key_path: &str) -> Result<tokio_rustls::TlsAcceptor> {
    let cert_bytes = tokio::fs::read(cert_path)
        .await
        .with_context(|| format!("reading TLS certificate at {cert_path}"))?;
    let key_bytes = tokio::fs::read(key_path)
        .await
        .with_context(|| format!("reading TLS private key at {key_path}"))?;

    let certs = rustls_pemfile::certs(&mut cert_bytes.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parsing PEM certificates at {cert_path}"))?;
    let key = rustls_pemfile::private_key(&mut key_bytes.as_slice())
        .with_context(|| format!("parsing PEM private key at {key_path}"))?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {key_path}"))?;

    let server_tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("building rustls server config from supplied cert/key")?;
    Ok(tokio_rustls::TlsAcceptor::from(Arc::new(server_tls_config)))
}

/// Generates a self-signed certificate for `hostname` so STARTTLS works
/// out of the box when no operator-supplied material is configured.
fn self_signed_tls(hostname: &str) -> Result<tokio_rustls::TlsAcceptor> {
    let cert = rcgen::generate_simple_self_signed(vec![hostname.to_string()])
        .context("generating self-signed certificate")?;
    let cert_der = cert.cert.der().clone();
    let key_der = rustls::pki_types::PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
    let server_tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der.into())
        .context("building rustls server config from self-signed cert")?;
    Ok(tokio_rustls::TlsAcceptor::from(Arc::new(server_tls_config)))
}

async fn build_server_config(config: &Config) -> Result<Arc<ServerConfig>> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let tls_acceptor = match (&config.tls_cert_path, &config.tls_key_path) {
        (Some(cert_path), Some(key_path)) => Some(load_tls_material(cert_path, key_path).await?),
        (None, None) => Some(self_signed_tls(&config.hostname)?),
        _ => {
            return Err(anyhow::anyhow!(
                "MAILCRUCIBLE_TLS_CERT_PATH and MAILCRUCIBLE_TLS_KEY_PATH must both be set, or both left unset"
            ))
        }
    };

    let auth = if config.auth_enabled {
        Some(AuthConfig {
            allow_plaintext_without_tls: config.allow_plaintext_without_tls,
            verifier: Arc::new(StaticCredentialVerifier::new(config.auth_users.clone())),
        })
    } else {
        None
    };

    let mut server_config = ServerConfig::new(config.hostname.clone());
    server_config.max_message_size = config.max_message_size;
    server_config.tls_acceptor = tls_acceptor;
    server_config.auth = auth;
    server_config.session_timeout = Duration::from_secs(config.session_timeout_secs);
    Ok(Arc::new(server_config))
}

fn parse_bind_addrs(raw: &[String]) -> Result<Vec<SocketAddr>> {
    raw.iter()
        .map(|addr| {
            addr.parse::<SocketAddr>()
                .with_context(|| format!("invalid bind address {addr:?}"))
        })
        .collect()
}

/// Runs the mailcrucible application: loads configuration, wires the
/// storage/policy/relay/queue engine to the SMTP (and optional HTTP) edge,
/// and runs until SIGINT/SIGTERM, then drains in-flight work for up to
/// `shutdown_grace_secs` before returning.
///
/// # Returns
///
/// - `Ok(())` on a clean, requested shutdown.
/// - `Err(anyhow::Error)` if configuration loading fails, a listener can't
///   bind, or a spawned component task fails unexpectedly.
pub async fn run() -> Result<()> {
    info!(
        "Starting {} v{} MTA",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return Err(e);
        }
    };

    let storage = build_storage(&config).await?;
    let relay = build_relay_manager(&config)?;

    let (queue_handle, mut queue) = Queue::new(
        storage,
        relay,
        QueueConfig {
            hostname: config.hostname.clone(),
            policies: build_policies(&config),
            backoff: backoff::exponential(),
        },
    );
    queue.recover().await.context("recovering queued envelopes from storage")?;

    let shutdown = CancellationToken::new();
    let submitter: Arc<dyn submit::EnvelopeSubmitter> = Arc::new(queue_handle);

    let queue_shutdown = shutdown.clone();
    let queue_handle_task = tokio::spawn(async move {
        queue.run(queue_shutdown).await;
    });

    let server_config = build_server_config(&config).await?;
    let edge_config = EdgeConfig {
        bind_addrs: parse_bind_addrs(&config.smtp_bind_addresses)?,
        max_connections: config.max_connections,
        proxy_protocol: config.proxy_protocol,
        shutdown_grace: Duration::from_secs(config.shutdown_grace_secs),
        server: server_config,
        validator_factory: Arc::new(PermissiveValidator),
    };

    let edge_submitter = submitter.clone();
    let edge_shutdown = shutdown.clone();
    let edge_handle = tokio::spawn(async move {
        if let Err(e) = edge::run(edge_config, edge_submitter, edge_shutdown).await {
            error!("SMTP edge encountered a fatal error: {e}");
            return Err(e);
        }
        Ok(())
    });

    let http_handle = if let Some(bind_address) = config.http_edge_bind_address.clone() {
        let addr: SocketAddr = format!("{bind_address}:{}", config.http_edge_port)
            .parse()
            .with_context(|| format!("invalid HTTP edge bind address {bind_address}"))?;
        let http_submitter = submitter.clone();
        let http_shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!("HTTP edge listening on {addr}");
            let app = http_edge::router(http_submitter)
                .into_make_service_with_connect_info::<SocketAddr>();
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
                .await?;
            Ok::<(), anyhow::Error>(())
        }))
    } else {
        None
    };

    let health_config = config.clone();
    let health_shutdown = shutdown.clone();
    let health_handle = tokio::spawn(async move {
        if let Err(e) = health::run_health_server(health_config, health_shutdown).await {
            error!("Health check server encountered a fatal error: {e}");
            return Err(e);
        }
        Ok(())
    });

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            info!("shutdown signal received; draining in-flight work");
            signal_shutdown.cancel();
        }
    });

    let result = select! {
        res = edge_handle => summarize("SMTP edge", res),
        res = health_handle => summarize("health check server", res),
        res = queue_handle_task => {
            shutdown.cancel();
            res.context("queue dispatcher task panicked")?;
            info!("queue dispatcher drained");
            Ok(())
        }
    };

    shutdown.cancel();
    if let Some(handle) = http_handle {
        let _ = handle.await;
    }

    result
}

fn summarize(name: &str, res: Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match res {
        Ok(Ok(())) => {
            info!("{name} shut down");
            Ok(())
        }
        Ok(Err(e)) => {
            error!("{name} returned an error: {e}");
            Err(e)
        }
        Err(join_error) => {
            error!("{name} task failed: {join_error}");
            Err(anyhow::anyhow!("{name} task failed: {join_error}"))
        }
    }
}
