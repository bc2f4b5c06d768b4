//! Manages application configuration loaded from environment variables.
//!
//! This module defines the `Config` struct which holds all runtime settings
//! and provides the `from_env` function to populate this struct. It supports
//! loading variables from a `.env` file via the `dotenv` crate and provides
//! default values for optional settings.

use std::collections::HashMap;
use std::env;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Which storage backend the binary's default wiring persists queued
/// envelopes with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StorageBackend {
    Memory,
    Filesystem { root: String },
}

/// How the relay manager picks a next hop, mirroring `relay::RelayMode`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RelayMode {
    Static { host: String, port: u16 },
    Mx { port: u16 },
}

/// Holds the application's runtime configuration settings.
///
/// These settings are typically loaded from environment variables via `from_env`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The hostname this instance identifies itself as in banners, EHLO
    /// replies, `Received:` headers, and bounce `From:` addresses.
    /// (Required: `MAILCRUCIBLE_HOSTNAME`)
    pub hostname: String,

    /// Addresses the SMTP edge binds, `host:port` each. (Optional:
    /// `MAILCRUCIBLE_SMTP_BIND_ADDRESSES`, comma-separated, Default:
    /// "0.0.0.0:2525")
    pub smtp_bind_addresses: Vec<String>,

    /// Upper bound on concurrently handled SMTP connections before further
    /// accepts block. (Optional: `MAILCRUCIBLE_MAX_CONNECTIONS`, Default: 256)
    pub max_connections: usize,

    /// Whether accepted connections are expected to open with a PROXY
    /// protocol v1/v2 header. (Optional: `MAILCRUCIBLE_PROXY_PROTOCOL`,
    /// Default: false)
    pub proxy_protocol: bool,

    /// Grace period given to in-flight sessions on shutdown before their
    /// sockets are forced closed. (Optional: `MAILCRUCIBLE_SHUTDOWN_GRACE_SECS`,
    /// Default: 30)
    pub shutdown_grace_secs: u64,

    /// Maximum accepted message size in bytes, advertised via `SIZE`.
    /// (Optional: `MAILCRUCIBLE_MAX_MESSAGE_SIZE`, Default: 26214400)
    pub max_message_size: usize,

    /// Per-read idle timeout for an SMTP session. (Optional:
    /// `MAILCRUCIBLE_SESSION_TIMEOUT_SECS`, Default: 300)
    pub session_timeout_secs: u64,

    /// PEM certificate chain path for STARTTLS. When unset, a self-signed
    /// certificate is generated at startup so STARTTLS still works without
    /// operator-supplied material. (Optional: `MAILCRUCIBLE_TLS_CERT_PATH`)
    pub tls_cert_path: Option<String>,

    /// PEM private key path paired with `tls_cert_path`. (Optional:
    /// `MAILCRUCIBLE_TLS_KEY_PATH`)
    pub tls_key_path: Option<String>,

    /// Whether `AUTH` is advertised and accepted at all. (Optional:
    /// `MAILCRUCIBLE_AUTH_ENABLED`, Default: false)
    pub auth_enabled: bool,

    /// Whether `PLAIN`/`LOGIN` may be attempted before STARTTLS. Per
    /// spec.md §9 Open Question (a), defaults to refusing plaintext
    /// credentials without TLS. (Optional:
    /// `MAILCRUCIBLE_ALLOW_PLAINTEXT_AUTH`, Default: false)
    pub allow_plaintext_without_tls: bool,

    /// Static credential table for `CredentialVerifier`: `user:password`
    /// pairs. (Optional: `MAILCRUCIBLE_AUTH_USERS`, comma-separated, Default:
    /// empty)
    pub auth_users: Vec<(String, String)>,

    /// How the relay manager picks a destination. (Optional:
    /// `MAILCRUCIBLE_RELAY_MODE`, one of "static"/"mx", Default: "mx")
    pub relay_mode: RelayMode,

    /// Concurrent outbound connections allowed per destination. (Optional:
    /// `MAILCRUCIBLE_RELAY_CONCURRENT_CONNECTIONS`, Default: 4)
    pub relay_concurrent_connections: usize,

    /// How long an idle relay connection may be reused before reconnecting.
    /// (Optional: `MAILCRUCIBLE_RELAY_IDLE_TIMEOUT_SECS`, Default: 60)
    pub relay_idle_timeout_secs: u64,

    /// Per-domain MX override: `domain=host` pairs. (Optional:
    /// `MAILCRUCIBLE_RELAY_FORCED_HOSTS`, comma-separated, Default: empty)
    pub relay_forced_hosts: HashMap<String, String>,

    /// Where the queue persists envelopes pending delivery. (Optional:
    /// `MAILCRUCIBLE_STORAGE_BACKEND`, one of "memory"/"filesystem",
    /// Default: "memory"; filesystem root: `MAILCRUCIBLE_STORAGE_ROOT`,
    /// Default: "./mailcrucible-queue")
    pub storage_backend: StorageBackend,

    /// Regex-rewrite rules applied to every recipient by the `Forward`
    /// policy: `pattern=replacement` pairs, semicolon-separated. (Optional:
    /// `MAILCRUCIBLE_FORWARD_RULES`, Default: empty)
    pub forward_rules: Vec<(String, String)>,

    /// Whether the `RecipientSplit` policy is enabled (one envelope per
    /// recipient instead of one per message). (Optional:
    /// `MAILCRUCIBLE_SPLIT_PER_RECIPIENT`, Default: false)
    pub split_per_recipient: bool,

    /// Optional HTTP edge bind address; unset disables it entirely.
    /// (Optional: `MAILCRUCIBLE_HTTP_EDGE_BIND_ADDRESS`)
    pub http_edge_bind_address: Option<String>,

    /// HTTP edge port. (Optional: `MAILCRUCIBLE_HTTP_EDGE_PORT`, Default: 8025)
    pub http_edge_port: u16,

    /// The IP address the health check HTTP server should listen on. (Optional: `MAILCRUCIBLE_HEALTH_BIND_ADDRESS`, Default: "0.0.0.0")
    pub health_check_bind_address: String,

    /// The network port the health check HTTP server should listen on. (Optional: `MAILCRUCIBLE_HEALTH_PORT`, Default: 8080)
    pub health_check_port: u16,
}

fn env_or_default(key: &str, default: &str) -> String {
    env::var(key)
        .map(|val| {
            log::info!("Config: using {key} from env: {val}");
            val
        })
        .unwrap_or_else(|_| {
            log::info!("Config: using default {key}: {default}");
            default.to_string()
        })
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T: std::fmt::Display,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(val) => val.parse().map_err(|e| anyhow!("{key} ('{val}') is invalid: {e}")),
        Err(_) => {
            log::info!("Config: using default {key}: {default}");
            Ok(default)
        }
    }
}

fn split_nonempty(raw: &str, sep: char) -> Vec<String> {
    raw.split(sep).map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
}

impl Config {
    /// Loads configuration settings from environment variables prefixed
    /// `MAILCRUCIBLE_`. Supports loading from a `.env` file if present.
    /// Provides default values for optional settings and logs the values
    /// in effect.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv::dotenv();

        let hostname = match env::var("MAILCRUCIBLE_HOSTNAME") {
            Ok(val) => val,
            Err(e) => {
                let err_msg = "MAILCRUCIBLE_HOSTNAME environment variable must be set";
                log::error!("{err_msg}: {e}");
                return Err(anyhow!(e).context(err_msg));
            }
        };
        log::info!("Config: using hostname: {hostname}");

        let smtp_bind_addresses = split_nonempty(&env_or_default("MAILCRUCIBLE_SMTP_BIND_ADDRESSES", "0.0.0.0:2525"), ',');
        let max_connections: usize = env_parsed("MAILCRUCIBLE_MAX_CONNECTIONS", 256)?;
        let proxy_protocol: bool = env_parsed("MAILCRUCIBLE_PROXY_PROTOCOL", false)?;
        let shutdown_grace_secs: u64 = env_parsed("MAILCRUCIBLE_SHUTDOWN_GRACE_SECS", 30)?;
        let max_message_size: usize = env_parsed("MAILCRUCIBLE_MAX_MESSAGE_SIZE", 25 * 1024 * 1024)?;
        let session_timeout_secs: u64 = env_parsed("MAILCRUCIBLE_SESSION_TIMEOUT_SECS", 300)?;

        let tls_cert_path = env::var("MAILCRUCIBLE_TLS_CERT_PATH").ok();
        let tls_key_path = env::var("MAILCRUCIBLE_TLS_KEY_PATH").ok();

        let auth_enabled: bool = env_parsed("MAILCRUCIBLE_AUTH_ENABLED", false)?;
        let allow_plaintext_without_tls: bool = env_parsed("MAILCRUCIBLE_ALLOW_PLAINTEXT_AUTH", false)?;
        let auth_users = split_nonempty(&env_or_default("MAILCRUCIBLE_AUTH_USERS", ""), ',')
            .into_iter()
            .filter_map(|pair| pair.split_once(':').map(|(u, p)| (u.to_string(), p.to_string())))
            .collect();

        let relay_mode_str = env_or_default("MAILCRUCIBLE_RELAY_MODE", "mx");
        let relay_port: u16 = env_parsed("MAILCRUCIBLE_RELAY_PORT", 25)?;
        let relay_mode = match relay_mode_str.as_str() {
            "static" => {
                let host = match env::var("MAILCRUCIBLE_RELAY_HOST") {
                    Ok(val) => val,
                    Err(e) => {
                        let err_msg = "MAILCRUCIBLE_RELAY_HOST is required when MAILCRUCIBLE_RELAY_MODE=static";
                        log::error!("{err_msg}: {e}");
                        return Err(anyhow!(e).context(err_msg));
                    }
                };
                RelayMode::Static { host, port: relay_port }
            }
            "mx" => RelayMode::Mx { port: relay_port },
            other => {
                let err_msg = format!("MAILCRUCIBLE_RELAY_MODE ('{other}') must be 'static' or 'mx'");
                log::error!("{err_msg}");
                return Err(anyhow!(err_msg));
            }
        };

        let relay_concurrent_connections: usize = env_parsed("MAILCRUCIBLE_RELAY_CONCURRENT_CONNECTIONS", 4)?;
        let relay_idle_timeout_secs: u64 = env_parsed("MAILCRUCIBLE_RELAY_IDLE_TIMEOUT_SECS", 60)?;
        let relay_forced_hosts: HashMap<String, String> = split_nonempty(&env_or_default("MAILCRUCIBLE_RELAY_FORCED_HOSTS", ""), ',')
            .into_iter()
            .filter_map(|pair| pair.split_once('=').map(|(d, h)| (d.to_lowercase(), h.to_string())))
            .collect();

        let storage_backend_str = env_or_default("MAILCRUCIBLE_STORAGE_BACKEND", "memory");
        let storage_backend = match storage_backend_str.as_str() {
            "memory" => StorageBackend::Memory,
            "filesystem" => StorageBackend::Filesystem {
                root: env_or_default("MAILCRUCIBLE_STORAGE_ROOT", "./mailcrucible-queue"),
            },
            other => {
                let err_msg = format!("MAILCRUCIBLE_STORAGE_BACKEND ('{other}') must be 'memory' or 'filesystem'");
                log::error!("{err_msg}");
                return Err(anyhow!(err_msg));
            }
        };

        let forward_rules = split_nonempty(&env_or_default("MAILCRUCIBLE_FORWARD_RULES", ""), ';')
            .into_iter()
            .filter_map(|pair| pair.split_once('=').map(|(p, r)| (p.to_string(), r.to_string())))
            .collect();
        let split_per_recipient: bool = env_parsed("MAILCRUCIBLE_SPLIT_PER_RECIPIENT", false)?;

        let http_edge_bind_address = env::var("MAILCRUCIBLE_HTTP_EDGE_BIND_ADDRESS").ok();
        let http_edge_port: u16 = env_parsed("MAILCRUCIBLE_HTTP_EDGE_PORT", 8025)?;

        let health_check_bind_address = env_or_default("MAILCRUCIBLE_HEALTH_BIND_ADDRESS", "0.0.0.0");
        let health_check_port: u16 = env_parsed("MAILCRUCIBLE_HEALTH_PORT", 8080)?;

        Ok(Config {
            hostname,
            smtp_bind_addresses,
            max_connections,
            proxy_protocol,
            shutdown_grace_secs,
            max_message_size,
            session_timeout_secs,
            tls_cert_path,
            tls_key_path,
            auth_enabled,
            allow_plaintext_without_tls,
            auth_users,
            relay_mode,
            relay_concurrent_connections,
            relay_idle_timeout_secs,
            relay_forced_hosts,
            storage_backend,
            forward_rules,
            split_per_recipient,
            http_edge_bind_address,
            http_edge_port,
            health_check_bind_address,
            health_check_port,
        })
    }
}

// The inline tests module has been moved to src/config/tests.rs
// and is included via `mod tests;` below.

// Include the tests defined in tests.rs
mod tests;
