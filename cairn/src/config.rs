use std::path::{absolute, PathBuf};
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use figment::providers::{Env, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// Default port of the propagation listener.
pub const DEFAULT_BIND_PORT: u16 = 4159;

/// How long an upload session may sit idle before its staging area is
/// reclaimed.
pub const DEFAULT_SESSION_TTL_SECS: u64 = 5 * 60;

/// Lifetime of an issued, unused file nonce.
pub const DEFAULT_NONCE_TTL_SECS: u64 = 10 * 60;

/// Lifetime of a cached write-permission answer.
pub const DEFAULT_OWNER_CACHE_TTL_SECS: u64 = 3 * 60;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Base directory holding the store tree and session staging areas.
    pub base_dir: PathBuf,
    pub bind_host: String,
    pub bind_port: u16,

    /// PEM certificate and key for the TLS listener. Both or neither; a
    /// pair that cannot be loaded aborts startup.
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,

    /// Endpoint of the datastore metadata service (root history, write
    /// permissions, creation heights).
    pub meta_endpoint: Option<String>,

    /// Basic-auth credentials required to create a store that does not yet
    /// exist on disk.
    pub store_owner: Option<OwnerCredentials>,

    pub session_ttl_secs: u64,
    pub nonce_ttl_secs: u64,
    pub owner_cache_ttl_secs: u64,

    #[serde(flatten)]
    pub rate_limits: RateLimitConfig,

    pub log_level: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OwnerCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub upload_start_max: u64,
    pub upload_start_window_secs: u64,
    pub fetch_max: u64,
    pub fetch_window_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("cairn-data"),
            bind_host: "0.0.0.0".to_string(),
            bind_port: DEFAULT_BIND_PORT,
            tls_cert: None,
            tls_key: None,
            meta_endpoint: None,
            store_owner: None,
            session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
            nonce_ttl_secs: DEFAULT_NONCE_TTL_SECS,
            owner_cache_ttl_secs: DEFAULT_OWNER_CACHE_TTL_SECS,
            rate_limits: RateLimitConfig::default(),
            log_level: None,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            upload_start_max: 10,
            upload_start_window_secs: 15 * 60,
            fetch_max: 100,
            fetch_window_secs: 15 * 60,
        }
    }
}

impl Config {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn nonce_ttl(&self) -> Duration {
        Duration::from_secs(self.nonce_ttl_secs)
    }

    pub fn owner_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.owner_cache_ttl_secs)
    }
}

#[derive(Parser, Serialize, Debug)]
#[command(
    name = "cairn",
    about = "Content propagation server for a decentralized datastore network",
    long_about = None,
    version
)]
struct Cli {
    /// Bind port of the HTTP(S) listener.
    #[arg(short = 'p', long, value_name = "PORT")]
    #[serde(skip_serializing_if = "Option::is_none")]
    bind_port: Option<u16>,

    /// Bind address of the HTTP(S) listener.
    #[arg(long, value_name = "ADDR")]
    #[serde(skip_serializing_if = "Option::is_none")]
    bind_host: Option<String>,

    /// Base directory for stores and session staging areas.
    #[arg(short = 'd', long, value_name = "PATH")]
    #[serde(skip_serializing_if = "Option::is_none")]
    base_dir: Option<PathBuf>,

    /// Path to the PEM-encoded TLS certificate.
    #[arg(long, value_name = "PATH")]
    #[serde(skip_serializing_if = "Option::is_none")]
    tls_cert: Option<PathBuf>,

    /// Path to the PEM-encoded TLS private key.
    #[arg(long, value_name = "PATH")]
    #[serde(skip_serializing_if = "Option::is_none")]
    tls_key: Option<PathBuf>,

    /// Endpoint of the datastore metadata service.
    #[arg(short = 'm', long, value_name = "URL")]
    #[serde(skip_serializing_if = "Option::is_none")]
    meta_endpoint: Option<String>,

    /// Log filter, either a level for the node or a full tracing directive.
    #[arg(short = 'l', long, value_name = "FILTER")]
    #[serde(skip_serializing_if = "Option::is_none")]
    log_level: Option<String>,
}

/// Layered configuration: hard defaults, then `CAIRN_*` environment
/// variables, then command-line flags.
pub fn load_config() -> Result<Config> {
    let mut config: Config = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Env::prefixed("CAIRN_"))
        .merge(Serialized::defaults(Cli::parse()))
        .extract()?;

    config.base_dir = absolute(&config.base_dir)?;
    Ok(config)
}
