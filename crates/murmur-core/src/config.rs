//! Node configuration.
//!
//! Typed view of the YAML configuration file. Field names stay aligned with
//! the deployed `config.yaml` layout; derived values (decoded token key,
//! token lifetimes) are populated after parsing and validated once at load.

use crate::error::{Error, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Listen endpoints per transport.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListenConfig {
    /// TCP listen address, e.g. `0.0.0.0:4000`.
    #[serde(default)]
    pub tcp: String,
    /// QUIC listen address.
    #[serde(default)]
    pub quic: String,
}

/// TLS certificate paths for the public transports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM certificate chain path.
    #[serde(default)]
    pub cert_file: String,
    /// PEM private key path.
    #[serde(default)]
    pub key_file: String,
}

/// Which transports the node enables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportsConfig {
    /// Enable plain TCP.
    #[serde(default = "default_true")]
    pub enable_tcp: bool,
    /// Enable QUIC.
    #[serde(default = "default_true")]
    pub enable_quic: bool,
    /// Enable WebSocket over TLS.
    #[serde(default)]
    pub enable_wss: bool,
}

impl Default for TransportsConfig {
    fn default() -> Self {
        Self {
            enable_tcp: true,
            enable_quic: true,
            enable_wss: false,
        }
    }
}

/// Server-facing listener configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen endpoints.
    #[serde(default)]
    pub listen: ListenConfig,
    /// TLS material.
    #[serde(default)]
    pub tls: TlsConfig,
    /// Enabled transports.
    #[serde(default)]
    pub transports: TransportsConfig,
}

/// Adaptive routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Selection strategy name (only `adaptive` is implemented).
    #[serde(default = "default_strategy")]
    pub strategy: String,
    /// DHT bootstrap nodes as multiaddrs.
    #[serde(default)]
    pub bootstrap_nodes: Vec<String>,
    /// Static relay hop addresses.
    #[serde(default)]
    pub relays: Vec<String>,
    /// Latency threshold used to normalize latency/jitter scores.
    #[serde(default = "default_switch_threshold_ms")]
    pub switch_threshold_ms: u64,
    /// Metrics considered stale after this window.
    #[serde(default = "default_metrics_window_sec")]
    pub metrics_window_sec: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            bootstrap_nodes: Vec::new(),
            relays: Vec::new(),
            switch_threshold_ms: default_switch_threshold_ms(),
            metrics_window_sec: default_metrics_window_sec(),
        }
    }
}

/// Content store (IPFS) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpfsConfig {
    /// HTTP API endpoint of the content store.
    #[serde(default)]
    pub endpoint: String,
    /// Pin imported CARs after verification.
    #[serde(default = "default_true")]
    pub pinning_enabled: bool,
    /// Desired replication factor (advisory; enforced externally).
    #[serde(default = "default_replication")]
    pub replication_factor: u32,
}

impl Default for IpfsConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            pinning_enabled: true,
            replication_factor: default_replication(),
        }
    }
}

/// Argon2id parameters for the password verifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfConfig {
    /// Iterations.
    #[serde(default = "default_kdf_time")]
    pub time: u32,
    /// Memory in MiB.
    #[serde(default = "default_kdf_memory")]
    pub memory_mb: u32,
    /// Parallelism.
    #[serde(default = "default_kdf_threads")]
    pub threads: u32,
    /// Output length in bytes.
    #[serde(default = "default_kdf_key_len")]
    pub key_len: u32,
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            time: default_kdf_time(),
            memory_mb: default_kdf_memory(),
            threads: default_kdf_threads(),
            key_len: default_kdf_key_len(),
        }
    }
}

/// Access/refresh token parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Issuer embedded in and required from every access token.
    #[serde(default = "default_issuer")]
    pub issuer: String,
    /// Access token lifetime in minutes.
    #[serde(default = "default_token_lifetime_min")]
    pub lifetime_min: u64,
    /// Refresh token lifetime in days.
    #[serde(default = "default_refresh_days")]
    pub refresh_days: u64,
    /// Base64 of the 32-byte HMAC key.
    #[serde(default)]
    pub symmetric_key_base64: String,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            issuer: default_issuer(),
            lifetime_min: default_token_lifetime_min(),
            refresh_days: default_refresh_days(),
            symmetric_key_base64: String::new(),
        }
    }
}

/// Second-factor code parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecondaryKeyConfig {
    /// Code length in characters.
    #[serde(default = "default_secondary_length")]
    pub length: usize,
    /// Code rotation period in minutes.
    #[serde(default = "default_rotate_minutes")]
    pub rotate_minutes: u64,
    /// Allowed clock skew in seconds.
    #[serde(default = "default_clock_skew_sec")]
    pub allowed_clock_skew_sec: u64,
}

impl Default for SecondaryKeyConfig {
    fn default() -> Self {
        Self {
            length: default_secondary_length(),
            rotate_minutes: default_rotate_minutes(),
            allowed_clock_skew_sec: default_clock_skew_sec(),
        }
    }
}

/// Security section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Password KDF parameters.
    #[serde(default)]
    pub kdf: KdfConfig,
    /// Token parameters.
    #[serde(default)]
    pub token: TokenConfig,
    /// Second-factor parameters.
    #[serde(default)]
    pub secondary_key: SecondaryKeyConfig,
}

/// Database section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite DSN (path, or `:memory:` for tests).
    #[serde(default = "default_dsn")]
    pub dsn: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { dsn: default_dsn() }
    }
}

/// Logging section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `murmur_core=debug`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Top-level node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Listener configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Routing configuration.
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Content store configuration.
    #[serde(default)]
    pub ipfs: IpfsConfig,
    /// Security configuration.
    #[serde(default)]
    pub security: SecurityConfig,
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load and validate configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("read config: {}", e)))?;
        let config: Config = serde_yaml::from_str(&data)
            .map_err(|e| Error::Config(format!("parse yaml: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate derived fields without touching the filesystem.
    pub fn validate(&self) -> Result<()> {
        if !self.security.token.symmetric_key_base64.is_empty() {
            self.token_key()?;
        }
        if self.security.kdf.key_len < 16 {
            return Err(Error::Config("kdf key_len must be at least 16".into()));
        }
        Ok(())
    }

    /// Decoded 32-byte token HMAC key.
    pub fn token_key(&self) -> Result<[u8; 32]> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(&self.security.token.symmetric_key_base64)
            .map_err(|e| Error::Config(format!("decode token symmetric key: {}", e)))?;
        raw.try_into()
            .map_err(|_| Error::Config("token symmetric key must be 32 bytes".into()))
    }

    /// Access token lifetime.
    pub fn access_token_ttl(&self) -> Duration {
        Duration::from_secs(self.security.token.lifetime_min * 60)
    }

    /// Refresh token lifetime.
    pub fn refresh_token_ttl(&self) -> Duration {
        Duration::from_secs(self.security.token.refresh_days * 24 * 60 * 60)
    }

    /// Metrics staleness window.
    pub fn metrics_window(&self) -> Duration {
        Duration::from_secs(self.routing.metrics_window_sec)
    }

    /// Latency normalization threshold.
    pub fn switch_threshold(&self) -> Duration {
        Duration::from_millis(self.routing.switch_threshold_ms)
    }
}

fn default_true() -> bool {
    true
}
fn default_strategy() -> String {
    "adaptive".to_string()
}
fn default_switch_threshold_ms() -> u64 {
    200
}
fn default_metrics_window_sec() -> u64 {
    60
}
fn default_replication() -> u32 {
    3
}
fn default_kdf_time() -> u32 {
    1
}
fn default_kdf_memory() -> u32 {
    64
}
fn default_kdf_threads() -> u32 {
    1
}
fn default_kdf_key_len() -> u32 {
    32
}
fn default_issuer() -> String {
    "murmur".to_string()
}
fn default_token_lifetime_min() -> u64 {
    30
}
fn default_refresh_days() -> u64 {
    30
}
fn default_secondary_length() -> usize {
    8
}
fn default_rotate_minutes() -> u64 {
    5
}
fn default_clock_skew_sec() -> u64 {
    30
}
fn default_dsn() -> String {
    "murmur.db".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
