//! Updater configuration.
//!
//! Loaded from TOML. Every field has a default so a minimal file only needs
//! `feed_url` and one entry in `security.public_keys`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};

use crate::download::{DownloaderConfig, RetryPolicy};
use crate::error::UpdateError;
use crate::transport::{TransportConfig, DEFAULT_MAX_FEED_BYTES};
use crate::verify::{TrustVerifier, UnsignedPolicy};

/// Main updater configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// Feed document URL
    #[serde(default)]
    pub feed_url: String,

    /// Application path the installer relaunches
    #[serde(default)]
    pub relaunch_path: Option<PathBuf>,

    /// Directory for downloaded payloads (empty = default location)
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,

    /// Send platform, OS and application versions with the feed request
    #[serde(default)]
    pub send_system_profile: bool,

    /// Security configuration
    #[serde(default)]
    pub security: SecurityConfig,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl UpdaterConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, UpdateError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, UpdateError> {
        toml::from_str(content).map_err(|e| UpdateError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), UpdateError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| UpdateError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the staging directory, using the default if not specified.
    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(default_staging_dir)
    }

    /// Build the trust verifier from the pinned keys and unsigned policy.
    pub fn trust_verifier(&self) -> Result<TrustVerifier, UpdateError> {
        let keys = self.security.parse_public_keys()?;
        let policy = if self.security.allow_unsigned {
            UnsignedPolicy::Permit
        } else {
            UnsignedPolicy::Reject
        };
        Ok(TrustVerifier::new(keys).with_unsigned_policy(policy))
    }

    /// Downloader settings.
    pub fn downloader_config(&self) -> DownloaderConfig {
        DownloaderConfig {
            retry: RetryPolicy {
                max_attempts: self.network.max_attempts,
                initial_backoff: Duration::from_millis(self.network.initial_backoff_ms),
                max_backoff: Duration::from_millis(self.network.max_backoff_ms),
            },
            allow_insecure_http: self.network.allow_insecure_http,
        }
    }

    /// HTTP client settings.
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout: Duration::from_secs(self.network.timeout_seconds),
            read_timeout: Duration::from_secs(self.network.read_timeout_seconds),
            user_agent: self.network.user_agent.clone(),
            max_feed_bytes: self.network.max_feed_bytes,
        }
    }
}

/// Security configuration for payload verification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Pinned public keys (Ed25519, hex or base64 encoded)
    /// Format: "ed25519:<hex_or_base64_public_key>"
    #[serde(default)]
    pub public_keys: Vec<String>,

    /// Accept payloads that carry no signature
    #[serde(default)]
    pub allow_unsigned: bool,
}

impl SecurityConfig {
    /// Parse the pinned keys into Ed25519 verifying keys.
    pub fn parse_public_keys(&self) -> Result<Vec<VerifyingKey>, UpdateError> {
        self.public_keys.iter().map(|k| parse_ed25519_key(k)).collect()
    }
}

/// Parse an Ed25519 public key from string format.
///
/// Supports formats:
/// - "ed25519:<hex_encoded_32_bytes>"
/// - "ed25519:<base64_encoded_32_bytes>"
pub fn parse_ed25519_key(s: &str) -> Result<VerifyingKey, UpdateError> {
    let encoded = s
        .strip_prefix("ed25519:")
        .ok_or_else(|| UpdateError::Config("key must start with 'ed25519:'".to_string()))?;

    let key_data = match hex::decode(encoded) {
        Ok(bytes) => bytes,
        Err(_) => base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| UpdateError::Config(format!("invalid key encoding: {}", e)))?,
    };

    let key_bytes: [u8; 32] = key_data.try_into().map_err(|_| {
        UpdateError::Config("Ed25519 public key must be 32 bytes".to_string())
    })?;

    VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| UpdateError::Config(format!("invalid Ed25519 public key: {}", e)))
}

/// Network configuration for feed and payload requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Connect timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Read timeout for streamed bodies in seconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_seconds: u64,

    /// Attempts per download, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First retry delay in milliseconds
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Retry delay ceiling in milliseconds
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// User agent string
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Accept plain `http` feed and payload URLs
    #[serde(default)]
    pub allow_insecure_http: bool,

    /// Largest feed document accepted, in bytes
    #[serde(default = "default_max_feed_bytes")]
    pub max_feed_bytes: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout(),
            read_timeout_seconds: default_read_timeout(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            user_agent: default_user_agent(),
            allow_insecure_http: false,
            max_feed_bytes: default_max_feed_bytes(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
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

// Default value functions for serde
fn default_timeout() -> u64 {
    30
}

fn default_read_timeout() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    4
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    30_000
}

fn default_max_feed_bytes() -> u64 {
    DEFAULT_MAX_FEED_BYTES
}

fn default_user_agent() -> String {
    format!("aircast-updater/{}", env!("CARGO_PKG_VERSION"))
}

fn default_log_level() -> String {
    "warn".to_string()
}

/// Get the default staging directory.
fn default_staging_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("LOCALAPPDATA") {
            return PathBuf::from(appdata).join("Aircast").join("updates");
        }
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Caches")
                .join("Aircast")
                .join("updates");
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(cache_home) = std::env::var("XDG_CACHE_HOME") {
            return PathBuf::from(cache_home).join("aircast").join("updates");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".cache")
                .join("aircast")
                .join("updates");
        }
    }

    std::env::temp_dir().join("aircast-updates")
}
