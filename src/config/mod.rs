
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level configuration record for the admin server.
///
/// Every field has a serde default so a partial JSON document (or
/// `ServerConfig::default()`) yields a runnable configuration; `validate`
/// is called once at startup and refuses nonsense before any socket is
/// opened.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_thread_pool_size")]
    pub thread_pool_size: usize,

    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    #[serde(default = "default_max_requests_per_session")]
    pub max_requests_per_session: u32,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    #[serde(default)]
    pub cipher: CipherConfig,
    #[serde(default)]
    pub key_store: KeyStoreConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default = "default_event_inbox_capacity")]
    pub event_inbox_capacity: usize,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct CipherConfig {
    #[serde(default = "default_true")]
    pub enable_production: bool,
    #[serde(default)]
    pub enable_legacy: bool,
    #[serde(default)]
    pub enable_null: bool,
}

/// Which backend the key store resolves identities against.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeyStoreConfig {
    /// Identities and hex keys given inline.
    Memory {
        #[serde(default)]
        entries: HashMap<String, String>,
    },
    /// `identity: hexkey` lines, reloadable at runtime.
    File { path: PathBuf },
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    #[serde(default = "default_capacity_scripts")]
    pub capacity_scripts: usize,
    #[serde(default = "default_capacity_bytes")]
    pub capacity_bytes: usize,
    /// Applied to scripts enqueued without an explicit expiry. `None`
    /// means scripts never expire.
    #[serde(default)]
    pub default_ttl_ms: Option<u64>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct SecurityConfig {
    #[serde(default = "default_mismatch_window_ms")]
    pub mismatch_window_ms: u64,
    #[serde(default = "default_mismatch_threshold")]
    pub mismatch_threshold: usize,
    #[serde(default = "default_failure_window_ms")]
    pub failure_window_ms: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,
    #[serde(default = "default_error_window_ms")]
    pub error_window_ms: u64,
    #[serde(default = "default_error_threshold")]
    pub error_threshold: usize,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

fn default_host() -> String {
    "0.0.0.0".to_owned()
}
fn default_port() -> u16 {
    8443
}
fn default_max_connections() -> usize {
    100
}
fn default_thread_pool_size() -> usize {
    10
}
fn default_handshake_timeout_ms() -> u64 {
    30_000
}
fn default_read_timeout_ms() -> u64 {
    30_000
}
fn default_session_timeout_ms() -> u64 {
    300_000
}
fn default_max_requests_per_session() -> u32 {
    256
}
fn default_shutdown_grace_ms() -> u64 {
    5_000
}
fn default_event_inbox_capacity() -> usize {
    1024
}
fn default_true() -> bool {
    true
}
fn default_capacity_scripts() -> usize {
    64
}
fn default_capacity_bytes() -> usize {
    1_048_576
}
fn default_mismatch_window_ms() -> u64 {
    60_000
}
fn default_mismatch_threshold() -> usize {
    3
}
fn default_failure_window_ms() -> u64 {
    60_000
}
fn default_failure_threshold() -> usize {
    10
}
fn default_error_window_ms() -> u64 {
    300_000
}
fn default_error_threshold() -> usize {
    10
}
fn default_max_header_bytes() -> usize {
    8192
}
fn default_max_body_bytes() -> usize {
    65_536
}
fn default_content_type() -> String {
    "application/vnd.etsi.sct".to_owned()
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            thread_pool_size: default_thread_pool_size(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            session_timeout_ms: default_session_timeout_ms(),
            max_requests_per_session: default_max_requests_per_session(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            cipher: CipherConfig::default(),
            key_store: KeyStoreConfig::default(),
            queue: QueueConfig::default(),
            security: SecurityConfig::default(),
            http: HttpConfig::default(),
            event_inbox_capacity: default_event_inbox_capacity(),
        }
    }
}

impl Default for CipherConfig {
    fn default() -> Self {
        CipherConfig {
            enable_production: true,
            enable_legacy: false,
            enable_null: false,
        }
    }
}

impl Default for KeyStoreConfig {
    fn default() -> Self {
        KeyStoreConfig::Memory {
            entries: HashMap::new(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            capacity_scripts: default_capacity_scripts(),
            capacity_bytes: default_capacity_bytes(),
            default_ttl_ms: None,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        SecurityConfig {
            mismatch_window_ms: default_mismatch_window_ms(),
            mismatch_threshold: default_mismatch_threshold(),
            failure_window_ms: default_failure_window_ms(),
            failure_threshold: default_failure_threshold(),
            error_window_ms: default_error_window_ms(),
            error_threshold: default_error_threshold(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            max_header_bytes: default_max_header_bytes(),
            max_body_bytes: default_max_body_bytes(),
            content_type: default_content_type(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())
            .map_err(|e| Error::ErrConfigInvalid(format!("read config: {e}")))?;
        let cfg: ServerConfig = serde_json::from_str(&raw)
            .map_err(|e| Error::ErrConfigInvalid(format!("parse config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.cipher.enable_production && !self.cipher.enable_legacy && !self.cipher.enable_null
        {
            return Err(Error::ErrConfigInvalid(
                "no cipher suite tier is enabled".to_owned(),
            ));
        }
        if self.max_connections == 0 {
            return Err(Error::ErrConfigInvalid(
                "max_connections must be at least 1".to_owned(),
            ));
        }
        if self.thread_pool_size == 0 {
            return Err(Error::ErrConfigInvalid(
                "thread_pool_size must be at least 1".to_owned(),
            ));
        }
        if self.max_requests_per_session == 0 {
            return Err(Error::ErrConfigInvalid(
                "max_requests_per_session must be at least 1".to_owned(),
            ));
        }
        if self.queue.capacity_scripts == 0 || self.queue.capacity_bytes == 0 {
            return Err(Error::ErrConfigInvalid(
                "queue capacities must be at least 1".to_owned(),
            ));
        }
        if self.security.mismatch_threshold == 0
            || self.security.failure_threshold == 0
            || self.security.error_threshold == 0
        {
            return Err(Error::ErrConfigInvalid(
                "security thresholds must be at least 1".to_owned(),
            ));
        }
        if self.http.max_header_bytes == 0 || self.http.max_body_bytes == 0 {
            return Err(Error::ErrConfigInvalid(
                "http limits must be at least 1".to_owned(),
            ));
        }
        if self.http.content_type.is_empty() {
            return Err(Error::ErrConfigInvalid(
                "http content_type must not be empty".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl QueueConfig {
    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl_ms.map(Duration::from_millis)
    }
}

impl SecurityConfig {
    pub fn mismatch_window(&self) -> Duration {
        Duration::from_millis(self.mismatch_window_ms)
    }

    pub fn failure_window(&self) -> Duration {
        Duration::from_millis(self.failure_window_ms)
    }

    pub fn error_window(&self) -> Duration {
        Duration::from_millis(self.error_window_ms)
    }
}
