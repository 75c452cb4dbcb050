// SPDX-License-Identifier: MIT
//! Configuration lifecycle (spec §3 "Config snapshot", §4.5, §6 YAML root
//! keys). Derive-heavy `serde` structs mirroring the closest reference
//! tunnel config in this pack (a QUIC tunnel's `ServerConfig`/`ClientConfig`),
//! parsed from YAML with `serde_yaml` per §6.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{Result, SsError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Server,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Quic,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub enum TlsVersion {
    #[serde(rename = "1.2")]
    V1_2,
    #[serde(rename = "1.3")]
    V1_3,
}

impl TlsVersion {
    fn ordinal(self) -> u8 {
        match self {
            TlsVersion::V1_2 => 2,
            TlsVersion::V1_3 => 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    pub interface: Option<String>,
    pub address: String,
    pub mtu: u32,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default)]
    pub routes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TunnelConfig {
    #[serde(default)]
    pub listen_address: Option<String>,
    #[serde(default)]
    pub listen_port: Option<u16>,
    #[serde(default)]
    pub server_address: Option<String>,
    #[serde(default)]
    pub server_port: Option<u16>,
    pub protocol: Protocol,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub ca_file: PathBuf,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    pub mtu: u32,
    #[serde(default)]
    pub compression: bool,
    #[serde(default = "default_keepalive")]
    pub keepalive: u64,
    #[serde(default)]
    pub upload_kbps: Option<u64>,
    #[serde(default)]
    pub download_kbps: Option<u64>,
}

fn default_max_clients() -> usize {
    100
}

fn default_keepalive() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CertRotationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_rotation_interval_secs")]
    pub interval: u64,
}

fn default_rotation_interval_secs() -> u64 {
    12 * 3600
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsSecurityConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub ca_file: PathBuf,
    pub min_version: TlsVersion,
    pub max_version: TlsVersion,
    #[serde(default)]
    pub ciphers: Vec<String>,
    #[serde(default)]
    pub cert_rotation: CertRotationConfig,
}

impl Default for CertRotationConfig {
    fn default() -> Self {
        CertRotationConfig {
            enabled: false,
            interval: default_rotation_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecurityConfig {
    pub tls: TlsSecurityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_monitor_type")]
    pub r#type: String,
    #[serde(default = "default_monitor_interval")]
    pub interval: u64,
}

fn default_monitor_type() -> String {
    "log".to_string()
}

fn default_monitor_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default = "default_log_output")]
    pub output: String,
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub startup_logs: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_log_output() -> String {
    "stdout".to_string()
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ThrottleConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rate: u64,
    #[serde(default)]
    pub burst: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InnerConfig {
    pub mode: Mode,
    pub state_dir: PathBuf,
    pub log_dir: PathBuf,
    pub network: NetworkConfig,
    pub tunnel: TunnelConfig,
    pub security: SecurityConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            enabled: true,
            r#type: default_monitor_type(),
            interval: default_monitor_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
            output: default_log_output(),
            file: None,
            startup_logs: false,
        }
    }
}

/// Root of the YAML config file (§6).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Document {
    pub r#type: Mode,
    pub version: String,
    #[serde(default)]
    pub metadata: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub throttle: ThrottleConfig,
    pub config: InnerConfig,
}

/// An environment this tunnel runs in, used only to enforce the
/// "production requires TLS 1.3" validation rule (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

const ALLOWED_CIPHERS: &[&str] = &[
    "TLS13_AES_256_GCM_SHA384",
    "TLS13_AES_128_GCM_SHA256",
    "TLS13_CHACHA20_POLY1305_SHA256",
    "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
    "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
];

/// Validate a parsed document against §4.5's rule set, rejecting with the
/// first specific failure encountered.
pub fn validate(doc: &Document, env: Environment) -> Result<()> {
    let invalid = |reason: String| SsError::ConfigInvalid { reason };

    if doc.config.tunnel.protocol != Protocol::Tcp {
        return Err(invalid(
            "protocol: udp/quic are reserved, only tcp is implemented".into(),
        ));
    }

    if !(576..=65535).contains(&doc.config.tunnel.mtu) {
        return Err(invalid(format!(
            "mtu {} out of range [576, 65535]",
            doc.config.tunnel.mtu
        )));
    }
    if !(576..=65535).contains(&doc.config.network.mtu) {
        return Err(invalid(format!(
            "network.mtu {} out of range [576, 65535]",
            doc.config.network.mtu
        )));
    }

    if let Some(port) = doc.config.tunnel.listen_port {
        if port == 0 {
            return Err(invalid("port must be in [1, 65535]".into()));
        }
    }
    if let Some(port) = doc.config.tunnel.server_port {
        if port == 0 {
            return Err(invalid("port must be in [1, 65535]".into()));
        }
    }

    let tls = &doc.config.security.tls;
    if tls.min_version.ordinal() > tls.max_version.ordinal() {
        return Err(invalid("tls.max_version must be >= tls.min_version".into()));
    }
    if env == Environment::Production && tls.min_version != TlsVersion::V1_3 {
        return Err(invalid(
            "production environment requires tls.min_version = 1.3".into(),
        ));
    }
    for cipher in &tls.ciphers {
        if !ALLOWED_CIPHERS.contains(&cipher.as_str()) {
            return Err(invalid(format!(
                "cipher suite {cipher} is not in the AEAD ECDHE allow-list"
            )));
        }
    }

    if doc.throttle.enabled {
        const KIB: u64 = 1024;
        const GIB: u64 = 1024 * 1024 * 1024;
        if !(KIB..=GIB).contains(&doc.throttle.rate) {
            return Err(invalid(format!(
                "throttle.rate {} out of range [1 KiB/s, 1 GiB/s]",
                doc.throttle.rate
            )));
        }
        if doc.throttle.rate > 0 && doc.throttle.burst / doc.throttle.rate.max(1) > 10 {
            return Err(invalid("throttle.burst/rate must be <= 10".into()));
        }
    }

    validate_cert_path(&tls.cert_file, &[".crt", ".pem"])?;
    validate_cert_path(&tls.ca_file, &[".crt", ".pem"])?;
    validate_cert_path(&tls.key_file, &[".key", ".pem"])?;

    if doc.config.tunnel.compression {
        tracing::warn!("compression is accepted but not wired to a codec; ignoring");
    }

    Ok(())
}

fn validate_cert_path(path: &Path, allowed_suffixes: &[&str]) -> Result<()> {
    let s = path.to_string_lossy();
    if s.contains("..") || s.contains("//") {
        return Err(SsError::ConfigInvalid {
            reason: format!("path {s} must not contain '..' or '//'"),
        });
    }
    if !allowed_suffixes.iter().any(|suf| s.ends_with(suf)) {
        return Err(SsError::ConfigInvalid {
            reason: format!("path {s} must end in one of {allowed_suffixes:?}"),
        });
    }
    Ok(())
}

/// Load and validate a YAML config file (§4.5 `load()`).
pub fn load(path: &Path, env: Environment) -> Result<Document> {
    let raw = std::fs::read_to_string(path).map_err(SsError::Io)?;
    let doc: Document = serde_yaml::from_str(&raw).map_err(|e| SsError::ConfigInvalid {
        reason: format!("YAML parse error: {e}"),
    })?;
    validate(&doc, env)?;
    Ok(doc)
}

/// An immutable snapshot observed by watchers (§3 "Config snapshot").
pub type Snapshot = std::sync::Arc<Document>;

/// The `watch()` side of §4.5: a `tokio::sync::watch` channel, inherently
/// latest-wins (Design Notes "hot-reload propagation"). New subscribers
/// immediately observe the current snapshot.
pub struct ConfigStore {
    tx: watch::Sender<Snapshot>,
    env: Environment,
}

impl ConfigStore {
    pub fn new(initial: Document, env: Environment) -> Self {
        let (tx, _rx) = watch::channel(std::sync::Arc::new(initial));
        ConfigStore { tx, env }
    }

    pub fn current(&self) -> Snapshot {
        self.tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Snapshot> {
        self.tx.subscribe()
    }

    /// `set/update(snapshot)`: re-validate, then publish (§4.5). Slow
    /// watchers naturally see only the latest value via `watch::Sender`.
    pub fn update(&self, doc: Document) -> Result<()> {
        validate(&doc, self.env)?;
        self.tx.send_replace(std::sync::Arc::new(doc));
        Ok(())
    }
}
