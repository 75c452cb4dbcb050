// SPDX-License-Identifier: MIT
//! Supervisor (spec §3 C8): owns process lifecycle, signal handling, the
//! PID file, and hot-reload wiring between the config watcher and the
//! running sessions' limiters (§4 "Hot reload").

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::cert::CertManager;
use crate::config::{ConfigStore, Document, Environment};
use crate::error::{Result, SsError};
use crate::ipc::IpcState;
use crate::limiter::tokio_util_notify::CancelToken;
use crate::limiter::{Direction, Limiter};
use crate::logging::StartupLog;
use crate::monitor::Monitor;

/// A session's rate limiter, registered here so `reload()` can push
/// `update(rate, burst)` into every live session without disturbing its
/// MTU or TUN adapter (§4 "Hot reload": "MTU and address changes do not
/// disturb existing sessions").
#[derive(Clone)]
pub struct LimiterRegistry {
    inner: Arc<Mutex<Vec<std::sync::Weak<Limiter>>>>,
}

impl Default for LimiterRegistry {
    fn default() -> Self {
        LimiterRegistry {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl LimiterRegistry {
    pub async fn register(&self, limiter: &Arc<Limiter>) {
        let mut guard = self.inner.lock().await;
        guard.retain(|w| w.strong_count() > 0);
        guard.push(Arc::downgrade(limiter));
    }

    /// Push a fresh `(rate, burst)` pair to every still-alive session
    /// limiter, both directions (§4.1 `update` is idempotent and atomic
    /// per bucket, so concurrent sessions observe it cleanly).
    async fn broadcast(&self, in_rate: f64, in_burst: f64, out_rate: f64, out_burst: f64) {
        let guard = self.inner.lock().await;
        for weak in guard.iter() {
            if let Some(limiter) = weak.upgrade() {
                limiter.update(Direction::Inbound, in_rate, in_burst).await;
                limiter.update(Direction::Outbound, out_rate, out_burst).await;
            }
        }
    }
}

/// Everything the daemon binary wires up in one place, per SPEC_FULL.md
/// §4.9 ("C9 is the thing that actually invokes C1-C8").
pub struct Supervisor {
    pub config: Arc<ConfigStore>,
    pub monitor: Monitor,
    pub cert_manager: Arc<CertManager>,
    pub limiters: LimiterRegistry,
    pub shutdown: CancelToken,
    state_dir: PathBuf,
    env: Environment,
}

impl Supervisor {
    pub fn new(initial: Document, env: Environment, cert_manager: CertManager) -> Self {
        let state_dir = initial.config.state_dir.clone();
        Supervisor {
            config: Arc::new(ConfigStore::new(initial, env)),
            monitor: Monitor::default(),
            cert_manager: Arc::new(cert_manager),
            limiters: LimiterRegistry::default(),
            shutdown: CancelToken::default(),
            state_dir,
            env,
        }
    }

    /// Write `<state_dir>/sssonector.pid` (§6 "Persisted state").
    pub fn write_pid_file(&self) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir).map_err(SsError::Io)?;
        let pid = std::process::id();
        std::fs::write(self.state_dir.join("sssonector.pid"), pid.to_string())
            .map_err(SsError::Io)
    }

    pub fn remove_pid_file(&self) {
        let _ = std::fs::remove_file(self.state_dir.join("sssonector.pid"));
    }

    /// Re-read and validate the config file at `path`, publish the new
    /// snapshot, then broadcast its throttle rate/burst to every live
    /// session (§4 "Hot reload"). A validation failure here is logged and
    /// the previous snapshot stays in effect (§7: "ConfigInvalid ... fatal
    /// at startup; refuse reload").
    pub async fn reload(&self, path: &std::path::Path) -> Result<()> {
        let doc = crate::config::load(path, self.env)?;
        let throttle = doc.throttle.clone();
        self.config.update(doc)?;

        if throttle.enabled {
            let burst = throttle.burst as f64;
            self.limiters
                .broadcast(
                    throttle.rate as f64,
                    burst,
                    throttle.rate as f64,
                    burst,
                )
                .await;
        }

        info!("configuration reloaded");
        Ok(())
    }

    pub fn ipc_state(&self) -> Arc<IpcState> {
        Arc::new(IpcState {
            monitor: self.monitor.clone(),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
            reload: tokio::sync::Notify::new(),
        })
    }

    /// Run until SIGINT/SIGTERM (clean shutdown) or SIGHUP (reload), per
    /// §6 "Signals". Unix-only: signal handling is an OS concern the
    /// teacher crate also gates behind `cfg(unix)` in its own service
    /// entry points.
    #[cfg(unix)]
    pub async fn run_signal_loop(&self, config_path: std::path::PathBuf) -> Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt()).map_err(SsError::Io)?;
        let mut sigterm = signal(SignalKind::terminate()).map_err(SsError::Io)?;
        let mut sighup = signal(SignalKind::hangup()).map_err(SsError::Io)?;

        loop {
            tokio::select! {
                _ = sigint.recv() => {
                    info!("received SIGINT, shutting down");
                    self.shutdown.cancel();
                    return Ok(());
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down");
                    self.shutdown.cancel();
                    return Ok(());
                }
                _ = sighup.recv() => {
                    info!("received SIGHUP, reloading config");
                    if let Err(e) = self.reload(&config_path).await {
                        warn!(error = %e, "config reload failed, keeping previous snapshot");
                    }
                }
                _ = self.shutdown.cancelled() => {
                    return Ok(());
                }
            }
        }
    }

    pub fn startup_log(&self) -> Result<StartupLog> {
        let doc = self.config.current();
        StartupLog::open(&doc.config.log_dir, matches!(doc.config.mode, crate::config::Mode::Server))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::*;

    fn doc_with_state_dir(dir: &std::path::Path) -> Document {
        Document {
            r#type: Mode::Server,
            version: "1.0.0".into(),
            metadata: Default::default(),
            throttle: ThrottleConfig::default(),
            config: InnerConfig {
                mode: Mode::Server,
                state_dir: dir.to_path_buf(),
                log_dir: dir.to_path_buf(),
                network: NetworkConfig {
                    interface: None,
                    address: "10.0.0.1/24".into(),
                    mtu: 1500,
                    dns: vec![],
                    routes: vec![],
                },
                tunnel: TunnelConfig {
                    listen_address: Some("0.0.0.0".into()),
                    listen_port: Some(8443),
                    server_address: None,
                    server_port: None,
                    protocol: Protocol::Tcp,
                    cert_file: "server.crt".into(),
                    key_file: "server.key".into(),
                    ca_file: "ca.crt".into(),
                    max_clients: 100,
                    mtu: 1500,
                    compression: false,
                    keepalive: 30,
                    upload_kbps: None,
                    download_kbps: None,
                },
                security: SecurityConfig {
                    tls: TlsSecurityConfig {
                        cert_file: "server.crt".into(),
                        key_file: "server.key".into(),
                        ca_file: "ca.crt".into(),
                        min_version: TlsVersion::V1_2,
                        max_version: TlsVersion::V1_3,
                        ciphers: vec![],
                        cert_rotation: CertRotationConfig::default(),
                    },
                },
                monitor: MonitorConfig::default(),
                logging: LoggingConfig::default(),
            },
        }
    }

    #[test]
    fn pid_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let ca = crate::cert::generate_ca(dir.path()).unwrap();
        let leaf =
            crate::cert::generate_end_entity("sssonector", dir.path(), true, &ca).unwrap();
        let supervisor = Supervisor::new(
            doc_with_state_dir(dir.path()),
            Environment::Development,
            CertManager::new(leaf, ca.record),
        );
        supervisor.write_pid_file().unwrap();
        let contents = std::fs::read_to_string(dir.path().join("sssonector.pid")).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
        supervisor.remove_pid_file();
        assert!(!dir.path().join("sssonector.pid").exists());
    }
}
