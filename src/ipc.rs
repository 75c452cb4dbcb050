// SPDX-License-Identifier: MIT
//! Local control-plane protocol (spec §6 "CLI surface", SPEC_FULL.md §4.9).
//!
//! One `IpcRequest` per line over a `UnixListener` bound inside `state_dir`;
//! one `IpcResponse` back, then the connection closes. No persistent
//! control sessions.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{error, warn};

use crate::config::ConfigStore;
use crate::error::{Result, SsError};
use crate::limiter::tokio_util_notify::CancelToken;
use crate::monitor::Monitor;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "command")]
pub enum IpcRequest {
    Status,
    Metrics,
    Reload,
    Stop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcResponse {
    pub ok: bool,
    pub mode: String,
    pub active_sessions: i64,
    pub total_sessions: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub uptime_secs: u64,
    pub message: Option<String>,
}

impl IpcResponse {
    fn from_monitor(mode: &str, monitor: &Monitor) -> Self {
        let snap = monitor.snapshot();
        IpcResponse {
            ok: true,
            mode: mode.to_string(),
            active_sessions: snap.active_sessions,
            total_sessions: snap.total_sessions,
            bytes_in: snap.bytes_in,
            bytes_out: snap.bytes_out,
            uptime_secs: snap.uptime_secs,
            message: None,
        }
    }

    fn error(mode: &str, message: String) -> Self {
        IpcResponse {
            ok: false,
            mode: mode.to_string(),
            active_sessions: 0,
            total_sessions: 0,
            bytes_in: 0,
            bytes_out: 0,
            uptime_secs: 0,
            message: Some(message),
        }
    }
}

/// Shared state the IPC listener reads from and acts on; owned by the
/// supervisor (C8), which is the only writer of `config`/`shutdown`.
pub struct IpcState {
    pub monitor: Monitor,
    pub config: Arc<ConfigStore>,
    pub shutdown: CancelToken,
    pub reload: tokio::sync::Notify,
}

/// Bind `<state_dir>/sssonector.ipc` and serve requests until `shutdown`
/// fires (SPEC_FULL.md §4.9: "one task per connection, bounded to
/// short-lived request/response exchanges").
pub async fn serve(state_dir: &Path, state: Arc<IpcState>) -> Result<()> {
    let socket_path = state_dir.join("sssonector.ipc");
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path).map_err(SsError::Io)?;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _addr) = accepted.map_err(SsError::Io)?;
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, &state).await {
                        warn!(error = %e, "ipc connection failed");
                    }
                });
            }
            _ = state.shutdown.cancelled() => {
                let _ = std::fs::remove_file(&socket_path);
                return Ok(());
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, state: &IpcState) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let Some(line) = lines.next_line().await.map_err(SsError::Io)? else {
        return Ok(());
    };

    let mode = state.config.current().config.mode;
    let mode_str = match mode {
        crate::config::Mode::Server => "server",
        crate::config::Mode::Client => "client",
    };

    let response = match serde_json::from_str::<IpcRequest>(&line) {
        Ok(IpcRequest::Status) | Ok(IpcRequest::Metrics) => {
            IpcResponse::from_monitor(mode_str, &state.monitor)
        }
        Ok(IpcRequest::Reload) => {
            state.reload.notify_waiters();
            IpcResponse::from_monitor(mode_str, &state.monitor)
        }
        Ok(IpcRequest::Stop) => {
            state.shutdown.cancel();
            IpcResponse::from_monitor(mode_str, &state.monitor)
        }
        Err(e) => {
            error!(error = %e, "ipc request parse error");
            IpcResponse::error(mode_str, format!("invalid request: {e}"))
        }
    };

    let mut body = serde_json::to_string(&response).map_err(|e| SsError::ConfigInvalid {
        reason: format!("failed to serialize ipc response: {e}"),
    })?;
    body.push('\n');
    write_half.write_all(body.as_bytes()).await.map_err(SsError::Io)?;
    Ok(())
}

/// `sssonectorctl`'s half of the protocol: connect, send one request,
/// read one response (SPEC_FULL.md §4.9).
pub async fn send_request(socket_path: &Path, request: IpcRequest) -> Result<IpcResponse> {
    let stream = UnixStream::connect(socket_path).await.map_err(SsError::Io)?;
    let (read_half, mut write_half) = stream.into_split();

    let mut line = serde_json::to_string(&request).map_err(|e| SsError::ConfigInvalid {
        reason: format!("failed to serialize ipc request: {e}"),
    })?;
    line.push('\n');
    write_half.write_all(line.as_bytes()).await.map_err(SsError::Io)?;
    write_half.shutdown().await.map_err(SsError::Io)?;

    let mut lines = BufReader::new(read_half).lines();
    let response_line = lines
        .next_line()
        .await
        .map_err(SsError::Io)?
        .ok_or_else(|| SsError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "daemon closed connection without a response",
        )))?;

    serde_json::from_str(&response_line).map_err(|e| SsError::ConfigInvalid {
        reason: format!("failed to parse ipc response: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;

    fn base_doc() -> crate::config::Document {
        use crate::config::*;
        Document {
            r#type: Mode::Server,
            version: "1.0.0".into(),
            metadata: Default::default(),
            throttle: ThrottleConfig::default(),
            config: InnerConfig {
                mode: Mode::Server,
                state_dir: std::env::temp_dir(),
                log_dir: std::env::temp_dir(),
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

    #[tokio::test]
    async fn status_round_trips_over_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(IpcState {
            monitor: Monitor::default(),
            config: Arc::new(ConfigStore::new(base_doc(), Environment::Development)),
            shutdown: CancelToken::default(),
            reload: tokio::sync::Notify::new(),
        });
        state.monitor.session_started();

        let dir_path = dir.path().to_path_buf();
        let server_state = state.clone();
        let server = tokio::spawn(async move { serve(&dir_path, server_state).await });

        // Give the listener a moment to bind.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let socket_path = dir.path().join("sssonector.ipc");
        let response = send_request(&socket_path, IpcRequest::Status).await.unwrap();
        assert!(response.ok);
        assert_eq!(response.active_sessions, 1);

        state.shutdown.cancel();
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), server).await;
    }
}
