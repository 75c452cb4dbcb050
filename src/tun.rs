// SPDX-License-Identifier: MIT
//! TUN adapter facade (spec §6 "TUN interface contract"). The platform
//! device open/close/read/write is an explicit external collaborator
//! (§1 Non-goals); this module defines the trait boundary plus an
//! in-process loopback implementation used by tests and by any build that
//! has not yet wired a real OS binding behind [`TunDevice`].
//!
//! Trait-at-the-seam matches the teacher crate's `SecureTransport` trait
//! in `secure_channel_improved.rs` and the transport trait used by the
//! closest reference repo in this pack for its own pluggable transports.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{Result, SsError};

/// Options passed to `create` (§4.2 step 2): `{retries, retry_delay,
/// cleanup_timeout, validate_state}`.
#[derive(Debug, Clone, Copy)]
pub struct CreateOpts {
    pub retries: u32,
    pub retry_delay: Duration,
    pub cleanup_timeout: Duration,
    pub validate_state: bool,
}

impl Default for CreateOpts {
    fn default() -> Self {
        CreateOpts {
            retries: 5,
            retry_delay: Duration::from_millis(200),
            cleanup_timeout: Duration::from_secs(10),
            validate_state: true,
        }
    }
}

/// `{name, address, mtu}` passed to `configure` (§4.2 step 3, §6).
#[derive(Debug, Clone)]
pub struct TunParams {
    pub name: String,
    pub address: String,
    pub mtu: u32,
}

/// The external collaborator contract from §6, verbatim: `create`,
/// `configure`, `read`, `write`, `cleanup` (idempotent and bounded).
#[async_trait]
pub trait TunDevice: Send + Sync {
    async fn create(name: &str, opts: CreateOpts) -> Result<Self>
    where
        Self: Sized;
    async fn configure(&self, params: &TunParams) -> Result<()>;
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;
    async fn write(&self, buf: &[u8]) -> Result<usize>;
    async fn cleanup(&self) -> Result<()>;
}

/// Derive a process-unique TUN name (§4.2 step 1): a monotonic counter
/// suffix, avoiding any dependency on wall-clock resolution.
pub fn fresh_name(prefix: &str) -> String {
    use std::sync::atomic::AtomicU64;
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}{n}")
}

/// An in-process loopback TUN stand-in: a duplex byte pipe. Satisfies
/// every invariant in §3 (single adapter per session, idempotent
/// cleanup) without touching the kernel; the production binding point
/// for a real platform TUN is this same `TunDevice` trait (§9a).
pub struct LoopbackTun {
    name: String,
    inbox: Mutex<tokio::sync::mpsc::Receiver<Vec<u8>>>,
    outbox: tokio::sync::mpsc::Sender<Vec<u8>>,
    cleaned_up: AtomicBool,
    configured: Mutex<Option<TunParams>>,
}

impl LoopbackTun {
    /// Build a connected pair: writes to one side's `outbox` are readable
    /// from the other side's `inbox`, modeling a TUN device that echoes
    /// whatever the "network" peer sent into it.
    pub fn pair(name_a: &str, name_b: &str) -> (Arc<LoopbackTun>, Arc<LoopbackTun>) {
        let (tx_a, rx_b) = tokio::sync::mpsc::channel(64);
        let (tx_b, rx_a) = tokio::sync::mpsc::channel(64);
        let a = Arc::new(LoopbackTun {
            name: name_a.to_string(),
            inbox: Mutex::new(rx_a),
            outbox: tx_a,
            cleaned_up: AtomicBool::new(false),
            configured: Mutex::new(None),
        });
        let b = Arc::new(LoopbackTun {
            name: name_b.to_string(),
            inbox: Mutex::new(rx_b),
            outbox: tx_b,
            cleaned_up: AtomicBool::new(false),
            configured: Mutex::new(None),
        });
        (a, b)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl TunDevice for LoopbackTun {
    async fn create(name: &str, _opts: CreateOpts) -> Result<Self> {
        // A bare `create` with no peer makes little sense for the loopback
        // stand-in; real sessions use `LoopbackTun::pair`. This impl exists
        // so the trait signature matches §6 exactly.
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        drop(tx);
        Ok(LoopbackTun {
            name: name.to_string(),
            inbox: Mutex::new(rx),
            outbox: tokio::sync::mpsc::channel(1).0,
            cleaned_up: AtomicBool::new(false),
            configured: Mutex::new(None),
        })
    }

    async fn configure(&self, params: &TunParams) -> Result<()> {
        if !(576..=65535).contains(&params.mtu) {
            return Err(SsError::AdapterConfigure {
                reason: format!("mtu {} out of range", params.mtu),
            });
        }
        info!(name = %self.name, address = %params.address, mtu = params.mtu, "tun configured");
        *self.configured.lock().await = Some(params.clone());
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut inbox = self.inbox.lock().await;
        match inbox.recv().await {
            Some(frame) => {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                Ok(n)
            }
            None => Ok(0), // peer dropped: end of stream
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.outbox
            .send(buf.to_vec())
            .await
            .map_err(|_| SsError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "tun peer gone",
            )))?;
        Ok(buf.len())
    }

    async fn cleanup(&self) -> Result<()> {
        // Idempotent: a second cleanup of an already-cleaned adapter is a
        // no-op without error (§8).
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(name = %self.name, "tun cleaned up");
        Ok(())
    }
}

/// Split view used so egress/ingress pipelines never share one handle
/// (§4.2 step 5, Design Notes "concurrent I/O").
pub struct TunReader(Arc<dyn TunDevice>);
pub struct TunWriter(Arc<dyn TunDevice>);

pub fn split(dev: Arc<dyn TunDevice>) -> (TunReader, TunWriter) {
    (TunReader(dev.clone()), TunWriter(dev))
}

impl TunReader {
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.0.read(buf).await
    }
}

impl TunWriter {
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.0.write(buf).await
    }
}

impl AsyncRead for TunReader {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let mut fut = self.0.read(buf.initialize_unfilled());
        let result = fut.as_mut().poll(cx);
        drop(fut);
        match result {
            std::task::Poll::Ready(Ok(n)) => {
                buf.advance(n);
                std::task::Poll::Ready(Ok(()))
            }
            std::task::Poll::Ready(Err(e)) => {
                std::task::Poll::Ready(Err(std::io::Error::other(e)))
            }
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}

impl AsyncWrite for TunWriter {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        let mut fut = self.0.write(buf);
        let result = fut.as_mut().poll(cx);
        drop(fut);
        match result {
            std::task::Poll::Ready(Ok(n)) => std::task::Poll::Ready(Ok(n)),
            std::task::Poll::Ready(Err(e)) => {
                std::task::Poll::Ready(Err(std::io::Error::other(e)))
            }
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}

/// Create a TUN adapter with the retry policy from §4.2 step 2: up to
/// `opts.retries` attempts, `opts.retry_delay` apart.
pub async fn create_with_retries<T: TunDevice>(name: &str, opts: CreateOpts) -> Result<T> {
    let mut last_err = None;
    for attempt in 0..=opts.retries {
        match T::create(name, opts).await {
            Ok(dev) => return Ok(dev),
            Err(e) => {
                warn!(attempt, "tun create attempt failed");
                last_err = Some(e);
                if attempt < opts.retries {
                    tokio::time::sleep(opts.retry_delay).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or(SsError::AdapterCreate {
        reason: "no attempts made".into(),
    }))
}
