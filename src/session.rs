// SPDX-License-Identifier: MIT
//! Tunnel session engine (spec §3 "Session", §4.2). Per-session execution
//! is identical on both sides once the TLS connection exists: split the
//! TLS stream and the TUN adapter into owned halves (Design Notes
//! "concurrent I/O on a TLS connection"), then run two independent
//! splice pipelines.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};

use crate::error::{Result, SsError};
use crate::limiter::tokio_util_notify::CancelToken;
use crate::limiter::{Direction, Limiter};
use crate::monitor::Monitor;
use crate::tun::{CreateOpts, TunDevice, TunParams};

/// Scratch buffer size for both pipelines: MTU rounded up to a 4 KiB
/// multiple, clamped to `[4 KiB, 1 MiB]` (§4.2 step 5).
pub fn scratch_buffer_len(mtu: u32) -> usize {
    const UNIT: usize = 4096;
    let mtu = mtu as usize;
    let rounded = mtu.div_ceil(UNIT) * UNIT;
    rounded.clamp(UNIT, 1024 * 1024)
}

/// Everything a running session needs that outlives any one pipeline
/// task. Dropped once both pipelines finish and cleanup has run.
pub struct SessionHandle {
    pub remote: String,
    pub tun_name: String,
    cancel: CancelToken,
    done_tx: tokio::sync::watch::Sender<bool>,
}

impl SessionHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_done(&self) -> bool {
        *self.done_tx.subscribe().borrow()
    }
}

/// RAII backstop for adapter release (spec invariant "the TUN adapter is
/// released on every exit path, including panic/abort"). Normal exits call
/// `disarm_with_cleanup`, which runs cleanup under the caller's timeout and
/// disarms the guard; if a pipeline future panics instead, unwinding drops
/// this guard while still armed and `Drop` spawns a best-effort cleanup
/// task, since `cleanup()` is async and a sync `Drop` cannot await it.
struct TunCleanupGuard {
    tun: Arc<dyn TunDevice>,
    remote: String,
    armed: bool,
}

impl TunCleanupGuard {
    fn new(tun: Arc<dyn TunDevice>, remote: String) -> Self {
        TunCleanupGuard {
            tun,
            remote,
            armed: true,
        }
    }

    async fn disarm_with_cleanup(mut self, timeout: Duration) {
        self.armed = false;
        let cleanup_result = tokio::time::timeout(timeout, self.tun.cleanup()).await;
        match cleanup_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(remote = %self.remote, error = %e, "tun cleanup failed"),
            Err(_) => warn!(remote = %self.remote, "tun cleanup exceeded timeout, abandoning"),
        }
    }
}

impl Drop for TunCleanupGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let tun = self.tun.clone();
        let remote = self.remote.clone();
        tokio::spawn(async move {
            if let Err(e) = tun.cleanup().await {
                warn!(remote = %remote, error = %e, "tun cleanup failed during unwind");
            }
        });
    }
}

/// Splice one TLS connection to one TUN adapter (§4.2 steps 4-7).
///
/// `tls_read`/`tls_write` must already be independent halves (the caller
/// obtains them via `tokio::io::split` so a non-splittable TLS type is
/// never shared between tasks, per Design Notes §9).
pub async fn run_session<R, W>(
    remote: String,
    tun: Arc<dyn TunDevice>,
    tun_name: String,
    mut tls_read: R,
    mut tls_write: W,
    limiter: Arc<Limiter>,
    monitor: Monitor,
    mtu: u32,
    cleanup_timeout: Duration,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let cancel = CancelToken::default();
    let (done_tx, _done_rx) = tokio::sync::watch::channel(false);
    let handle = Arc::new(SessionHandle {
        remote: remote.clone(),
        tun_name: tun_name.clone(),
        cancel: cancel.clone(),
        done_tx,
    });

    monitor.session_started();
    let buf_len = scratch_buffer_len(mtu);

    let (tun_reader, tun_writer) = crate::tun::split(tun.clone());
    let cleanup_guard = TunCleanupGuard::new(tun, remote.clone());

    // Run both pipelines concurrently on this task rather than spawning: the
    // borrows of `tls_read`/`tls_write` never need to outlive `run_session`,
    // and `select!` already gives us the "either one ends the session" trigger.
    let result = tokio::select! {
        r = egress_loop(tun_reader, &mut tls_write, limiter.clone(), monitor.clone(), buf_len, cancel.clone()) => r,
        r = ingress_loop(&mut tls_read, tun_writer, limiter.clone(), monitor.clone(), buf_len, cancel.clone()) => r,
    };

    // Cleanup order (§4.2 step 7): cancel the other side, close TLS, cleanup
    // adapter (bounded), publish done, decrement active count.
    handle.cancel.cancel();

    cleanup_guard.disarm_with_cleanup(cleanup_timeout).await;

    let _ = handle.done_tx.send(true);
    monitor.session_ended();
    info!(remote = %remote, tun_name = %tun_name, "session closed");

    result
}

async fn egress_loop<W: AsyncWrite + Unpin>(
    tun_reader: crate::tun::TunReader,
    mut tls_write: W,
    limiter: Arc<Limiter>,
    monitor: Monitor,
    buf_len: usize,
    cancel: CancelToken,
) -> Result<()> {
    let mut buf = vec![0u8; buf_len];
    loop {
        if cancel.is_cancelled() {
            return Err(SsError::Cancelled);
        }
        let n = tokio::select! {
            r = tun_reader.read(&mut buf) => r?,
            _ = cancel.cancelled() => return Err(SsError::Cancelled),
        };
        if n == 0 {
            return Ok(()); // end of stream from TUN side
        }

        let delay = limiter.try_acquire(Direction::Outbound, n as u64).await;
        if delay > Duration::ZERO {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(SsError::Cancelled),
            }
        }

        tls_write.write_all(&buf[..n]).await?;
        monitor.add_bytes_out(n as u64);
    }
}

async fn ingress_loop<R: AsyncRead + Unpin>(
    mut tls_read: R,
    tun_writer: crate::tun::TunWriter,
    limiter: Arc<Limiter>,
    monitor: Monitor,
    buf_len: usize,
    cancel: CancelToken,
) -> Result<()> {
    let mut buf = vec![0u8; buf_len];
    loop {
        if cancel.is_cancelled() {
            return Err(SsError::Cancelled);
        }
        let n = tokio::select! {
            r = tls_read.read(&mut buf) => r?,
            _ = cancel.cancelled() => return Err(SsError::Cancelled),
        };
        if n == 0 {
            return Ok(()); // peer closed the TLS connection
        }

        let delay = limiter.try_acquire(Direction::Inbound, n as u64).await;
        if delay > Duration::ZERO {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(SsError::Cancelled),
            }
        }

        tun_writer.write(&buf[..n]).await?;
        monitor.add_bytes_in(n as u64);
    }
}

/// Per-session setup (§4.2 steps 1-3): fresh TUN name, create with
/// retries, configure from the snapshot.
pub async fn provision_tun<T: TunDevice + 'static>(
    params: &TunParams,
    opts: CreateOpts,
) -> Result<Arc<T>> {
    let dev = crate::tun::create_with_retries::<T>(&params.name, opts)
        .await
        .map_err(|e| SsError::AdapterCreate {
            reason: e.to_string(),
        })?;
    let dev = Arc::new(dev);
    dev.configure(params)
        .await
        .map_err(|e| SsError::AdapterConfigure {
            reason: e.to_string(),
        })?;
    Ok(dev)
}

/// Admission policy (§4.2 "Admission policy"): server rejects once the
/// active-session counter equals `max_clients`, without consuming a slot.
pub struct Admission {
    semaphore: Arc<tokio::sync::Semaphore>,
}

impl Admission {
    pub fn new(max_clients: usize) -> Self {
        Admission {
            semaphore: Arc::new(tokio::sync::Semaphore::new(max_clients)),
        }
    }

    /// Returns `None` if the endpoint is already at `max_clients`.
    pub fn try_admit(&self) -> Option<tokio::sync::OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DialTiming {
    pub started: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tun::LoopbackTun;

    #[test]
    fn scratch_buffer_len_rounds_up_to_4kib() {
        assert_eq!(scratch_buffer_len(1500), 4096);
        assert_eq!(scratch_buffer_len(4096), 4096);
        assert_eq!(scratch_buffer_len(4097), 8192);
        assert_eq!(scratch_buffer_len(2_000_000), 1024 * 1024);
    }

    #[tokio::test]
    async fn admission_rejects_past_max_clients() {
        let admission = Admission::new(1);
        let first = admission.try_admit();
        assert!(first.is_some());
        let second = admission.try_admit();
        assert!(second.is_none());
        drop(first);
        assert!(admission.try_admit().is_some());
    }

    #[tokio::test]
    async fn session_splices_tun_to_tls_and_cleans_up() {
        let (tun_a, tun_b) = LoopbackTun::pair("t0", "t1");
        let monitor = Monitor::default();
        let limiter = Arc::new(Limiter::new(0.0, 0.0, 0.0, 0.0));

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client);

        // tun_a's inbox is fed by writes on its peer, tun_b (`pair` wires
        // the two ends crosswise so each side reads what the other wrote).
        tun_b.write(b"ping").await.unwrap();

        let tun_dev: Arc<dyn TunDevice> = tun_a.clone();
        let session = tokio::spawn(run_session(
            "127.0.0.1:1".to_string(),
            tun_dev,
            "t0".to_string(),
            client_read,
            client_write,
            limiter,
            monitor.clone(),
            1500,
            Duration::from_secs(1),
        ));

        let (mut server_read, mut _server_write) = tokio::io::split(server);
        let mut buf = [0u8; 16];
        let n = server_read.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        drop(server_read);
        drop(_server_write);
        let _ = tokio::time::timeout(Duration::from_secs(2), session).await;
        assert_eq!(monitor.snapshot().active_sessions, 0);
    }
}
