// SPDX-License-Identifier: MIT
//! Token-bucket rate limiter (spec §3 "Token bucket" / §4.1).
//!
//! Classical token bucket with lazy refill. The bucket itself is the
//! fine-grained unit of mutual exclusion: `try_acquire` takes a short
//! critical section covering refill + compare + deduct, matching the
//! atomics-first locking discipline the teacher crate uses for its
//! connection-pool counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// TCP/TLS record overhead folded into the programmed rate so the
/// *shaped wire rate* matches the user-facing nominal rate (§4.1).
const TCP_OVERHEAD_MULTIPLIER: f64 = 1.10;

const MIN_BUF: usize = 4 * 1024;
const MAX_BUF: usize = 1024 * 1024;

/// One direction's worth of shaping state (§3 "Token bucket").
struct Bucket {
    rate: f64,     // bytes/sec, pre-overhead nominal value
    capacity: f64, // bytes
    tokens: f64,
    last_update: Instant,
}

impl Bucket {
    fn new(rate: f64, capacity: f64) -> Self {
        Bucket {
            rate,
            capacity,
            tokens: capacity,
            last_update: Instant::now(),
        }
    }

    fn wire_rate(&self) -> f64 {
        self.rate / TCP_OVERHEAD_MULTIPLIER
    }

    fn refill(&mut self, now: Instant) {
        if self.rate <= 0.0 {
            self.last_update = now;
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.wire_rate()).min(self.capacity);
        self.last_update = now;
    }

    /// Returns `Ok(())` if `n` tokens were deducted, `Err(delay)` otherwise.
    /// Never under-bills: on `Err`, no tokens were deducted (§4.1).
    fn try_acquire(&mut self, n: u64) -> Result<(), Duration> {
        let now = Instant::now();
        self.refill(now);

        if self.rate <= 0.0 {
            // rate = 0 disables the bucket: pass-through (§3, §8 boundary).
            return Ok(());
        }

        let n = n as f64;
        if self.tokens >= n {
            self.tokens -= n;
            Ok(())
        } else {
            let deficit = n - self.tokens;
            let delay_secs = deficit / self.wire_rate();
            Err(Duration::from_secs_f64(delay_secs.max(0.0)))
        }
    }

    fn update(&mut self, rate: f64, capacity: f64) {
        self.rate = rate;
        self.capacity = capacity;
        self.tokens = self.tokens.min(capacity);
        self.last_update = Instant::now();
    }
}

/// Per-direction metrics, reported as pre-overhead nominal values (§4.1).
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectionMetrics {
    pub rate: f64,
    pub burst: f64,
    pub limit_hits: u64,
}

struct DirectionState {
    bucket: Mutex<Bucket>,
    limit_hits: AtomicU64,
}

impl DirectionState {
    fn new(rate: f64, capacity: f64) -> Self {
        DirectionState {
            bucket: Mutex::new(Bucket::new(rate, capacity)),
            limit_hits: AtomicU64::new(0),
        }
    }

    async fn try_acquire(&self, n: u64) -> Duration {
        let mut bucket = self.bucket.lock().await;
        match bucket.try_acquire(n) {
            Ok(()) => Duration::ZERO,
            Err(delay) => {
                self.limit_hits.fetch_add(1, Ordering::Relaxed);
                delay
            }
        }
    }

    async fn update(&self, rate: f64, capacity: f64) {
        self.bucket.lock().await.update(rate, capacity);
    }

    async fn metrics(&self) -> DirectionMetrics {
        let bucket = self.bucket.lock().await;
        DirectionMetrics {
            rate: bucket.rate,
            burst: bucket.capacity,
            limit_hits: self.limit_hits.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Bounds and cooldown for the dynamic adjustment wrapper (§3 "Limiter").
#[derive(Debug, Clone, Copy)]
pub struct DynamicBounds {
    pub min_rate: f64,
    pub max_rate: f64,
    pub cooldown: Duration,
}

impl DynamicBounds {
    /// Default bounds from §4.1: `min = 0.5*base`, `max = 2*base`, `cooldown = 1s`.
    pub fn from_base(base_rate: f64) -> Self {
        DynamicBounds {
            min_rate: base_rate * 0.5,
            max_rate: base_rate * 2.0,
            cooldown: Duration::from_secs(1),
        }
    }
}

struct DynamicState {
    bounds: DynamicBounds,
    last_adjust: std::sync::Mutex<Instant>,
    adjust_count: AtomicU64,
}

/// Two-direction limiter bound to one session, with an optional dynamic
/// adjustment wrapper (§3 "Limiter", §4.1).
pub struct Limiter {
    inbound: DirectionState,
    outbound: DirectionState,
    dynamic: Option<DynamicState>,
}

impl Limiter {
    pub fn new(in_rate: f64, in_burst: f64, out_rate: f64, out_burst: f64) -> Self {
        Limiter {
            inbound: DirectionState::new(in_rate, in_burst),
            outbound: DirectionState::new(out_rate, out_burst),
            dynamic: None,
        }
    }

    pub fn with_dynamic(mut self, bounds: DynamicBounds) -> Self {
        self.dynamic = Some(DynamicState {
            bounds,
            last_adjust: std::sync::Mutex::new(Instant::now() - bounds.cooldown),
            adjust_count: AtomicU64::new(0),
        });
        self
    }

    fn state(&self, dir: Direction) -> &DirectionState {
        match dir {
            Direction::Inbound => &self.inbound,
            Direction::Outbound => &self.outbound,
        }
    }

    /// `try_acquire(dir, n) -> delay` (§4.1). Pure arithmetic under a short
    /// critical section; never suspends itself (§5).
    pub async fn try_acquire(&self, dir: Direction, n: u64) -> Duration {
        self.state(dir).try_acquire(n).await
    }

    /// Atomically replace one direction's bucket parameters (§4.1).
    /// Idempotent: two identical updates in a row yield identical state (§8).
    pub async fn update(&self, dir: Direction, rate: f64, burst: f64) {
        self.state(dir).update(rate, burst).await;
    }

    pub async fn metrics(&self, dir: Direction) -> DirectionMetrics {
        self.state(dir).metrics().await
    }

    /// `increase(pct)`: bump rate by `pct`%, clamp to bounds, respect cooldown.
    /// Returns `false` without side effect if still within cooldown (§4.1).
    pub async fn increase(&self, dir: Direction, pct: f64) -> bool {
        self.adjust(dir, pct).await
    }

    /// `decrease(pct)`: same as `increase` with the opposite sign.
    pub async fn decrease(&self, dir: Direction, pct: f64) -> bool {
        self.adjust(dir, -pct).await
    }

    async fn adjust(&self, dir: Direction, signed_pct: f64) -> bool {
        let Some(dynamic) = &self.dynamic else {
            return false;
        };

        {
            let mut last = dynamic.last_adjust.lock().unwrap();
            if last.elapsed() < dynamic.bounds.cooldown {
                return false;
            }
            *last = Instant::now();
        }

        let current = self.state(dir).metrics().await.rate;
        let new_rate = (current * (1.0 + signed_pct / 100.0))
            .clamp(dynamic.bounds.min_rate, dynamic.bounds.max_rate);
        let burst = self.state(dir).metrics().await.burst;
        self.state(dir).update(new_rate, burst).await;
        dynamic.adjust_count.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn adjust_count(&self) -> u64 {
        self.dynamic
            .as_ref()
            .map(|d| d.adjust_count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

/// Scratch buffer sizing rule from §4.1: requests under 4 KiB bypass the
/// pool; requests at or above 4 KiB may reuse a pooled buffer sized to
/// `min(len, 1 MiB)`.
pub fn scratch_len(requested: usize) -> Option<usize> {
    if requested < MIN_BUF {
        None
    } else {
        Some(requested.min(MAX_BUF))
    }
}

/// A small pool of reusable scratch buffers for large (>= 4 KiB) requests.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Default for BufferPool {
    fn default() -> Self {
        BufferPool {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl BufferPool {
    pub async fn acquire(&self, len: usize) -> Vec<u8> {
        let mut pool = self.inner.lock().await;
        if let Some(mut buf) = pool.pop() {
            buf.clear();
            buf.resize(len, 0);
            buf
        } else {
            vec![0u8; len]
        }
    }

    pub async fn release(&self, buf: Vec<u8>) {
        let mut pool = self.inner.lock().await;
        if pool.len() < 16 {
            pool.push(buf);
        }
    }
}

/// Sleep up to `delay`, honoring cancellation, using the executor's timer
/// (not an OS sleep) so it stays interruptible (§5, Design Notes).
pub async fn cancellable_sleep(delay: Duration, cancel: &tokio_util_notify::CancelToken) {
    if delay.is_zero() {
        return;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = cancel.cancelled() => {}
    }
}

/// Hand-rolled cancellation token (spec §5 "Cancellation"), built on
/// `tokio::sync::Notify` + an atomic flag rather than pulling in
/// `tokio-util`, matching the atomics-first style the teacher crate
/// uses for its own cancellation/circuit-breaker flags.
pub mod tokio_util_notify {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::Notify;

    #[derive(Clone)]
    pub struct CancelToken {
        flag: Arc<AtomicBool>,
        notify: Arc<Notify>,
    }

    impl Default for CancelToken {
        fn default() -> Self {
            CancelToken {
                flag: Arc::new(AtomicBool::new(false)),
                notify: Arc::new(Notify::new()),
            }
        }
    }

    impl CancelToken {
        pub fn cancel(&self) {
            self.flag.store(true, Ordering::SeqCst);
            self.notify.notify_waiters();
        }

        pub fn is_cancelled(&self) -> bool {
            self.flag.load(Ordering::SeqCst)
        }

        pub async fn cancelled(&self) {
            if self.is_cancelled() {
                return;
            }
            self.notify.notified().await;
        }
    }
}
