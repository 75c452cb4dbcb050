// SPDX-License-Identifier: MIT
//! Monitor facade (spec §3, §4.6): `info/warn/error(event, fields)` plus
//! counter updaters. Logging is a thin wrapper over `tracing`, the same
//! ecosystem choice the teacher crate makes; counters are atomics
//! snapshotted into an immutable struct so reads are snapshot-consistent
//! without locking the byte path (§5 "Shared resources").

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

#[derive(Debug, Default, Clone, Copy)]
pub struct MonitorSnapshot {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub active_sessions: i64,
    pub total_sessions: u64,
    pub packets_lost: u64,
    pub uptime_secs: u64,
    pub latency_us: i64,
}

struct Counters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    active_sessions: AtomicI64,
    total_sessions: AtomicU64,
    packets_lost: AtomicU64,
    latency_us: AtomicI64,
    started_at: std::time::Instant,
}

/// Shared handle observed by both pipeline tasks and the supervisor
/// (§5 "Monitor: shared via atomic counters (no locks on the byte path)").
#[derive(Clone)]
pub struct Monitor {
    inner: Arc<Counters>,
}

impl Default for Monitor {
    fn default() -> Self {
        Monitor {
            inner: Arc::new(Counters {
                bytes_in: AtomicU64::new(0),
                bytes_out: AtomicU64::new(0),
                active_sessions: AtomicI64::new(0),
                total_sessions: AtomicU64::new(0),
                packets_lost: AtomicU64::new(0),
                latency_us: AtomicI64::new(0),
                started_at: std::time::Instant::now(),
            }),
        }
    }
}

impl Monitor {
    pub fn info(&self, event: &str, fields: &[(&str, &str)]) {
        info!(event, ?fields, "monitor event");
    }

    pub fn warn(&self, event: &str, fields: &[(&str, &str)]) {
        warn!(event, ?fields, "monitor event");
    }

    pub fn error(&self, event: &str, fields: &[(&str, &str)]) {
        error!(event, ?fields, "monitor event");
    }

    pub fn add_bytes_in(&self, n: u64) {
        self.inner.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_out(&self, n: u64) {
        self.inner.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    pub fn session_started(&self) {
        self.inner.active_sessions.fetch_add(1, Ordering::SeqCst);
        self.inner.total_sessions.fetch_add(1, Ordering::SeqCst);
    }

    pub fn session_ended(&self) {
        self.inner.active_sessions.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn add_packets_lost(&self, n: u64) {
        self.inner.packets_lost.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_latency_us(&self, v: i64) {
        self.inner.latency_us.store(v, Ordering::Relaxed);
    }

    /// Reading is snapshot-consistent (§4.6): one `Acquire` load per field
    /// into an immutable struct.
    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            bytes_in: self.inner.bytes_in.load(Ordering::Acquire),
            bytes_out: self.inner.bytes_out.load(Ordering::Acquire),
            active_sessions: self.inner.active_sessions.load(Ordering::Acquire),
            total_sessions: self.inner.total_sessions.load(Ordering::Acquire),
            packets_lost: self.inner.packets_lost.load(Ordering::Acquire),
            uptime_secs: self.inner.started_at.elapsed().as_secs(),
            latency_us: self.inner.latency_us.load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_sessions_is_a_gauge() {
        let monitor = Monitor::default();
        monitor.session_started();
        monitor.session_started();
        monitor.session_ended();
        assert_eq!(monitor.snapshot().active_sessions, 1);
        assert_eq!(monitor.snapshot().total_sessions, 2);
    }

    #[test]
    fn byte_counters_are_monotonic() {
        let monitor = Monitor::default();
        monitor.add_bytes_in(10);
        monitor.add_bytes_in(5);
        assert_eq!(monitor.snapshot().bytes_in, 15);
    }
}
