// SPDX-License-Identifier: MIT
//! End-to-end scenarios from spec §8 "Testable properties", exercised
//! over loopback TCP with the in-memory `LoopbackTun` stand-in (real
//! platform TUN I/O is out of scope per §1). Scenarios 1, 2, 5 and 6 are
//! covered here; scenario 3 (dial retry timing) and 4 (certificate
//! rotation under a live session) are exercised at the unit level in
//! `resilience.rs`/`cert.rs` since their full durations don't belong in
//! a fast integration suite.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use sssonector::cert::{self, CaHandle};
use sssonector::limiter::{Direction, DynamicBounds, Limiter};
use sssonector::monitor::Monitor;
use sssonector::resilience::{all_errors_are_failures, BreakerConfig, BreakerState, CircuitBreaker};
use sssonector::session;
use sssonector::tun::{LoopbackTun, TunDevice};

/// Issue a CA plus a server/client leaf pair under it, mirroring
/// §8 scenario 1's "CA+server/client certs issued under `SSSonector CA`".
fn issue_pair(dir: &std::path::Path) -> (CaHandle, cert::CertRecord, cert::CertRecord) {
    let ca = cert::generate_ca(dir).unwrap();
    let server = cert::generate_end_entity("server", dir, true, &ca).unwrap();
    let client = cert::generate_end_entity("client", dir, false, &ca).unwrap();
    (ca, server, client)
}

async fn bind_loopback() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (listener, addr)
}

/// Scenario 1: baseline tunnel. A client session and a server session,
/// each with its own loopback TUN pair, splice a real mTLS TCP
/// connection. Data written into the client's "external" TUN peer must
/// arrive at the server's "external" TUN peer, and the active-session
/// counter must return to 0 within 1s of disconnect (§8 scenario 1).
#[tokio::test]
async fn scenario_1_baseline_tunnel() {
    let dir = tempfile::tempdir().unwrap();
    let (ca, server_cert, client_cert) = issue_pair(dir.path());

    let server_config = cert::tls_server_config(&server_cert, &ca.record).unwrap();
    let client_config = cert::tls_client_config(&client_cert, &ca.record).unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(server_config));
    let connector = TlsConnector::from(Arc::new(client_config));

    let (listener, addr) = bind_loopback().await;

    let monitor = Monitor::default();
    let (server_tun, server_peer) = LoopbackTun::pair("srv", "srv-peer");
    let (client_tun, client_peer) = LoopbackTun::pair("cli", "cli-peer");

    let server_monitor = monitor.clone();
    let server_task = tokio::spawn(async move {
        let (tcp, _peer) = listener.accept().await.unwrap();
        let tls = acceptor.accept(tcp).await.unwrap();
        let (tls_read, tls_write) = tokio::io::split(tls);
        let tun_dev: Arc<dyn TunDevice> = server_tun;
        session::run_session(
            "client".into(),
            tun_dev,
            "srv".into(),
            tls_read,
            tls_write,
            Arc::new(Limiter::new(0.0, 0.0, 0.0, 0.0)),
            server_monitor,
            1500,
            Duration::from_secs(1),
        )
        .await
    });

    let server_name = rustls::pki_types::ServerName::try_from(
        server_cert.subject_cn.clone(),
    )
    .unwrap();
    let tcp = TcpStream::connect(&addr).await.unwrap();
    let tls = connector.connect(server_name, tcp).await.unwrap();
    let (tls_read, tls_write) = tokio::io::split(tls);
    let client_tun_dev: Arc<dyn TunDevice> = client_tun;
    let client_monitor = monitor.clone();
    let client_task = tokio::spawn(async move {
        session::run_session(
            addr,
            client_tun_dev,
            "cli".into(),
            tls_read,
            tls_write,
            Arc::new(Limiter::new(0.0, 0.0, 0.0, 0.0)),
            client_monitor,
            1500,
            Duration::from_secs(1),
        )
        .await
    });

    // Give both sessions a moment to start splicing.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(monitor.snapshot().active_sessions, 2);

    // "Ping" the tunnel: push a frame into the client's external TUN
    // peer and read it back out of the server's external TUN peer.
    client_peer.write(b"ping").await.unwrap();
    let mut buf = [0u8; 16];
    let n = server_peer.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"ping");

    // Tear down the client side: dropping its peer closes the TUN pair, so
    // the client's egress read hits EOF, the session exits on its own, and
    // its TLS half-close then ends the server's session too. Both must
    // settle within the spec's 1s bound without forcibly aborting either.
    drop(client_peer);

    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if monitor.snapshot().active_sessions == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("active_sessions did not return to 0 within 1s");

    let _ = tokio::time::timeout(Duration::from_secs(1), client_task).await;
    let _ = tokio::time::timeout(Duration::from_secs(1), server_task).await;
}

/// Scenario 2: throttled throughput. `rate=2 KiB/s, burst=1 KiB`;
/// pushing 4 KiB through the limiter on the data path must take between
/// 1.5s and 3.0s (§8 scenario 2's TCP-overhead/jitter bounds).
#[tokio::test]
async fn scenario_2_throttled_throughput() {
    let dir = tempfile::tempdir().unwrap();
    let (ca, server_cert, client_cert) = issue_pair(dir.path());

    let server_config = cert::tls_server_config(&server_cert, &ca.record).unwrap();
    let client_config = cert::tls_client_config(&client_cert, &ca.record).unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(server_config));
    let connector = TlsConnector::from(Arc::new(client_config));

    let (listener, addr) = bind_loopback().await;

    let monitor = Monitor::default();
    let (server_tun, server_peer) = LoopbackTun::pair("srv2", "srv2-peer");
    let (client_tun, client_peer) = LoopbackTun::pair("cli2", "cli2-peer");

    let rate = 2048.0; // 2 KiB/s
    let burst = 1024.0; // 1 KiB

    let server_monitor = monitor.clone();
    let server_task = tokio::spawn(async move {
        let (tcp, _peer) = listener.accept().await.unwrap();
        let tls = acceptor.accept(tcp).await.unwrap();
        let (tls_read, tls_write) = tokio::io::split(tls);
        let tun_dev: Arc<dyn TunDevice> = server_tun;
        // Only the client's outbound bucket paces this flow (an upload
        // throttle): the server's inbound bucket stays disabled so the
        // same bytes aren't gated twice by two independently-full buckets,
        // which would roughly double the expected transfer time.
        session::run_session(
            "client".into(),
            tun_dev,
            "srv2".into(),
            tls_read,
            tls_write,
            Arc::new(Limiter::new(0.0, 0.0, rate, burst)),
            server_monitor,
            1500,
            Duration::from_secs(1),
        )
        .await
    });

    let server_name =
        rustls::pki_types::ServerName::try_from(server_cert.subject_cn.clone()).unwrap();
    let tcp = TcpStream::connect(&addr).await.unwrap();
    let tls = connector.connect(server_name, tcp).await.unwrap();
    let (tls_read, tls_write) = tokio::io::split(tls);
    let client_tun_dev: Arc<dyn TunDevice> = client_tun;
    let client_monitor = monitor.clone();
    let client_task = tokio::spawn(async move {
        session::run_session(
            addr,
            client_tun_dev,
            "cli2".into(),
            tls_read,
            tls_write,
            Arc::new(Limiter::new(rate, burst, rate, burst)),
            client_monitor,
            1500,
            Duration::from_secs(1),
        )
        .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    let payload = vec![0xAEu8; 4096];
    let started = Instant::now();
    client_peer.write(&payload).await.unwrap();

    let mut received = 0usize;
    let mut buf = vec![0u8; 4096];
    while received < payload.len() {
        let n = tokio::time::timeout(Duration::from_secs(5), server_peer.read(&mut buf))
            .await
            .expect("timed out waiting for throttled bytes")
            .unwrap();
        if n == 0 {
            break;
        }
        received += n;
    }
    let elapsed = started.elapsed();

    assert_eq!(received, payload.len());
    assert!(
        elapsed >= Duration::from_millis(1500) && elapsed <= Duration::from_millis(3000),
        "throttled transfer took {elapsed:?}, expected within [1.5s, 3.0s]"
    );

    client_task.abort();
    server_task.abort();
}

/// Scenario 5: circuit breaker trips. Ten consecutive real connection
/// failures (dialing an address nothing listens on) must open the
/// breaker; an immediate call must then fail fast with `CircuitOpen`;
/// after `recovery_timeout` a single probe is admitted and two
/// consecutive successes close the breaker again (§8 scenario 5).
#[tokio::test]
async fn scenario_5_circuit_breaker_trips() {
    let breaker = CircuitBreaker::new(BreakerConfig {
        failure_threshold: 0.5,
        min_requests: 10,
        recovery_timeout: Duration::from_millis(100),
        success_threshold: 2,
        request_timeout: Duration::from_secs(1),
    });

    // Nothing is listening on this port: every dial is a real I/O failure.
    let dead_addr = "127.0.0.1:1";

    for _ in 0..10 {
        let _ = breaker
            .call(all_errors_are_failures, || async {
                TcpStream::connect(dead_addr)
                    .await
                    .map(|_| ())
                    .map_err(sssonector::error::SsError::Io)
            })
            .await;
    }
    assert_eq!(breaker.state(), BreakerState::Open);

    let immediate = breaker
        .call(all_errors_are_failures, || async { Ok::<_, sssonector::error::SsError>(()) })
        .await;
    assert!(matches!(
        immediate,
        Err(sssonector::error::SsError::CircuitOpen { .. })
    ));

    tokio::time::sleep(Duration::from_millis(120)).await;

    for _ in 0..2 {
        let _ = breaker
            .call(all_errors_are_failures, || async { Ok::<_, sssonector::error::SsError>(()) })
            .await;
    }
    assert_eq!(breaker.state(), BreakerState::Closed);
}

/// Scenario 6: hot reload of rate limit. A running session's limiter,
/// registered the way the supervisor registers every live session
/// (§4 "Hot reload"), observes a rate change pushed into it without any
/// reconnect — the session keeps running on the same `Limiter` handle.
#[tokio::test]
async fn scenario_6_hot_reload_rate_limit() {
    let limiter = Arc::new(
        Limiter::new(1024.0 * 1024.0, 4096.0, 1024.0 * 1024.0, 4096.0)
            .with_dynamic(DynamicBounds {
                min_rate: 1024.0,
                max_rate: 10.0 * 1024.0 * 1024.0,
                cooldown: Duration::ZERO,
            }),
    );

    let before = limiter.metrics(Direction::Outbound).await;
    assert!((before.rate - 1024.0 * 1024.0).abs() < 1.0);

    // Hot reload: push a fresh rate/burst, exactly what
    // `LimiterRegistry::broadcast` does during `Supervisor::reload`.
    let new_rate = 100.0 * 1024.0; // 100 KiB/s
    limiter.update(Direction::Outbound, new_rate, 4096.0).await;
    limiter.update(Direction::Inbound, new_rate, 4096.0).await;

    let after = limiter.metrics(Direction::Outbound).await;
    assert!(
        (after.rate - new_rate).abs() < 1.0,
        "expected rate {new_rate}, got {}",
        after.rate
    );

    // The same limiter handle keeps throttling at the new rate: a 200 KiB
    // debit (well past the 4 KiB burst) must now cost close to 2s at
    // 100 KiB/s, within the spec's ±15% bound.
    let delay = limiter
        .try_acquire(Direction::Outbound, 200 * 1024)
        .await;
    let expected = Duration::from_secs_f64((200.0 * 1024.0 - 4096.0) / new_rate);
    let lower = expected.mul_f64(0.85);
    let upper = expected.mul_f64(1.15);
    assert!(
        delay >= lower && delay <= upper,
        "delay {delay:?} not within ±15% of {expected:?}"
    );
}
