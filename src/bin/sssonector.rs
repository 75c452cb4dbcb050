// SPDX-License-Identifier: MIT
//! Daemon entry point (spec §6 "CLI surface", SPEC_FULL.md §4.9).
//!
//! `sssonector --config <path> [--debug]` runs until SIGINT/SIGTERM, or
//! reloads on SIGHUP. Exit codes: 0 clean shutdown, 1 configuration
//! error, 2 runtime error.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{info, warn};

use sssonector::cert::{self, CertManager};
use sssonector::config::{self, Environment, Mode};
use sssonector::error::SsError;
use sssonector::ipc;
use sssonector::limiter::Limiter;
use sssonector::logging::{self, Phase};
use sssonector::resilience::{default_classifier, Backoff, BackoffConfig, RetryOutcome};
use sssonector::session::{self, Admission};
use sssonector::supervisor::Supervisor;
use sssonector::tun::{self, CreateOpts, LoopbackTun, TunDevice, TunParams};

#[derive(Parser, Debug)]
#[command(name = "sssonector", about = "Mutually-authenticated TLS tunnel")]
struct Cli {
    #[arg(long)]
    config: PathBuf,

    #[arg(long)]
    debug: bool,
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    let rt = tokio::runtime::Runtime::new().expect("failed to start tokio runtime");
    match rt.block_on(run(cli)) {
        Ok(()) => std::process::ExitCode::from(0),
        Err(e) if e.downcast_ref::<SsError>().map(|e| matches!(e, SsError::ConfigInvalid { .. } | SsError::CertLoad { .. })).unwrap_or(false) => {
            eprintln!("configuration error: {e:#}");
            std::process::ExitCode::from(1)
        }
        Err(e) => {
            eprintln!("runtime error: {e:#}");
            std::process::ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let env = if cli.debug {
        Environment::Development
    } else {
        Environment::Production
    };
    let doc = config::load(&cli.config, env).context("loading configuration")?;

    logging::init(
        if cli.debug { "debug" } else { &doc.config.logging.level },
        &doc.config.logging.format,
    );

    let is_server = matches!(doc.config.mode, Mode::Server);
    let startup = logging::StartupLog::open(&doc.config.log_dir, is_server)
        .context("opening startup log")?;

    let t0 = Instant::now();
    let tls = &doc.config.security.tls;
    let cert_manager = match load_cert_material(&tls.cert_file, &tls.key_file, &tls.ca_file) {
        Ok((leaf, ca)) => {
            startup.record(Phase::Initialization, "cert", "load", &leaf.serial, t0, Ok(())).ok();
            CertManager::new(leaf, ca)
        }
        Err(e) => {
            startup.record(Phase::Initialization, "cert", "load", "", t0, Err(&e.to_string())).ok();
            return Err(e);
        }
    };

    let supervisor = Arc::new(Supervisor::new(doc.clone(), env, cert_manager));
    supervisor.write_pid_file().context("writing pid file")?;

    let ipc_state = supervisor.ipc_state();
    let ipc_dir = doc.config.state_dir.clone();
    let ipc_task = tokio::spawn(async move {
        if let Err(e) = ipc::serve(&ipc_dir, ipc_state).await {
            warn!(error = %e, "ipc listener exited");
        }
    });

    let result = match doc.config.mode {
        Mode::Server => run_server(supervisor.clone(), &startup).await,
        Mode::Client => run_client(supervisor.clone(), &startup).await,
    };

    supervisor.shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(2), ipc_task).await;
    supervisor.remove_pid_file();

    #[cfg(unix)]
    {
        let config_path = cli.config.clone();
        tokio::select! {
            r = supervisor.run_signal_loop(config_path) => { r?; }
            _ = async {} => {}
        }
    }

    result
}

fn load_cert_material(
    cert_file: &std::path::Path,
    key_file: &std::path::Path,
    ca_file: &std::path::Path,
) -> anyhow::Result<(cert::CertRecord, cert::CertRecord)> {
    let leaf = cert::load(cert_file, key_file, Some(ca_file))?;
    let ca = cert::load_ca(ca_file)?;
    Ok((leaf, ca))
}

async fn run_server(supervisor: Arc<Supervisor>, startup: &logging::StartupLog) -> anyhow::Result<()> {
    let doc = supervisor.config.current();
    let addr = format!(
        "{}:{}",
        doc.config.tunnel.listen_address.clone().unwrap_or_else(|| "0.0.0.0".into()),
        doc.config.tunnel.listen_port.unwrap_or(8443)
    );

    let t0 = Instant::now();
    let listener = TcpListener::bind(&addr).await.map_err(|e| SsError::Bind { addr: addr.clone(), source: e })?;
    startup.record(Phase::Listen, "tunnel", "bind", &addr, t0, Ok(())).ok();
    info!(%addr, "listening");

    let snapshot = supervisor.cert_manager.snapshot();
    let server_config = cert::tls_server_config(&snapshot.0, &snapshot.1)?;
    let acceptor = TlsAcceptor::from(Arc::new(server_config));
    let admission = Arc::new(Admission::new(doc.config.tunnel.max_clients));

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (tcp, remote) = accepted.map_err(SsError::Io)?;
                let Some(permit) = admission.try_admit() else {
                    warn!(%remote, "rejecting connection: at max_clients");
                    continue;
                };
                let acceptor = acceptor.clone();
                let supervisor = supervisor.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = serve_one(tcp, remote.to_string(), acceptor, supervisor).await {
                        warn!(%remote, error = %e, "session ended with error");
                    }
                });
            }
            _ = supervisor.shutdown.cancelled() => {
                info!("shutting down server listener");
                return Ok(());
            }
        }
    }
}

async fn serve_one(
    tcp: TcpStream,
    remote: String,
    acceptor: TlsAcceptor,
    supervisor: Arc<Supervisor>,
) -> anyhow::Result<()> {
    let tls_stream = acceptor.accept(tcp).await.map_err(|e| SsError::TlsHandshake { reason: e.to_string() })?;
    let (tls_read, tls_write) = tokio::io::split(tls_stream);

    let doc = supervisor.config.current();
    let name = tun::fresh_name("sssonector");
    let tun_dev: Arc<dyn TunDevice> = Arc::new(
        tun::create_with_retries::<LoopbackTun>(&name, CreateOpts::default()).await?,
    );
    tun_dev
        .configure(&TunParams {
            name: name.clone(),
            address: doc.config.network.address.clone(),
            mtu: doc.config.network.mtu,
        })
        .await?;

    let limiter = Arc::new(build_limiter(&doc));
    supervisor.limiters.register(&limiter).await;

    if doc.config.tunnel.compression {
        warn!("compression is accepted but not wired to a codec; ignoring");
    }

    session::run_session(
        remote,
        tun_dev,
        name,
        tls_read,
        tls_write,
        limiter,
        supervisor.monitor.clone(),
        doc.config.network.mtu,
        Duration::from_secs(10),
    )
    .await?;
    Ok(())
}

async fn run_client(supervisor: Arc<Supervisor>, startup: &logging::StartupLog) -> anyhow::Result<()> {
    let doc = supervisor.config.current();
    let addr = format!(
        "{}:{}",
        doc.config.tunnel.server_address.clone().unwrap_or_default(),
        doc.config.tunnel.server_port.unwrap_or(8443)
    );

    let snapshot = supervisor.cert_manager.snapshot();
    let client_config = cert::tls_client_config(&snapshot.0, &snapshot.1)?;
    let connector = TlsConnector::from(Arc::new(client_config));

    let t0 = Instant::now();
    let backoff = Backoff::new(BackoffConfig::network_retry(), 5);
    let connect_addr = addr.clone();
    let connector2 = connector.clone();
    let outcome = sssonector::resilience::retry(
        backoff,
        Duration::from_secs(10),
        &supervisor.shutdown,
        default_classifier,
        move || {
            let addr = connect_addr.clone();
            let connector = connector2.clone();
            async move { dial_once(&addr, connector).await }
        },
    )
    .await;

    let tls_stream = match outcome {
        RetryOutcome::Ok(stream) => stream,
        RetryOutcome::Skipped => return Err(SsError::DialExhausted { addr }.into()),
        RetryOutcome::Err(e) => {
            startup.record(Phase::Connection, "tunnel", "dial", &addr, t0, Err(&e.to_string())).ok();
            return Err(e.into());
        }
    };
    startup.record(Phase::Connection, "tunnel", "dial", &addr, t0, Ok(())).ok();
    info!(%addr, "connected");

    let (tls_read, tls_write) = tokio::io::split(tls_stream);
    let name = tun::fresh_name("sssonector");
    let tun_dev: Arc<dyn TunDevice> = Arc::new(
        tun::create_with_retries::<LoopbackTun>(&name, CreateOpts::default()).await?,
    );
    tun_dev
        .configure(&TunParams {
            name: name.clone(),
            address: doc.config.network.address.clone(),
            mtu: doc.config.network.mtu,
        })
        .await?;

    let limiter = Arc::new(build_limiter(&doc));
    supervisor.limiters.register(&limiter).await;

    tokio::select! {
        r = session::run_session(
            addr,
            tun_dev,
            name,
            tls_read,
            tls_write,
            limiter,
            supervisor.monitor.clone(),
            doc.config.network.mtu,
            Duration::from_secs(10),
        ) => { r?; }
        _ = supervisor.shutdown.cancelled() => {}
    }
    Ok(())
}

async fn dial_once(
    addr: &str,
    connector: TlsConnector,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, SsError> {
    let tcp = TcpStream::connect(addr).await.map_err(SsError::Io)?;
    let server_name = rustls::pki_types::ServerName::try_from("sssonector-server".to_string())
        .map_err(|e| SsError::TlsHandshake { reason: e.to_string() })?;
    connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| SsError::TlsHandshake { reason: e.to_string() })
}

fn build_limiter(doc: &config::Document) -> Limiter {
    if doc.throttle.enabled {
        let burst = doc.throttle.burst as f64;
        Limiter::new(
            doc.throttle.rate as f64,
            burst,
            doc.throttle.rate as f64,
            burst,
        )
    } else {
        Limiter::new(0.0, 0.0, 0.0, 0.0)
    }
}
