//! Certificate pin files across reconnects.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rcgen::{date_time_ymd, CertificateParams, KeyPair};
use rustls::pki_types::CertificateDer;
use tempfile::TempDir;

use electrum_spv::error::{CertError, NetworkError, NetworkResult};
use electrum_spv::network::tls::{cert_path, fingerprint, resolve_trust};
use electrum_spv::network::{Connected, Connector, ServerAddr, TrustRoot};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Answers certificate checks from fixed data and counts network round trips.
struct CountingConnector {
    ca_signed: bool,
    certificate: Option<CertificateDer<'static>>,
    ca_checks: AtomicUsize,
    fetches: AtomicUsize,
}

impl CountingConnector {
    fn ca_signed() -> Self {
        Self {
            ca_signed: true,
            certificate: None,
            ca_checks: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
        }
    }

    fn self_signed(certificate: CertificateDer<'static>) -> Self {
        Self {
            ca_signed: false,
            certificate: Some(certificate),
            ca_checks: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
        }
    }

    fn ca_checks(&self) -> usize {
        self.ca_checks.load(Ordering::SeqCst)
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for CountingConnector {
    async fn connect(&self, _server: &ServerAddr, _trust: &TrustRoot, _timeout: Duration) -> NetworkResult<Connected> {
        Err(NetworkError::ConnectionFailed("no network in tests".to_string()))
    }

    async fn check_ca_signed(&self, _server: &ServerAddr, _timeout: Duration) -> NetworkResult<bool> {
        self.ca_checks.fetch_add(1, Ordering::SeqCst);
        Ok(self.ca_signed)
    }

    async fn fetch_certificate(
        &self,
        _server: &ServerAddr,
        _timeout: Duration,
    ) -> NetworkResult<Option<CertificateDer<'static>>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.certificate.clone())
    }
}

fn certificate_valid_during(first_year: i32, last_year: i32) -> CertificateDer<'static> {
    let mut params = CertificateParams::new(vec!["electrum.local".to_string()]).unwrap();
    params.not_before = date_time_ymd(first_year, 1, 1);
    params.not_after = date_time_ymd(last_year, 12, 31);
    let key = KeyPair::generate().unwrap();
    params.self_signed(&key).unwrap().der().clone()
}

fn mid(year: i32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, 6, 1, 0, 0, 0).unwrap()
}

fn tls_server() -> ServerAddr {
    "electrum.local:50002:s".parse().unwrap()
}

#[tokio::test]
async fn test_ca_signed_marker_skips_network_on_reconnect() {
    let dir = TempDir::new().unwrap();
    let server = tls_server();
    let path = cert_path(dir.path(), server.host());
    let connector = CountingConnector::ca_signed();

    let trust = resolve_trust(&connector, &server, &path, None, mid(2025), TIMEOUT).await.unwrap();
    assert_eq!(trust, TrustRoot::CaSigned);
    assert_eq!(std::fs::read(&path).unwrap(), Vec::<u8>::new());

    let again = resolve_trust(&connector, &server, &path, None, mid(2025), TIMEOUT).await.unwrap();
    assert_eq!(again, TrustRoot::CaSigned);
    assert_eq!(connector.ca_checks(), 1);
    assert_eq!(connector.fetches(), 0);
}

#[tokio::test]
async fn test_self_signed_pin_reused_until_expiry() {
    let dir = TempDir::new().unwrap();
    let server = tls_server();
    let path = cert_path(dir.path(), server.host());
    let certificate = certificate_valid_during(2024, 2025);
    let connector = CountingConnector::self_signed(certificate.clone());

    let trust = resolve_trust(&connector, &server, &path, None, mid(2024), TIMEOUT).await.unwrap();
    assert_eq!(trust, TrustRoot::Pinned(certificate.clone()));
    assert_eq!(connector.fetches(), 1);

    for year in [2024, 2025] {
        let again = resolve_trust(&connector, &server, &path, None, mid(year), TIMEOUT).await.unwrap();
        assert_eq!(again, TrustRoot::Pinned(certificate.clone()));
    }
    assert_eq!(connector.fetches(), 1);

    // expired: the pin is dropped and fetched exactly once more
    let refreshed = resolve_trust(&connector, &server, &path, None, mid(2027), TIMEOUT).await.unwrap();
    assert_eq!(refreshed, TrustRoot::Pinned(certificate));
    assert_eq!(connector.fetches(), 2);
    assert!(path.exists());
}

#[tokio::test]
async fn test_fingerprint_mismatch_is_not_pinned() {
    let dir = TempDir::new().unwrap();
    let server = tls_server();
    let path = cert_path(dir.path(), server.host());
    let certificate = certificate_valid_during(2024, 2030);
    let connector = CountingConnector::self_signed(certificate.clone());

    let wrong = "00".repeat(32);
    let result = resolve_trust(&connector, &server, &path, Some(&wrong), mid(2025), TIMEOUT).await;
    assert!(matches!(result, Err(NetworkError::Cert(CertError::FingerprintMismatch { .. }))));
    assert!(!path.exists());

    let expected = fingerprint(&certificate);
    let trust = resolve_trust(&connector, &server, &path, Some(&expected), mid(2025), TIMEOUT).await.unwrap();
    assert_eq!(trust, TrustRoot::Pinned(certificate));
}

#[tokio::test]
async fn test_fingerprint_refused_for_ca_signed_server() {
    let dir = TempDir::new().unwrap();
    let server = tls_server();
    let path = cert_path(dir.path(), server.host());
    let connector = CountingConnector::ca_signed();

    let result = resolve_trust(&connector, &server, &path, Some(&"ab".repeat(32)), mid(2025), TIMEOUT).await;
    assert!(matches!(result, Err(NetworkError::Cert(CertError::InvalidOptionCombination(_)))));
    assert!(!path.exists());
}

#[tokio::test]
async fn test_plaintext_needs_no_pin() {
    let dir = TempDir::new().unwrap();
    let server: ServerAddr = "electrum.local:50001:t".parse().unwrap();
    let path = cert_path(dir.path(), server.host());
    let connector = CountingConnector::ca_signed();

    let trust = resolve_trust(&connector, &server, &path, None, mid(2025), TIMEOUT).await.unwrap();
    assert_eq!(trust, TrustRoot::Plaintext);
    assert_eq!(connector.ca_checks(), 0);
    assert!(!path.exists());
}
