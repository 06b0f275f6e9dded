//! Dialing servers over TCP, optionally wrapped in TLS.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::ClientConfig;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use super::server_addr::ServerAddr;
use super::session::BoxedStream;
use super::tls::{accept_any_client_config, ca_client_config, TrustRoot};
use crate::error::{NetworkError, NetworkResult};

/// An open byte stream to a server.
pub struct Connected {
    pub stream: BoxedStream,
    pub remote_addr: Option<SocketAddr>,
}

/// Opens streams to servers. Abstracted so connections can run over in-memory pipes.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, server: &ServerAddr, trust: &TrustRoot, timeout: Duration) -> NetworkResult<Connected>;

    /// Whether the server presents a certificate that validates against the CA
    /// roots. Handshake failures other than certificate rejection are errors.
    async fn check_ca_signed(&self, server: &ServerAddr, timeout: Duration) -> NetworkResult<bool>;

    /// The server's leaf certificate, read without validating it.
    async fn fetch_certificate(
        &self,
        server: &ServerAddr,
        timeout: Duration,
    ) -> NetworkResult<Option<CertificateDer<'static>>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl TcpConnector {
    pub fn new() -> Self {
        Self
    }

    async fn dial(&self, server: &ServerAddr, timeout: Duration) -> NetworkResult<TcpStream> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect((server.host(), server.port())))
            .await
            .map_err(|_| NetworkError::RequestTimedOut(format!("connecting to {}", server)))?
            .map_err(|e| NetworkError::ConnectionFailed(format!("{}: {}", server, e)))?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("[{}] failed to set TCP_NODELAY: {}", server, e);
        }
        Ok(stream)
    }

    async fn handshake(
        &self,
        server: &ServerAddr,
        config: Arc<ClientConfig>,
        stream: TcpStream,
        timeout: Duration,
    ) -> NetworkResult<std::io::Result<TlsStream<TcpStream>>> {
        let name = ServerName::try_from(server.host().to_string())
            .map_err(|e| NetworkError::InvalidArgument(format!("{}: {}", server, e)))?;
        tokio::time::timeout(timeout, TlsConnector::from(config).connect(name, stream))
            .await
            .map_err(|_| NetworkError::RequestTimedOut(format!("TLS handshake with {}", server)))
    }
}

fn is_certificate_rejection(err: &std::io::Error) -> bool {
    matches!(
        err.get_ref().and_then(|inner| inner.downcast_ref::<rustls::Error>()),
        Some(rustls::Error::InvalidCertificate(_))
    )
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, server: &ServerAddr, trust: &TrustRoot, timeout: Duration) -> NetworkResult<Connected> {
        let tcp = self.dial(server, timeout).await?;
        let remote_addr = tcp.peer_addr().ok();
        let stream: BoxedStream = match trust.client_config()? {
            None => Box::new(tcp),
            Some(config) => {
                let tls = self
                    .handshake(server, config, tcp, timeout)
                    .await?
                    .map_err(|e| NetworkError::Tls(format!("{}: {}", server, e)))?;
                Box::new(tls)
            }
        };
        Ok(Connected {
            stream,
            remote_addr,
        })
    }

    async fn check_ca_signed(&self, server: &ServerAddr, timeout: Duration) -> NetworkResult<bool> {
        let tcp = self.dial(server, timeout).await?;
        match self.handshake(server, ca_client_config()?, tcp, timeout).await? {
            Ok(_) => Ok(true),
            Err(e) if is_certificate_rejection(&e) => Ok(false),
            Err(e) => Err(NetworkError::Tls(format!("{}: {}", server, e))),
        }
    }

    async fn fetch_certificate(
        &self,
        server: &ServerAddr,
        timeout: Duration,
    ) -> NetworkResult<Option<CertificateDer<'static>>> {
        let tcp = self.dial(server, timeout).await?;
        let tls = self
            .handshake(server, accept_any_client_config()?, tcp, timeout)
            .await?
            .map_err(|e| NetworkError::Tls(format!("{}: {}", server, e)))?;
        let (_, connection) = tls.get_ref();
        Ok(connection.peer_certificates().and_then(|certs| certs.first()).map(|cert| cert.clone().into_owned()))
    }
}
