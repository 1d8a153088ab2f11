//! TLS listener and per-connection client details

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::connect_info::Connected;
use axum::serve::{IncomingStream, Listener};
use rustls::RootCertStore;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tracing::{debug, error};

use crate::config::ListenerTlsConfig;
use crate::proxy::{ClientInfo, TlsPeerInfo};
use crate::{Error, Result};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the TLS acceptor for the listener.
///
/// A configured client CA enables optional client certificates; clients
/// without one are still accepted.
pub fn tls_acceptor(config: &ListenerTlsConfig, http2: bool) -> Result<TlsAcceptor> {
    let certs = read_pem(&config.cert_path)?;
    let certs = CertificateDer::pem_slice_iter(&certs)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("{}: {e}", config.cert_path)))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!("{}: no certificates found", config.cert_path)));
    }
    let key = PrivateKeyDer::from_pem_slice(&read_pem(&config.key_path)?)
        .map_err(|e| Error::Tls(format!("{}: {e}", config.key_path)))?;

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let builder = rustls::ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(e.to_string()))?;
    let builder = match &config.client_ca_path {
        Some(path) => {
            let mut roots = RootCertStore::empty();
            for cert in CertificateDer::pem_slice_iter(&read_pem(path)?) {
                let cert = cert.map_err(|e| Error::Tls(format!("{path}: {e}")))?;
                roots
                    .add(cert)
                    .map_err(|e| Error::Tls(format!("{path}: {e}")))?;
            }
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                .allow_unauthenticated()
                .build()
                .map_err(|e| Error::Tls(format!("client verifier: {e}")))?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    let mut server_config = builder
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(format!("certificate/key mismatch: {e}")))?;
    server_config.alpn_protocols = if http2 {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    } else {
        vec![b"http/1.1".to_vec()]
    };

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn read_pem(path: &str) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| Error::Tls(format!("failed to read '{path}': {e}")))
}

/// Listener that hands out connections once their TLS handshake completed.
///
/// Handshakes run in their own tasks so a slow client never stalls accept.
pub struct TlsListener {
    incoming: mpsc::Receiver<(TlsStream<TcpStream>, SocketAddr)>,
    local_addr: SocketAddr,
}

impl TlsListener {
    /// Start accepting on `tcp`.
    pub fn new(tcp: TcpListener, acceptor: TlsAcceptor) -> io::Result<Self> {
        let local_addr = tcp.local_addr()?;
        let (tx, incoming) = mpsc::channel(128);
        tokio::spawn(accept_loop(tcp, acceptor, tx));
        Ok(Self {
            incoming,
            local_addr,
        })
    }
}

async fn accept_loop(
    tcp: TcpListener,
    acceptor: TlsAcceptor,
    tx: mpsc::Sender<(TlsStream<TcpStream>, SocketAddr)>,
) {
    while !tx.is_closed() {
        let (stream, remote) = match tcp.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => {
                    let _ = tx.send((tls, remote)).await;
                }
                Ok(Err(e)) => debug!(remote = %remote, error = %e, "TLS handshake failed"),
                Err(_) => debug!(remote = %remote, "TLS handshake timed out"),
            }
        });
    }
}

impl Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.incoming.recv().await {
            Some(accepted) => accepted,
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

impl Connected<IncomingStream<'_, TcpListener>> for ClientInfo {
    fn connect_info(stream: IncomingStream<'_, TcpListener>) -> Self {
        Self {
            remote_addr: *stream.remote_addr(),
            local_port: stream.io().local_addr().map_or(0, |a| a.port()),
            tls: None,
        }
    }
}

impl Connected<IncomingStream<'_, TlsListener>> for ClientInfo {
    fn connect_info(stream: IncomingStream<'_, TlsListener>) -> Self {
        let (tcp, session) = stream.io().get_ref();
        let tls = TlsPeerInfo {
            cipher_suite: session
                .negotiated_cipher_suite()
                .map(|suite| format!("{:?}", suite.suite())),
            protocol: session.protocol_version().map(|v| format!("{v:?}")),
            peer_certificates: session
                .peer_certificates()
                .map(|chain| chain.iter().map(|der| der.to_vec()).collect())
                .unwrap_or_default(),
        };
        Self {
            remote_addr: *stream.remote_addr(),
            local_port: tcp.local_addr().map_or(0, |a| a.port()),
            tls: Some(tls),
        }
    }
}
