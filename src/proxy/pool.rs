//! Upstream connection pool
//!
//! Connections are borrowed exclusively for one exchange through a
//! [`PooledConnection`] guard. The guard goes back to the idle list on drop
//! only when the exchange completed cleanly; otherwise the connection is
//! closed. Either way no exit path leaks a borrowed connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::body::Body;
use http::{Request, Response};
use hyper::body::Incoming;
use hyper::client::conn::{http1, http2};
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::Mutex;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use super::ProxyError;
use super::target::Upstream;
use crate::config::ProxyConfig;

/// A live client connection
enum Sender {
    Http1(http1::SendRequest<Body>),
    Http2(http2::SendRequest<Body>),
}

impl Sender {
    fn is_closed(&self) -> bool {
        match self {
            Self::Http1(s) => s.is_closed(),
            Self::Http2(s) => s.is_closed(),
        }
    }

    async fn ready(&mut self) -> Result<(), hyper::Error> {
        match self {
            Self::Http1(s) => s.ready().await,
            Self::Http2(s) => s.ready().await,
        }
    }
}

/// Per-host pool of idle upstream connections
pub struct ConnectionPool {
    idle: Mutex<HashMap<String, Vec<Sender>>>,
    max_idle_per_host: usize,
    connect_timeout: Duration,
    tls: TlsConnector,
    http2: bool,
    connect_attempts: AtomicU64,
}

impl ConnectionPool {
    /// Create a pool from the `proxy` section.
    pub fn new(config: &ProxyConfig) -> Result<Self, ProxyError> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if let Some(path) = &config.upstream_ca_path {
            let pem = std::fs::read(path)
                .map_err(|e| ProxyError::Tls(format!("failed to read '{path}': {e}")))?;
            for cert in CertificateDer::pem_slice_iter(&pem) {
                let cert = cert.map_err(|e| ProxyError::Tls(format!("'{path}': {e}")))?;
                roots
                    .add(cert)
                    .map_err(|e| ProxyError::Tls(format!("'{path}': {e}")))?;
            }
        }

        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let mut tls = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ProxyError::Tls(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();
        tls.alpn_protocols = if config.http2_enabled {
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        } else {
            vec![b"http/1.1".to_vec()]
        };

        Ok(Self {
            idle: Mutex::new(HashMap::new()),
            max_idle_per_host: config.connections_per_host,
            connect_timeout: config.connect_timeout,
            tls: TlsConnector::from(Arc::new(tls)),
            http2: config.http2_enabled,
            connect_attempts: AtomicU64::new(0),
        })
    }

    /// Borrow a connection to `upstream`, reusing an idle one when possible.
    pub async fn acquire(self: &Arc<Self>, upstream: &Upstream) -> Result<PooledConnection, ProxyError> {
        let key = format!("{}://{}", upstream.scheme(), upstream.authority());

        loop {
            let candidate = self.idle.lock().get_mut(&key).and_then(Vec::pop);
            let Some(mut sender) = candidate else {
                break;
            };
            if sender.is_closed() || sender.ready().await.is_err() {
                trace!(upstream = %key, "Discarding stale pooled connection");
                continue;
            }
            trace!(upstream = %key, "Reusing pooled connection");
            return Ok(self.guard(key, sender));
        }

        let sender = self.connect(upstream).await?;
        Ok(self.guard(key, sender))
    }

    fn guard(self: &Arc<Self>, key: String, sender: Sender) -> PooledConnection {
        PooledConnection {
            pool: Arc::clone(self),
            key,
            sender: Some(sender),
            reusable: false,
        }
    }

    async fn connect(&self, upstream: &Upstream) -> Result<Sender, ProxyError> {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
        let authority = upstream.authority();
        debug!(upstream = %authority, tls = upstream.tls, "Connecting to upstream");

        let connect = async {
            let tcp = TcpStream::connect((upstream.host.as_str(), upstream.port))
                .await
                .map_err(|e| ProxyError::connect(&authority, e))?;
            let _ = tcp.set_nodelay(true);

            if !upstream.tls {
                return handshake(tcp, false)
                    .await
                    .map_err(|e| ProxyError::connect(&authority, e));
            }

            let name = ServerName::try_from(upstream.host.clone())
                .map_err(|e| ProxyError::InvalidTarget(format!("{}: {e}", upstream.host)))?;
            let stream = self
                .tls
                .connect(name, tcp)
                .await
                .map_err(|e| ProxyError::connect(&authority, e))?;
            let h2 = self.http2 && stream.get_ref().1.alpn_protocol() == Some(b"h2".as_slice());
            handshake(stream, h2)
                .await
                .map_err(|e| ProxyError::connect(&authority, e))
        };

        tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| ProxyError::connect(&authority, "connect timed out"))?
    }

    fn release(&self, key: String, sender: Sender) {
        if sender.is_closed() {
            return;
        }
        let mut idle = self.idle.lock();
        let list = idle.entry(key).or_default();
        if list.len() < self.max_idle_per_host {
            list.push(sender);
        }
    }

    /// Total connection attempts made (successful or not)
    #[must_use]
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::Relaxed)
    }

    /// Idle connections across all hosts
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.idle.lock().values().map(Vec::len).sum()
    }
}

async fn handshake<S>(io: S, h2: bool) -> Result<Sender, hyper::Error>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let io = TokioIo::new(io);
    if h2 {
        let (sender, conn) = http2::handshake(TokioExecutor::new(), io).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "Upstream HTTP/2 connection closed with error");
            }
        });
        Ok(Sender::Http2(sender))
    } else {
        let (sender, conn) = http1::handshake(io).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!(error = %e, "Upstream connection closed with error");
            }
        });
        Ok(Sender::Http1(sender))
    }
}

/// A request that failed on a borrowed connection
#[derive(Debug)]
pub struct SendFailure {
    /// What went wrong
    pub error: ProxyError,
    /// The request, when it never reached the upstream
    pub unsent: Option<Request<Body>>,
}

/// An exclusively borrowed upstream connection
pub struct PooledConnection {
    pool: Arc<ConnectionPool>,
    key: String,
    sender: Option<Sender>,
    reusable: bool,
}

impl PooledConnection {
    /// Whether requests go out as HTTP/2
    #[must_use]
    pub fn is_http2(&self) -> bool {
        matches!(self.sender, Some(Sender::Http2(_)))
    }

    /// Send one request. If it could not be written at all the request is
    /// handed back inside the error so it can be retried elsewhere.
    pub async fn send(&mut self, request: Request<Body>) -> Result<Response<Incoming>, SendFailure> {
        let sent = match self.sender.as_mut() {
            Some(Sender::Http1(s)) => s.try_send_request(request).await,
            Some(Sender::Http2(s)) => s.try_send_request(request).await,
            None => {
                return Err(SendFailure {
                    error: ProxyError::Upstream("connection already released".to_string()),
                    unsent: Some(request),
                });
            }
        };
        sent.map_err(|mut e| {
            let unsent = e.take_message();
            let error = e.into_error();
            SendFailure {
                error: if unsent.is_some() {
                    ProxyError::connect(&self.key, error)
                } else {
                    ProxyError::Upstream(error.to_string())
                },
                unsent,
            }
        })
    }

    /// The exchange completed; the connection may serve another request.
    pub fn mark_reusable(&mut self) {
        self.reusable = true;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            if self.reusable {
                self.pool.release(std::mem::take(&mut self.key), sender);
            } else {
                trace!(upstream = %self.key, "Closing upstream connection");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn pool() -> Arc<ConnectionPool> {
        Arc::new(
            ConnectionPool::new(&ProxyConfig {
                connect_timeout: Duration::from_millis(500),
                ..ProxyConfig::default()
            })
            .unwrap(),
        )
    }

    async fn refused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn refused_connection_counts_one_attempt() {
        let pool = pool();
        let upstream = Upstream::parse(&format!("http://127.0.0.1:{}", refused_port().await)).unwrap();

        let err = pool.acquire(&upstream).await.err().unwrap();
        assert!(err.is_connect());
        assert_eq!(pool.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn completed_exchange_returns_connection_to_pool() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            for _ in 0..2 {
                let _ = socket.read(&mut buf).await.unwrap();
                socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
                    .await
                    .unwrap();
            }
        });

        let pool = pool();
        let upstream = Upstream::parse(&format!("http://127.0.0.1:{port}")).unwrap();

        for _ in 0..2 {
            let mut conn = pool.acquire(&upstream).await.unwrap();
            let request = Request::get("/").header("host", "x").body(Body::empty()).unwrap();
            let response = conn.send(request).await.unwrap();
            assert_eq!(response.status(), 200);
            let _ = http_body_util::BodyExt::collect(response.into_body()).await.unwrap();
            conn.mark_reusable();
        }

        assert_eq!(pool.connect_attempts(), 1);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn abandoned_exchange_closes_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let pool = pool();
        let upstream = Upstream::parse(&format!("http://127.0.0.1:{port}")).unwrap();
        let conn = pool.acquire(&upstream).await.unwrap();
        drop(conn);

        assert_eq!(pool.idle_count(), 0);
    }
}
