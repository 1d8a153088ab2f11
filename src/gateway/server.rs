//! Gateway server

use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{debug, info, warn};

use super::listener::{TlsListener, tls_acceptor};
use super::router::{AppState, create_router};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::oauth::{OAuthClient, ProviderRegistry, TokenIssuer};
use crate::proxy::{ClientInfo, ProxyHandler};
use crate::security::{AuthState, KeyResolver, SwtVerifier, TokenVerifier};
use crate::{Error, Result};

/// Authenticating reverse proxy server
///
/// The composition root: every client, cache and verifier is built here
/// once and shared through `Arc`s.
pub struct Gateway {
    config: Config,
    state: Arc<AppState>,
    auth: Arc<AuthState>,
    keys: Arc<KeyResolver>,
}

impl Gateway {
    /// Create a new gateway on the system clock
    pub fn new(config: Config) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a new gateway with an explicit clock
    pub fn with_clock(config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        let client = Arc::new(OAuthClient::new(config.client.request_timeout)?);
        let providers = Arc::new(ProviderRegistry::from_config(&config.client));

        let issuer = Arc::new(TokenIssuer::new(
            Arc::clone(&client),
            Arc::clone(&providers),
            &config.client,
            Arc::clone(&clock),
        ));
        let keys = Arc::new(KeyResolver::new(
            Arc::clone(&client),
            Arc::clone(&providers),
            &config.security,
        )?);
        let verifier = Arc::new(TokenVerifier::new(
            Arc::clone(&keys),
            &config.security,
            Arc::clone(&clock),
        ));
        let swt = config.security.enable_swt.then(|| {
            Arc::new(SwtVerifier::new(
                Arc::clone(&client),
                Arc::clone(&providers),
                &config.security,
                Arc::clone(&clock),
            ))
        });

        let auth = Arc::new(AuthState::new(
            &config.security,
            Arc::clone(&verifier),
            swt.clone(),
            Arc::clone(&providers),
        ));

        let proxy = if config.proxy.enabled {
            Some(Arc::new(ProxyHandler::new(
                &config.proxy,
                Some(Arc::clone(&issuer)),
            )?))
        } else {
            None
        };

        for (id, provider) in &config.client.providers {
            debug!(service_id = %id, server = %provider.server_url, "Registered OAuth provider");
        }

        let state = Arc::new(AppState {
            proxy,
            issuer,
            verifier,
            swt,
        });

        Ok(Self {
            config,
            state,
            auth,
            keys,
        })
    }

    /// The HTTP application
    pub fn router(&self) -> Router {
        create_router(Arc::clone(&self.state), Arc::clone(&self.auth))
    }

    /// Shared state (for inspection)
    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Run the gateway until Ctrl-C or SIGTERM
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        if self.config.security.bootstrap_from_key_service {
            self.keys.bootstrap(&self.config.security.jwk_service_ids).await;
        }

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        self.spawn_cache_sweep(shutdown_tx.subscribe());

        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("AUTHPROXY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, tls = self.config.server.tls.is_some(), "Listening");
        info!(providers = self.config.client.providers.len(), "OAuth providers registered");
        for route in &self.config.proxy.routes {
            info!(prefix = %route.path_prefix, hosts = ?route.hosts, "Proxy route");
        }
        if self.config.security.enabled {
            info!(mode = ?self.config.security.key_resolver, "AUTHENTICATION enabled");
        } else {
            warn!("AUTHENTICATION disabled - gateway is open to all requests");
        }
        info!("============================================================");

        let shutdown_timeout = self.config.server.shutdown_timeout;
        let mut drain_rx = shutdown_tx.subscribe();
        let drain_deadline = async move {
            let _ = drain_rx.recv().await;
            tokio::time::sleep(shutdown_timeout).await;
        };

        let app = self.router().into_make_service_with_connect_info::<ClientInfo>();
        let signal = shutdown_signal(shutdown_tx);

        let served = match &self.config.server.tls {
            Some(tls) => {
                let acceptor = tls_acceptor(tls, self.config.server.http2)?;
                let listener = TlsListener::new(listener, acceptor)?;
                tokio::select! {
                    r = axum::serve(listener, app).with_graceful_shutdown(signal).into_future() => r,
                    () = drain_deadline => {
                        warn!(timeout = ?shutdown_timeout, "Graceful shutdown timed out");
                        Ok(())
                    }
                }
            }
            None => {
                tokio::select! {
                    r = axum::serve(listener, app).with_graceful_shutdown(signal).into_future() => r,
                    () = drain_deadline => {
                        warn!(timeout = ?shutdown_timeout, "Graceful shutdown timed out");
                        Ok(())
                    }
                }
            }
        };
        served.map_err(|e| Error::Internal(e.to_string()))?;

        info!("Gateway stopped");
        Ok(())
    }

    /// Serve plain HTTP on an already bound listener until `shutdown`
    /// resolves.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let app = self.router().into_make_service_with_connect_info::<ClientInfo>();
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::Internal(e.to_string()))
    }

    /// Periodically drop expired verification results.
    fn spawn_cache_sweep(&self, mut shutdown_rx: tokio::sync::broadcast::Receiver<()>) {
        let state = Arc::clone(&self.state);
        let period = self
            .config
            .security
            .jwt_cache_ttl
            .max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let mut evicted = state.verifier.evict_expired();
                        if let Some(swt) = &state.swt {
                            evicted += swt.evict_expired();
                        }
                        if evicted > 0 {
                            debug!(evicted, "Swept expired verification results");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
