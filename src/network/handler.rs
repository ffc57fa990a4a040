//! Main network handler

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnectionBuilder;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::proxy::FixtureProxy;
use crate::{Result, TapedeckError};

use super::connection_pool::ConnectionPool;
use super::{build_acceptor, HttpHandler, StaticRoutes, SHUTDOWN_TIMEOUT_MS};

/// Main network handler running the HTTP and HTTPS listeners
pub struct NetworkHandler {
    config: Arc<Config>,
    handler: Arc<HttpHandler>,
    connection_pool: ConnectionPool,
    shutdown_tx: broadcast::Sender<()>,
}

impl NetworkHandler {
    /// Create a new network handler
    ///
    /// # Errors
    ///
    /// Returns error if the proxy cannot be built
    pub fn new(config: Config) -> Result<Self> {
        let proxy = Arc::new(FixtureProxy::new(&config)?);
        let statics = StaticRoutes::new(&config.static_routes);
        let handler = HttpHandler::new(proxy, statics, config.limits.max_request_size);
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            connection_pool: ConnectionPool::new(config.limits.max_connections),
            config: Arc::new(config),
            handler: Arc::new(handler),
            shutdown_tx,
        })
    }

    /// Sender that stops the handler when signalled
    #[must_use]
    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Bind both listeners and run until shutdown
    ///
    /// HTTP listens on the configured port and HTTPS on the port after it.
    ///
    /// # Errors
    ///
    /// Returns error if a listener cannot be bound or TLS setup fails
    pub async fn run(self) -> Result<()> {
        let host = self.config.host.as_str();
        let port = self.config.port;

        let plain = TcpListener::bind((host, port)).await?;
        let secure = TcpListener::bind((host, port + 1)).await?;

        self.run_with_listeners(plain, Some(secure)).await
    }

    /// Run on already bound listeners until shutdown
    ///
    /// # Errors
    ///
    /// Returns error if TLS setup fails or a listener task dies
    pub async fn run_with_listeners(
        self,
        plain: TcpListener,
        secure: Option<TcpListener>,
    ) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut tasks = JoinSet::new();

        info!(
            "{} mode, proxying {} (fixtures in {})",
            if self.config.mode().is_record() { "Record" } else { "Replay" },
            self.config.mock.origin(),
            self.config.out.display()
        );

        tasks.spawn(self.accept_loop(plain, None));
        if let Some(secure) = secure {
            let acceptor = build_acceptor(self.config.ssl.as_ref())?;
            tasks.spawn(self.accept_loop(secure, Some(acceptor)));
        }

        let shutdown_signal = async {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT, shutting down");
                }
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                }
            }
        };

        tokio::select! {
            () = shutdown_signal => {
                info!("Initiating graceful shutdown");
            }
            Some(result) = tasks.join_next() => {
                if let Err(e) = result {
                    error!("Listener task failed: {}", e);
                    return Err(TapedeckError::Other(format!("Listener task failed: {e}")));
                }
            }
        }

        self.shutdown_tx.send(()).ok();

        let shutdown_timeout = Duration::from_millis(SHUTDOWN_TIMEOUT_MS);
        tokio::time::timeout(shutdown_timeout, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    warn!("Task cleanup error: {}", e);
                }
            }
        })
        .await
        .ok();

        info!("Shutdown complete");
        Ok(())
    }

    /// Accept connections on one listener until shutdown
    fn accept_loop(
        &self,
        listener: TcpListener,
        acceptor: Option<TlsAcceptor>,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        let handler = Arc::clone(&self.handler);
        let pool = self.connection_pool.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let protocol = if acceptor.is_some() { "https:" } else { "http:" };

        async move {
            match listener.local_addr() {
                Ok(addr) => info!("Listening on {}//{}", protocol, addr),
                Err(e) => warn!("Listening on unknown address: {}", e),
            }

            loop {
                tokio::select! {
                    result = listener.accept() => {
                        let (stream, peer_addr) = match result {
                            Ok(accepted) => accepted,
                            Err(e) => {
                                error!("Accept error: {}", e);
                                continue;
                            }
                        };

                        let Some(guard) = pool.try_acquire() else {
                            warn!("Connection limit reached, rejecting {}", peer_addr);
                            continue;
                        };

                        let handler = Arc::clone(&handler);
                        let acceptor = acceptor.clone();

                        tokio::spawn(async move {
                            let _guard = guard;
                            match acceptor {
                                Some(acceptor) => match acceptor.accept(stream).await {
                                    Ok(stream) => {
                                        serve_connection(stream, handler, protocol, peer_addr)
                                            .await;
                                    }
                                    Err(e) => {
                                        debug!("TLS handshake with {} failed: {}", peer_addr, e);
                                    }
                                },
                                None => {
                                    serve_connection(stream, handler, protocol, peer_addr).await;
                                }
                            }
                        });
                    }
                    _ = shutdown_rx.recv() => {
                        info!("{} listener shutting down", protocol);
                        break;
                    }
                }
            }
        }
    }
}

async fn serve_connection<S>(
    stream: S,
    handler: Arc<HttpHandler>,
    protocol: &'static str,
    peer_addr: SocketAddr,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |request| {
        let handler = Arc::clone(&handler);
        async move { Ok::<_, Infallible>(handler.handle(request, protocol).await) }
    });

    if let Err(e) = ConnectionBuilder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        debug!("Connection error from {}: {}", peer_addr, e);
    }
}
