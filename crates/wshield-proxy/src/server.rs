//! Proxy server: TCP listener, connection dispatch, and lifecycle.
//!
//! The server binds `host:port` (port 0 = OS-assigned), accepts TCP
//! connections and runs each one in its own task. A connection task ends
//! when the handler finishes, when the registry signals a list change, or
//! when the proxy shuts down, whichever comes first. Dropping the handler
//! future closes both sockets.

use crate::error::{log_connection_error, ProxyError, Result};
use crate::handler;
use crate::registry::ConnectionRegistry;
use crate::upstream::{DirectConnector, UpstreamConnector};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use wshield_core::config::ProxyConfig;
use wshield_core::{FilterEngine, TelemetrySink};

/// Pending-connection queue length
const LISTEN_BACKLOG: i32 = 1024;

/// How long shutdown waits for connection tasks before aborting them
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const RESPONSE_503: &[u8] =
    b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Shared state for the proxy server
pub(crate) struct ProxyState {
    pub(crate) config: ProxyConfig,
    pub(crate) engine: Arc<FilterEngine>,
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) telemetry: Arc<TelemetrySink>,
    pub(crate) connector: Arc<dyn UpstreamConnector>,
}

/// Handle returned when the proxy server starts
///
/// Call [`shutdown`](Self::shutdown) to stop accepting and close every live
/// connection, then [`wait`](Self::wait) for the accept loop to finish.
pub struct ProxyHandle {
    /// The address the proxy is listening on
    pub local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ProxyHandle {
    /// Signal the proxy to shut down
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait until the accept loop and every connection task have ended
    pub async fn wait(self) -> Result<()> {
        self.task.await.map_err(|e| {
            ProxyError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("accept loop failed: {e}"),
            ))
        })
    }
}

/// Filtering forward proxy
pub struct ProxyServer;

impl ProxyServer {
    /// Bind and start serving with direct upstream connections
    pub async fn start(
        config: ProxyConfig,
        engine: Arc<FilterEngine>,
        registry: Arc<ConnectionRegistry>,
        telemetry: Arc<TelemetrySink>,
    ) -> Result<ProxyHandle> {
        Self::start_with_connector(config, engine, registry, telemetry, Arc::new(DirectConnector))
            .await
    }

    /// Bind and start serving, dialing origins through `connector`
    pub async fn start_with_connector(
        config: ProxyConfig,
        engine: Arc<FilterEngine>,
        registry: Arc<ConnectionRegistry>,
        telemetry: Arc<TelemetrySink>,
        connector: Arc<dyn UpstreamConnector>,
    ) -> Result<ProxyHandle> {
        let listener = bind_listener(&config).await?;
        let local_addr = listener.local_addr().map_err(|e| ProxyError::Bind {
            addr: config.listen_addr(),
            source: e,
        })?;
        info!(
            addr = %local_addr,
            max_connections = config.max_connections,
            "Proxy server listening"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = Arc::new(ProxyState {
            config,
            engine,
            registry,
            telemetry,
            connector,
        });
        let task = tokio::spawn(accept_loop(listener, state, shutdown_rx));

        Ok(ProxyHandle {
            local_addr,
            shutdown_tx,
            task,
        })
    }
}

/// Resolve and bind the listen address with `SO_REUSEADDR`
async fn bind_listener(config: &ProxyConfig) -> Result<TcpListener> {
    let display = config.listen_addr();
    let bind_err = |source: io::Error| ProxyError::Bind {
        addr: display.clone(),
        source,
    };

    let addr = tokio::net::lookup_host((config.host.as_str(), config.port))
        .await
        .map_err(bind_err)?
        .next()
        .ok_or_else(|| {
            bind_err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "host resolved to no addresses",
            ))
        })?;

    let socket =
        Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP)).map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_err)?;
    TcpListener::from_std(socket.into()).map_err(bind_err)
}

/// Accept loop: listen for connections until shutdown
async fn accept_loop(
    listener: TcpListener,
    state: Arc<ProxyState>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => admit(stream, peer, &state, &shutdown_rx, &mut tasks),
                    Err(e) => warn!("Accept error: {}", e),
                }
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        warn!("Connection task panicked: {}", e);
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                // A dropped handle stops the server too
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    drop(listener);
    info!(live = tasks.len(), "Proxy server shutting down");
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(remaining = tasks.len(), "Aborting connections that did not close");
        tasks.shutdown().await;
    }
    debug!("Accept loop stopped");
}

fn admit(
    stream: TcpStream,
    peer: SocketAddr,
    state: &Arc<ProxyState>,
    shutdown_rx: &watch::Receiver<bool>,
    tasks: &mut JoinSet<()>,
) {
    let max = state.config.max_connections;
    let live = state.registry.len();
    if max > 0 && live >= max {
        warn!(%peer, live, max, "Connection limit reached, rejecting");
        // Non-blocking best effort; the socket closes on drop either way
        let _ = stream.try_write(RESPONSE_503);
        return;
    }

    debug!(%peer, "Accepted connection");
    let guard = state.registry.register_stream(&stream, peer);
    let state = Arc::clone(state);
    let shutdown = shutdown_rx.clone();

    tasks.spawn(async move {
        let result = tokio::select! {
            result = handler::serve(stream, peer, &state, &guard) => result,
            _ = guard.cancelled() => {
                debug!(%peer, "Connection closed after list change");
                Ok(())
            }
            _ = stopped(shutdown) => Err(ProxyError::Shutdown),
        };
        if let Err(e) = result {
            log_connection_error(peer, &e);
        }
    });
}

/// Resolves once shutdown is requested or the handle is gone
async fn stopped(mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
impl ProxyState {
    /// Default engine over empty lists, short timeouts
    pub(crate) fn for_tests(connector: Arc<dyn UpstreamConnector>) -> Self {
        use wshield_core::lists::{FileFetcher, MemoryPersistence};
        use wshield_core::threat::NoThreatFeed;
        use wshield_core::{Config, ListStore, RateLimiter, VerdictCache};

        let config = Config::default();
        let mut lists_config = config.lists.clone();
        lists_config.sources.clear();
        let lists = Arc::new(ListStore::new(
            lists_config,
            Arc::new(FileFetcher::new()),
            Arc::new(MemoryPersistence::new()),
        ));
        let engine = Arc::new(FilterEngine::new(
            &config,
            lists,
            Arc::new(RateLimiter::from_config(&config.rate_limit)),
            Arc::new(NoThreatFeed),
            Arc::new(VerdictCache::from_config(&config.cache)),
        ));

        Self {
            config: ProxyConfig {
                connect_timeout_secs: 5,
                response_timeout_secs: 1,
                retry_response_timeout_secs: 1,
                ..ProxyConfig::default()
            },
            engine,
            registry: Arc::new(ConnectionRegistry::new()),
            telemetry: Arc::new(TelemetrySink::default()),
            connector,
        }
    }
}
