//! Accept loop and per-connection handler tasks.

use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    task::{JoinError, JoinSet},
};
use tracing::{debug, info, warn};

use crate::{
    config::RelayConfig,
    connection::{Connection, ConnectionOptions, ReceiveError, Received},
    dispatch::broadcast,
    registry::{ClientRegistry, ClientToken},
};

/// Pause after running out of descriptors or buffers before accepting again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct RelayServer {
    listener: TcpListener,
    registry: Arc<ClientRegistry>,
    options: ConnectionOptions,
}

impl RelayServer {
    /// Binds the configured address. Failure here is fatal to the caller.
    pub async fn bind(config: &RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;
        Ok(Self::new(listener, config.connection_options()))
    }

    pub fn new(listener: TcpListener, options: ConnectionOptions) -> Self {
        Self {
            listener,
            registry: Arc::new(ClientRegistry::new()),
            options,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<ClientRegistry> {
        Arc::clone(&self.registry)
    }

    /// Accepts and relays until `shutdown` resolves or the listener fails.
    ///
    /// On the way out the listener is released, every live connection is
    /// closed and all handler tasks are awaited, whichever way the loop ended.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let RelayServer {
            listener,
            registry,
            options,
        } = self;
        let mut handlers = JoinSet::new();
        tokio::pin!(shutdown);

        let result = loop {
            select! {
                _ = &mut shutdown => {
                    info!("relay shutting down");
                    break Ok(());
                }
                accept_result = listener.accept() => {
                    if let Err(err) =
                        handle_accept_result(accept_result, &registry, options, &mut handlers).await
                    {
                        break Err(err);
                    }
                }
                Some(joined) = handlers.join_next() => log_handler_exit(joined),
            }
        };

        drop(listener);
        stop_handlers(&registry, handlers).await;
        result
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_accept_result(
    result: io::Result<(TcpStream, SocketAddr)>,
    registry: &Arc<ClientRegistry>,
    options: ConnectionOptions,
    handlers: &mut JoinSet<()>,
) -> Result<()> {
    match result {
        Ok((stream, peer)) => {
            spawn_client_handler(stream, peer, registry, options, handlers).await;
            Ok(())
        }
        Err(err) if is_transient_accept_error(&err) => {
            warn!(error = ?err, "failed to accept connection");
            if is_resource_exhaustion(&err) {
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
            Ok(())
        }
        Err(err) => Err(anyhow::Error::new(err).context("listening socket failed")),
    }
}

async fn spawn_client_handler(
    stream: TcpStream,
    peer: SocketAddr,
    registry: &Arc<ClientRegistry>,
    options: ConnectionOptions,
    handlers: &mut JoinSet<()>,
) {
    let connection = Connection::new(stream, peer, options);
    let token = registry.register(connection.peer()).await;
    info!(%peer, %token, "client registered");

    handlers.spawn(handle_connection(connection, token, Arc::clone(registry)));
}

async fn handle_connection(
    mut connection: Connection,
    token: ClientToken,
    registry: Arc<ClientRegistry>,
) {
    let outcome = relay_messages(&mut connection, token, &registry).await;

    registry.unregister(token).await;
    connection.close().await;

    let peer = connection.addr();
    match outcome {
        Ok(()) => info!(%peer, %token, "client disconnected"),
        Err(ReceiveError::Closed) => info!(%peer, %token, "client connection closed by relay"),
        Err(error) => warn!(%peer, %token, %error, "client connection closed with error"),
    }
}

async fn relay_messages(
    connection: &mut Connection,
    token: ClientToken,
    registry: &ClientRegistry,
) -> Result<(), ReceiveError> {
    loop {
        match connection.receive().await? {
            Received::Message(payload) => {
                debug!(%token, bytes = payload.len(), "relaying message");
                broadcast(registry, &payload, token).await;
            }
            Received::EndOfStream => return Ok(()),
        }
    }
}

async fn stop_handlers(registry: &ClientRegistry, mut handlers: JoinSet<()>) {
    for (_, peer) in registry.snapshot().await {
        peer.close().await;
    }
    while let Some(joined) = handlers.join_next().await {
        log_handler_exit(joined);
    }
    info!("relay stopped");
}

fn log_handler_exit(joined: Result<(), JoinError>) {
    if let Err(err) = joined {
        warn!(error = ?err, "client handler task failed");
    }
}

/// Errors that affect one pending connection rather than the listener.
fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::NetworkDown
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::OutOfMemory
    ) || is_pending_connection_errno(err)
        || is_resource_exhaustion(err)
}

// accept(2) passes these through from the new socket: ENONET, EPROTO,
// ENOPROTOOPT, EOPNOTSUPP, EHOSTDOWN
fn is_pending_connection_errno(err: &io::Error) -> bool {
    cfg!(target_os = "linux") && matches!(err.raw_os_error(), Some(64 | 71 | 92 | 95 | 112))
}

// ENOMEM / ENFILE / EMFILE / ENOBUFS
fn is_resource_exhaustion(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::OutOfMemory
        || (cfg!(target_os = "linux") && matches!(err.raw_os_error(), Some(12 | 23 | 24 | 105)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_connection_accept_errors_are_transient() {
        for kind in [
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::Interrupted,
            io::ErrorKind::NetworkDown,
            io::ErrorKind::NetworkUnreachable,
            io::ErrorKind::HostUnreachable,
            io::ErrorKind::OutOfMemory,
        ] {
            assert!(is_transient_accept_error(&io::Error::from(kind)), "{kind:?}");
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn linux_accept_errnos_are_transient() {
        // ENONET, ENOMEM, ENFILE, EMFILE, EPROTO, ENOPROTOOPT, EOPNOTSUPP,
        // ENETDOWN, ENETUNREACH, ENOBUFS, EHOSTDOWN, EHOSTUNREACH
        for errno in [64, 12, 23, 24, 71, 92, 95, 100, 101, 105, 112, 113] {
            let err = io::Error::from_raw_os_error(errno);
            assert!(is_transient_accept_error(&err), "errno {errno}");
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn resource_exhaustion_triggers_backoff() {
        for errno in [12, 23, 24, 105] {
            assert!(is_resource_exhaustion(&io::Error::from_raw_os_error(errno)), "errno {errno}");
        }
        assert!(!is_resource_exhaustion(&io::Error::from_raw_os_error(71)));
    }

    #[test]
    fn listener_level_errors_are_fatal() {
        for kind in [io::ErrorKind::InvalidInput, io::ErrorKind::PermissionDenied] {
            assert!(!is_transient_accept_error(&io::Error::from(kind)), "{kind:?}");
        }
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let config = RelayConfig {
            listen: taken.local_addr().expect("addr"),
            ..RelayConfig::default()
        };

        let result = RelayServer::bind(&config).await;
        assert!(result.is_err());
    }
}
