//! DNS server setup and lifecycle management.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::docker::ContainerApi;
use crate::error::DnsError;
use crate::events::EventConsumer;
use crate::inspect;
use crate::registry::HostRegistry;
use crate::responder::Responder;

/// Interval for emitting registry metrics.
const METRICS_INTERVAL: Duration = Duration::from_secs(10);

/// How long a receive may block before the shutdown token is checked again.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Receive buffer size.
const MAX_DATAGRAM: usize = 4096;

/// Periodically emit registry metrics.
async fn metrics_loop(registry: HostRegistry, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(METRICS_INTERVAL);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                registry.emit_metrics();
                debug!(
                    containers = registry.container_count(),
                    aliases = registry.alias_count(),
                    "emitted registry metrics"
                );
            }
            _ = shutdown.cancelled() => {
                debug!("metrics loop shutting down");
                return;
            }
        }
    }
}

/// Answer datagrams on `socket` until `shutdown` is cancelled.
///
/// Each receive waits at most [`RECEIVE_TIMEOUT`], so cancellation is
/// observed within that bound. Transport errors are logged and the loop
/// keeps going; undecodable datagrams are dropped.
pub async fn serve_udp(socket: UdpSocket, responder: Arc<Responder>, shutdown: CancellationToken) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    while !shutdown.is_cancelled() {
        let (len, peer) = match timeout(RECEIVE_TIMEOUT, socket.recv_from(&mut buf)).await {
            Err(_) => continue,
            Ok(Err(e)) => {
                error!(error = %e, "failed to receive datagram");
                continue;
            }
            Ok(Ok(received)) => received,
        };

        match responder.respond(&buf[..len]) {
            Ok(Some(reply)) => {
                if let Err(e) = socket.send_to(&reply, peer).await {
                    error!(%peer, error = %e, "failed to send response");
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(%peer, len, error = %e, "dropping undecodable datagram");
            }
        }
    }

    info!("UDP loop stopped");
}

/// DNS server for the containers of one Docker host.
pub struct DnsServer {
    config: Config,
    api: Arc<dyn ContainerApi>,
    registry: HostRegistry,
}

impl DnsServer {
    /// Create a server reading containers through `api`.
    pub fn new(config: Config, api: Arc<dyn ContainerApi>) -> Self {
        let registry = HostRegistry::new(&config.dns.domain);
        Self {
            config,
            api,
            registry,
        }
    }

    /// The container registry.
    pub fn registry(&self) -> &HostRegistry {
        &self.registry
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), DnsError> {
        self.start_with(shutdown).await?.wait().await
    }

    /// Load the registry, bind sockets and serve in the background.
    ///
    /// Failing to enumerate containers or to bind is returned here; nothing
    /// is left running in that case.
    pub async fn start(self) -> Result<ServerHandle, DnsError> {
        self.start_with(CancellationToken::new()).await
    }

    async fn start_with(self, shutdown: CancellationToken) -> Result<ServerHandle, DnsError> {
        info!(
            listen_addr = %self.config.dns.listen_addr,
            domain = %self.config.dns.domain,
            "starting dock-dns"
        );

        let responder = Arc::new(Responder::from_config(
            self.registry.clone(),
            &self.config.dns,
        )?);

        self.registry.initialize(self.api.as_ref()).await?;
        self.registry.emit_metrics();

        let socket = UdpSocket::bind(self.config.dns.listen_addr).await?;
        let local_addr = socket.local_addr()?;
        info!(addr = %local_addr, "DNS UDP listening");

        let http = match self.config.http.listen_addr {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };

        let Self { api, registry, .. } = self;
        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            let events = tokio::spawn(EventConsumer::new(api, registry.clone()).run(token.clone()));
            let metrics = tokio::spawn(metrics_loop(registry.clone(), token.clone()));
            let http = http.map(|listener| {
                tokio::spawn(inspect::serve(listener, registry.clone(), token.clone()))
            });

            serve_udp(socket, responder, token.clone()).await;
            token.cancel();

            if let Err(e) = events.await {
                error!(error = %e, "event consumer task panicked");
            }
            if let Err(e) = metrics.await {
                error!(error = %e, "metrics task panicked");
            }
            if let Some(http) = http {
                match http.await {
                    Ok(Err(e)) => error!(error = %e, "inspection endpoint failed"),
                    Err(e) => error!(error = %e, "inspection endpoint task panicked"),
                    Ok(Ok(())) => {}
                }
            }

            info!("dock-dns stopped");
            Ok::<(), DnsError>(())
        });

        Ok(ServerHandle {
            shutdown,
            task,
            local_addr,
        })
    }
}

/// A running server.
pub struct ServerHandle {
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), DnsError>>,
    local_addr: SocketAddr,
}

impl ServerHandle {
    /// Address the UDP socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Token that stops the server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Request shutdown and wait for every task to finish.
    pub async fn stop(self) -> Result<(), DnsError> {
        self.shutdown.cancel();
        self.wait().await
    }

    /// Wait for the server to stop on its own.
    pub async fn wait(self) -> Result<(), DnsError> {
        self.task.await.map_err(|e| DnsError::Io(io::Error::other(e)))?
    }
}
