//! Docker Engine API access.
//!
//! The registry only needs three operations from the orchestrator, captured
//! by [`ContainerApi`]. [`DockerClient`] implements them over the Engine's
//! HTTP API, reached through a unix socket or TCP; tests substitute an
//! in-memory implementation.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use hyper::body::Bytes;
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tracing::{debug, trace, warn};

use crate::config::DockerConfig;
use crate::error::DnsError;

/// Stream of container lifecycle events.
pub type EventStream = BoxStream<'static, Result<ContainerEvent, DnsError>>;

/// Read access to the container orchestrator.
#[async_trait]
pub trait ContainerApi: Send + Sync {
    /// List currently running containers.
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, DnsError>;

    /// Fetch the network settings of one container.
    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, DnsError>;

    /// Subscribe to container lifecycle events.
    async fn events(&self) -> Result<EventStream, DnsError>;
}

/// One row of `GET /containers/json`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSummary {
    /// Container id.
    pub id: String,
    /// Container names, each with a leading `/`.
    #[serde(default)]
    pub names: Vec<String>,
    /// Image reference the container was created from.
    #[serde(default)]
    pub image: String,
}

impl ContainerSummary {
    /// First listed name, as Docker reports it.
    pub fn primary_name(&self) -> Option<&str> {
        self.names.first().map(String::as_str)
    }
}

/// The subset of `GET /containers/{id}/json` used for DNS.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerDetails {
    /// Network settings.
    #[serde(rename = "NetworkSettings", default)]
    pub network_settings: NetworkSettings,
}

/// Network settings of a container.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkSettings {
    /// Attached networks keyed by network name.
    #[serde(rename = "Networks", default)]
    pub networks: Option<HashMap<String, NetworkAttachment>>,
}

/// One network attachment.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkAttachment {
    /// IPv4 address on this network; empty for networks without IPAM.
    #[serde(rename = "IPAddress", default)]
    pub ip_address: String,
    /// IPv6 address on this network; empty unless IPv6 is enabled.
    #[serde(rename = "GlobalIPv6Address", default)]
    pub global_ipv6_address: String,
    /// Per-network DNS aliases.
    #[serde(rename = "Aliases", default)]
    pub aliases: Option<Vec<String>>,
}

impl NetworkAttachment {
    /// Non-empty addresses of this attachment, IPv4 first.
    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        [self.ip_address.as_str(), self.global_ipv6_address.as_str()]
            .into_iter()
            .filter(|a| !a.is_empty())
    }
}

impl ContainerDetails {
    /// Iterate over attached networks.
    pub fn networks(&self) -> impl Iterator<Item = (&String, &NetworkAttachment)> {
        self.network_settings.networks.iter().flatten()
    }
}

/// A container lifecycle event, reduced to what the registry acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerEvent {
    /// A container started (or restarted).
    Start {
        /// Container id.
        id: String,
        /// Container name from the event attributes.
        name: Option<String>,
        /// Image reference the container runs.
        image: String,
    },
    /// A container stopped.
    Stop {
        /// Container id.
        id: String,
    },
    /// Any other event.
    Other {
        /// Event type (`container`, `network`, ...).
        kind: String,
        /// Event action (`die`, `create`, ...).
        action: String,
    },
}

/// Wire format of one `/events` line.
///
/// `status`, `id` and `from` are deprecated in recent API versions; the
/// `Action` and `Actor` fields carry the same data.
#[derive(Debug, Clone, Default, Deserialize)]
struct RawEvent {
    #[serde(rename = "Type", default)]
    kind: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(rename = "Action", default)]
    action: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    from: Option<String>,
    #[serde(rename = "Actor", default)]
    actor: Option<RawActor>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawActor {
    #[serde(rename = "ID", default)]
    id: Option<String>,
    #[serde(rename = "Attributes", default)]
    attributes: HashMap<String, String>,
}

impl From<RawEvent> for ContainerEvent {
    fn from(raw: RawEvent) -> Self {
        let kind = raw.kind.unwrap_or_default();
        let action = raw.status.or(raw.action).unwrap_or_default();
        let actor = raw.actor.unwrap_or_default();
        let id = raw.id.or(actor.id);

        if kind == "container" {
            if let Some(id) = id {
                match action.as_str() {
                    "start" => {
                        return ContainerEvent::Start {
                            id,
                            name: actor.attributes.get("name").cloned(),
                            image: raw
                                .from
                                .or_else(|| actor.attributes.get("image").cloned())
                                .unwrap_or_default(),
                        }
                    }
                    "stop" => return ContainerEvent::Stop { id },
                    _ => {}
                }
            }
        }

        ContainerEvent::Other { kind, action }
    }
}

/// Parse one line of the `/events` stream.
pub fn parse_event(line: &str) -> Result<ContainerEvent, DnsError> {
    let raw: RawEvent = serde_json::from_str(line)?;
    Ok(raw.into())
}

/// Socket used when neither the configuration nor `DOCKER_HOST` names an
/// endpoint.
pub const DEFAULT_SOCKET: &str = "/var/run/docker.sock";

const EVENTS_PATH: &str = "events?filters=%7B%22type%22%3A%5B%22container%22%5D%7D";

/// Response body as a stream of chunks.
type ByteStream = BoxStream<'static, Result<Bytes, io::Error>>;

/// Where the Engine API listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerEndpoint {
    /// HTTP over a unix domain socket.
    Unix(PathBuf),
    /// HTTP over TCP. The URL is the API root and ends with `/`.
    Tcp(Url),
}

impl DockerEndpoint {
    /// Pick the endpoint: the configured URL, then `docker_host`, then
    /// [`DEFAULT_SOCKET`]. Blank values count as unset.
    pub fn resolve(configured: Option<&str>, docker_host: Option<&str>) -> Result<Self, DnsError> {
        let chosen = [configured, docker_host]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|url| !url.is_empty());
        match chosen {
            Some(url) => Self::parse(url),
            None => Ok(Self::Unix(PathBuf::from(DEFAULT_SOCKET))),
        }
    }

    /// [`DockerEndpoint::resolve`] against the process environment.
    pub fn from_config(config: &DockerConfig) -> Result<Self, DnsError> {
        let docker_host = std::env::var("DOCKER_HOST").ok();
        Self::resolve(config.url.as_deref(), docker_host.as_deref())
    }

    /// Parse `unix:///path`, `tcp://host:port` or `http://host:port[/base]`.
    pub fn parse(endpoint: &str) -> Result<Self, DnsError> {
        let invalid = |reason: &dyn fmt::Display| {
            DnsError::Config(format!("docker endpoint {:?}: {}", endpoint, reason))
        };

        if let Some(path) = endpoint.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(invalid(&"empty socket path"));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }

        let url = match endpoint.strip_prefix("tcp://") {
            Some(rest) => format!("http://{}", rest),
            None => endpoint.to_string(),
        };
        let mut base = Url::parse(&url).map_err(|e| invalid(&e))?;
        if base.scheme() != "http" {
            return Err(invalid(&format!("unsupported scheme {:?}", base.scheme())));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self::Tcp(base))
    }

    /// Request target for `path`, relative to the API root.
    fn target(&self, path: &str) -> Result<String, DnsError> {
        match self {
            Self::Unix(_) => Ok(format!("/{}", path)),
            Self::Tcp(base) => base
                .join(path)
                .map(String::from)
                .map_err(|e| DnsError::Config(format!("bad Docker API path {:?}: {}", path, e))),
        }
    }
}

impl fmt::Display for DockerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Tcp(url) => write!(f, "{}", url),
        }
    }
}

/// [`ContainerApi`] over the Docker Engine HTTP API.
#[derive(Debug, Clone)]
pub struct DockerClient {
    endpoint: DockerEndpoint,
    http: Client,
    connect_timeout: Duration,
}

impl DockerClient {
    /// Create a client for the configured Engine endpoint.
    pub fn new(config: &DockerConfig) -> Result<Self, DnsError> {
        let endpoint = DockerEndpoint::from_config(config)?;
        Self::with_endpoint(endpoint, Duration::from_secs(config.connect_timeout_secs))
    }

    /// Create a client for an explicit endpoint.
    pub fn with_endpoint(endpoint: DockerEndpoint, connect_timeout: Duration) -> Result<Self, DnsError> {
        // No overall request timeout: the events response never completes.
        let http = Client::builder().connect_timeout(connect_timeout).build()?;
        Ok(Self {
            endpoint,
            http,
            connect_timeout,
        })
    }

    /// The endpoint requests go to.
    pub fn endpoint(&self) -> &DockerEndpoint {
        &self.endpoint
    }

    async fn get(&self, path: &str) -> Result<ByteStream, DnsError> {
        let target = self.endpoint.target(path)?;
        trace!(endpoint = %self.endpoint, %target, "Docker API request");
        match &self.endpoint {
            DockerEndpoint::Unix(socket) => unix_get(socket, self.connect_timeout, &target).await,
            DockerEndpoint::Tcp(_) => self.tcp_get(&target).await,
        }
    }

    async fn tcp_get(&self, url: &str) -> Result<ByteStream, DnsError> {
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(DnsError::DockerApi {
                status: status.as_u16(),
                message: message.trim().to_string(),
            });
        }
        Ok(response.bytes_stream().map_err(io::Error::other).boxed())
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, DnsError> {
        let body = self
            .get(path)
            .await?
            .try_fold(Vec::new(), |mut body, chunk| async move {
                body.extend_from_slice(&chunk);
                Ok(body)
            })
            .await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

/// One HTTP/1 GET over a fresh connection to `socket`.
#[cfg(unix)]
async fn unix_get(socket: &Path, connect_timeout: Duration, target: &str) -> Result<ByteStream, DnsError> {
    use http_body_util::{BodyExt, Empty};
    use hyper::header::HOST;
    use hyper::Request;
    use hyper_util::rt::TokioIo;
    use tokio::net::UnixStream;

    let stream = tokio::time::timeout(connect_timeout, UnixStream::connect(socket))
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connecting to {}", socket.display()),
            )
        })??;
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(error = %e, "Docker socket connection closed");
        }
    });

    let request = Request::get(target)
        .header(HOST, "docker")
        .body(Empty::<Bytes>::new())
        .map_err(|e| DnsError::Config(format!("bad Docker API path {:?}: {}", target, e)))?;
    let response = sender.send_request(request).await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.into_body().collect().await?.to_bytes();
        return Err(DnsError::DockerApi {
            status: status.as_u16(),
            message: String::from_utf8_lossy(&body).trim().to_string(),
        });
    }
    Ok(response
        .into_body()
        .into_data_stream()
        .map_err(io::Error::other)
        .boxed())
}

#[cfg(not(unix))]
async fn unix_get(socket: &Path, _: Duration, _: &str) -> Result<ByteStream, DnsError> {
    Err(DnsError::Config(format!(
        "unix socket {} is not supported on this platform",
        socket.display()
    )))
}

#[async_trait]
impl ContainerApi for DockerClient {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, DnsError> {
        let containers: Vec<ContainerSummary> = self.get_json("containers/json").await?;
        debug!(count = containers.len(), "listed running containers");
        Ok(containers)
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, DnsError> {
        self.get_json(&format!("containers/{}/json", id)).await
    }

    async fn events(&self) -> Result<EventStream, DnsError> {
        let bytes = self.get(EVENTS_PATH).await?;
        let lines = FramedRead::new(StreamReader::new(bytes), LinesCodec::new());

        let events = lines.filter_map(|line| async move {
            match line {
                Ok(line) if line.trim().is_empty() => None,
                Ok(line) => match parse_event(&line) {
                    Ok(event) => Some(Ok(event)),
                    Err(e) => {
                        warn!(error = %e, "skipping malformed Docker event");
                        None
                    }
                },
                Err(e) => Some(Err(DnsError::Io(io::Error::other(e)))),
            }
        });

        Ok(events.boxed())
    }
}
