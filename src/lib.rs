//! Dock DNS - An authoritative DNS server for the containers of a Docker host.
//!
//! Every running container answers under a reserved domain (`.docker` by
//! default) by its name, its bare image name and the DNS aliases of each
//! network it is attached to. Container lifecycle events keep the answers
//! current without polling.
//!
//! ## Features
//!
//! - A/AAAA answers synthesized per query, TTL 0, never cached
//! - Live updates from the Docker event stream, with reconnect and resync
//! - TSIG-verified queries and signed responses
//! - EDNS echo with the DNSSEC-OK bit mirrored
//! - Read-only HTTP view of the registry
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           dock-dns                              │
//! │                                                                 │
//! │  ┌──────────────────┐    ┌──────────────────┐                  │
//! │  │  Docker Engine   │───▶│  Host Registry   │◀── GET /containers│
//! │  │  (events, list,  │    │  (id -> entry)   │                  │
//! │  │   inspect)       │    └────────┬─────────┘                  │
//! │  └──────────────────┘             │ resolve                    │
//! │                                   ▼                             │
//! │                          ┌──────────────────┐                  │
//! │                          │ Zone Synthesizer │                  │
//! │                          └────────┬─────────┘                  │
//! │                                   ▼                             │
//! │                          ┌──────────────────┐                  │
//! │                          │ Query Responder  │◀── UDP :53       │
//! │                          └──────────────────┘                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## DNS Resolution
//!
//! ```text
//! db.web.docker
//!   → zone for db.web.docker? no container answers to "db.web"
//!   → zone for web.docker?    container alias "web" matches
//!   → db.web.docker is not the apex: empty NOERROR answer
//!
//! web.docker
//!   → A records for every IP whose aliases include "web"
//!   → NS web.docker in authority, AA set
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use dock_dns::{Config, DnsServer, DockerClient};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::default();
//!     let docker = DockerClient::new(&config.docker).unwrap();
//!
//!     let shutdown = CancellationToken::new();
//!     let server = DnsServer::new(config, Arc::new(docker));
//!     server.run(shutdown).await.unwrap();
//! }
//! ```

#![warn(missing_docs)]

pub mod alias;
pub mod config;
pub mod docker;
pub mod error;
pub mod events;
pub mod inspect;
pub mod metrics;
pub mod registry;
pub mod responder;
pub mod server;
pub mod telemetry;
pub mod tsig;
pub mod zone;

// Re-export main types
pub use config::{Config, DnsConfig, DockerConfig, SignaturePolicy, SoaConfig, UnmatchedPolicy};
pub use docker::{ContainerApi, ContainerEvent, DockerClient};
pub use error::DnsError;
pub use registry::{ContainerInfo, HostRegistry};
pub use responder::Responder;
pub use server::{serve_udp, DnsServer, ServerHandle};
pub use zone::ZoneSynthesizer;
