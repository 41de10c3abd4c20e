//! Configuration types for dock-dns.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// DNS server configuration.
    #[serde(default)]
    pub dns: DnsConfig,

    /// Docker Engine API configuration.
    #[serde(default)]
    pub docker: DockerConfig,

    /// Read-only HTTP inspection endpoint.
    #[serde(default)]
    pub http: HttpConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// DNS server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Address for the DNS server to listen on (UDP only).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Reserved top-level label served by this instance (e.g. "docker").
    #[serde(default = "default_domain")]
    pub domain: String,

    /// SOA record configuration.
    #[serde(default)]
    pub soa: SoaConfig,

    /// Rcode returned when no container matches any ancestor of the query name.
    #[serde(default)]
    pub unmatched: UnmatchedPolicy,

    /// How RRsets are inserted when a client asks for DNSSEC data.
    #[serde(default)]
    pub signature_records: SignaturePolicy,

    /// Shared secrets accepted on TSIG-signed queries.
    #[serde(default)]
    pub tsig_keys: Vec<TsigKeyConfig>,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            domain: default_domain(),
            soa: SoaConfig::default(),
            unmatched: UnmatchedPolicy::default(),
            signature_records: SignaturePolicy::default(),
            tsig_keys: Vec::new(),
        }
    }
}

/// Response code for queries that match no container.
///
/// `NoError` answers with an empty answer section, which is what the service
/// has always done. `NxDomain` is the stricter reading of RFC 1035.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnmatchedPolicy {
    /// NOERROR with zero answers.
    #[default]
    NoError,
    /// NXDOMAIN.
    NxDomain,
}

/// Insertion policy for the signature companion of an RRset.
///
/// No signatures are ever generated. `Omit` therefore inserts nothing for
/// them. `Duplicate` re-inserts the base records whenever DNSSEC-OK or a
/// signature-only query is seen, which doubles every record of a DO query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignaturePolicy {
    /// Insert base records once; signature companions are empty.
    #[default]
    Omit,
    /// Insert base records a second time in place of signatures.
    Duplicate,
}

/// A TSIG shared secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TsigKeyConfig {
    /// Key name as it appears in the TSIG owner field (e.g. "update-key.").
    pub name: String,

    /// HMAC algorithm name (e.g. "hmac-sha256").
    #[serde(default = "default_tsig_algorithm")]
    pub algorithm: String,

    /// Base64-encoded secret.
    pub secret: String,
}

/// Docker Engine API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Engine API endpoint: `unix:///path`, `tcp://host:port` or
    /// `http://host:port[/base]`. Falls back to `DOCKER_HOST`, then to
    /// `unix:///var/run/docker.sock`.
    #[serde(default)]
    pub url: Option<String>,

    /// Connect timeout for API requests, in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            url: None,
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// HTTP inspection endpoint configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Address to serve `GET /containers` on. Disabled when unset.
    #[serde(default)]
    pub listen_addr: Option<SocketAddr>,
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "debug", "dock_dns=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus metrics exporter address.
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,

    /// OpenTelemetry configuration.
    #[serde(default)]
    pub opentelemetry: Option<OpenTelemetryConfig>,
}

/// OpenTelemetry exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenTelemetryConfig {
    /// OTLP endpoint (e.g., "http://localhost:4317").
    pub endpoint: String,

    /// Service name for traces.
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            prometheus_addr: None,
            opentelemetry: None,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 53))
}

fn default_domain() -> String {
    "docker".to_string()
}

fn default_tsig_algorithm() -> String {
    "hmac-sha256".to_string()
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "dock-dns".to_string()
}

/// SOA (Start of Authority) record configuration.
///
/// The same record is synthesized for every zone, so these are fixed values
/// rather than per-zone state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoaConfig {
    /// Primary nameserver name (e.g., "dock-dns.").
    #[serde(default = "default_mname")]
    pub mname: String,

    /// Admin mailbox in DNS format (e.g., "hostmaster.dock-dns.").
    #[serde(default = "default_rname")]
    pub rname: String,

    /// Zone serial.
    #[serde(default = "default_serial")]
    pub serial: u32,

    /// Refresh interval in seconds.
    #[serde(default = "default_refresh")]
    pub refresh: u32,

    /// Retry interval in seconds.
    #[serde(default = "default_retry")]
    pub retry: u32,

    /// Expire time in seconds.
    #[serde(default = "default_expire")]
    pub expire: u32,

    /// Minimum TTL in seconds.
    #[serde(default = "default_minimum")]
    pub minimum: u32,
}

fn default_mname() -> String {
    "dock-dns.".to_string()
}

fn default_rname() -> String {
    "hostmaster.dock-dns.".to_string()
}

fn default_serial() -> u32 {
    1000
}

fn default_refresh() -> u32 {
    1000
}

fn default_retry() -> u32 {
    3600
}

fn default_expire() -> u32 {
    1000
}

fn default_minimum() -> u32 {
    0
}

impl Default for SoaConfig {
    fn default() -> Self {
        Self {
            mname: default_mname(),
            rname: default_rname(),
            serial: default_serial(),
            refresh: default_refresh(),
            retry: default_retry(),
            expire: default_expire(),
            minimum: default_minimum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.dns.listen_addr.port(), 53);
        assert_eq!(config.dns.domain, "docker");
        assert_eq!(config.dns.unmatched, UnmatchedPolicy::NoError);
        assert_eq!(config.dns.signature_records, SignaturePolicy::Omit);
        assert_eq!(config.dns.soa.serial, 1000);
        assert_eq!(config.dns.soa.retry, 3600);
        assert!(config.http.listen_addr.is_none());
        assert!(config.docker.url.is_none());
    }

    #[test]
    fn test_policies_deserialize_from_lowercase() {
        let dns: DnsConfig = serde_json::from_str(
            r#"{"domain":"containers","unmatched":"nxdomain","signature_records":"duplicate"}"#,
        )
        .unwrap();
        assert_eq!(dns.domain, "containers");
        assert_eq!(dns.unmatched, UnmatchedPolicy::NxDomain);
        assert_eq!(dns.signature_records, SignaturePolicy::Duplicate);
    }
}
