//! In-memory container registry fed by Docker lifecycle events.
//!
//! Maps a container id to the addresses it holds and the aliases each address
//! answers to. Entries are replaced wholesale, so a concurrent reader sees
//! either the old or the new entry for a container, never a mix.
//!
//! - `resolve("web")` returns every IP, across all containers, whose alias
//!   set contains `web`
//! - aliases come from per-network DNS aliases, the container name and the
//!   bare image name

use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::alias;
use crate::docker::{ContainerApi, ContainerDetails, ContainerEvent};
use crate::error::DnsError;
use crate::metrics::{self, RegistryEventKind};

/// TTL marker in the informational export: expiry is not tracked.
pub const NO_EXPIRY: i32 = -1;

/// One running container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEntry {
    /// Container id.
    pub id: String,
    /// Container name without the leading `/`.
    pub name: Option<String>,
    /// Image reference as reported by Docker.
    pub image: String,
    /// IP -> aliases valid for that IP (lower-case, no domain suffix).
    addresses: HashMap<IpAddr, HashSet<String>>,
}

impl ContainerEntry {
    /// Create an entry with no addresses yet.
    pub fn new(id: impl Into<String>, name: Option<&str>, image: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.map(|n| alias::normalize_container_name(n).to_string()),
            image: image.into(),
            addresses: HashMap::new(),
        }
    }

    /// Build an entry from inspect output, deriving aliases for every network.
    ///
    /// Networks without a usable IP address are skipped.
    pub fn from_details(
        id: &str,
        name: Option<&str>,
        image: &str,
        details: &ContainerDetails,
        domain: &str,
    ) -> Self {
        let mut entry = Self::new(id, name, image);

        for (network, attachment) in details.networks() {
            let ips: Vec<IpAddr> = attachment
                .addresses()
                .filter_map(|addr| match addr.parse() {
                    Ok(ip) => Some(ip),
                    Err(_) => {
                        warn!(
                            container_id = %id,
                            network = %network,
                            ip = %addr,
                            "ignoring unparsable address"
                        );
                        None
                    }
                })
                .collect();
            if ips.is_empty() {
                warn!(
                    container_id = %id,
                    network = %network,
                    "skipping network without usable IP address"
                );
                continue;
            }

            let mut aliases: Vec<String> = attachment
                .aliases
                .iter()
                .flatten()
                .map(|a| alias::strip_domain(a, domain).to_string())
                .collect();
            if let Some(name) = &entry.name {
                aliases.push(name.clone());
            }
            aliases.push(alias::normalize_image_name(image).to_string());

            for ip in ips {
                for a in &aliases {
                    entry.add_alias(ip, a);
                }
            }
        }

        entry
    }

    /// Attach an alias to an IP.
    pub fn add_alias(&mut self, ip: IpAddr, alias: &str) {
        if alias.is_empty() {
            return;
        }
        self.addresses
            .entry(ip)
            .or_default()
            .insert(alias.to_ascii_lowercase());
    }

    /// IPs whose alias set contains `key` (already normalized).
    pub fn addresses_for<'a>(&'a self, key: &'a str) -> impl Iterator<Item = IpAddr> + 'a {
        self.addresses
            .iter()
            .filter(move |(_, aliases)| aliases.contains(key))
            .map(|(ip, _)| *ip)
    }

    /// All IPs held by this container.
    pub fn ips(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.addresses.keys().copied()
    }

    /// Union of the aliases of every IP.
    pub fn aliases(&self) -> BTreeSet<&str> {
        self.addresses
            .values()
            .flatten()
            .map(String::as_str)
            .collect()
    }

    /// Export row with fully-qualified aliases.
    pub fn info(&self, domain: &str) -> ContainerInfo {
        ContainerInfo {
            name: self.name.clone(),
            image: self.image.clone(),
            ips: self.ips().collect(),
            ttl: NO_EXPIRY,
            aliases: self
                .aliases()
                .into_iter()
                .map(|a| format!("{}.{}", a, domain))
                .collect(),
        }
    }
}

/// Read-only view of one container, for external inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerInfo {
    /// Container name.
    #[serde(rename = "Name")]
    pub name: Option<String>,
    /// Image reference.
    #[serde(rename = "Image")]
    pub image: String,
    /// Addresses held by the container.
    #[serde(rename = "IPs")]
    pub ips: BTreeSet<IpAddr>,
    /// Always [`NO_EXPIRY`].
    #[serde(rename = "TTL")]
    pub ttl: i32,
    /// Fully-qualified names answering for this container.
    #[serde(rename = "Aliases")]
    pub aliases: BTreeSet<String>,
}

/// Thread-safe container registry.
///
/// Cloning is cheap; all clones share the same map.
#[derive(Debug, Clone)]
pub struct HostRegistry {
    domain: Arc<str>,
    entries: Arc<DashMap<String, Arc<ContainerEntry>>>,
}

impl HostRegistry {
    /// Create an empty registry for the given reserved domain (e.g. "docker").
    pub fn new(domain: &str) -> Self {
        Self {
            domain: Arc::from(domain.trim_matches('.').to_ascii_lowercase()),
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Reserved domain this registry strips from aliases.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Load every running container. Any API failure is returned.
    pub async fn initialize(&self, api: &dyn ContainerApi) -> Result<usize, DnsError> {
        let containers = api.list_containers().await?;
        for container in &containers {
            let details = api.inspect_container(&container.id).await?;
            self.insert(ContainerEntry::from_details(
                &container.id,
                container.primary_name(),
                &container.image,
                &details,
                &self.domain,
            ));
        }

        info!(
            containers = self.container_count(),
            aliases = self.alias_count(),
            "container registry initialized"
        );
        Ok(containers.len())
    }

    /// Replace the registry contents with the current container list.
    ///
    /// Containers that vanish between listing and inspection are skipped.
    pub async fn resync(&self, api: &dyn ContainerApi) -> Result<usize, DnsError> {
        let containers = api.list_containers().await?;
        let mut fresh = Vec::with_capacity(containers.len());
        for container in &containers {
            match api.inspect_container(&container.id).await {
                Ok(details) => fresh.push(ContainerEntry::from_details(
                    &container.id,
                    container.primary_name(),
                    &container.image,
                    &details,
                    &self.domain,
                )),
                Err(e) => {
                    warn!(container_id = %container.id, error = %e, "skipping container during resync");
                }
            }
        }

        let live: HashSet<&str> = fresh.iter().map(|e| e.id.as_str()).collect();
        self.entries.retain(|id, _| live.contains(id.as_str()));
        let count = fresh.len();
        for entry in fresh {
            self.insert(entry);
        }

        metrics::record_registry_event(RegistryEventKind::Resync);
        info!(containers = count, "container registry resynchronized");
        Ok(count)
    }

    /// Apply one lifecycle event.
    ///
    /// A start event triggers an inspect call; its failure is returned and
    /// leaves the registry untouched.
    pub async fn apply_event(
        &self,
        api: &dyn ContainerApi,
        event: ContainerEvent,
    ) -> Result<(), DnsError> {
        match event {
            ContainerEvent::Stop { id } => {
                info!(container_id = %id, "container stopped");
                self.remove(&id);
                metrics::record_registry_event(RegistryEventKind::Stop);
            }
            ContainerEvent::Start { id, name, image } => {
                info!(container_id = %id, name = ?name, image = %image, "container started");
                let details = api.inspect_container(&id).await?;
                self.insert(ContainerEntry::from_details(
                    &id,
                    name.as_deref(),
                    &image,
                    &details,
                    &self.domain,
                ));
                metrics::record_registry_event(RegistryEventKind::Start);
            }
            ContainerEvent::Other { kind, action } => {
                debug!(kind = %kind, action = %action, "ignoring event");
                metrics::record_registry_event(RegistryEventKind::Ignored);
            }
        }
        Ok(())
    }

    /// Insert or replace the entry for a container.
    pub fn insert(&self, entry: ContainerEntry) {
        debug!(
            container_id = %entry.id,
            name = ?entry.name,
            ips = ?entry.addresses.keys().collect::<Vec<_>>(),
            aliases = ?entry.aliases(),
            "upserting container"
        );
        self.entries.insert(entry.id.clone(), Arc::new(entry));
    }

    /// Remove a container by id. Returns whether it was present.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.entries.remove(id).is_some();
        if removed {
            debug!(container_id = %id, "removed container");
        }
        removed
    }

    /// Look up a container by id.
    pub fn get(&self, id: &str) -> Option<Arc<ContainerEntry>> {
        self.entries.get(id).map(|e| Arc::clone(e.value()))
    }

    /// Every IP whose alias set contains `hostname`.
    ///
    /// Matching is exact and case-insensitive; a trailing reserved domain is
    /// ignored. Order is unspecified and duplicates across containers are kept.
    pub fn resolve(&self, hostname: &str) -> Vec<IpAddr> {
        let key = alias::normalize_hostname(hostname, &self.domain);
        let mut ips = Vec::new();
        for entry in self.entries.iter() {
            ips.extend(entry.value().addresses_for(&key));
        }
        ips
    }

    /// Snapshot of every container, keyed by id.
    pub fn snapshot(&self) -> BTreeMap<String, ContainerInfo> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().info(&self.domain)))
            .collect()
    }

    /// Number of containers.
    pub fn container_count(&self) -> usize {
        self.entries.len()
    }

    /// Number of distinct aliases across all containers.
    pub fn alias_count(&self) -> usize {
        let mut aliases = HashSet::new();
        for entry in self.entries.iter() {
            for alias in entry.value().aliases() {
                aliases.insert(alias.to_string());
            }
        }
        aliases.len()
    }

    /// Emit current registry metrics.
    pub fn emit_metrics(&self) {
        let addresses = self
            .entries
            .iter()
            .map(|e| e.value().addresses.len())
            .sum();
        metrics::record_registry_counts(self.container_count(), self.alias_count(), addresses);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::fake::{details, FakeApi};

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn sorted(mut ips: Vec<IpAddr>) -> Vec<IpAddr> {
        ips.sort();
        ips
    }

    #[test]
    fn test_entry_derives_aliases_from_name_image_and_network() {
        let entry = ContainerEntry::from_details(
            "c1",
            Some("/web"),
            "registry.local/team/nginx:1.25",
            &details(&[("10.0.0.5", &["frontend.docker", "www"])]),
            "docker",
        );

        assert_eq!(entry.name.as_deref(), Some("web"));
        assert_eq!(
            entry.aliases().into_iter().collect::<Vec<_>>(),
            vec!["frontend", "nginx", "web", "www"]
        );
    }

    #[test]
    fn test_entry_skips_network_without_ip() {
        let entry = ContainerEntry::from_details(
            "c1",
            Some("/web"),
            "nginx",
            &details(&[("", &[]), ("10.0.0.5", &[])]),
            "docker",
        );
        assert_eq!(entry.ips().collect::<Vec<_>>(), vec![ip("10.0.0.5")]);
    }

    #[test]
    fn test_dual_stack_network_aliases_both_addresses() {
        let details: ContainerDetails = serde_json::from_str(
            r#"{"NetworkSettings":{"Networks":{"v6net":{
                "IPAddress":"172.20.0.2",
                "GlobalIPv6Address":"fd00::2",
                "Aliases":["api"]}}}}"#,
        )
        .unwrap();
        let entry = ContainerEntry::from_details("c1", Some("/web"), "nginx", &details, "docker");

        let mut api: Vec<IpAddr> = entry.addresses_for("api").collect();
        api.sort();
        assert_eq!(api, vec![ip("172.20.0.2"), ip("fd00::2")]);
        assert_eq!(entry.addresses_for("web").count(), 2);
    }

    #[test]
    fn test_resolve_is_exact_and_case_insensitive() {
        let registry = HostRegistry::new("docker");
        let mut entry = ContainerEntry::new("c1", Some("/web"), "nginx");
        entry.add_alias(ip("10.0.0.5"), "Web");
        registry.insert(entry);

        assert_eq!(registry.resolve("web"), vec![ip("10.0.0.5")]);
        assert_eq!(registry.resolve("WEB"), vec![ip("10.0.0.5")]);
        assert_eq!(registry.resolve("web.docker"), vec![ip("10.0.0.5")]);
        assert!(registry.resolve("we").is_empty());
        assert!(registry.resolve("api.web").is_empty());
    }

    #[test]
    fn test_resolve_returns_ips_of_every_matching_container() {
        let registry = HostRegistry::new("docker");
        for (id, addr) in [("c1", "10.0.0.5"), ("c2", "10.0.0.6"), ("c3", "10.0.0.5")] {
            let mut entry = ContainerEntry::new(id, None, "nginx");
            entry.add_alias(ip(addr), "shared");
            registry.insert(entry);
        }

        assert_eq!(
            sorted(registry.resolve("shared")),
            vec![ip("10.0.0.5"), ip("10.0.0.5"), ip("10.0.0.6")]
        );
    }

    #[test]
    fn test_insert_replaces_entry_for_same_id() {
        let registry = HostRegistry::new("docker");
        let mut old = ContainerEntry::new("c1", Some("web"), "nginx");
        old.add_alias(ip("10.0.0.5"), "web");
        registry.insert(old);

        let mut new = ContainerEntry::new("c1", Some("web"), "nginx");
        new.add_alias(ip("10.0.0.9"), "web");
        registry.insert(new);

        assert_eq!(registry.container_count(), 1);
        assert_eq!(registry.resolve("web"), vec![ip("10.0.0.9")]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_resolve_sees_whole_entries() {
        let registry = HostRegistry::new("docker");
        let blue = [ip("10.0.0.1"), ip("10.0.0.2")];
        let green = [ip("10.0.0.3"), ip("10.0.0.4")];
        let entry = |ips: &[IpAddr]| {
            let mut entry = ContainerEntry::new("c1", Some("web"), "nginx");
            for addr in ips {
                entry.add_alias(*addr, "web");
            }
            entry
        };
        registry.insert(entry(&blue));

        let writer = tokio::spawn({
            let registry = registry.clone();
            async move {
                for round in 0..5_000 {
                    registry.insert(entry(if round % 2 == 0 { &green } else { &blue }));
                    if round % 64 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            }
        });

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    for round in 0..5_000 {
                        let mut ips = registry.resolve("web");
                        ips.sort();
                        assert!(
                            ips == blue || ips == green,
                            "torn read: {:?}",
                            ips
                        );
                        if round % 64 == 0 {
                            tokio::task::yield_now().await;
                        }
                    }
                })
            })
            .collect();

        writer.await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
        assert_eq!(registry.container_count(), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = HostRegistry::new("docker");
        registry.insert(ContainerEntry::new("c1", None, "nginx"));
        assert!(registry.remove("c1"));
        assert!(!registry.remove("c1"));
        assert_eq!(registry.container_count(), 0);
    }

    #[tokio::test]
    async fn test_initialize_loads_running_containers() {
        let api = FakeApi::new();
        api.add("c1", "web", "nginx:latest", details(&[("10.0.0.5", &[])]));
        api.add("c2", "db", "postgres:16", details(&[("10.0.0.6", &["database"])]));

        let registry = HostRegistry::new("docker");
        assert_eq!(registry.initialize(&api).await.unwrap(), 2);

        assert_eq!(registry.resolve("web"), vec![ip("10.0.0.5")]);
        assert_eq!(registry.resolve("nginx"), vec![ip("10.0.0.5")]);
        assert_eq!(registry.resolve("database"), vec![ip("10.0.0.6")]);
        assert_eq!(registry.resolve("postgres"), vec![ip("10.0.0.6")]);
    }

    #[tokio::test]
    async fn test_start_and_stop_events() {
        let api = FakeApi::new();
        let registry = HostRegistry::new("docker");

        api.add("c1", "web", "nginx", details(&[("10.0.0.5", &[])]));
        registry
            .apply_event(
                &api,
                ContainerEvent::Start {
                    id: "c1".to_string(),
                    name: Some("web".to_string()),
                    image: "nginx".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(registry.resolve("web"), vec![ip("10.0.0.5")]);

        registry
            .apply_event(&api, ContainerEvent::Stop { id: "c1".to_string() })
            .await
            .unwrap();
        assert!(registry.resolve("web").is_empty());

        // Stopping an unknown container is a no-op.
        registry
            .apply_event(&api, ContainerEvent::Stop { id: "c1".to_string() })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_start_event_for_vanished_container_fails_cleanly() {
        let api = FakeApi::new();
        let registry = HostRegistry::new("docker");

        let result = registry
            .apply_event(
                &api,
                ContainerEvent::Start {
                    id: "gone".to_string(),
                    name: Some("ghost".to_string()),
                    image: "busybox".to_string(),
                },
            )
            .await;

        assert!(matches!(result, Err(DnsError::DockerApi { status: 404, .. })));
        assert_eq!(registry.container_count(), 0);
    }

    #[tokio::test]
    async fn test_resync_drops_stale_entries() {
        let api = FakeApi::new();
        api.add("c1", "web", "nginx", details(&[("10.0.0.5", &[])]));
        api.add("c2", "db", "postgres", details(&[("10.0.0.6", &[])]));

        let registry = HostRegistry::new("docker");
        registry.initialize(&api).await.unwrap();

        api.remove("c2");
        assert_eq!(registry.resync(&api).await.unwrap(), 1);
        assert!(registry.get("c2").is_none());
        assert!(registry.resolve("db").is_empty());
        assert_eq!(registry.resolve("web"), vec![ip("10.0.0.5")]);
    }

    #[test]
    fn test_snapshot_exports_fqdn_aliases() {
        let registry = HostRegistry::new("docker");
        registry.insert(ContainerEntry::from_details(
            "c1",
            Some("/web"),
            "nginx:latest",
            &details(&[("10.0.0.5", &["frontend"])]),
            "docker",
        ));

        let snapshot = registry.snapshot();
        let info = &snapshot["c1"];
        assert_eq!(info.name.as_deref(), Some("web"));
        assert_eq!(info.image, "nginx:latest");
        assert_eq!(info.ttl, NO_EXPIRY);
        assert!(info.ips.contains(&ip("10.0.0.5")));
        assert!(info.aliases.contains("web.docker"));
        assert!(info.aliases.contains("frontend.docker"));
        assert!(info.aliases.contains("nginx.docker"));

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["c1"]["TTL"], -1);
        assert_eq!(json["c1"]["Name"], "web");
    }
}
