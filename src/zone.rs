//! Per-query zone synthesis.
//!
//! Nothing here is cached: every lookup asks the registry again and builds a
//! throwaway zone rooted at the matched name.

use hickory_proto::rr::rdata::{A, AAAA, NS, SOA};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordSet, RecordType};
use std::net::IpAddr;
use tracing::{debug, trace};

use crate::alias;
use crate::config::SoaConfig;
use crate::error::DnsError;
use crate::registry::HostRegistry;

/// TTL of every synthesized record.
pub const SYNTHESIZED_TTL: u32 = 0;

/// Outcome of [`SynthesizedZone::find_records`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZoneLookup {
    /// Matching RRsets.
    Success(Vec<RecordSet>),
    /// The name exists but has no records of the requested type.
    NoData,
    /// The name does not exist in this zone.
    NxDomain,
}

/// A one-shot zone for a single reserved-domain name.
#[derive(Debug, Clone)]
pub struct SynthesizedZone {
    apex: Name,
    rrsets: Vec<RecordSet>,
}

impl SynthesizedZone {
    /// Build a zone at `apex` holding the given addresses plus NS and SOA.
    pub fn new(apex: Name, ips: &[IpAddr], soa: &SoaTemplate) -> Self {
        let mut a = RecordSet::with_ttl(apex.clone(), RecordType::A, SYNTHESIZED_TTL);
        let mut aaaa = RecordSet::with_ttl(apex.clone(), RecordType::AAAA, SYNTHESIZED_TTL);

        for ip in ips {
            let (set, rdata) = match ip {
                IpAddr::V4(v4) => (&mut a, RData::A(A::from(*v4))),
                IpAddr::V6(v6) => (&mut aaaa, RData::AAAA(AAAA::from(*v6))),
            };
            set.insert(build_record(apex.clone(), rdata), 0);
        }

        let mut ns = RecordSet::with_ttl(apex.clone(), RecordType::NS, SYNTHESIZED_TTL);
        ns.insert(build_record(apex.clone(), RData::NS(NS(apex.clone()))), 0);

        let mut soa_set = RecordSet::with_ttl(apex.clone(), RecordType::SOA, SYNTHESIZED_TTL);
        soa_set.insert(build_record(apex.clone(), RData::SOA(soa.to_rdata())), 0);

        let rrsets = [a, aaaa, ns, soa_set]
            .into_iter()
            .filter(|set| !set.is_empty())
            .collect();

        Self { apex, rrsets }
    }

    /// Zone apex.
    pub fn apex(&self) -> &Name {
        &self.apex
    }

    /// RRset of the given type at the apex.
    pub fn rrset(&self, record_type: RecordType) -> Option<&RecordSet> {
        self.rrsets
            .iter()
            .find(|set| set.record_type() == record_type)
    }

    /// The zone's NS RRset.
    pub fn ns(&self) -> Option<&RecordSet> {
        self.rrset(RecordType::NS)
    }

    /// All RRsets, address records first.
    pub fn rrsets(&self) -> &[RecordSet] {
        &self.rrsets
    }

    /// Look up `name`/`record_type` in this zone.
    ///
    /// A wildcard apex also answers for every name strictly below its parent.
    pub fn find_records(&self, name: &Name, record_type: RecordType) -> ZoneLookup {
        if !self.owns(name) {
            return ZoneLookup::NxDomain;
        }

        if record_type == RecordType::ANY {
            return ZoneLookup::Success(self.rrsets.clone());
        }

        match self.rrset(record_type) {
            Some(set) => ZoneLookup::Success(vec![set.clone()]),
            None => ZoneLookup::NoData,
        }
    }

    fn owns(&self, name: &Name) -> bool {
        if *name == self.apex {
            return true;
        }
        if !self.apex.is_wildcard() {
            return false;
        }
        let parent = self.apex.base_name().to_lowercase();
        let name = name.to_lowercase();
        name != parent && parent.zone_of(&name)
    }
}

/// Fixed SOA fields stamped into every synthesized zone.
#[derive(Debug, Clone)]
pub struct SoaTemplate {
    mname: Name,
    rname: Name,
    serial: u32,
    refresh: i32,
    retry: i32,
    expire: i32,
    minimum: u32,
}

impl SoaTemplate {
    /// Parse the configured SOA values.
    pub fn from_config(config: &SoaConfig) -> Result<Self, DnsError> {
        Ok(Self {
            mname: Name::from_ascii(&config.mname)?,
            rname: Name::from_ascii(&config.rname)?,
            serial: config.serial,
            refresh: clamp_i32(config.refresh),
            retry: clamp_i32(config.retry),
            expire: clamp_i32(config.expire),
            minimum: config.minimum,
        })
    }

    fn to_rdata(&self) -> SOA {
        SOA::new(
            self.mname.clone(),
            self.rname.clone(),
            self.serial,
            self.refresh,
            self.retry,
            self.expire,
            self.minimum,
        )
    }
}

fn clamp_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn build_record(name: Name, rdata: RData) -> Record {
    let mut record = Record::from_rdata(name, SYNTHESIZED_TTL, rdata);
    record.set_dns_class(DNSClass::IN);
    record
}

/// Builds zones on demand from the host registry.
#[derive(Debug, Clone)]
pub struct ZoneSynthesizer {
    registry: HostRegistry,
    domain: Name,
    soa: SoaTemplate,
}

impl ZoneSynthesizer {
    /// Create a synthesizer over `registry` using the configured SOA values.
    pub fn new(registry: HostRegistry, soa: &SoaConfig) -> Result<Self, DnsError> {
        let domain = Name::from_ascii(format!("{}.", registry.domain()))?.to_lowercase();
        Ok(Self {
            registry,
            domain,
            soa: SoaTemplate::from_config(soa)?,
        })
    }

    /// The backing registry.
    pub fn registry(&self) -> &HostRegistry {
        &self.registry
    }

    /// Zone rooted at exactly `name`, if any container answers to it.
    pub fn zone_for(&self, name: &Name) -> Option<SynthesizedZone> {
        let hostname = alias::hostname_in_domain(&name.to_ascii(), self.registry.domain())?;
        let ips = self.registry.resolve(&hostname);
        if ips.is_empty() {
            trace!(hostname = %hostname, "no container for hostname");
            return None;
        }

        debug!(hostname = %hostname, ips = ?ips, "hostname resolved");
        Some(SynthesizedZone::new(name.clone(), &ips, &self.soa))
    }

    /// Closest enclosing zone: `name` itself, then each ancestor below the
    /// reserved domain.
    pub fn find_best_zone(&self, name: &Name) -> Option<SynthesizedZone> {
        if !self.domain.zone_of(&name.to_lowercase()) {
            return None;
        }

        let floor = self.domain.iter().count();
        let mut candidate = name.clone();
        while candidate.iter().count() > floor {
            if let Some(zone) = self.zone_for(&candidate) {
                return Some(zone);
            }
            candidate = candidate.base_name();
        }
        None
    }

    /// RRset of `record_type` at exactly `name`, without walking ancestors.
    pub fn find_exact_match(&self, name: &Name, record_type: RecordType) -> Option<RecordSet> {
        self.zone_for(name)?.rrset(record_type).cloned()
    }
}
