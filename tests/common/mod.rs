//! Shared test infrastructure for responder and server integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, Name, RData, RecordType};
use tokio::sync::mpsc;

use dock_dns::config::{DnsConfig, TsigKeyConfig};
use dock_dns::docker::{
    ContainerApi, ContainerDetails, ContainerEvent, ContainerSummary, EventStream,
    NetworkAttachment, NetworkSettings,
};
use dock_dns::tsig::{unix_now, DEFAULT_FUDGE};
use hickory_proto::dnssec::rdata::tsig::{make_tsig_record, TsigAlgorithm, TSIG};
use hickory_proto::dnssec::tsig::TSigner;
use dock_dns::{DnsError, HostRegistry, Responder};

// --- Constants ---

pub const DOMAIN: &str = "docker";
pub const KEY_NAME: &str = "update-key.";
/// Base64 of `0123456789abcdef0123456789abcdef`.
pub const KEY_SECRET: &str = "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=";
pub const KEY_BYTES: &[u8] = b"0123456789abcdef0123456789abcdef";

// --- FakeDocker ---

/// In-memory Docker Engine.
///
/// Containers added here are visible to `list_containers` and
/// `inspect_container`; events pushed through [`FakeDocker::emit`] are
/// delivered on the stream returned by `events()`.
#[derive(Clone)]
pub struct FakeDocker {
    containers: Arc<Mutex<Vec<(ContainerSummary, ContainerDetails)>>>,
    sender: mpsc::UnboundedSender<ContainerEvent>,
    receiver: Arc<Mutex<Option<mpsc::UnboundedReceiver<ContainerEvent>>>>,
}

impl FakeDocker {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            containers: Arc::new(Mutex::new(Vec::new())),
            sender,
            receiver: Arc::new(Mutex::new(Some(receiver))),
        }
    }

    /// Register a running container attached to one network per `(ip, aliases)`.
    pub fn run(&self, id: &str, name: &str, image: &str, networks: &[(&str, &[&str])]) {
        let summary = ContainerSummary {
            id: id.to_string(),
            names: vec![format!("/{}", name)],
            image: image.to_string(),
        };
        let mut containers = self.containers.lock().unwrap();
        containers.retain(|(c, _)| c.id != id);
        containers.push((summary, details(networks)));
    }

    /// Forget a container.
    pub fn kill(&self, id: &str) {
        self.containers.lock().unwrap().retain(|(c, _)| c.id != id);
    }

    /// Push an event to the subscriber.
    pub fn emit(&self, event: ContainerEvent) {
        self.sender.send(event).unwrap();
    }

    /// Run a container and announce it.
    pub fn start(&self, id: &str, name: &str, image: &str, networks: &[(&str, &[&str])]) {
        self.run(id, name, image, networks);
        self.emit(start_event(id, name, image));
    }

    /// Stop a container and announce it.
    pub fn stop(&self, id: &str) {
        self.kill(id);
        self.emit(stop_event(id));
    }
}

#[async_trait]
impl ContainerApi for FakeDocker {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, DnsError> {
        let containers = self.containers.lock().unwrap();
        Ok(containers.iter().map(|(c, _)| c.clone()).collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, DnsError> {
        let containers = self.containers.lock().unwrap();
        containers
            .iter()
            .find(|(c, _)| c.id == id)
            .map(|(_, d)| d.clone())
            .ok_or_else(|| DnsError::DockerApi {
                status: 404,
                message: format!("No such container: {}", id),
            })
    }

    async fn events(&self) -> Result<EventStream, DnsError> {
        let receiver = self.receiver.lock().unwrap().take();
        match receiver {
            Some(rx) => Ok(futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|event| (Ok(event), rx))
            })
            .boxed()),
            None => Ok(futures::stream::pending().boxed()),
        }
    }
}

/// Inspect output with one network per `(ip, aliases)` pair.
pub fn details(networks: &[(&str, &[&str])]) -> ContainerDetails {
    let networks: HashMap<String, NetworkAttachment> = networks
        .iter()
        .enumerate()
        .map(|(i, (ip, aliases))| {
            (
                format!("net{}", i),
                NetworkAttachment {
                    ip_address: ip.to_string(),
                    aliases: Some(aliases.iter().map(|a| a.to_string()).collect()),
                    ..Default::default()
                },
            )
        })
        .collect();
    ContainerDetails {
        network_settings: NetworkSettings {
            networks: Some(networks),
        },
    }
}

// --- Config builders ---

pub fn test_dns_config() -> DnsConfig {
    DnsConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        domain: DOMAIN.to_string(),
        tsig_keys: vec![TsigKeyConfig {
            name: KEY_NAME.to_string(),
            algorithm: "hmac-sha256".to_string(),
            secret: KEY_SECRET.to_string(),
        }],
        ..DnsConfig::default()
    }
}

/// Registry loaded from `docker`, plus a responder over it.
pub async fn build_responder(
    docker: &FakeDocker,
    config: &DnsConfig,
) -> (HostRegistry, Responder) {
    let registry = HostRegistry::new(&config.domain);
    registry
        .initialize(docker)
        .await
        .expect("failed to initialize registry");
    let responder =
        Responder::from_config(registry.clone(), config).expect("failed to build responder");
    (registry, responder)
}

/// Apply `events` to `registry` in order, inspecting through `docker`.
pub async fn apply_events(
    docker: &FakeDocker,
    registry: &HostRegistry,
    events: Vec<ContainerEvent>,
) {
    for event in events {
        registry
            .apply_event(docker, event)
            .await
            .expect("failed to apply event");
    }
}

pub fn start_event(id: &str, name: &str, image: &str) -> ContainerEvent {
    ContainerEvent::Start {
        id: id.to_string(),
        name: Some(name.to_string()),
        image: image.to_string(),
    }
}

pub fn stop_event(id: &str) -> ContainerEvent {
    ContainerEvent::Stop { id: id.to_string() }
}

// --- Query construction ---

/// Build wire-format bytes for a DNS query.
pub fn build_query_bytes(name: &str, record_type: RecordType, id: u16) -> Vec<u8> {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    let mut query = Query::new();
    query.set_name(Name::from_ascii(name).unwrap());
    query.set_query_type(record_type);
    query.set_query_class(DNSClass::IN);
    msg.add_query(query);
    msg.to_vec().unwrap()
}

/// Run a query through the responder and parse the reply.
pub fn execute_query(
    responder: &Responder,
    name: &str,
    record_type: RecordType,
    id: u16,
) -> Message {
    execute_bytes(responder, &build_query_bytes(name, record_type, id))
}

/// Run raw bytes through the responder and parse the reply.
pub fn execute_bytes(responder: &Responder, bytes: &[u8]) -> Message {
    let reply = responder
        .respond(bytes)
        .expect("query failed to decode")
        .expect("no response produced");
    Message::from_vec(&reply).expect("failed to parse response")
}

// --- Response helpers ---

/// Extract A and AAAA addresses from the answer section.
pub fn extract_ips(msg: &Message) -> Vec<IpAddr> {
    let mut ips: Vec<IpAddr> = msg
        .answers()
        .iter()
        .filter_map(|r| match r.data() {
            RData::A(a) => Some(IpAddr::V4(a.0)),
            RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect();
    ips.sort();
    ips
}

/// Assert response code.
pub fn assert_response_code(msg: &Message, expected: ResponseCode) {
    assert_eq!(
        msg.response_code(),
        expected,
        "expected {:?}, got {:?}",
        expected,
        msg.response_code()
    );
}

/// Assert a NOERROR response with exactly the expected addresses.
pub fn assert_ips(msg: &Message, expected: &[&str]) {
    assert_response_code(msg, ResponseCode::NoError);
    let mut expected: Vec<IpAddr> = expected.iter().map(|s| s.parse().unwrap()).collect();
    expected.sort();
    assert_eq!(
        extract_ips(msg),
        expected,
        "address mismatch for {:?}",
        msg.queries()
    );
}

// --- TSIG ---

/// A client signer for `name` with the test secret.
pub fn signer_named(name: &str) -> TSigner {
    TSigner::new(
        KEY_BYTES.to_vec(),
        TsigAlgorithm::HmacSha256,
        Name::from_ascii(name).unwrap(),
        DEFAULT_FUDGE,
    )
    .expect("failed to build signer")
}

/// The key matching [`test_dns_config`]'s keyring.
pub fn test_signer() -> TSigner {
    signer_named(KEY_NAME)
}

/// Query bytes signed with `signer` at the current time. Returns the request MAC too.
pub fn signed_query_bytes(
    signer: &TSigner,
    name: &str,
    record_type: RecordType,
    id: u16,
) -> (Vec<u8>, Vec<u8>) {
    let mut msg = Message::from_vec(&build_query_bytes(name, record_type, id)).unwrap();
    let pre_tsig = TSIG::new(
        signer.algorithm().clone(),
        unix_now(),
        DEFAULT_FUDGE,
        Vec::new(),
        id,
        0,
        Vec::new(),
    );
    let mac = signer
        .sign_message(&msg, &pre_tsig)
        .expect("failed to sign query");
    msg.add_tsig(make_tsig_record(
        signer.signer_name().clone(),
        pre_tsig.set_mac(mac.clone()),
    ));
    (msg.to_vec().unwrap(), mac)
}
