//! Query answering.
//!
//! Turns one received datagram into zero or one response datagram:
//!
//! ```text
//! bytes -> opcode check -> TSIG verify -> EDNS flags -> question checks
//!       -> answer / authority -> glue -> OPT echo -> encode -> TSIG seal
//! ```
//!
//! Every failure that can be reported to the client becomes a well-formed
//! error message; only undecodable datagrams and non-QUERY opcodes produce
//! no reply.

use hickory_proto::op::{Edns, Header, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, Record, RecordSet, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinDecoder};
use tracing::{debug, warn};

use crate::config::{DnsConfig, SignaturePolicy, UnmatchedPolicy};
use crate::error::DnsError;
use crate::metrics::{self, QueryResult, Timer};
use crate::registry::HostRegistry;
use crate::tsig::{self, RequestSignature, TsigKeyring};
use crate::zone::{ZoneLookup, ZoneSynthesizer};

/// Depth limit for answer chasing.
pub const MAX_ITERATIONS: usize = 6;

/// UDP payload size advertised in the OPT record of responses.
pub const RESPONSE_UDP_PAYLOAD: u16 = 4096;

/// Message sections records can be added to, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Section {
    /// Answer section.
    Answer,
    /// Authority section.
    Authority,
    /// Additional section.
    Additional,
}

impl Section {
    const ALL: [Section; 3] = [Section::Answer, Section::Authority, Section::Additional];

    fn records(self, message: &Message) -> &[Record] {
        match self {
            Section::Answer => message.answers(),
            Section::Authority => message.name_servers(),
            Section::Additional => message.additionals(),
        }
    }

    fn push(self, message: &mut Message, record: Record) {
        match self {
            Section::Answer => message.add_answer(record),
            Section::Authority => message.add_name_server(record),
            Section::Additional => message.add_additional(record),
        };
    }
}

/// Per-query flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryFlags {
    /// The query carried an OPT record with the DO bit.
    pub dnssec_ok: bool,
    /// The query asked for SIG or RRSIG only.
    pub sig_only: bool,
}

/// A decoded, verified query.
#[derive(Debug)]
pub struct QueryContext<'a> {
    /// Decoded message.
    pub query: Message,
    /// Bytes as received.
    pub raw: &'a [u8],
    /// Verified TSIG signature of the query.
    pub signature: Option<RequestSignature>,
    /// Whether the query carried an OPT record.
    pub edns: bool,
    /// DNSSEC flags.
    pub flags: QueryFlags,
}

enum Prepared<'a> {
    Query(QueryContext<'a>),
    Reply(Vec<u8>),
    Ignore,
}

/// Answers queries from synthesized zones.
#[derive(Debug)]
pub struct Responder {
    synthesizer: ZoneSynthesizer,
    keyring: TsigKeyring,
    unmatched: UnmatchedPolicy,
    signatures: SignaturePolicy,
}

impl Responder {
    /// Create a responder with default policies.
    pub fn new(synthesizer: ZoneSynthesizer, keyring: TsigKeyring) -> Self {
        Self {
            synthesizer,
            keyring,
            unmatched: UnmatchedPolicy::default(),
            signatures: SignaturePolicy::default(),
        }
    }

    /// Build a responder over `registry` from DNS configuration.
    pub fn from_config(registry: HostRegistry, config: &DnsConfig) -> Result<Self, DnsError> {
        let synthesizer = ZoneSynthesizer::new(registry, &config.soa)?;
        let keyring = TsigKeyring::from_config(&config.tsig_keys)?;
        Ok(Self::new(synthesizer, keyring)
            .with_unmatched(config.unmatched)
            .with_signature_policy(config.signature_records))
    }

    /// Rcode for names no container answers to.
    pub fn with_unmatched(mut self, policy: UnmatchedPolicy) -> Self {
        self.unmatched = policy;
        self
    }

    /// Insertion policy for signature companions.
    pub fn with_signature_policy(mut self, policy: SignaturePolicy) -> Self {
        self.signatures = policy;
        self
    }

    /// The zone synthesizer.
    pub fn synthesizer(&self) -> &ZoneSynthesizer {
        &self.synthesizer
    }

    /// Answer one datagram.
    ///
    /// `Err` means the datagram could not be decoded and should be dropped.
    /// `Ok(None)` means it was understood but deserves no reply.
    pub fn respond(&self, packet: &[u8]) -> Result<Option<Vec<u8>>, DnsError> {
        self.respond_at(packet, tsig::unix_now())
    }

    /// [`Responder::respond`] with an explicit clock for TSIG.
    pub fn respond_at(&self, packet: &[u8], now: u64) -> Result<Option<Vec<u8>>, DnsError> {
        let timer = Timer::start();
        let ctx = match self.prepare(packet, now)? {
            Prepared::Query(ctx) => ctx,
            Prepared::Reply(bytes) => {
                metrics::record_query("-", QueryResult::FormErr, timer.elapsed());
                return Ok(Some(bytes));
            }
            Prepared::Ignore => return Ok(None),
        };

        let Some(question) = ctx.query.queries().first().cloned() else {
            debug!(id = ctx.query.id(), "query without question");
            metrics::record_query("-", QueryResult::FormErr, timer.elapsed());
            let reply = build_error_message(ctx.query.header(), ResponseCode::FormErr, None);
            return Ok(Some(reply.to_vec()?));
        };

        let rtype = question.query_type();
        let rtype_str = rtype.to_string();
        if !is_concrete(rtype) && rtype != RecordType::ANY {
            debug!(name = %question.name(), qtype = %rtype, "unsupported query type");
            metrics::record_query(&rtype_str, QueryResult::NotImp, timer.elapsed());
            let reply = build_error_message(ctx.query.header(), ResponseCode::NotImp, Some(&question));
            return Ok(Some(reply.to_vec()?));
        }

        let mut response = Message::new();
        response
            .set_id(ctx.query.id())
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(ctx.query.recursion_desired());
        response.add_query(question.clone());

        let rcode = self.add_answer(&mut response, question.name(), rtype, 0, ctx.flags);
        if rcode != ResponseCode::NoError && rcode != ResponseCode::NXDomain {
            metrics::record_query(&rtype_str, QueryResult::Error, timer.elapsed());
            let reply = build_error_message(ctx.query.header(), rcode, Some(&question));
            return Ok(Some(reply.to_vec()?));
        }
        self.add_additional(&mut response, ctx.flags);
        response.set_response_code(rcode);

        if ctx.edns {
            let mut edns = Edns::new();
            edns.set_max_payload(RESPONSE_UDP_PAYLOAD);
            edns.set_rcode_high(rcode.high());
            edns.set_version(0);
            edns.set_dnssec_ok(ctx.flags.dnssec_ok);
            response.set_edns(edns);
        }

        let answers = response.answers().len();
        debug!(
            name = %question.name(),
            qtype = %rtype,
            rcode = %rcode,
            answers,
            authority = response.name_servers().len(),
            additional = response.additionals().len(),
            "answered query"
        );

        let bytes = match ctx.signature.as_ref() {
            Some(signature) => signature.sign_response(&mut response, now)?,
            None => response.to_vec()?,
        };

        let result = match (rcode, answers) {
            (ResponseCode::NXDomain, _) => QueryResult::NxDomain,
            (_, 0) => QueryResult::Empty,
            _ => QueryResult::Answered,
        };
        metrics::record_answer_records(answers);
        metrics::record_query(&rtype_str, result, timer.elapsed());
        Ok(Some(bytes))
    }

    fn prepare<'a>(&'a self, packet: &'a [u8], now: u64) -> Result<Prepared<'a>, DnsError> {
        let header = Header::from_bytes(packet)?;
        if header.op_code() != OpCode::Query {
            warn!(id = header.id(), opcode = ?header.op_code(), "ignoring non-query opcode");
            return Ok(Prepared::Ignore);
        }

        let query = match Message::from_vec(packet) {
            Ok(query) => query,
            Err(e) if tsig_misplaced(packet) => {
                debug!(id = header.id(), error = %e, "rejecting query");
                return formerr(&header).map(Prepared::Reply);
            }
            Err(e) => return Err(e.into()),
        };

        let signature = match query
            .signature()
            .iter()
            .find(|r| r.record_type() == RecordType::TSIG)
        {
            Some(record) => match self.keyring.verify(packet, record, now) {
                Ok(signature) => Some(signature),
                Err(e) => {
                    debug!(id = header.id(), error = %e, "TSIG verification failed");
                    return formerr(&header).map(Prepared::Reply);
                }
            },
            None => None,
        };

        let edns = query.extensions().as_ref();
        let flags = QueryFlags {
            dnssec_ok: edns.is_some_and(|e| e.flags().dnssec_ok),
            sig_only: false,
        };
        let edns = edns.is_some();

        Ok(Prepared::Query(QueryContext {
            query,
            raw: packet,
            signature,
            edns,
            flags,
        }))
    }

    /// Resolve `name`/`rtype` into the answer and authority sections.
    ///
    /// Returns the rcode for the response.
    pub fn add_answer(
        &self,
        response: &mut Message,
        name: &Name,
        rtype: RecordType,
        iterations: usize,
        mut flags: QueryFlags,
    ) -> ResponseCode {
        if iterations > MAX_ITERATIONS {
            return ResponseCode::NoError;
        }

        let rtype = if matches!(rtype, RecordType::SIG | RecordType::RRSIG) {
            flags.sig_only = true;
            RecordType::ANY
        } else {
            rtype
        };

        let Some(zone) = self.synthesizer.find_best_zone(name) else {
            return self.unmatched_rcode();
        };

        match zone.find_records(name, rtype) {
            ZoneLookup::Success(rrsets) => {
                for rrset in &rrsets {
                    self.add_rrset(name, response, rrset, Section::Answer, flags);
                }
                self.add_ns(response, zone.ns(), flags);
                if iterations == 0 {
                    response.set_authoritative(true);
                }
                ResponseCode::NoError
            }
            ZoneLookup::NoData => ResponseCode::NoError,
            ZoneLookup::NxDomain => self.unmatched_rcode(),
        }
    }

    fn add_ns(&self, response: &mut Message, ns: Option<&RecordSet>, flags: QueryFlags) {
        if let Some(ns) = ns {
            self.add_rrset(ns.name(), response, ns, Section::Authority, flags);
        }
    }

    /// Add glue A records for every NS, MX or SRV target in the answer and
    /// authority sections.
    pub fn add_additional(&self, response: &mut Message, flags: QueryFlags) {
        let targets: Vec<Name> = response
            .answers()
            .iter()
            .chain(response.name_servers())
            .filter_map(glue_target)
            .collect();

        for target in targets {
            self.add_glue(response, &target, flags);
        }
    }

    fn add_glue(&self, response: &mut Message, name: &Name, flags: QueryFlags) {
        if let Some(a) = self.synthesizer.find_exact_match(name, RecordType::A) {
            self.add_rrset(name, response, &a, Section::Additional, flags);
        }
    }

    /// Insert `rrset` into `section` unless `(name, type)` is already present
    /// in that section or an earlier one.
    pub fn add_rrset(
        &self,
        name: &Name,
        response: &mut Message,
        rrset: &RecordSet,
        section: Section,
        flags: QueryFlags,
    ) {
        let present = Section::ALL
            .iter()
            .filter(|s| **s <= section)
            .flat_map(|s| s.records(response))
            .any(|r| r.name() == name && r.record_type() == rrset.record_type());
        if present {
            return;
        }

        let records: Vec<Record> = rrset
            .records_without_rrsigs()
            .map(|r| rewrite_wildcard(r, name))
            .collect();

        if !flags.sig_only {
            for record in &records {
                section.push(response, record.clone());
            }
        }
        if self.signatures == SignaturePolicy::Duplicate && (flags.sig_only || flags.dnssec_ok) {
            for record in records {
                section.push(response, record);
            }
        }
    }

    fn unmatched_rcode(&self) -> ResponseCode {
        match self.unmatched {
            UnmatchedPolicy::NoError => ResponseCode::NoError,
            UnmatchedPolicy::NxDomain => ResponseCode::NXDomain,
        }
    }
}

/// Error reply built from `header`: the request header copied unchanged
/// apart from the rcode, every section empty. The question is kept only
/// for SERVFAIL.
pub fn build_error_message(
    header: &Header,
    rcode: ResponseCode,
    question: Option<&Query>,
) -> Message {
    let mut header = *header;
    header
        .set_response_code(rcode)
        .set_query_count(0)
        .set_answer_count(0)
        .set_name_server_count(0)
        .set_additional_count(0);

    let mut message = Message::new();
    message.set_header(header);
    if rcode == ResponseCode::ServFail {
        if let Some(question) = question {
            message.add_query(question.clone());
        }
    }
    message
}

fn formerr(header: &Header) -> Result<Vec<u8>, DnsError> {
    Ok(build_error_message(header, ResponseCode::FormErr, None).to_vec()?)
}

/// True if `packet` holds a TSIG record that is not its last record.
///
/// Decoding stops at the first record that does not parse, so forged
/// section counts cost no more than the datagram itself.
fn tsig_misplaced(packet: &[u8]) -> bool {
    let mut decoder = BinDecoder::new(packet);
    let Ok(header) = Header::read(&mut decoder) else {
        return false;
    };
    for _ in 0..header.query_count() {
        if Query::read(&mut decoder).is_err() {
            return false;
        }
    }

    let total = usize::from(header.answer_count())
        + usize::from(header.name_server_count())
        + usize::from(header.additional_count());
    for index in 0..total {
        match Record::read(&mut decoder) {
            Ok(record) if record.record_type() == RecordType::TSIG => return index + 1 != total,
            Ok(_) => {}
            Err(_) => return false,
        }
    }
    false
}

/// Types that name actual data: not 0, not OPT, not the meta range.
fn is_concrete(rtype: RecordType) -> bool {
    let code = u16::from(rtype);
    !(code == 0 || rtype == RecordType::OPT || (128..=255).contains(&code))
}

fn glue_target(record: &Record) -> Option<Name> {
    match record.data() {
        RData::NS(ns) => Some(ns.0.clone()),
        RData::MX(mx) => Some(mx.exchange().clone()),
        RData::SRV(srv) => Some(srv.target().clone()),
        _ => None,
    }
}

fn rewrite_wildcard(record: &Record, name: &Name) -> Record {
    if record.name().is_wildcard() && !name.is_wildcard() {
        let mut record = record.clone();
        record.set_name(name.clone());
        record
    } else {
        record.clone()
    }
}
