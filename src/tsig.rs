//! Transaction signatures (RFC 8945).
//!
//! Requests are verified over the exact bytes received with hickory's
//! [`TSigner`]. Responses are signed with the request MAC as prior digest
//! and carry the TSIG record as the last additional record.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hickory_proto::dnssec::rdata::tsig::{make_tsig_record, TsigAlgorithm, TSIG};
use hickory_proto::dnssec::rdata::DNSSECRData;
use hickory_proto::dnssec::tsig::TSigner;
use hickory_proto::dnssec::DnsSecError;
use hickory_proto::op::Message;
use hickory_proto::rr::{Name, RData, Record};
use hickory_proto::serialize::binary::BinEncoder;
use hickory_proto::ProtoError;
use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::config::TsigKeyConfig;

/// Fudge written into signed responses, in seconds.
pub const DEFAULT_FUDGE: u16 = 300;

/// TSIG failures.
#[derive(Debug, Error)]
pub enum TsigError {
    /// Algorithm name not supported.
    #[error("unsupported TSIG algorithm: {0}")]
    UnknownAlgorithm(String),

    /// Secret is not valid base64.
    #[error("invalid TSIG secret for key {0}")]
    BadSecret(String),

    /// Key name is not a valid domain name.
    #[error("invalid TSIG key name: {0}")]
    BadName(String),

    /// No key with the name carried by the request.
    #[error("unknown TSIG key: {0}")]
    UnknownKey(Name),

    /// The signature record does not hold TSIG rdata.
    #[error("record {0} is not a TSIG record")]
    NotTsig(Name),

    /// Time signed is outside the fudge window.
    #[error("TSIG time {time_signed} outside fudge {fudge} (now {now})")]
    BadTime {
        /// Time signed.
        time_signed: u64,
        /// Allowed skew.
        fudge: u16,
        /// Local time.
        now: u64,
    },

    /// MAC, key or algorithm check failed.
    #[error("TSIG verification failed: {0}")]
    Verify(#[from] DnsSecError),

    /// Encoding the signed message failed.
    #[error(transparent)]
    Proto(#[from] ProtoError),
}

/// Map a configured algorithm name such as `hmac-sha256` or `HMAC-SHA256.`.
///
/// Only the algorithms hickory can compute are accepted.
pub fn parse_algorithm(name: &str) -> Result<TsigAlgorithm, TsigError> {
    match name.trim_end_matches('.').to_ascii_lowercase().as_str() {
        "hmac-sha256" => Ok(TsigAlgorithm::HmacSha256),
        "hmac-sha384" => Ok(TsigAlgorithm::HmacSha384),
        "hmac-sha512" => Ok(TsigAlgorithm::HmacSha512),
        _ => Err(TsigError::UnknownAlgorithm(name.to_string())),
    }
}

/// Build a signer from one configured key.
pub fn signer_from_config(config: &TsigKeyConfig) -> Result<TSigner, TsigError> {
    let algorithm = parse_algorithm(&config.algorithm)?;
    let name = if config.name.ends_with('.') {
        config.name.clone()
    } else {
        format!("{}.", config.name)
    };
    let name = Name::from_ascii(&name).map_err(|_| TsigError::BadName(config.name.clone()))?;
    let secret = STANDARD
        .decode(config.secret.trim())
        .map_err(|_| TsigError::BadSecret(config.name.clone()))?;
    Ok(TSigner::new(secret, algorithm, name, DEFAULT_FUDGE)?)
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A verified request signature: the key that produced it and its MAC.
///
/// The MAC is the prior digest of the response signature.
#[derive(Clone)]
pub struct RequestSignature {
    signer: TSigner,
    mac: Vec<u8>,
    time_signed: u64,
}

impl RequestSignature {
    /// Key name.
    pub fn key_name(&self) -> &Name {
        self.signer.signer_name()
    }

    /// MAC carried by the request.
    pub fn mac(&self) -> &[u8] {
        &self.mac
    }

    /// Time the request was signed.
    pub fn time_signed(&self) -> u64 {
        self.time_signed
    }

    /// Append a TSIG record to `response` and encode it.
    ///
    /// The MAC covers the request MAC, the unsigned response and the TSIG
    /// variables, in that order.
    pub fn sign_response(&self, response: &mut Message, now: u64) -> Result<Vec<u8>, TsigError> {
        let unsigned = response.to_vec()?;
        let pre_tsig = TSIG::new(
            self.signer.algorithm().clone(),
            now,
            DEFAULT_FUDGE,
            Vec::new(),
            response.id(),
            0,
            Vec::new(),
        );

        let mut tbs = Vec::with_capacity(unsigned.len() + self.mac.len() + 64);
        {
            let mut encoder = BinEncoder::new(&mut tbs);
            encoder.emit_u16(self.mac.len() as u16)?;
            encoder.emit_vec(&self.mac)?;
            encoder.emit_vec(&unsigned)?;
            pre_tsig.emit_tsig_for_mac(&mut encoder, self.signer.signer_name())?;
        }
        let mac = self.signer.sign(&tbs)?;

        response.add_tsig(make_tsig_record(
            self.signer.signer_name().clone(),
            pre_tsig.set_mac(mac),
        ));
        Ok(response.to_vec()?)
    }
}

impl fmt::Debug for RequestSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestSignature")
            .field("key", self.signer.signer_name())
            .field("time_signed", &self.time_signed)
            .finish_non_exhaustive()
    }
}

/// Signers indexed by lower-cased key name.
#[derive(Default, Clone)]
pub struct TsigKeyring {
    signers: HashMap<String, TSigner>,
}

impl TsigKeyring {
    /// Build a keyring from configuration; any invalid key is an error.
    pub fn from_config(keys: &[TsigKeyConfig]) -> Result<Self, TsigError> {
        let mut ring = Self::default();
        for config in keys {
            ring.insert(signer_from_config(config)?);
        }
        Ok(ring)
    }

    /// Add or replace a key.
    pub fn insert(&mut self, signer: TSigner) {
        self.signers.insert(key_id(signer.signer_name()), signer);
    }

    /// Key by name, ignoring case.
    pub fn get(&self, name: &Name) -> Option<&TSigner> {
        self.signers.get(&key_id(name))
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.signers.len()
    }

    /// True if no keys are configured.
    pub fn is_empty(&self) -> bool {
        self.signers.is_empty()
    }

    /// Verify `packet`, whose last additional record is `record`.
    ///
    /// Checks follow RFC 8945: key, algorithm and MAC, then time.
    pub fn verify(
        &self,
        packet: &[u8],
        record: &Record,
        now: u64,
    ) -> Result<RequestSignature, TsigError> {
        let signer = self
            .get(record.name())
            .ok_or_else(|| TsigError::UnknownKey(record.name().clone()))?;
        let RData::DNSSEC(DNSSECRData::TSIG(tsig)) = record.data() else {
            return Err(TsigError::NotTsig(record.name().clone()));
        };

        let bad_time = || TsigError::BadTime {
            time_signed: tsig.time(),
            fudge: tsig.fudge(),
            now,
        };
        // The signer's window starts at time - fudge.
        if tsig.time() < u64::from(tsig.fudge()) {
            return Err(bad_time());
        }

        let (mac, _, time_signed) = signer.verify_message_byte(None, packet, true)?;
        if now.abs_diff(time_signed) > u64::from(tsig.fudge()) {
            return Err(bad_time());
        }

        Ok(RequestSignature {
            signer: signer.clone(),
            mac,
            time_signed,
        })
    }
}

impl fmt::Debug for TsigKeyring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.signers.keys()).finish()
    }
}

fn key_id(name: &Name) -> String {
    let mut name = name.to_lowercase();
    name.set_fqdn(true);
    name.to_ascii()
}
