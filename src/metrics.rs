//! Metrics instrumentation for dock-dns.
//!
//! All metrics are prefixed with `dock_dns.`

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a DNS query.
pub fn record_query(record_type: &str, result: QueryResult, duration: Duration) {
    let result_str = match result {
        QueryResult::Answered => "answered",
        QueryResult::Empty => "empty",
        QueryResult::NxDomain => "nxdomain",
        QueryResult::NotImp => "notimp",
        QueryResult::FormErr => "formerr",
        QueryResult::Error => "error",
    };

    counter!("dock_dns.query.count", "type" => record_type.to_string(), "result" => result_str)
        .increment(1);
    histogram!("dock_dns.query.duration.seconds", "type" => record_type.to_string())
        .record(duration.as_secs_f64());
}

/// Query result type for metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryResult {
    /// At least one answer record.
    Answered,
    /// NOERROR with an empty answer section.
    Empty,
    /// Name not found.
    NxDomain,
    /// Unsupported query type.
    NotImp,
    /// Malformed query or TSIG failure.
    FormErr,
    /// Any other failure.
    Error,
}

/// Record a registry mutation driven by the event stream.
pub fn record_registry_event(kind: RegistryEventKind) {
    let kind_str = match kind {
        RegistryEventKind::Start => "start",
        RegistryEventKind::Stop => "stop",
        RegistryEventKind::Ignored => "ignored",
        RegistryEventKind::Resync => "resync",
        RegistryEventKind::Error => "error",
    };

    counter!("dock_dns.registry.event.count", "kind" => kind_str).increment(1);
}

/// Registry event kinds.
#[derive(Debug, Clone, Copy)]
pub enum RegistryEventKind {
    /// Container started and was (re)inserted.
    Start,
    /// Container stopped and was removed.
    Stop,
    /// Event with no effect on the registry.
    Ignored,
    /// Full re-enumeration after a reconnect.
    Resync,
    /// Event could not be applied.
    Error,
}

/// Record an event stream reconnect.
pub fn record_event_stream_reconnect(reason: ReconnectReason) {
    let reason_str = match reason {
        ReconnectReason::StreamEnded => "stream_ended",
        ReconnectReason::Error => "error",
        ReconnectReason::InitialConnect => "initial_connect",
    };

    counter!("dock_dns.events.reconnect.count", "reason" => reason_str).increment(1);
}

/// Reconnect reasons.
#[derive(Debug, Clone, Copy)]
pub enum ReconnectReason {
    /// Event stream ended normally.
    StreamEnded,
    /// Subscribing or reading the stream failed.
    Error,
    /// First subscription.
    InitialConnect,
}

/// Record registry sizes (call periodically).
pub fn record_registry_counts(containers: usize, aliases: usize, addresses: usize) {
    gauge!("dock_dns.registry.containers.count").set(containers as f64);
    gauge!("dock_dns.registry.aliases.count").set(aliases as f64);
    gauge!("dock_dns.registry.addresses.count").set(addresses as f64);
}

/// Record the number of records in an answer section.
pub fn record_answer_records(count: usize) {
    histogram!("dock_dns.query.answer.records").record(count as f64);
}

/// Helper for timing operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
