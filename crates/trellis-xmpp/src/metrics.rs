//! Server metrics.
//!
//! Instruments come from the global OpenTelemetry meter provider and are
//! built once on first use. Until the host installs a provider every
//! recording is a no-op.

use std::sync::OnceLock;

use opentelemetry::metrics::{Counter, Histogram, UpDownCounter};
use opentelemetry::KeyValue;

struct Instruments {
    stanzas: Counter<u64>,
    auth_attempts: Counter<u64>,
    s2s_connections: Counter<u64>,
    floods: Counter<u64>,
    connections: UpDownCounter<i64>,
    stanza_latency: Histogram<f64>,
}

fn instruments() -> &'static Instruments {
    static INSTRUMENTS: OnceLock<Instruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = opentelemetry::global::meter("trellis-xmpp");
        Instruments {
            stanzas: meter
                .u64_counter("xmpp.stanzas.processed")
                .with_description("Stanzas handled, by kind and direction")
                .with_unit("stanza")
                .build(),
            auth_attempts: meter
                .u64_counter("xmpp.auth.attempts")
                .with_description("SASL attempts, by mechanism and outcome")
                .with_unit("attempt")
                .build(),
            s2s_connections: meter
                .u64_counter("xmpp.s2s.connections")
                .with_description("Outbound peer dials, by domain and outcome")
                .with_unit("connection")
                .build(),
            floods: meter
                .u64_counter("xmpp.rate_limit.floods")
                .with_description("Sessions that ran out of rate-limit tokens")
                .with_unit("session")
                .build(),
            connections: meter
                .i64_up_down_counter("xmpp.connections.active")
                .with_description("Open sessions, by role")
                .with_unit("connection")
                .build(),
            stanza_latency: meter
                .f64_histogram("xmpp.stanza.latency")
                .with_description("Time spent handling one inbound stanza")
                .with_unit("ms")
                .build(),
        }
    })
}

fn outcome(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "failure"
    }
}

pub fn record_stanza(kind: &str, direction: &str) {
    instruments().stanzas.add(
        1,
        &[
            KeyValue::new("type", kind.to_string()),
            KeyValue::new("direction", direction.to_string()),
        ],
    );
}

pub fn record_auth_attempt(mechanism: &str, success: bool) {
    instruments().auth_attempts.add(
        1,
        &[
            KeyValue::new("mechanism", mechanism.to_string()),
            KeyValue::new("result", outcome(success)),
        ],
    );
}

/// One dial of a remote domain, after every SRV candidate was tried.
pub fn record_s2s_connection(domain: &str, success: bool) {
    instruments().s2s_connections.add(
        1,
        &[
            KeyValue::new("domain", domain.to_string()),
            KeyValue::new("result", outcome(success)),
        ],
    );
}

pub fn record_flood(role: &str) {
    instruments().floods.add(1, &[KeyValue::new("role", role.to_string())]);
}

/// Adjust the number of open sessions of `role` by `delta`.
pub fn record_connection_count(delta: i64, role: &str) {
    instruments()
        .connections
        .add(delta, &[KeyValue::new("role", role.to_string())]);
}

pub fn record_stanza_latency(latency_ms: f64, kind: &str) {
    instruments()
        .stanza_latency
        .record(latency_ms, &[KeyValue::new("type", kind.to_string())]);
}
