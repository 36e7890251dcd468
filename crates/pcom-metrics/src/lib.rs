//! Metrics for the PCOM serial gateway.
//!
//! Every metric the link layer records is declared once in [`metric_defs`].
//! Recording is a no-op until a recorder is installed, so library code can
//! increment counters unconditionally.
//!
//! ```rust,ignore
//! use pcom_metrics::{describe_metrics, metric_defs, LinkLabels};
//!
//! describe_metrics();
//!
//! let labels = LinkLabels::new("127.0.0.1:4001").to_labels();
//! metrics::counter!(metric_defs::LINK_FRAMES_SENT.name, &labels).increment(1);
//! ```

pub use metrics;

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

/// Counter, gauge or histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

/// A metric name with the metadata handed to the recorder.
#[derive(Debug, Clone)]
pub struct Metric {
    /// Name passed to the `metrics` macros.
    pub name: &'static str,
    /// Kind of metric.
    pub kind: MetricKind,
    /// Help text.
    pub description: &'static str,
    /// Unit, all link metrics have one.
    pub unit: Unit,
}

impl Metric {
    const fn new(kind: MetricKind, name: &'static str, unit: Unit, description: &'static str) -> Self {
        Metric {
            name,
            kind,
            description,
            unit,
        }
    }

    /// Declare a counter.
    pub const fn counter(name: &'static str, unit: Unit, description: &'static str) -> Self {
        Self::new(MetricKind::Counter, name, unit, description)
    }

    /// Declare a gauge.
    pub const fn gauge(name: &'static str, unit: Unit, description: &'static str) -> Self {
        Self::new(MetricKind::Gauge, name, unit, description)
    }

    /// Declare a histogram.
    pub const fn histogram(name: &'static str, unit: Unit, description: &'static str) -> Self {
        Self::new(MetricKind::Histogram, name, unit, description)
    }

    /// Register the description with the installed recorder.
    pub fn describe(&self) {
        match self.kind {
            MetricKind::Counter => describe_counter!(self.name, self.unit, self.description),
            MetricKind::Gauge => describe_gauge!(self.name, self.unit, self.description),
            MetricKind::Histogram => describe_histogram!(self.name, self.unit, self.description),
        }
    }
}

/// All metric definitions for the gateway.
pub mod metric_defs {
    use super::{Metric, Unit};

    // ========================================================================
    // Link Layer Metrics
    // ========================================================================

    /// Frames written to the wire, including retransmissions and ACKs.
    pub const LINK_FRAMES_SENT: Metric = Metric::counter(
        "pcom.link.frames_sent",
        Unit::Count,
        "Frames written to the serial link",
    );

    /// Frames extracted from the inbound byte stream.
    pub const LINK_FRAMES_RECEIVED: Metric = Metric::counter(
        "pcom.link.frames_received",
        Unit::Count,
        "Frames received from the serial link",
    );

    /// Retransmissions after an acknowledgment timeout.
    pub const LINK_RETRANSMISSIONS: Metric = Metric::counter(
        "pcom.link.retransmissions",
        Unit::Count,
        "Frames resent after an acknowledgment timeout",
    );

    /// Sends that exhausted their retry budget.
    pub const LINK_DELIVERY_FAILURES: Metric = Metric::counter(
        "pcom.link.delivery_failures",
        Unit::Count,
        "Sends that exhausted their retry budget",
    );

    /// Frames whose body did not sum to zero.
    pub const LINK_CHECKSUM_MISMATCHES: Metric = Metric::counter(
        "pcom.link.checksum_mismatches",
        Unit::Count,
        "Received frames with a bad checksum",
    );

    /// ACKs that matched no pending slot.
    pub const LINK_STALE_ACKS: Metric = Metric::counter(
        "pcom.link.stale_acks",
        Unit::Count,
        "ACK frames with no matching pending sequence number",
    );

    /// ACK frames written in reply to inbound frames.
    pub const LINK_ACKS_SENT: Metric = Metric::counter(
        "pcom.link.acks_sent",
        Unit::Count,
        "ACK frames written for inbound frames",
    );

    /// Depth of the outbound queue.
    pub const LINK_QUEUE_DEPTH: Metric = Metric::gauge(
        "pcom.link.queue_depth",
        Unit::Count,
        "Messages waiting in the outbound queue",
    );

    /// Round trip from first transmission to ACK.
    pub const LINK_ACK_LATENCY: Metric = Metric::histogram(
        "pcom.link.ack_latency_us",
        Unit::Microseconds,
        "Time from first transmission to acknowledgment",
    );

    // ========================================================================
    // Codec Metrics
    // ========================================================================

    /// Outbound logical messages that failed to encode.
    pub const CODEC_ENCODE_ERRORS: Metric = Metric::counter(
        "pcom.codec.encode_errors",
        Unit::Count,
        "Logical messages rejected by the encoder",
    );

    /// Inbound payloads that failed to decode.
    pub const CODEC_DECODE_ERRORS: Metric = Metric::counter(
        "pcom.codec.decode_errors",
        Unit::Count,
        "Inbound payloads that failed to decode",
    );

    // ========================================================================
    // Discovery Metrics
    // ========================================================================

    /// Discovery sessions started (joined sessions are not counted).
    pub const DISCOVERY_SESSIONS: Metric = Metric::counter(
        "pcom.discovery.sessions",
        Unit::Count,
        "Discovery sessions started",
    );

    /// Descriptors learned from item enumeration.
    pub const DISCOVERY_DESCRIPTORS: Metric = Metric::gauge(
        "pcom.discovery.descriptors",
        Unit::Count,
        "Format descriptors known after the last discovery",
    );

    /// Every metric declared above.
    pub const ALL: &[Metric] = &[
        LINK_FRAMES_SENT,
        LINK_FRAMES_RECEIVED,
        LINK_RETRANSMISSIONS,
        LINK_DELIVERY_FAILURES,
        LINK_CHECKSUM_MISMATCHES,
        LINK_STALE_ACKS,
        LINK_ACKS_SENT,
        LINK_QUEUE_DEPTH,
        LINK_ACK_LATENCY,
        CODEC_ENCODE_ERRORS,
        CODEC_DECODE_ERRORS,
        DISCOVERY_SESSIONS,
        DISCOVERY_DESCRIPTORS,
    ];
}

/// Labels attached to link-scoped metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkLabels {
    /// Human-readable link name (usually the transport address).
    pub link: String,
}

impl LinkLabels {
    /// Create labels for a link.
    pub fn new(link: impl Into<String>) -> Self {
        LinkLabels { link: link.into() }
    }

    /// Returns the labels as key-value pairs for the `metrics` macros.
    pub fn to_labels(&self) -> Vec<(&'static str, String)> {
        vec![("link", self.link.clone())]
    }
}

/// Describes all metrics used by the gateway.
///
/// Call once at startup after installing a recorder.
pub fn describe_metrics() {
    for metric in metric_defs::ALL {
        metric.describe();
    }
}

/// Install a Prometheus exporter serving on `addr`.
#[cfg(feature = "prometheus")]
pub fn install_prometheus(
    addr: std::net::SocketAddr,
) -> Result<(), metrics_exporter_prometheus::BuildError> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_labels() {
        let labels = LinkLabels::new("127.0.0.1:5000");
        let label_vec = labels.to_labels();

        assert_eq!(label_vec.len(), 1);
        assert!(label_vec.contains(&("link", "127.0.0.1:5000".to_string())));
    }

    #[test]
    fn test_metric_definitions() {
        assert_eq!(metric_defs::LINK_FRAMES_SENT.name, "pcom.link.frames_sent");
        assert_eq!(metric_defs::LINK_FRAMES_SENT.kind, MetricKind::Counter);
        assert_eq!(metric_defs::LINK_QUEUE_DEPTH.kind, MetricKind::Gauge);
        assert_eq!(metric_defs::LINK_ACK_LATENCY.kind, MetricKind::Histogram);
        assert_eq!(metric_defs::LINK_ACK_LATENCY.unit, Unit::Microseconds);
    }

    #[test]
    fn test_all_metrics_have_unique_names() {
        let mut names: Vec<_> = metric_defs::ALL.iter().map(|m| m.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), metric_defs::ALL.len());
    }

    #[test]
    fn test_describe_without_recorder() {
        describe_metrics();
    }
}
