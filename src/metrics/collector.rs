//! Metrics collector using prometheus-client.
//!
//! Provides metrics for connection counts, message throughput, and
//! per-connection failures.

use crate::config::Protocol;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::Arc;

/// Labels for connection metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ConnectionLabels {
    pub protocol: String,
}

/// Labels for message metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct MessageLabels {
    pub protocol: String,
    pub direction: Direction,
}

/// Labels for connection error metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub protocol: String,
    pub kind: String,
}

/// Direction of a message relative to the server.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Collects and stores all metrics.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<MetricsCollectorInner>,
}

struct MetricsCollectorInner {
    /// Total accepted connections.
    connections_total: Family<ConnectionLabels, Counter>,
    /// Connections currently open.
    active_connections: Family<ConnectionLabels, Gauge>,
    /// Messages dispatched to sinks or written back to peers.
    messages_total: Family<MessageLabels, Counter>,
    /// Connections closed by a framing, sink, or I/O failure.
    connection_errors_total: Family<ErrorLabels, Counter>,
    /// Accepted sockets dropped because the worker pool was closed.
    rejected_connections_total: Family<ConnectionLabels, Counter>,
    /// The prometheus registry.
    registry: Registry,
}

fn labels(protocol: Protocol) -> ConnectionLabels {
    ConnectionLabels {
        protocol: protocol.name().to_string(),
    }
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let connections_total = Family::<ConnectionLabels, Counter>::default();
        let active_connections = Family::<ConnectionLabels, Gauge>::default();
        let messages_total = Family::<MessageLabels, Counter>::default();
        let connection_errors_total = Family::<ErrorLabels, Counter>::default();
        let rejected_connections_total = Family::<ConnectionLabels, Counter>::default();

        registry.register(
            "netgate_connections",
            "Total number of accepted connections",
            connections_total.clone(),
        );
        registry.register(
            "netgate_active_connections",
            "Number of open connections",
            active_connections.clone(),
        );
        registry.register(
            "netgate_messages",
            "Total number of framed messages",
            messages_total.clone(),
        );
        registry.register(
            "netgate_connection_errors",
            "Total number of connections closed by an error",
            connection_errors_total.clone(),
        );
        registry.register(
            "netgate_rejected_connections",
            "Total number of accepted connections rejected by a closed pool",
            rejected_connections_total.clone(),
        );

        Self {
            inner: Arc::new(MetricsCollectorInner {
                connections_total,
                active_connections,
                messages_total,
                connection_errors_total,
                rejected_connections_total,
                registry,
            }),
        }
    }

    /// Get the prometheus registry for encoding.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Increment active connections.
    pub fn connection_opened(&self, protocol: Protocol) {
        let labels = labels(protocol);
        self.inner.active_connections.get_or_create(&labels).inc();
        self.inner.connections_total.get_or_create(&labels).inc();
    }

    /// Decrement active connections, counting the close as an error when
    /// `error_kind` is set.
    pub fn connection_closed(&self, protocol: Protocol, error_kind: Option<&str>) {
        self.inner
            .active_connections
            .get_or_create(&labels(protocol))
            .dec();

        if let Some(kind) = error_kind {
            let labels = ErrorLabels {
                protocol: protocol.name().to_string(),
                kind: kind.to_string(),
            };
            self.inner.connection_errors_total.get_or_create(&labels).inc();
        }
    }

    /// Record one message crossing a connection.
    pub fn record_message(&self, protocol: Protocol, direction: Direction) {
        let labels = MessageLabels {
            protocol: protocol.name().to_string(),
            direction,
        };
        self.inner.messages_total.get_or_create(&labels).inc();
    }

    /// Record an accepted socket that could not be handed to a worker.
    pub fn connection_rejected(&self, protocol: Protocol) {
        self.inner
            .rejected_connections_total
            .get_or_create(&labels(protocol))
            .inc();
    }

    /// Current number of open connections for `protocol`.
    pub fn active_connections(&self, protocol: Protocol) -> i64 {
        self.inner
            .active_connections
            .get_or_create(&labels(protocol))
            .get()
    }

    /// Total messages recorded for `protocol` in `direction`.
    pub fn messages(&self, protocol: Protocol, direction: Direction) -> u64 {
        let labels = MessageLabels {
            protocol: protocol.name().to_string(),
            direction,
        };
        self.inner.messages_total.get_or_create(&labels).get()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_collector_new() {
        let collector = MetricsCollector::new();
        let _ = collector.registry();
    }

    #[test]
    fn test_connection_tracking() {
        let collector = MetricsCollector::new();

        collector.connection_opened(Protocol::Line);
        collector.connection_opened(Protocol::Line);
        collector.connection_opened(Protocol::Mqtt);
        collector.connection_closed(Protocol::Line, None);

        assert_eq!(collector.active_connections(Protocol::Line), 1);
        assert_eq!(collector.active_connections(Protocol::Mqtt), 1);
        assert_eq!(collector.active_connections(Protocol::WebSocket), 0);
    }

    #[test]
    fn test_message_counts() {
        let collector = MetricsCollector::new();

        collector.record_message(Protocol::WebSocket, Direction::Inbound);
        collector.record_message(Protocol::WebSocket, Direction::Inbound);
        collector.record_message(Protocol::WebSocket, Direction::Outbound);

        assert_eq!(collector.messages(Protocol::WebSocket, Direction::Inbound), 2);
        assert_eq!(collector.messages(Protocol::WebSocket, Direction::Outbound), 1);
    }

    #[test]
    fn test_errors_and_rejections_encoded() {
        let collector = MetricsCollector::new();

        collector.connection_opened(Protocol::Mqtt);
        collector.connection_closed(Protocol::Mqtt, Some("malformed_frame"));
        collector.connection_rejected(Protocol::Line);

        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, collector.registry()).unwrap();

        assert!(buffer.contains("netgate_connection_errors_total"));
        assert!(buffer.contains("kind=\"malformed_frame\""));
        assert!(buffer.contains("netgate_rejected_connections_total"));
    }
}
