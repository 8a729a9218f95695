//! Per-protocol pipelines.
//!
//! A pipeline is a codec (bytes to frames), a set of stages (frames to
//! messages), and a terminal [`MessageSink`]. [`PipelineFactory`] builds a
//! fresh pipeline for every accepted connection from its [`ProtocolSpec`].

mod connection;
mod sink;
mod stages;

pub use connection::{Chain, ConnectionContext};
pub use sink::{CloseReason, LoggingSink, MessageSink, SinkError, Sinks};
pub use stages::{LineStages, MqttStages, Stages, Step, WebSocketStages};

use crate::codec::{LineCodec, MqttCodec, WebSocketCodec};
use crate::config::{Config, Protocol};
use tokio::io::{AsyncRead, AsyncWrite};

/// Codec parameters for one protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecSettings {
    Mqtt {
        max_remaining_length: usize,
    },
    WebSocket {
        path: String,
        max_frame_payload: usize,
        write_chunk_size: usize,
    },
    Line {
        max_line_length: usize,
    },
}

impl CodecSettings {
    pub fn protocol(&self) -> Protocol {
        match self {
            CodecSettings::Mqtt { .. } => Protocol::Mqtt,
            CodecSettings::WebSocket { .. } => Protocol::WebSocket,
            CodecSettings::Line { .. } => Protocol::Line,
        }
    }
}

/// A protocol served on one port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolSpec {
    pub port: u16,
    pub codec: CodecSettings,
}

impl ProtocolSpec {
    pub fn protocol(&self) -> Protocol {
        self.codec.protocol()
    }

    /// Port and codec settings for `protocol` as configured.
    pub fn from_config(config: &Config, protocol: Protocol) -> Self {
        match protocol {
            Protocol::Mqtt => ProtocolSpec {
                port: config.mqtt.port,
                codec: CodecSettings::Mqtt {
                    max_remaining_length: config.mqtt.max_remaining_length,
                },
            },
            Protocol::WebSocket => ProtocolSpec {
                port: config.websocket.port,
                codec: CodecSettings::WebSocket {
                    path: config.websocket.path.clone(),
                    max_frame_payload: config.websocket.max_frame_payload,
                    write_chunk_size: config.websocket.write_chunk_size,
                },
            },
            Protocol::Line => ProtocolSpec {
                port: config.tcp.port,
                codec: CodecSettings::Line {
                    max_line_length: config.tcp.max_line_length,
                },
            },
        }
    }

    /// Every protocol, in startup order.
    pub fn all(config: &Config) -> Vec<ProtocolSpec> {
        Protocol::ALL
            .iter()
            .map(|protocol| ProtocolSpec::from_config(config, *protocol))
            .collect()
    }
}

/// A ready-to-run pipeline for one connection.
pub enum Pipeline {
    Mqtt(Chain<MqttStages>),
    WebSocket(Chain<WebSocketStages>),
    Line(Chain<LineStages>),
}

impl Pipeline {
    pub fn protocol(&self) -> Protocol {
        match self {
            Pipeline::Mqtt(_) => Protocol::Mqtt,
            Pipeline::WebSocket(_) => Protocol::WebSocket,
            Pipeline::Line(_) => Protocol::Line,
        }
    }

    /// Drive `io` through this pipeline until the connection ends.
    pub async fn run<IO>(self, io: IO, ctx: ConnectionContext) -> CloseReason
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send,
    {
        match self {
            Pipeline::Mqtt(chain) => connection::drive(chain, io, ctx).await,
            Pipeline::WebSocket(chain) => connection::drive(chain, io, ctx).await,
            Pipeline::Line(chain) => connection::drive(chain, io, ctx).await,
        }
    }
}

/// Builds pipelines, pairing each protocol's codec with its sink.
pub struct PipelineFactory {
    sinks: Sinks,
}

impl PipelineFactory {
    pub fn new(sinks: Sinks) -> Self {
        Self { sinks }
    }

    /// A fresh pipeline with its own codec state.
    pub fn build(&self, spec: &ProtocolSpec) -> Pipeline {
        match &spec.codec {
            CodecSettings::Mqtt {
                max_remaining_length,
            } => Pipeline::Mqtt(Chain::new(
                MqttCodec::new(*max_remaining_length),
                MqttStages,
                self.sinks.mqtt.clone(),
            )),
            CodecSettings::WebSocket {
                path,
                max_frame_payload,
                write_chunk_size,
            } => Pipeline::WebSocket(Chain::new(
                WebSocketCodec::server(path.clone(), *max_frame_payload, *write_chunk_size),
                WebSocketStages,
                self.sinks.websocket.clone(),
            )),
            CodecSettings::Line { max_line_length } => Pipeline::Line(Chain::new(
                LineCodec::new(*max_line_length),
                LineStages,
                self.sinks.line.clone(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsCollector;
    use crate::util::{ConnectionId, DrainSignal};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_specs_in_startup_order() {
        let config = Config::default();
        let specs = ProtocolSpec::all(&config);

        let protocols: Vec<_> = specs.iter().map(ProtocolSpec::protocol).collect();
        assert_eq!(protocols, vec![Protocol::Mqtt, Protocol::WebSocket, Protocol::Line]);
        assert_eq!(specs[0].port, 1883);
        assert_eq!(specs[1].port, 8080);
        assert_eq!(specs[2].port, 9000);
    }

    #[test]
    fn test_factory_builds_matching_pipeline() {
        let config = Config::default();
        let factory = PipelineFactory::new(Sinks::logging());

        for spec in ProtocolSpec::all(&config) {
            assert_eq!(factory.build(&spec).protocol(), spec.protocol());
        }
    }

    #[tokio::test]
    async fn test_websocket_pipeline_rejects_wrong_path() {
        let config = Config::default();
        let factory = PipelineFactory::new(Sinks::logging());
        let spec = ProtocolSpec::from_config(&config, Protocol::WebSocket);

        let (mut client, server) = tokio::io::duplex(4096);
        let ctx = ConnectionContext {
            id: ConnectionId::next(),
            peer: "127.0.0.1:5000".parse().unwrap(),
            protocol: Protocol::WebSocket,
            signal: DrainSignal::new(),
            metrics: MetricsCollector::new(),
        };
        let task = tokio::spawn(factory.build(&spec).run(server, ctx));

        client
            .write_all(
                b"GET /chat HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\n\
                  Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                  Sec-WebSocket-Version: 13\r\n\r\n",
            )
            .await
            .unwrap();

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 404 Not Found"));

        let reason = task.await.unwrap();
        assert_eq!(reason.kind(), "handshake_rejected");
    }
}
