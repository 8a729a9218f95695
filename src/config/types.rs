//! Configuration data types.

use crate::codec::{
    DEFAULT_MAX_FRAME_PAYLOAD, DEFAULT_MAX_LINE_LENGTH, DEFAULT_PATH, DEFAULT_WRITE_CHUNK_SIZE,
    MAX_REMAINING_LENGTH,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Global settings
    #[serde(default)]
    pub global: GlobalConfig,

    /// Interface all three listeners bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// Listen backlog for every listener
    #[serde(default = "default_backlog")]
    pub backlog: u32,

    /// Enable SO_KEEPALIVE on accepted sockets
    #[serde(default = "default_true")]
    pub keepalive: bool,

    /// How long `stop` waits for connections before force-closing them
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Acceptor and worker pool sizing
    #[serde(default)]
    pub pools: PoolConfig,

    /// MQTT listener
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// WebSocket listener
    #[serde(default)]
    pub websocket: WebSocketConfig,

    /// Line-delimited TCP listener
    #[serde(default)]
    pub tcp: TcpConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            global: GlobalConfig::default(),
            bind_address: default_bind_address(),
            backlog: default_backlog(),
            keepalive: true,
            shutdown_timeout: default_shutdown_timeout(),
            pools: PoolConfig::default(),
            mqtt: MqttConfig::default(),
            websocket: WebSocketConfig::default(),
            tcp: TcpConfig::default(),
        }
    }
}

impl Config {
    /// Socket address a listener for `port` binds to.
    pub fn listen_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.bind_address, port)
    }
}

/// Global configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Json,
            metrics: MetricsConfig::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Metrics endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether metrics endpoint is enabled
    #[serde(default)]
    pub enabled: bool,

    /// Address to bind metrics server
    #[serde(default = "default_metrics_address")]
    pub address: SocketAddr,

    /// Path for metrics endpoint
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
            path: default_metrics_path(),
        }
    }
}

/// Execution pool sizing. Unset values fall back to hardware-derived defaults.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Threads running accept loops
    #[serde(default)]
    pub acceptor_threads: Option<usize>,

    /// Threads running connection I/O and dispatch
    #[serde(default)]
    pub worker_threads: Option<usize>,
}

impl PoolConfig {
    pub fn acceptor_threads(&self) -> usize {
        self.acceptor_threads.unwrap_or(1)
    }

    /// Defaults to twice the available hardware parallelism.
    pub fn worker_threads(&self) -> usize {
        self.worker_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get() * 2)
                .unwrap_or(2)
        })
    }
}

/// MQTT listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Largest remaining length accepted in a fixed header
    #[serde(default = "default_max_remaining_length")]
    pub max_remaining_length: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            port: default_mqtt_port(),
            max_remaining_length: default_max_remaining_length(),
        }
    }
}

/// WebSocket listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebSocketConfig {
    #[serde(default = "default_websocket_port")]
    pub port: u16,

    /// Request path that accepts upgrades
    #[serde(default = "default_websocket_path")]
    pub path: String,

    /// Largest frame or reassembled message payload
    #[serde(default = "default_max_frame_payload")]
    pub max_frame_payload: usize,

    /// Outbound messages above this size are sent as continuation frames
    #[serde(default = "default_write_chunk_size")]
    pub write_chunk_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            port: default_websocket_port(),
            path: default_websocket_path(),
            max_frame_payload: default_max_frame_payload(),
            write_chunk_size: default_write_chunk_size(),
        }
    }
}

/// Line-delimited TCP listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TcpConfig {
    #[serde(default = "default_tcp_port")]
    pub port: u16,

    /// Longest accepted line, excluding the delimiter
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            port: default_tcp_port(),
            max_line_length: default_max_line_length(),
        }
    }
}

/// Wire protocol served by a listener.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Mqtt,
    #[serde(rename = "websocket")]
    WebSocket,
    Line,
}

impl Protocol {
    /// Fixed startup order.
    pub const ALL: [Protocol; 3] = [Protocol::Mqtt, Protocol::WebSocket, Protocol::Line];

    pub fn name(self) -> &'static str {
        match self {
            Protocol::Mqtt => "mqtt",
            Protocol::WebSocket => "websocket",
            Protocol::Line => "line",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_true() -> bool {
    true
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_backlog() -> u32 {
    128
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_metrics_address() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9090)
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_max_remaining_length() -> usize {
    MAX_REMAINING_LENGTH
}

fn default_websocket_port() -> u16 {
    8080
}

fn default_websocket_path() -> String {
    DEFAULT_PATH.to_string()
}

fn default_max_frame_payload() -> usize {
    DEFAULT_MAX_FRAME_PAYLOAD
}

fn default_write_chunk_size() -> usize {
    DEFAULT_WRITE_CHUNK_SIZE
}

fn default_tcp_port() -> u16 {
    9000
}

fn default_max_line_length() -> usize {
    DEFAULT_MAX_LINE_LENGTH
}

/// Custom serde module for humantime durations.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
