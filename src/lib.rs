//! netgate - a multi-protocol TCP server gateway
//!
//! One process serves three protocols, each on its own port:
//! - MQTT fixed-header framing
//! - WebSocket upgrade and RFC 6455 text frames
//! - Newline-delimited UTF-8 text over plain TCP
//!
//! Decoded messages are handed to a per-protocol [`pipeline::MessageSink`].
//! All listeners share one acceptor pool and one worker pool, start
//! atomically, and drain together on shutdown.

pub mod codec;
pub mod config;
pub mod frontend;
pub mod metrics;
pub mod pipeline;
pub mod pools;
pub mod server;
pub mod util;

pub use config::Config;
pub use server::{Ready, Server, ServerState, StartupError, Stopped};
