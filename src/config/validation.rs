//! Configuration validation.

use crate::codec::MAX_REMAINING_LENGTH;
use crate::config::{Config, Protocol};
use std::collections::HashMap;

/// Validate the configuration.
///
/// Checks for:
/// - Distinct listener ports (port 0 asks the OS and is exempt)
/// - A non-zero backlog
/// - A WebSocket path starting with `/`
/// - Non-zero framing limits within protocol bounds
/// - Pool sizes of at least one thread
/// - A known log level
///
/// # Returns
///
/// `Ok(())` if valid, or an error message describing the problem.
pub fn validate_config(config: &Config) -> Result<(), String> {
    let mut errors = Vec::new();

    // Check for port collisions between listeners
    let mut ports: HashMap<u16, Protocol> = HashMap::new();
    for (protocol, port) in [
        (Protocol::Mqtt, config.mqtt.port),
        (Protocol::WebSocket, config.websocket.port),
        (Protocol::Line, config.tcp.port),
    ] {
        if port == 0 {
            continue;
        }
        if let Some(previous) = ports.insert(port, protocol) {
            errors.push(format!(
                "duplicate listen port: {} (used by {} and {})",
                port, previous, protocol
            ));
        }
    }

    if config.backlog == 0 {
        errors.push("backlog must be at least 1".to_string());
    }

    // MQTT limits
    if config.mqtt.max_remaining_length == 0 {
        errors.push("mqtt.max_remaining_length must be at least 1".to_string());
    }
    if config.mqtt.max_remaining_length > MAX_REMAINING_LENGTH {
        errors.push(format!(
            "mqtt.max_remaining_length {} exceeds protocol maximum {}",
            config.mqtt.max_remaining_length, MAX_REMAINING_LENGTH
        ));
    }

    // WebSocket settings
    if !config.websocket.path.starts_with('/') {
        errors.push(format!(
            "websocket.path '{}' must start with '/'",
            config.websocket.path
        ));
    }
    if config.websocket.max_frame_payload == 0 {
        errors.push("websocket.max_frame_payload must be at least 1".to_string());
    }
    if config.websocket.write_chunk_size == 0 {
        errors.push("websocket.write_chunk_size must be at least 1".to_string());
    }

    // Line protocol
    if config.tcp.max_line_length == 0 {
        errors.push("tcp.max_line_length must be at least 1".to_string());
    }

    // Pool sizes
    if config.pools.acceptor_threads == Some(0) {
        errors.push("pools.acceptor_threads must be at least 1".to_string());
    }
    if config.pools.worker_threads == Some(0) {
        errors.push("pools.worker_threads must be at least 1".to_string());
    }

    // Validate log level
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.global.log_level.to_lowercase().as_str()) {
        errors.push(format!(
            "invalid log level '{}', must be one of: {}",
            config.global.log_level,
            valid_levels.join(", ")
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}
