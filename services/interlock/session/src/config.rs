//! Per-session configuration.

use interlock_buffer::DEFAULT_BUFFER_CAPACITY;
use interlock_wakeup::WakeupKind;
use serde::{Deserialize, Serialize};

/// Configuration for a TLS session
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Wakeup channel implementation for socket sessions
    pub wakeup: WakeupKind,
    /// Capacity of each engine-mode ciphertext buffer in bytes
    pub engine_buffer_capacity: usize,
    /// Plaintext the engine may queue ahead of the transport, in bytes
    pub max_pending_plaintext: usize,
    /// ALPN protocols offered or accepted, most preferred first
    pub alpn_protocols: Vec<String>,
    /// Read timeout used by the `std::io::Read` adapter (0 = wait forever)
    pub read_timeout_ms: u64,
    /// Write timeout used by the `std::io::Write` adapter (0 = wait forever)
    pub write_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            wakeup: WakeupKind::Auto,
            engine_buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            max_pending_plaintext: 64 * 1024,
            alpn_protocols: Vec::new(),
            read_timeout_ms: 0,
            write_timeout_ms: 0,
        }
    }
}

impl SessionConfig {
    /// ALPN protocols in wire form
    pub fn alpn_wire(&self) -> Vec<Vec<u8>> {
        self.alpn_protocols
            .iter()
            .map(|p| p.as_bytes().to_vec())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.wakeup, WakeupKind::Auto);
        assert_eq!(config.engine_buffer_capacity, DEFAULT_BUFFER_CAPACITY);
        assert_eq!(config.read_timeout_ms, 0);
        assert!(config.alpn_wire().is_empty());
    }

    #[test]
    fn test_alpn_wire_form() {
        let config = SessionConfig {
            alpn_protocols: vec!["h2".to_string(), "http/1.1".to_string()],
            ..Default::default()
        };
        assert_eq!(config.alpn_wire(), vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }
}
