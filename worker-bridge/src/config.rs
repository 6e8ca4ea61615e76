//! Bridge configuration.

use crate::bridge::codec::DEFAULT_MAX_FRAME_LENGTH;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Label for the worker, attached to every log line of the bridge.
    pub name: String,
    /// Largest frame accepted or produced by the framed transport.
    pub max_frame_length: usize,
    /// Inbound messages buffered between the transport and the dispatch loop.
    pub inbound_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            inbound_capacity: 256,
        }
    }
}

impl BridgeConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_max_frame_length(mut self, n: usize) -> Self {
        self.max_frame_length = n;
        self
    }

    /// Values below 1 are clamped; a bounded channel needs room for one message.
    pub fn with_inbound_capacity(mut self, n: usize) -> Self {
        self.inbound_capacity = n.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.name, "worker");
        assert_eq!(config.max_frame_length, 16 * 1024 * 1024);
        assert_eq!(config.inbound_capacity, 256);
    }

    #[test]
    fn builder_overrides() {
        let config = BridgeConfig::new("endpoint-worker-3")
            .with_max_frame_length(1024)
            .with_inbound_capacity(0);

        assert_eq!(config.name, "endpoint-worker-3");
        assert_eq!(config.max_frame_length, 1024);
        assert_eq!(config.inbound_capacity, 1);
    }
}
