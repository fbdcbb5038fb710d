//! Configuration for the locking layer.

use crate::error::{MeshLockError, Result};
use crate::wire::DEFAULT_HEADER_TAG;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration for a [`LockingProtocol`](crate::LockingProtocol) instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockingConfig {
    /// Ask the transport not to bundle lock messages with other traffic.
    ///
    /// A latency hint only; correctness does not depend on it.
    #[serde(default = "default_bypass_bundling")]
    pub bypass_bundling: bool,

    /// Marker byte identifying this layer's messages on the wire.
    ///
    /// Every member of the group must use the same value. Stacks running
    /// several locking instances side by side give each its own id.
    /// Zero is reserved and rejected by [`validate`](Self::validate).
    #[serde(default = "default_protocol_id")]
    pub protocol_id: u8,
}

fn default_bypass_bundling() -> bool {
    true
}

fn default_protocol_id() -> u8 {
    DEFAULT_HEADER_TAG
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            bypass_bundling: true,
            protocol_id: DEFAULT_HEADER_TAG,
        }
    }
}

impl LockingConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MeshLockError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| MeshLockError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.protocol_id == 0 {
            return Err(MeshLockError::InvalidConfig {
                field: "protocol_id".to_string(),
                reason: "Protocol id must be non-zero".to_string(),
            });
        }

        Ok(())
    }

    /// Set the bundling bypass hint.
    pub fn with_bypass_bundling(mut self, bypass: bool) -> Self {
        self.bypass_bundling = bypass;
        self
    }

    /// Set the wire marker byte.
    pub fn with_protocol_id(mut self, protocol_id: u8) -> Self {
        self.protocol_id = protocol_id;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_bypasses_bundling() {
        let config = LockingConfig::default();
        assert!(config.bypass_bundling);
        assert_eq!(config.protocol_id, DEFAULT_HEADER_TAG);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = LockingConfig::default()
            .with_bypass_bundling(false)
            .with_protocol_id(0x21);
        assert!(!config.bypass_bundling);
        assert_eq!(config.protocol_id, 0x21);
    }

    #[test]
    fn test_parse_defaults_missing_fields() {
        let config: LockingConfig = serde_json::from_str("{}").unwrap();
        assert!(config.bypass_bundling);
        assert_eq!(config.protocol_id, DEFAULT_HEADER_TAG);
    }

    #[test]
    fn test_validate_rejects_zero_protocol_id() {
        let config: LockingConfig = serde_json::from_str(r#"{"protocol_id": 0}"#).unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            MeshLockError::InvalidConfig { ref field, .. } if field == "protocol_id"
        ));
    }
}
