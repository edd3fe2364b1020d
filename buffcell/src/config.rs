//! Registry configuration
//!
//! Read from JSON, every field optional:
//!
//! ```
//! use buffcell::RegistryConfig;
//!
//! let config = RegistryConfig::from_json_str(r#"{"channel_capacity": 64}"#).unwrap();
//! assert_eq!(config.channel_capacity, 64);
//! ```

use serde::Deserialize;

use crate::error::Result;

/// Capacity used for busy/idle broadcast channels unless configured otherwise
pub const DEFAULT_CHANNEL_CAPACITY: usize = 16;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct RegistryConfig {
    /// Capacity of each cell's broadcast channel. Zero is treated as one.
    ///
    /// Only subscribers are affected: a subscriber that falls more than
    /// `channel_capacity` transitions behind observes `RecvError::Lagged`.
    pub channel_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl RegistryConfig {
    /// Parse the config from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns `BuffError::Config` if the JSON is malformed or has
    /// fields of the wrong type.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Parse the config from a reader yielding JSON.
    ///
    /// # Errors
    ///
    /// Returns `BuffError::Config` on I/O failure or malformed JSON.
    pub fn from_json_reader(reader: impl std::io::Read) -> Result<Self> {
        Ok(serde_json::from_reader(reader)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BuffError;

    #[test]
    fn test_default_capacity() {
        let config = RegistryConfig::default();
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
    }

    #[test]
    fn test_empty_object_uses_defaults() {
        let config = RegistryConfig::from_json_str("{}").unwrap();
        assert_eq!(config, RegistryConfig::default());
    }

    #[test]
    fn test_from_reader() {
        let json = br#"{"channel_capacity": 3}"#;
        let config = RegistryConfig::from_json_reader(&json[..]).unwrap();
        assert_eq!(config.channel_capacity, 3);
    }

    #[test]
    fn test_malformed_json() {
        let result = RegistryConfig::from_json_str(r#"{"channel_capacity": "many"}"#);
        assert!(matches!(result, Err(BuffError::Config(_))));
    }
}
