//! Tunables of a protocol instance.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Durations are configured in milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProtocolConfig {
    /// How long to wait for the counterparty to answer a protocol message.
    #[serde(with = "millis")]
    pub sync_timeout: Duration,
    /// Re-sends of a protocol message within one attempt.
    pub message_retries: u32,
    /// Retries of a protocol method that timed out, on top of the first
    /// attempt.
    pub max_protocol_retries: u32,
    #[serde(with = "millis")]
    pub retry_delay: Duration,
    /// Reconcile deposits of every stored channel on connect.
    pub sync_on_startup: bool,
    /// Timeout of flows waiting on a transfer resolution.
    #[serde(with = "millis")]
    pub resolve_timeout: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            sync_timeout: Duration::from_secs(30),
            message_retries: 0,
            max_protocol_retries: 5,
            retry_delay: Duration::from_secs(1),
            sync_on_startup: true,
            resolve_timeout: Duration::from_secs(5 * 60),
        }
    }
}

impl ProtocolConfig {
    /// Parse a JSON config, missing fields take their default.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "syncTimeout",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ProtocolConfig::default();
        assert_eq!(config.sync_timeout, Duration::from_secs(30));
        assert_eq!(config.max_protocol_retries, 5);
        assert!(config.validate().is_ok());
        assert_eq!(ProtocolConfig::from_json("{}").unwrap(), config);
    }

    #[test]
    fn partial_json() {
        let config =
            ProtocolConfig::from_json(r#"{ "syncTimeout": 1500, "syncOnStartup": false }"#).unwrap();
        assert_eq!(config.sync_timeout, Duration::from_millis(1500));
        assert!(!config.sync_on_startup);
        assert_eq!(config.retry_delay, Duration::from_secs(1));
    }

    #[test]
    fn rejects_invalid() {
        assert!(matches!(
            ProtocolConfig::from_json(r#"{ "syncTimeout": 0 }"#),
            Err(ConfigError::InvalidValue { field: "syncTimeout", .. })
        ));
        assert!(matches!(
            ProtocolConfig::from_json(r#"{ "syncTimeout": "soon" }"#),
            Err(ConfigError::Parse(_))
        ));
    }
}
