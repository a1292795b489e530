//! Configuration file support for KTN CLI tools

use ktn_io::FailureConfig;
use ktn_protocol::{ProtocolConfig, SeqNumber};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Protocol timing, in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolSection {
    /// Retransmission timer period
    pub retransmit_interval_ms: u64,
    /// Overall budget for one wait-for-reply step
    pub step_timeout_ms: u64,
    /// Per-attempt receive timeout
    pub poll_interval_ms: u64,
    /// FIN_WAIT_2 waits this many step timeouts
    pub close_wait_multiplier: u32,
    pub client_initial_seq: u32,
    pub server_initial_seq: u32,
    /// Bound on a blocking receive; absent means wait forever
    pub receive_timeout_ms: Option<u64>,
}

impl Default for ProtocolSection {
    fn default() -> Self {
        ProtocolConfig::default().into()
    }
}

impl From<ProtocolConfig> for ProtocolSection {
    fn from(config: ProtocolConfig) -> Self {
        ProtocolSection {
            retransmit_interval_ms: config.retransmit_interval.as_millis() as u64,
            step_timeout_ms: config.step_timeout.as_millis() as u64,
            poll_interval_ms: config.poll_interval.as_millis() as u64,
            close_wait_multiplier: config.close_wait_multiplier,
            client_initial_seq: config.client_initial_seq.as_raw(),
            server_initial_seq: config.server_initial_seq.as_raw(),
            receive_timeout_ms: config.receive_timeout.map(|t| t.as_millis() as u64),
        }
    }
}

impl ProtocolSection {
    pub fn to_protocol_config(&self) -> ProtocolConfig {
        ProtocolConfig {
            retransmit_interval: Duration::from_millis(self.retransmit_interval_ms),
            step_timeout: Duration::from_millis(self.step_timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            close_wait_multiplier: self.close_wait_multiplier,
            client_initial_seq: SeqNumber::new(self.client_initial_seq),
            server_initial_seq: SeqNumber::new(self.server_initial_seq),
            receive_timeout: self.receive_timeout_ms.map(Duration::from_millis),
        }
    }
}

/// Simulated network failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    pub loss_probability: f64,
    pub delay_probability: f64,
    pub max_delay_ms: u64,
    pub ghost_probability: f64,
    pub header_error_probability: f64,
    pub payload_error_probability: f64,
    pub payload_errors_only: bool,
    pub seed: Option<u64>,
}

impl Default for NetworkSection {
    fn default() -> Self {
        let failures = FailureConfig::default();
        NetworkSection {
            loss_probability: failures.loss_probability,
            delay_probability: failures.delay_probability,
            max_delay_ms: failures.max_delay.as_millis() as u64,
            ghost_probability: failures.ghost_probability,
            header_error_probability: failures.header_error_probability,
            payload_error_probability: failures.payload_error_probability,
            payload_errors_only: failures.payload_errors_only,
            seed: failures.seed,
        }
    }
}

impl NetworkSection {
    pub fn to_failure_config(&self) -> FailureConfig {
        FailureConfig {
            loss_probability: self.loss_probability,
            delay_probability: self.delay_probability,
            max_delay: Duration::from_millis(self.max_delay_ms),
            ghost_probability: self.ghost_probability,
            header_error_probability: self.header_error_probability,
            payload_error_probability: self.payload_error_probability,
            payload_errors_only: self.payload_errors_only,
            seed: self.seed,
        }
    }
}

/// Combined configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub protocol: ProtocolSection,
    pub network: NetworkSection,
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Example configuration: default timing over a mildly lossy network
    pub fn example() -> Self {
        Config {
            protocol: ProtocolSection::default(),
            network: NetworkSection {
                loss_probability: 0.1,
                delay_probability: 0.05,
                ghost_probability: 0.05,
                header_error_probability: 0.02,
                payload_error_probability: 0.02,
                seed: Some(42),
                ..NetworkSection::default()
            },
        }
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        let network = &self.network;
        let probabilities = [
            ("loss_probability", network.loss_probability),
            ("delay_probability", network.delay_probability),
            ("ghost_probability", network.ghost_probability),
            ("header_error_probability", network.header_error_probability),
            ("payload_error_probability", network.payload_error_probability),
        ];
        for (name, value) in probabilities {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{} must be between 0 and 1, got {}",
                    name, value
                )));
            }
        }

        let protocol = &self.protocol;
        if protocol.retransmit_interval_ms == 0 || protocol.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "retransmit and poll intervals must be non-zero".to_string(),
            ));
        }
        if protocol.step_timeout_ms < protocol.retransmit_interval_ms {
            return Err(ConfigError::Invalid(
                "step timeout must cover at least one retransmission".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol() {
        let config = Config::default();
        assert_eq!(config.protocol.to_protocol_config(), ProtocolConfig::default());
        assert!(config.network.to_failure_config().is_reliable());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = Config::example();
        let toml = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_file() {
        let parsed: Config = toml::from_str(
            "[protocol]\nstep_timeout_ms = 2000\n\n[network]\nloss_probability = 0.25\n",
        )
        .unwrap();
        assert_eq!(parsed.protocol.step_timeout_ms, 2000);
        assert_eq!(parsed.protocol.retransmit_interval_ms, 100);
        assert_eq!(parsed.network.to_failure_config().loss_probability, 0.25);
    }

    #[test]
    fn test_validate_rejects_bad_probability() {
        let mut config = Config::default();
        config.network.loss_probability = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
