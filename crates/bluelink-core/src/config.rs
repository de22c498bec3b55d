//! Library configuration
//!
//! [`BleConfig`] groups the tunables of the resource manager and the two
//! orchestrators. All durations serialize with serde's default `Duration`
//! representation (`{ secs, nanos }`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::retry::RetryConfig;

/// ATT caps attribute values at 512 bytes
pub const MAX_ATTRIBUTE_LEN: usize = 512;

// ----------------------------------------------------------------------------
// Resource Manager Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Period of the background sweep
    pub sweep_interval: Duration,
    /// Inactive resources idle for longer than this are reclaimed
    pub ttl: Duration,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            ttl: Duration::from_secs(5 * 60),
        }
    }
}

// ----------------------------------------------------------------------------
// Central Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CentralConfig {
    /// Upper bound on waiting for the platform's discovery-complete signal
    pub discovery_timeout: Duration,
    /// Upper bound on a single read/write/subscribe round trip
    pub operation_timeout: Duration,
    /// Applied to temporary connect failures
    pub connect_retry: RetryConfig,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            discovery_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(5),
            connect_retry: RetryConfig::no_retry(),
        }
    }
}

// ----------------------------------------------------------------------------
// Peripheral Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeripheralConfig {
    /// Longest payload accepted by `notify_subscribers`
    pub max_notification_len: usize,
}

impl Default for PeripheralConfig {
    fn default() -> Self {
        Self {
            max_notification_len: MAX_ATTRIBUTE_LEN,
        }
    }
}

// ----------------------------------------------------------------------------
// Top-level Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BleConfig {
    pub resources: ResourceConfig,
    pub central: CentralConfig,
    pub peripheral: PeripheralConfig,
}

impl BleConfig {
    /// Short timers for tests
    pub fn testing() -> Self {
        Self {
            resources: ResourceConfig {
                sweep_interval: Duration::from_millis(100),
                ttl: Duration::from_secs(1),
            },
            central: CentralConfig {
                discovery_timeout: Duration::from_secs(1),
                operation_timeout: Duration::from_secs(1),
                connect_retry: RetryConfig::no_retry(),
            },
            peripheral: PeripheralConfig::default(),
        }
    }

    pub fn with_resources(mut self, resources: ResourceConfig) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_central(mut self, central: CentralConfig) -> Self {
        self.central = central;
        self
    }

    pub fn with_peripheral(mut self, peripheral: PeripheralConfig) -> Self {
        self.peripheral = peripheral;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let durations = [
            ("sweep interval", self.resources.sweep_interval),
            ("resource ttl", self.resources.ttl),
            ("discovery timeout", self.central.discovery_timeout),
            ("operation timeout", self.central.operation_timeout),
        ];
        for (parameter, value) in durations {
            if value.is_zero() {
                return Err(ValidationError::new(parameter, value, "must be positive"));
            }
        }

        self.central.connect_retry.validate()?;

        let len = self.peripheral.max_notification_len;
        if len == 0 || len > MAX_ATTRIBUTE_LEN {
            return Err(ValidationError::new(
                "max notification length",
                len,
                format!("must be between 1 and {}", MAX_ATTRIBUTE_LEN),
            ));
        }
        Ok(())
    }
}
