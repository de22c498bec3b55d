//! Scan, connection and advertising parameters
//!
//! The validators enforce the timing bounds Bluetooth Core 5.x sets for
//! the link layer. Each rejected value is reported as a [`ValidationError`]
//! naming the parameter, the offending value and the rule it broke.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::advertisement::Advertisement;
use crate::error::ValidationError;
use crate::types::BleUuid;

// ----------------------------------------------------------------------------
// Bounds
// ----------------------------------------------------------------------------

/// Scan interval and window: 0x0004..=0x4000 units of 0.625 ms
pub const SCAN_TIMING_MIN: Duration = Duration::from_micros(2_500);
pub const SCAN_TIMING_MAX: Duration = Duration::from_micros(10_240_000);

/// Connection interval: 0x0006..=0x0C80 units of 1.25 ms
pub const CONNECTION_INTERVAL_MIN: Duration = Duration::from_micros(7_500);
pub const CONNECTION_INTERVAL_MAX: Duration = Duration::from_secs(4);

pub const SLAVE_LATENCY_MAX: u16 = 499;

/// Supervision timeout: 0x000A..=0x0C80 units of 10 ms
pub const SUPERVISION_TIMEOUT_MIN: Duration = Duration::from_millis(100);
pub const SUPERVISION_TIMEOUT_MAX: Duration = Duration::from_secs(32);

/// Number of connection events the link must survive before being declared lost
pub const SUPERVISION_EVENT_FACTOR: u32 = 6;

/// Advertising interval: 0x0020..=0x4000 units of 0.625 ms
pub const ADVERTISING_INTERVAL_MIN: Duration = Duration::from_millis(20);
pub const ADVERTISING_INTERVAL_MAX: Duration = Duration::from_micros(10_240_000);

pub const TX_POWER_MIN_DBM: i8 = -127;
pub const TX_POWER_MAX_DBM: i8 = 20;

fn check_range(
    parameter: &str,
    value: Duration,
    min: Duration,
    max: Duration,
) -> Result<(), ValidationError> {
    if value < min || value > max {
        return Err(ValidationError::new(
            parameter,
            value,
            format!("must be between {:?} and {:?}", min, max),
        ));
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Scan Parameters
// ----------------------------------------------------------------------------

/// Which advertisements a scan reports
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanFilter {
    /// Report only advertisements listing at least one of these services
    pub service_uuids: Vec<BleUuid>,
    /// Report only advertisements whose name starts with this prefix
    pub name_prefix: Option<String>,
    /// Drop advertisements weaker than this
    pub min_rssi: Option<i16>,
}

impl ScanFilter {
    pub fn matches(&self, adv: &Advertisement) -> bool {
        if !self.service_uuids.is_empty()
            && !adv
                .service_uuids
                .iter()
                .any(|uuid| self.service_uuids.contains(uuid))
        {
            return false;
        }
        if let Some(prefix) = &self.name_prefix {
            match &adv.local_name {
                Some(name) if name.starts_with(prefix.as_str()) => {}
                _ => return false,
            }
        }
        if let Some(min_rssi) = self.min_rssi {
            if adv.rssi < min_rssi {
                return false;
            }
        }
        true
    }
}

/// Parameters for a Central scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanParams {
    pub interval: Duration,
    /// Listening time within each interval
    pub window: Duration,
    /// Scan duration; `None` scans until stopped or cancelled
    pub timeout: Option<Duration>,
    /// Request scan responses
    pub active: bool,
    /// Report every advertisement instead of once per address
    pub allow_duplicates: bool,
    pub filter: ScanFilter,
}

impl Default for ScanParams {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            window: Duration::from_millis(50),
            timeout: Some(Duration::from_secs(10)),
            active: true,
            allow_duplicates: false,
            filter: ScanFilter::default(),
        }
    }
}

impl ScanParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timing(mut self, interval: Duration, window: Duration) -> Self {
        self.interval = interval;
        self.window = window;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_filter(mut self, filter: ScanFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_duplicates(mut self, allow: bool) -> Self {
        self.allow_duplicates = allow;
        self
    }

    /// The window must fit inside the interval: a scan only listens within each
    /// interval slot
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_range("scan interval", self.interval, SCAN_TIMING_MIN, SCAN_TIMING_MAX)?;
        check_range("scan window", self.window, SCAN_TIMING_MIN, SCAN_TIMING_MAX)?;
        if self.window > self.interval {
            return Err(ValidationError::new(
                "scan window",
                self.window,
                format!("must not exceed the scan interval ({:?})", self.interval),
            ));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(ValidationError::new(
                "scan timeout",
                self.timeout,
                "must be positive; use None to scan until stopped",
            ));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Connection Parameters
// ----------------------------------------------------------------------------

/// Parameters requested when connecting to a peripheral
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub min_interval: Duration,
    pub max_interval: Duration,
    /// Connection events the peripheral may skip
    pub slave_latency: u16,
    pub supervision_timeout: Duration,
    /// How long to wait for the link to come up
    pub connect_timeout: Duration,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(30),
            max_interval: Duration::from_millis(50),
            slave_latency: 0,
            supervision_timeout: Duration::from_secs(4),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ConnectionParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interval(mut self, min: Duration, max: Duration) -> Self {
        self.min_interval = min;
        self.max_interval = max;
        self
    }

    pub fn with_slave_latency(mut self, latency: u16) -> Self {
        self.slave_latency = latency;
        self
    }

    pub fn with_supervision_timeout(mut self, timeout: Duration) -> Self {
        self.supervision_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Smallest supervision timeout that tolerates several missed connection events
    pub fn min_supervision_timeout(&self) -> Duration {
        self.max_interval * SUPERVISION_EVENT_FACTOR * (1 + u32::from(self.slave_latency))
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        check_range(
            "min interval",
            self.min_interval,
            CONNECTION_INTERVAL_MIN,
            CONNECTION_INTERVAL_MAX,
        )?;
        check_range(
            "max interval",
            self.max_interval,
            CONNECTION_INTERVAL_MIN,
            CONNECTION_INTERVAL_MAX,
        )?;
        if self.min_interval > self.max_interval {
            return Err(ValidationError::new(
                "min interval",
                self.min_interval,
                format!("must not exceed max interval ({:?})", self.max_interval),
            ));
        }
        if self.slave_latency > SLAVE_LATENCY_MAX {
            return Err(ValidationError::new(
                "slave latency",
                self.slave_latency,
                format!("must be at most {}", SLAVE_LATENCY_MAX),
            ));
        }
        check_range(
            "supervision timeout",
            self.supervision_timeout,
            SUPERVISION_TIMEOUT_MIN,
            SUPERVISION_TIMEOUT_MAX,
        )?;
        let required = self.min_supervision_timeout();
        if self.supervision_timeout < required {
            return Err(ValidationError::new(
                "supervision timeout",
                self.supervision_timeout,
                format!(
                    "must be at least {} x max interval x (1 + slave latency) = {:?}",
                    SUPERVISION_EVENT_FACTOR, required
                ),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(ValidationError::new(
                "connect timeout",
                self.connect_timeout,
                "must be positive",
            ));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Advertising Parameters
// ----------------------------------------------------------------------------

/// Parameters for a Peripheral advertisement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvertisingParams {
    pub min_interval: Duration,
    pub max_interval: Duration,
    /// Requested transmit power in dBm
    pub tx_power: Option<i8>,
    pub connectable: bool,
    /// Advertising duration; `None` advertises until stopped or cancelled
    pub timeout: Option<Duration>,
}

impl Default for AdvertisingParams {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(150),
            tx_power: None,
            connectable: true,
            timeout: None,
        }
    }
}

impl AdvertisingParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interval(mut self, min: Duration, max: Duration) -> Self {
        self.min_interval = min;
        self.max_interval = max;
        self
    }

    pub fn with_tx_power(mut self, dbm: i8) -> Self {
        self.tx_power = Some(dbm);
        self
    }

    pub fn with_connectable(mut self, connectable: bool) -> Self {
        self.connectable = connectable;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        check_range(
            "advertising min interval",
            self.min_interval,
            ADVERTISING_INTERVAL_MIN,
            ADVERTISING_INTERVAL_MAX,
        )?;
        check_range(
            "advertising max interval",
            self.max_interval,
            ADVERTISING_INTERVAL_MIN,
            ADVERTISING_INTERVAL_MAX,
        )?;
        if self.min_interval > self.max_interval {
            return Err(ValidationError::new(
                "advertising min interval",
                self.min_interval,
                format!("must not exceed max interval ({:?})", self.max_interval),
            ));
        }
        if let Some(dbm) = self.tx_power {
            if !(TX_POWER_MIN_DBM..=TX_POWER_MAX_DBM).contains(&dbm) {
                return Err(ValidationError::new(
                    "tx power",
                    dbm,
                    format!("must be between {} and {} dBm", TX_POWER_MIN_DBM, TX_POWER_MAX_DBM),
                ));
            }
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(ValidationError::new(
                "advertising timeout",
                self.timeout,
                "must be positive; use None to advertise until stopped",
            ));
        }
        Ok(())
    }
}
