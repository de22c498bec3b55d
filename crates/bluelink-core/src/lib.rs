//! Bluelink Core
//!
//! Platform-agnostic Bluetooth Low Energy orchestration. A single API surface
//! (Manager → Adapter → Central/Peripheral → Device/Service/Characteristic)
//! sits on top of small driver contracts that each native stack implements.
//! The core owns connection lifecycle, GATT discovery, scan and advertising
//! sessions, resource cleanup, structured errors and retry.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod advertisement;
pub mod central;
pub mod config;
pub mod driver;
pub mod error;
pub mod gatt;
pub mod manager;
pub mod params;
pub mod peripheral;
pub mod resource;
pub mod retry;
pub mod sim;
pub mod types;

mod session;
mod sync;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use advertisement::{parse_advertising_data, Advertisement, AdvertisingData};
pub use central::Central;
pub use config::{BleConfig, CentralConfig, PeripheralConfig, ResourceConfig};
pub use driver::{AdapterInfo, CentralDriver, PeripheralDriver, Platform};
pub use error::{
    combine_errors, BleError, BleResult, ErrorCategory, ErrorCode, MultiError, ValidationError,
};
pub use gatt::{Characteristic, CharacteristicProperties, Descriptor, Device, Service};
pub use manager::{Adapter, Manager};
pub use params::{AdvertisingParams, ConnectionParams, ScanFilter, ScanParams};
pub use peripheral::{Peripheral, PeripheralCharacteristic, PeripheralService};
pub use resource::{Resource, ResourceKind, ResourceManager};
pub use retry::{retry_until_cancelled, retry_with_backoff, RetryConfig};
pub use types::{Address, AddressKind, BleUuid};

pub use tokio_util::sync::CancellationToken;
