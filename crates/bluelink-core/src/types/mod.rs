//! Identifier types: device addresses and Bluetooth UUIDs

mod address;
mod ble_uuid;

pub use address::{Address, AddressKind};
pub use ble_uuid::{assigned, normalize_uuid, BleUuid, BASE_UUID_SUFFIX, BLUETOOTH_BASE_UUID};
