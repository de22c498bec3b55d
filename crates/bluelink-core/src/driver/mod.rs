//! Platform driver contracts
//!
//! A platform (Core Bluetooth, BlueZ, WinRT, a vendor soft-stack, or the
//! in-memory [`crate::sim`] radio) implements [`Platform`], [`CentralDriver`]
//! and [`PeripheralDriver`]. The orchestrators in [`crate::central`] and
//! [`crate::peripheral`] only ever talk to these traits.
//!
//! ## Callback marshaling
//!
//! Native callbacks (scan results, notifications, incoming connections) are
//! delivered by pushing onto unbounded channels handed to the driver. The
//! driver never calls back into orchestrator code directly, so a native
//! callback can never re-enter an orchestrator while it holds a lock. A
//! driver must ignore send errors: a closed channel means the consumer has
//! gone away (a scan ended, a subscription was cancelled) and the event is to
//! be dropped.
//!
//! ## Completion signals
//!
//! Every async method resolves only when the native operation has actually
//! completed. In particular [`CentralDriver::discover_services`] must not
//! resolve until the platform reports discovery complete.

mod registry;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::error::{BleError, BleResult};
use crate::gatt::CharacteristicProperties;
use crate::params::{AdvertisingParams, ConnectionParams, ScanParams};
use crate::types::{Address, BleUuid};

pub use registry::HandleRegistry;

// ----------------------------------------------------------------------------
// Handles and Reports
// ----------------------------------------------------------------------------

/// Opaque driver-issued handle for a connected device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u64);

/// Opaque driver-issued handle for a characteristic or descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttributeHandle(pub u64);

/// One advertisement as observed by the native stack
#[derive(Debug, Clone, PartialEq)]
pub struct ScanReport {
    pub address: Address,
    pub rssi: i16,
    /// Name the platform resolved for the device, if any
    pub name: Option<String>,
    /// Raw advertising (and scan response) payload
    pub payload: Vec<u8>,
    pub connectable: bool,
}

pub type ScanSink = mpsc::UnboundedSender<ScanReport>;

/// Receives the value of every notification/indication for one subscription
pub type NotificationSink = mpsc::UnboundedSender<Vec<u8>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

/// Result of a successful native connect
#[derive(Debug, Clone)]
pub struct ConnectedDevice {
    pub handle: DeviceHandle,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorInfo {
    pub handle: AttributeHandle,
    pub uuid: BleUuid,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CharacteristicInfo {
    pub handle: AttributeHandle,
    pub uuid: BleUuid,
    pub properties: CharacteristicProperties,
    pub descriptors: Vec<DescriptorInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceInfo {
    pub uuid: BleUuid,
    pub primary: bool,
    pub characteristics: Vec<CharacteristicInfo>,
}

// ----------------------------------------------------------------------------
// Central Driver
// ----------------------------------------------------------------------------

/// Client-role native operations
#[async_trait]
pub trait CentralDriver: Send + Sync {
    async fn enable(&self) -> BleResult<()>;

    async fn disable(&self) -> BleResult<()>;

    async fn is_enabled(&self) -> bool;

    /// Start scanning; every observed advertisement is pushed to `sink`
    async fn start_scan(&self, params: &ScanParams, sink: ScanSink) -> BleResult<()>;

    /// Stop scanning. Must succeed when no scan is running.
    async fn stop_scan(&self) -> BleResult<()>;

    async fn connect(
        &self,
        address: &Address,
        params: &ConnectionParams,
    ) -> BleResult<ConnectedDevice>;

    async fn disconnect(&self, device: DeviceHandle) -> BleResult<()>;

    /// Live link state as reported by the native stack
    async fn is_connected(&self, device: DeviceHandle) -> bool;

    /// Enumerate services (all when `filter` is empty). Resolves on the
    /// platform's discovery-complete signal.
    async fn discover_services(
        &self,
        device: DeviceHandle,
        filter: &[BleUuid],
    ) -> BleResult<Vec<ServiceInfo>>;

    async fn read(&self, device: DeviceHandle, characteristic: AttributeHandle)
        -> BleResult<Vec<u8>>;

    async fn write(
        &self,
        device: DeviceHandle,
        characteristic: AttributeHandle,
        value: &[u8],
        write_type: WriteType,
    ) -> BleResult<()>;

    async fn subscribe(
        &self,
        device: DeviceHandle,
        characteristic: AttributeHandle,
        sink: NotificationSink,
    ) -> BleResult<()>;

    async fn unsubscribe(
        &self,
        device: DeviceHandle,
        characteristic: AttributeHandle,
    ) -> BleResult<()>;

    async fn read_descriptor(
        &self,
        _device: DeviceHandle,
        _descriptor: AttributeHandle,
    ) -> BleResult<Vec<u8>> {
        Err(BleError::not_supported("descriptor reads are not supported by this platform"))
    }

    async fn write_descriptor(
        &self,
        _device: DeviceHandle,
        _descriptor: AttributeHandle,
        _value: &[u8],
    ) -> BleResult<()> {
        Err(BleError::not_supported("descriptor writes are not supported by this platform"))
    }

    async fn read_rssi(&self, _device: DeviceHandle) -> BleResult<i16> {
        Err(BleError::not_supported("RSSI reads are not supported by this platform"))
    }

    /// Negotiated ATT MTU
    async fn mtu(&self, _device: DeviceHandle) -> BleResult<u16> {
        Ok(23)
    }
}

// ----------------------------------------------------------------------------
// Peripheral Driver
// ----------------------------------------------------------------------------

/// Native server-side events, delivered through a [`PeripheralEventSink`]
#[derive(Debug)]
pub enum PeripheralEvent {
    CentralConnected(Address),
    CentralDisconnected(Address),
    /// A remote read; the answer goes back through `responder`
    ReadRequest {
        central: Address,
        service: BleUuid,
        characteristic: BleUuid,
        responder: oneshot::Sender<BleResult<Vec<u8>>>,
    },
    /// A remote write; `responder` is present for writes with response
    WriteRequest {
        central: Address,
        service: BleUuid,
        characteristic: BleUuid,
        value: Vec<u8>,
        responder: Option<oneshot::Sender<BleResult<()>>>,
    },
    Subscribed {
        central: Address,
        service: BleUuid,
        characteristic: BleUuid,
    },
    Unsubscribed {
        central: Address,
        service: BleUuid,
        characteristic: BleUuid,
    },
}

pub type PeripheralEventSink = mpsc::UnboundedSender<PeripheralEvent>;

/// A characteristic as published to the native GATT server
#[derive(Debug, Clone, PartialEq)]
pub struct CharacteristicDefinition {
    pub uuid: BleUuid,
    pub properties: CharacteristicProperties,
    pub initial_value: Vec<u8>,
}

/// Server-role native operations
#[async_trait]
pub trait PeripheralDriver: Send + Sync {
    /// Power up the server role; incoming events are pushed to `events`
    async fn enable(&self, events: PeripheralEventSink) -> BleResult<()>;

    async fn disable(&self) -> BleResult<()>;

    async fn is_enabled(&self) -> bool;

    async fn add_service(&self, uuid: BleUuid, primary: bool) -> BleResult<()>;

    async fn add_characteristic(
        &self,
        service: BleUuid,
        definition: &CharacteristicDefinition,
    ) -> BleResult<()>;

    async fn remove_service(&self, uuid: BleUuid) -> BleResult<()>;

    async fn start_advertising(&self, params: &AdvertisingParams, payload: &[u8])
        -> BleResult<()>;

    /// Stop advertising. Must succeed when not advertising.
    async fn stop_advertising(&self) -> BleResult<()>;

    async fn send_notification(
        &self,
        service: BleUuid,
        characteristic: BleUuid,
        value: &[u8],
        indicate: bool,
    ) -> BleResult<()>;
}

// ----------------------------------------------------------------------------
// Platform
// ----------------------------------------------------------------------------

/// A radio the platform can drive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    pub id: String,
    pub name: String,
    pub address: Option<Address>,
}

/// Entry point of one platform implementation, selected once at startup
#[async_trait]
pub trait Platform: Send + Sync {
    fn name(&self) -> &str;

    async fn adapters(&self) -> BleResult<Vec<AdapterInfo>>;

    async fn central_driver(&self, adapter: &AdapterInfo) -> BleResult<Arc<dyn CentralDriver>>;

    async fn peripheral_driver(
        &self,
        adapter: &AdapterInfo,
    ) -> BleResult<Arc<dyn PeripheralDriver>>;
}
