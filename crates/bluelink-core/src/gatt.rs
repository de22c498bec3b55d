//! GATT client model
//!
//! A connected [`Device`] owns its discovered [`Service`]s, which own their
//! [`Characteristic`]s, which own their [`Descriptor`]s. Links back up the
//! tree (characteristic to service to device) are `Weak` and used only for
//! navigation, so closing a device releases the whole subtree in one step.
//!
//! Every operation checks the characteristic's property bitmask before it
//! reaches the driver and fails with [`ErrorCode::OPERATION_NOT_SUPPORTED`]
//! when the capability is missing.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::central::WeakCentral;
use crate::config::CentralConfig;
use crate::driver::{
    AttributeHandle, CentralDriver, CharacteristicInfo, ConnectedDevice, DeviceHandle,
    ServiceInfo, WriteType,
};
use crate::error::{BleError, BleResult, ErrorCode, ValidationError};
use crate::sync::{lock, read, write};
use crate::types::{Address, BleUuid};

// ----------------------------------------------------------------------------
// Characteristic Properties
// ----------------------------------------------------------------------------

bitflags! {
    /// Characteristic property bits, in ATT order
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct CharacteristicProperties: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

/// Reject property sets a server must not publish
pub fn validate_properties(properties: CharacteristicProperties) -> Result<(), ValidationError> {
    if properties.is_empty() {
        return Err(ValidationError::new(
            "properties",
            properties,
            "at least one property is required",
        ));
    }
    if properties.contains(CharacteristicProperties::BROADCAST | CharacteristicProperties::WRITE) {
        return Err(ValidationError::new(
            "properties",
            properties,
            "broadcast and write are mutually exclusive",
        ));
    }
    Ok(())
}

/// Notify and indicate together are legal but discouraged
pub fn is_discouraged(properties: CharacteristicProperties) -> bool {
    properties.contains(CharacteristicProperties::NOTIFY | CharacteristicProperties::INDICATE)
}

// ----------------------------------------------------------------------------
// Device
// ----------------------------------------------------------------------------

struct DeviceInner {
    address: Address,
    name: Option<String>,
    handle: DeviceHandle,
    driver: Arc<dyn CentralDriver>,
    central: WeakCentral,
    discovery_timeout: Duration,
    operation_timeout: Duration,
    open: AtomicBool,
    rssi: Mutex<Option<i16>>,
    last_activity: Mutex<Instant>,
    services: RwLock<Vec<Service>>,
    /// Parent of every subscription's forwarding task
    subscriptions: CancellationToken,
}

impl DeviceInner {
    fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    fn ensure_open(&self) -> BleResult<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BleError::not_connected(self.address))
        }
    }

    /// Run a driver round trip under the operation timeout
    async fn call<T>(
        &self,
        operation: &str,
        target: BleUuid,
        fallback: ErrorCode,
        request: impl Future<Output = BleResult<T>>,
    ) -> BleResult<T> {
        match tokio::time::timeout(self.operation_timeout, request).await {
            Ok(Ok(value)) => {
                self.touch();
                Ok(value)
            }
            Ok(Err(err)) => Err(BleError::from_driver(err, fallback, operation, target)),
            Err(_) => Err(BleError::new(
                ErrorCode::OPERATION_TIMEOUT,
                format!("{} timed out", operation),
            )
            .with_context("operation", operation)
            .with_context("target", target)
            .with_context("device", self.address)),
        }
    }
}

/// A connected remote peripheral
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("address", &self.inner.address)
            .field("name", &self.inner.name)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Device {
    pub(crate) fn new(
        address: Address,
        connected: ConnectedDevice,
        driver: Arc<dyn CentralDriver>,
        central: WeakCentral,
        config: &CentralConfig,
    ) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                address,
                name: connected.name,
                handle: connected.handle,
                driver,
                central,
                discovery_timeout: config.discovery_timeout,
                operation_timeout: config.operation_timeout,
                open: AtomicBool::new(true),
                rssi: Mutex::new(connected.rssi),
                last_activity: Mutex::new(Instant::now()),
                services: RwLock::new(Vec::new()),
                subscriptions: CancellationToken::new(),
            }),
        }
    }

    pub fn address(&self) -> Address {
        self.inner.address
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// Last signal strength seen, without a radio round trip
    pub fn rssi_snapshot(&self) -> Option<i16> {
        *lock(&self.inner.rssi)
    }

    pub fn last_activity(&self) -> Instant {
        *lock(&self.inner.last_activity)
    }

    /// Live link state: false once closed locally or dropped by the remote
    pub async fn is_connected(&self) -> bool {
        self.is_open() && self.inner.driver.is_connected(self.inner.handle).await
    }

    pub(crate) fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    pub(crate) fn ptr_eq(&self, other: &Device) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Read the signal strength over the air and refresh the snapshot
    pub async fn rssi(&self) -> BleResult<i16> {
        self.inner.ensure_open()?;
        let rssi = self
            .inner
            .driver
            .read_rssi(self.inner.handle)
            .await
            .map_err(|err| {
                BleError::from_driver(
                    err,
                    ErrorCode::OPERATION_FAILED,
                    "read rssi",
                    self.inner.address,
                )
            })?;
        *lock(&self.inner.rssi) = Some(rssi);
        self.inner.touch();
        Ok(rssi)
    }

    pub async fn mtu(&self) -> BleResult<u16> {
        self.inner.ensure_open()?;
        self.inner
            .driver
            .mtu(self.inner.handle)
            .await
            .map_err(|err| {
                BleError::from_driver(
                    err,
                    ErrorCode::OPERATION_FAILED,
                    "read mtu",
                    self.inner.address,
                )
            })
    }

    /// Discover services (all of them when `uuids` is empty).
    ///
    /// Resolves only once the driver signals discovery complete; the
    /// configured discovery timeout bounds the wait.
    pub async fn discover_services(&self, uuids: &[BleUuid]) -> BleResult<Vec<Service>> {
        let inner = &self.inner;
        inner.ensure_open()?;
        debug!("Discovering services on {}", inner.address);

        let infos = match tokio::time::timeout(
            inner.discovery_timeout,
            inner.driver.discover_services(inner.handle, uuids),
        )
        .await
        {
            Ok(result) => result.map_err(|err| {
                BleError::from_driver(
                    err,
                    ErrorCode::DISCOVERY_FAILED,
                    "discover services",
                    inner.address,
                )
            })?,
            Err(_) => {
                return Err(BleError::new(
                    ErrorCode::DISCOVERY_TIMEOUT,
                    "service discovery did not complete",
                )
                .with_context("target", inner.address)
                .with_context("timeout_ms", inner.discovery_timeout.as_millis()))
            }
        };

        let discovered: Vec<Service> = infos
            .into_iter()
            .filter(|info| uuids.is_empty() || uuids.contains(&info.uuid))
            .map(|info| Service::build(info, Arc::downgrade(inner)))
            .collect();

        {
            let mut services = write(&inner.services);
            // The link may have gone down while discovery was in flight
            inner.ensure_open()?;
            for service in &discovered {
                match services.iter_mut().find(|s| s.uuid() == service.uuid()) {
                    Some(existing) => {
                        existing.cancel_subscriptions();
                        *existing = service.clone();
                    }
                    None => services.push(service.clone()),
                }
            }
        }
        inner.touch();

        info!("Discovered {} services on {}", discovered.len(), inner.address);
        Ok(discovered)
    }

    /// Snapshot of the discovered services
    pub fn services(&self) -> Vec<Service> {
        read(&self.inner.services).clone()
    }

    pub fn service(&self, uuid: BleUuid) -> Option<Service> {
        read(&self.inner.services)
            .iter()
            .find(|service| service.uuid() == uuid)
            .cloned()
    }

    pub fn characteristic(
        &self,
        service: BleUuid,
        characteristic: BleUuid,
    ) -> BleResult<Characteristic> {
        let service = self.service(service).ok_or_else(|| {
            BleError::new(ErrorCode::SERVICE_NOT_FOUND, "service not discovered")
                .with_context("target", service)
        })?;
        service.characteristic(characteristic).ok_or_else(|| {
            BleError::new(ErrorCode::CHARACTERISTIC_NOT_FOUND, "characteristic not discovered")
                .with_context("target", characteristic)
        })
    }

    /// First discovered characteristic with this UUID, in any service
    pub fn find_characteristic(&self, uuid: BleUuid) -> BleResult<Characteristic> {
        read(&self.inner.services)
            .iter()
            .find_map(|service| service.characteristic(uuid))
            .ok_or_else(|| {
                BleError::new(ErrorCode::CHARACTERISTIC_NOT_FOUND, "characteristic not discovered")
                    .with_context("target", uuid)
            })
    }

    /// Disconnect and release the connection resource
    pub async fn disconnect(&self) -> BleResult<()> {
        match self.inner.central.upgrade() {
            Some(central) => central.disconnect(self).await,
            None => self.close().await,
        }
    }

    /// Tear down the subtree, cancel subscriptions and drop the native link.
    /// Idempotent.
    pub(crate) async fn close(&self) -> BleResult<()> {
        let inner = &self.inner;
        if !inner.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        inner.subscriptions.cancel();
        let services = std::mem::take(&mut *write(&inner.services));
        for service in &services {
            service.cancel_subscriptions();
        }
        drop(services);

        let result = if inner.driver.is_connected(inner.handle).await {
            inner.driver.disconnect(inner.handle).await.map_err(|err| {
                BleError::from_driver(
                    err,
                    ErrorCode::CONNECTION_FAILED,
                    "disconnect",
                    inner.address,
                )
            })
        } else {
            Ok(())
        };

        if let Some(central) = inner.central.upgrade() {
            central.forget_device(self);
        }
        info!("Disconnected from {}", inner.address);
        result
    }
}

// ----------------------------------------------------------------------------
// Service
// ----------------------------------------------------------------------------

struct ServiceInner {
    uuid: BleUuid,
    primary: bool,
    device: Weak<DeviceInner>,
    characteristics: Vec<Characteristic>,
}

#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("uuid", &self.inner.uuid)
            .field("primary", &self.inner.primary)
            .field("characteristics", &self.inner.characteristics)
            .finish()
    }
}

impl Service {
    fn build(info: ServiceInfo, device: Weak<DeviceInner>) -> Self {
        let inner = Arc::new_cyclic(|service: &Weak<ServiceInner>| ServiceInner {
            uuid: info.uuid,
            primary: info.primary,
            device,
            characteristics: info
                .characteristics
                .into_iter()
                .map(|c| Characteristic::build(c, service.clone()))
                .collect(),
        });
        Self { inner }
    }

    pub fn uuid(&self) -> BleUuid {
        self.inner.uuid
    }

    pub fn is_primary(&self) -> bool {
        self.inner.primary
    }

    pub fn characteristics(&self) -> &[Characteristic] {
        &self.inner.characteristics
    }

    pub fn characteristic(&self, uuid: BleUuid) -> Option<Characteristic> {
        self.inner
            .characteristics
            .iter()
            .find(|c| c.uuid() == uuid)
            .cloned()
    }

    /// The owning device, while it is still alive
    pub fn device(&self) -> Option<Device> {
        self.inner.device.upgrade().map(|inner| Device { inner })
    }

    fn cancel_subscriptions(&self) {
        for characteristic in &self.inner.characteristics {
            characteristic.cancel_subscription();
        }
    }
}

// ----------------------------------------------------------------------------
// Characteristic
// ----------------------------------------------------------------------------

/// Held by the forwarding task across the `active` check and the callback
type DeliveryLock = Arc<Mutex<bool>>;

struct Subscription {
    active: DeliveryLock,
    cancel: CancellationToken,
}

impl Subscription {
    /// Blocks while a callback is running; no callback starts afterwards
    fn cancel(&self) {
        *lock(&self.active) = false;
        self.cancel.cancel();
    }
}

struct CharacteristicInner {
    uuid: BleUuid,
    handle: AttributeHandle,
    properties: CharacteristicProperties,
    service: Weak<ServiceInner>,
    descriptors: Vec<Descriptor>,
    subscription: Mutex<Option<Subscription>>,
}

#[derive(Clone)]
pub struct Characteristic {
    inner: Arc<CharacteristicInner>,
}

impl fmt::Debug for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Characteristic")
            .field("uuid", &self.inner.uuid)
            .field("properties", &self.inner.properties)
            .field("subscribed", &self.is_subscribed())
            .finish()
    }
}

impl Characteristic {
    fn build(info: CharacteristicInfo, service: Weak<ServiceInner>) -> Self {
        let inner = Arc::new_cyclic(|characteristic: &Weak<CharacteristicInner>| {
            CharacteristicInner {
                uuid: info.uuid,
                handle: info.handle,
                properties: info.properties,
                service,
                descriptors: info
                    .descriptors
                    .into_iter()
                    .map(|d| Descriptor {
                        inner: Arc::new(DescriptorInner {
                            uuid: d.uuid,
                            handle: d.handle,
                            characteristic: characteristic.clone(),
                        }),
                    })
                    .collect(),
                subscription: Mutex::new(None),
            }
        });
        Self { inner }
    }

    pub fn uuid(&self) -> BleUuid {
        self.inner.uuid
    }

    pub fn properties(&self) -> CharacteristicProperties {
        self.inner.properties
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.inner.descriptors
    }

    pub fn descriptor(&self, uuid: BleUuid) -> Option<Descriptor> {
        self.inner
            .descriptors
            .iter()
            .find(|d| d.uuid() == uuid)
            .cloned()
    }

    pub fn service(&self) -> Option<Service> {
        self.inner.service.upgrade().map(|inner| Service { inner })
    }

    pub fn is_subscribed(&self) -> bool {
        lock(&self.inner.subscription).is_some()
    }

    /// Resolve the owning device through the navigation links
    fn device(&self) -> BleResult<Arc<DeviceInner>> {
        let device = self
            .inner
            .service
            .upgrade()
            .and_then(|service| service.device.upgrade())
            .ok_or_else(|| {
                BleError::new(ErrorCode::DEVICE_NOT_CONNECTED, "device released")
                    .with_context("target", self.inner.uuid)
            })?;
        device.ensure_open()?;
        Ok(device)
    }

    fn require(&self, needed: CharacteristicProperties, operation: &str) -> BleResult<()> {
        if self.inner.properties.intersects(needed) {
            Ok(())
        } else {
            Err(BleError::not_supported(format!(
                "characteristic does not support {}",
                operation
            ))
            .with_context("operation", operation)
            .with_context("target", self.inner.uuid))
        }
    }

    pub async fn read(&self) -> BleResult<Vec<u8>> {
        self.require(CharacteristicProperties::READ, "read")?;
        let device = self.device()?;
        device
            .call(
                "read",
                self.inner.uuid,
                ErrorCode::READ_FAILED,
                device.driver.read(device.handle, self.inner.handle),
            )
            .await
    }

    pub async fn write(&self, value: &[u8]) -> BleResult<()> {
        self.require(CharacteristicProperties::WRITE, "write")?;
        let device = self.device()?;
        device
            .call(
                "write",
                self.inner.uuid,
                ErrorCode::WRITE_FAILED,
                device
                    .driver
                    .write(device.handle, self.inner.handle, value, WriteType::WithResponse),
            )
            .await
    }

    pub async fn write_without_response(&self, value: &[u8]) -> BleResult<()> {
        self.require(
            CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
            "write without response",
        )?;
        let device = self.device()?;
        device
            .call(
                "write without response",
                self.inner.uuid,
                ErrorCode::WRITE_FAILED,
                device.driver.write(
                    device.handle,
                    self.inner.handle,
                    value,
                    WriteType::WithoutResponse,
                ),
            )
            .await
    }

    /// Deliver every notification or indication to `callback`.
    ///
    /// The callback runs on a dedicated task, holding only this subscription's
    /// delivery lock. Once [`Characteristic::unsubscribe`] returns or the
    /// device disconnects, no call is in flight and none starts; values
    /// arriving after that are dropped. The callback must not unsubscribe its
    /// own characteristic.
    pub async fn subscribe<F>(&self, callback: F) -> BleResult<()>
    where
        F: Fn(Vec<u8>) + Send + Sync + 'static,
    {
        self.require(
            CharacteristicProperties::NOTIFY | CharacteristicProperties::INDICATE,
            "subscribe",
        )?;
        let device = self.device()?;

        let active: DeliveryLock = Arc::new(Mutex::new(true));
        let cancel = device.subscriptions.child_token();
        {
            let mut slot = lock(&self.inner.subscription);
            if slot.is_some() {
                return Err(BleError::invalid_operation("already subscribed")
                    .with_context("target", self.inner.uuid));
            }
            *slot = Some(Subscription {
                active: active.clone(),
                cancel: cancel.clone(),
            });
        }

        let (sink, mut values) = mpsc::unbounded_channel();
        let subscribed = device
            .call(
                "subscribe",
                self.inner.uuid,
                ErrorCode::SUBSCRIBE_FAILED,
                device.driver.subscribe(device.handle, self.inner.handle, sink),
            )
            .await;
        if let Err(err) = subscribed {
            self.cancel_subscription();
            return Err(err);
        }

        let weak_device = Arc::downgrade(&device);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    value = values.recv() => match value {
                        Some(value) => {
                            let delivering = lock(&active);
                            if !*delivering {
                                continue;
                            }
                            if let Some(device) = weak_device.upgrade() {
                                device.touch();
                            }
                            callback(value);
                        }
                        None => break,
                    },
                }
            }
        });

        debug!("Subscribed to {} on {}", self.inner.uuid, device.address);
        Ok(())
    }

    /// Stop notifications. A no-op when not subscribed.
    pub async fn unsubscribe(&self) -> BleResult<()> {
        let subscription = lock(&self.inner.subscription).take();
        let Some(subscription) = subscription else {
            return Ok(());
        };
        subscription.cancel();

        // Nothing to undo natively once the link is gone
        let Ok(device) = self.device() else {
            return Ok(());
        };
        device
            .call(
                "unsubscribe",
                self.inner.uuid,
                ErrorCode::UNSUBSCRIBE_FAILED,
                device.driver.unsubscribe(device.handle, self.inner.handle),
            )
            .await?;
        debug!("Unsubscribed from {} on {}", self.inner.uuid, device.address);
        Ok(())
    }

    fn cancel_subscription(&self) {
        let subscription = lock(&self.inner.subscription).take();
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
    }
}

// ----------------------------------------------------------------------------
// Descriptor
// ----------------------------------------------------------------------------

struct DescriptorInner {
    uuid: BleUuid,
    handle: AttributeHandle,
    characteristic: Weak<CharacteristicInner>,
}

#[derive(Clone)]
pub struct Descriptor {
    inner: Arc<DescriptorInner>,
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("uuid", &self.inner.uuid)
            .finish()
    }
}

impl Descriptor {
    pub fn uuid(&self) -> BleUuid {
        self.inner.uuid
    }

    pub fn characteristic(&self) -> Option<Characteristic> {
        self.inner
            .characteristic
            .upgrade()
            .map(|inner| Characteristic { inner })
    }

    fn device(&self) -> BleResult<Arc<DeviceInner>> {
        self.characteristic()
            .ok_or_else(|| {
                BleError::new(ErrorCode::DEVICE_NOT_CONNECTED, "device released")
                    .with_context("target", self.inner.uuid)
            })?
            .device()
    }

    pub async fn read(&self) -> BleResult<Vec<u8>> {
        let device = self.device()?;
        device
            .call(
                "read descriptor",
                self.inner.uuid,
                ErrorCode::READ_FAILED,
                device.driver.read_descriptor(device.handle, self.inner.handle),
            )
            .await
    }

    pub async fn write(&self, value: &[u8]) -> BleResult<()> {
        let device = self.device()?;
        device
            .call(
                "write descriptor",
                self.inner.uuid,
                ErrorCode::WRITE_FAILED,
                device
                    .driver
                    .write_descriptor(device.handle, self.inner.handle, value),
            )
            .await
    }
}
