//! Central role over a btleplug adapter

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use btleplug::api::{
    Central as _, CentralEvent, Characteristic as NativeCharacteristic,
    Descriptor as NativeDescriptor, Peripheral as _, ScanFilter as NativeScanFilter,
    WriteType as NativeWriteType,
};
use btleplug::platform::{Adapter, Peripheral};
use bluelink_core::driver::{
    AttributeHandle, CentralDriver, CharacteristicInfo, ConnectedDevice, DescriptorInfo,
    DeviceHandle, HandleRegistry, NotificationSink, ScanSink, ServiceInfo, WriteType,
};
use bluelink_core::{
    Address, BleError, BleResult, BleUuid, CancellationToken, ConnectionParams, ErrorCode,
    ScanParams,
};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::convert::{map_error, properties, scan_report, to_bdaddr};
use crate::routes::{RouteKey, Routes};

// ----------------------------------------------------------------------------
// Handle Targets
// ----------------------------------------------------------------------------

#[derive(Clone)]
enum AttributeKind {
    Characteristic(NativeCharacteristic),
    Descriptor(NativeDescriptor),
}

#[derive(Clone)]
struct AttributeTarget {
    device: u64,
    kind: AttributeKind,
}

type SharedRoutes = Arc<Mutex<Routes>>;

fn route_key(device: u64, native: &NativeCharacteristic) -> RouteKey {
    RouteKey {
        device,
        service: native.service_uuid,
        characteristic: native.uuid,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ----------------------------------------------------------------------------
// Driver
// ----------------------------------------------------------------------------

/// [`CentralDriver`] backed by one btleplug adapter.
///
/// btleplug has no power control, so enable/disable only gate this driver.
/// Connection parameters other than the connect timeout (which the core
/// enforces) are left to the operating system.
pub struct BtleplugCentral {
    adapter: Adapter,
    enabled: AtomicBool,
    devices: HandleRegistry<Peripheral>,
    attributes: HandleRegistry<AttributeTarget>,
    scan: Mutex<Option<CancellationToken>>,
    routes: SharedRoutes,
    pumps: Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl BtleplugCentral {
    pub fn new(adapter: Adapter) -> Self {
        Self {
            adapter,
            enabled: AtomicBool::new(false),
            devices: HandleRegistry::new(),
            attributes: HandleRegistry::new(),
            scan: Mutex::new(None),
            routes: Arc::new(Mutex::new(Routes::default())),
            pumps: Mutex::new(HashMap::new()),
        }
    }

    fn peripheral(&self, device: DeviceHandle) -> BleResult<Peripheral> {
        self.devices
            .get(device.0)
            .ok_or_else(|| BleError::not_connected(format!("device handle {}", device.0)))
    }

    fn characteristic(
        &self,
        characteristic: AttributeHandle,
    ) -> BleResult<(Peripheral, NativeCharacteristic)> {
        match self.attributes.get(characteristic.0) {
            Some(AttributeTarget {
                device,
                kind: AttributeKind::Characteristic(native),
            }) => Ok((self.peripheral(DeviceHandle(device))?, native)),
            _ => Err(BleError::new(
                ErrorCode::CHARACTERISTIC_NOT_FOUND,
                "stale characteristic handle",
            )
            .with_context("target", characteristic.0)),
        }
    }

    fn descriptor(&self, descriptor: AttributeHandle) -> BleResult<(Peripheral, NativeDescriptor)> {
        match self.attributes.get(descriptor.0) {
            Some(AttributeTarget {
                device,
                kind: AttributeKind::Descriptor(native),
            }) => Ok((self.peripheral(DeviceHandle(device))?, native)),
            _ => Err(BleError::new(ErrorCode::DESCRIPTOR_NOT_FOUND, "stale descriptor handle")
                .with_context("target", descriptor.0)),
        }
    }

    /// Reuse the handle issued for the same attribute by an earlier discovery
    fn handle_for(&self, device: u64, kind: AttributeKind) -> AttributeHandle {
        let existing = self.attributes.find(|target| {
            target.device == device
                && match (&target.kind, &kind) {
                    (AttributeKind::Characteristic(a), AttributeKind::Characteristic(b)) => a == b,
                    (AttributeKind::Descriptor(a), AttributeKind::Descriptor(b)) => a == b,
                    _ => false,
                }
        });
        match existing {
            Some((handle, _)) => AttributeHandle(handle),
            None => AttributeHandle(self.attributes.insert(AttributeTarget { device, kind })),
        }
    }

    async fn find_peripheral(&self, address: &Address) -> BleResult<Peripheral> {
        let target = to_bdaddr(address);
        let peripherals = self.adapter.peripherals().await.map_err(map_error)?;
        peripherals
            .into_iter()
            .find(|peripheral| peripheral.address() == target)
            .ok_or_else(|| {
                BleError::new(ErrorCode::DEVICE_NOT_FOUND, "device has not been seen by a scan")
                    .with_context("target", address)
            })
    }

    /// One notification stream per device, fanned out to the subscribed sinks
    async fn ensure_pump(&self, device: u64, peripheral: &Peripheral) -> BleResult<()> {
        if lock(&self.pumps).contains_key(&device) {
            return Ok(());
        }
        let mut stream = peripheral.notifications().await.map_err(map_error)?;
        let routes = self.routes.clone();
        let task = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                let delivered =
                    lock(&routes).deliver(device, notification.uuid, &notification.value);
                if delivered == 0 {
                    trace!("Unrouted notification from {}", notification.uuid);
                }
            }
            debug!("Notification stream for device {} ended", device);
        });

        let mut pumps = lock(&self.pumps);
        if pumps.contains_key(&device) {
            task.abort();
        } else {
            pumps.insert(device, task);
        }
        Ok(())
    }

    fn forget(&self, device: u64) {
        if let Some(pump) = lock(&self.pumps).remove(&device) {
            pump.abort();
        }
        lock(&self.routes).forget(device);
        for (handle, _) in self.attributes.filter(|target| target.device == device) {
            self.attributes.remove(handle);
        }
    }
}

#[async_trait]
impl CentralDriver for BtleplugCentral {
    async fn enable(&self) -> BleResult<()> {
        let info = self.adapter.adapter_info().await.map_err(map_error)?;
        self.enabled.store(true, Ordering::Release);
        info!("btleplug adapter ready: {}", info);
        Ok(())
    }

    async fn disable(&self) -> BleResult<()> {
        self.stop_scan().await?;
        for (handle, peripheral) in self.devices.drain() {
            self.forget(handle);
            if let Err(err) = peripheral.disconnect().await {
                warn!("Disconnecting {} during disable failed: {}", peripheral.address(), err);
            }
        }
        self.enabled.store(false, Ordering::Release);
        Ok(())
    }

    async fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    async fn start_scan(&self, params: &ScanParams, sink: ScanSink) -> BleResult<()> {
        let filter = NativeScanFilter {
            services: params.filter.service_uuids.iter().map(|uuid| *uuid.as_uuid()).collect(),
        };
        let mut events = self.adapter.events().await.map_err(map_error)?;
        self.adapter.start_scan(filter).await.map_err(map_error)?;

        let cancel = CancellationToken::new();
        if let Some(previous) = lock(&self.scan).replace(cancel.clone()) {
            previous.cancel();
        }

        let adapter = self.adapter.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.next() => event,
                };
                let id = match event {
                    Some(CentralEvent::DeviceDiscovered(id))
                    | Some(CentralEvent::DeviceUpdated(id)) => id,
                    Some(_) => continue,
                    None => break,
                };
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let Ok(Some(props)) = peripheral.properties().await else {
                    continue;
                };
                if let Some(report) = scan_report(&props) {
                    if sink.send(report).is_err() {
                        break;
                    }
                }
            }
            debug!("btleplug scan event loop exited");
        });
        Ok(())
    }

    async fn stop_scan(&self) -> BleResult<()> {
        let scan = lock(&self.scan).take();
        let Some(scan) = scan else {
            return Ok(());
        };
        scan.cancel();
        self.adapter.stop_scan().await.map_err(map_error)
    }

    async fn connect(
        &self,
        address: &Address,
        params: &ConnectionParams,
    ) -> BleResult<ConnectedDevice> {
        let peripheral = self.find_peripheral(address).await?;
        debug!(
            "Connecting to {} (interval {:?}..{:?} requested, left to the OS)",
            address, params.min_interval, params.max_interval
        );
        peripheral.connect().await.map_err(map_error)?;

        let props = peripheral.properties().await.map_err(map_error)?.unwrap_or_default();
        let handle = self.devices.insert(peripheral);
        Ok(ConnectedDevice {
            handle: DeviceHandle(handle),
            name: props.local_name,
            rssi: props.rssi,
        })
    }

    async fn disconnect(&self, device: DeviceHandle) -> BleResult<()> {
        let Some(peripheral) = self.devices.remove(device.0) else {
            return Ok(());
        };
        self.forget(device.0);
        peripheral.disconnect().await.map_err(map_error)
    }

    async fn is_connected(&self, device: DeviceHandle) -> bool {
        match self.devices.get(device.0) {
            Some(peripheral) => peripheral.is_connected().await.unwrap_or(false),
            None => false,
        }
    }

    async fn discover_services(
        &self,
        device: DeviceHandle,
        filter: &[BleUuid],
    ) -> BleResult<Vec<ServiceInfo>> {
        let peripheral = self.peripheral(device)?;
        peripheral.discover_services().await.map_err(map_error)?;

        let mut services = Vec::new();
        for service in peripheral.services() {
            let uuid = BleUuid::from(service.uuid);
            if !filter.is_empty() && !filter.contains(&uuid) {
                continue;
            }
            let mut characteristics = Vec::new();
            for characteristic in &service.characteristics {
                let mut descriptors = Vec::new();
                for descriptor in &characteristic.descriptors {
                    let kind = AttributeKind::Descriptor(descriptor.clone());
                    descriptors.push(DescriptorInfo {
                        handle: self.handle_for(device.0, kind),
                        uuid: BleUuid::from(descriptor.uuid),
                    });
                }
                let kind = AttributeKind::Characteristic(characteristic.clone());
                characteristics.push(CharacteristicInfo {
                    handle: self.handle_for(device.0, kind),
                    uuid: BleUuid::from(characteristic.uuid),
                    properties: properties(characteristic.properties),
                    descriptors,
                });
            }
            services.push(ServiceInfo {
                uuid,
                primary: service.primary,
                characteristics,
            });
        }
        Ok(services)
    }

    async fn read(
        &self,
        _device: DeviceHandle,
        characteristic: AttributeHandle,
    ) -> BleResult<Vec<u8>> {
        let (peripheral, native) = self.characteristic(characteristic)?;
        peripheral.read(&native).await.map_err(map_error)
    }

    async fn write(
        &self,
        _device: DeviceHandle,
        characteristic: AttributeHandle,
        value: &[u8],
        write_type: WriteType,
    ) -> BleResult<()> {
        let (peripheral, native) = self.characteristic(characteristic)?;
        let write_type = match write_type {
            WriteType::WithResponse => NativeWriteType::WithResponse,
            WriteType::WithoutResponse => NativeWriteType::WithoutResponse,
        };
        peripheral.write(&native, value, write_type).await.map_err(map_error)
    }

    async fn subscribe(
        &self,
        device: DeviceHandle,
        characteristic: AttributeHandle,
        sink: NotificationSink,
    ) -> BleResult<()> {
        let (peripheral, native) = self.characteristic(characteristic)?;
        self.ensure_pump(device.0, &peripheral).await?;
        let key = route_key(device.0, &native);
        let active = {
            let mut routes = lock(&self.routes);
            routes.insert(key, sink);
            routes.len()
        };
        if let Err(err) = peripheral.subscribe(&native).await {
            lock(&self.routes).remove(&key);
            return Err(map_error(err));
        }
        debug!("Subscribed to {} ({} routes active)", native.uuid, active);
        Ok(())
    }

    async fn unsubscribe(
        &self,
        device: DeviceHandle,
        characteristic: AttributeHandle,
    ) -> BleResult<()> {
        let (peripheral, native) = self.characteristic(characteristic)?;
        lock(&self.routes).remove(&route_key(device.0, &native));
        peripheral.unsubscribe(&native).await.map_err(map_error)
    }

    async fn read_descriptor(
        &self,
        _device: DeviceHandle,
        descriptor: AttributeHandle,
    ) -> BleResult<Vec<u8>> {
        let (peripheral, native) = self.descriptor(descriptor)?;
        peripheral.read_descriptor(&native).await.map_err(map_error)
    }

    async fn write_descriptor(
        &self,
        _device: DeviceHandle,
        descriptor: AttributeHandle,
        value: &[u8],
    ) -> BleResult<()> {
        let (peripheral, native) = self.descriptor(descriptor)?;
        peripheral.write_descriptor(&native, value).await.map_err(map_error)
    }

    async fn read_rssi(&self, device: DeviceHandle) -> BleResult<i16> {
        let peripheral = self.peripheral(device)?;
        let props = peripheral.properties().await.map_err(map_error)?;
        props.and_then(|props| props.rssi).ok_or_else(|| {
            BleError::not_supported("the platform has not reported an RSSI for this device")
        })
    }
}
