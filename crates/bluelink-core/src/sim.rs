//! Simulated platform
//!
//! An in-memory radio implementing the driver contracts, for tests and for
//! running the CLI without hardware. Remote peripherals are declared with
//! [`SimPeripheral`]; the local GATT server is observed and poked through
//! [`SimRadio`]. Scan reports and notifications are delivered from spawned
//! tasks, standing in for the native callback context.
//!
//! ```no_run
//! use bluelink_core::sim::{SimPeripheral, SimRadio, SimService};
//! use bluelink_core::gatt::CharacteristicProperties;
//! use bluelink_core::types::{assigned, Address};
//!
//! # fn main() -> bluelink_core::BleResult<()> {
//! let radio = SimRadio::default();
//! radio.add_peripheral(
//!     SimPeripheral::new(Address::parse("C0:FF:EE:00:00:01")?)
//!         .with_name("Thermo")
//!         .advertising(assigned::BATTERY_SERVICE)
//!         .with_service(SimService::new(assigned::BATTERY_SERVICE).with_characteristic(
//!             assigned::BATTERY_LEVEL,
//!             CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
//!             [100u8],
//!         )),
//! );
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::advertisement::{AdvertisingData, FLAGS_GENERAL_DISCOVERABLE};
use crate::driver::{
    AdapterInfo, AttributeHandle, CentralDriver, CharacteristicDefinition, CharacteristicInfo,
    ConnectedDevice, DescriptorInfo, DeviceHandle, HandleRegistry, NotificationSink,
    PeripheralDriver, PeripheralEvent, PeripheralEventSink, Platform, ScanReport, ScanSink,
    ServiceInfo, WriteType,
};
use crate::error::{BleError, BleResult, ErrorCode};
use crate::gatt::CharacteristicProperties;
use crate::params::{AdvertisingParams, ConnectionParams, ScanParams};
use crate::sync::lock;
use crate::types::{assigned, Address, AddressKind, BleUuid};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Behaviour of the simulated radio
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// How often every in-range peripheral is reported while scanning
    pub report_interval: Duration,
    /// ATT MTU reported for every link
    pub mtu: u16,
    /// Whether the central role starts powered on
    pub powered: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            report_interval: Duration::from_millis(100),
            mtu: 247,
            powered: true,
        }
    }
}

impl SimConfig {
    pub fn testing() -> Self {
        Self {
            report_interval: Duration::from_millis(10),
            ..Self::default()
        }
    }
}

/// Native operations that can be counted, failed or stalled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    EnableCentral,
    DisableCentral,
    StartScan,
    StopScan,
    Connect,
    Disconnect,
    Discover,
    Read,
    Write,
    Subscribe,
    Unsubscribe,
    ReadDescriptor,
    WriteDescriptor,
    ReadRssi,
    EnablePeripheral,
    DisablePeripheral,
    AddService,
    AddCharacteristic,
    RemoveService,
    StartAdvertising,
    StopAdvertising,
    Notify,
}

// ----------------------------------------------------------------------------
// Remote Peripherals
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SimCharacteristic {
    pub uuid: BleUuid,
    pub properties: CharacteristicProperties,
    pub value: Vec<u8>,
    pub descriptors: Vec<(BleUuid, Vec<u8>)>,
}

#[derive(Debug, Clone)]
pub struct SimService {
    pub uuid: BleUuid,
    pub primary: bool,
    pub characteristics: Vec<SimCharacteristic>,
}

impl SimService {
    pub fn new(uuid: BleUuid) -> Self {
        Self {
            uuid,
            primary: true,
            characteristics: Vec::new(),
        }
    }

    pub fn secondary(mut self) -> Self {
        self.primary = false;
        self
    }

    pub fn with_characteristic(
        mut self,
        uuid: BleUuid,
        properties: CharacteristicProperties,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        self.characteristics.push(SimCharacteristic {
            uuid,
            properties,
            value: value.into(),
            descriptors: Vec::new(),
        });
        self
    }

    /// Attach a descriptor to a characteristic added earlier
    pub fn with_descriptor(
        mut self,
        characteristic: BleUuid,
        uuid: BleUuid,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        if let Some(c) = self.characteristics.iter_mut().find(|c| c.uuid == characteristic) {
            c.descriptors.push((uuid, value.into()));
        }
        self
    }
}

/// A remote device in range of the simulated radio
#[derive(Debug, Clone)]
pub struct SimPeripheral {
    pub address: Address,
    pub name: Option<String>,
    pub rssi: i16,
    pub advertised_services: Vec<BleUuid>,
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
    pub connectable: bool,
    pub services: Vec<SimService>,
}

impl SimPeripheral {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            name: None,
            rssi: -60,
            advertised_services: Vec::new(),
            manufacturer_data: BTreeMap::new(),
            connectable: true,
            services: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    /// Include a service UUID in the advertising payload
    pub fn advertising(mut self, uuid: BleUuid) -> Self {
        self.advertised_services.push(uuid);
        self
    }

    pub fn with_manufacturer_data(mut self, company_id: u16, data: impl Into<Vec<u8>>) -> Self {
        self.manufacturer_data.insert(company_id, data.into());
        self
    }

    pub fn non_connectable(mut self) -> Self {
        self.connectable = false;
        self
    }

    pub fn with_service(mut self, service: SimService) -> Self {
        self.services.push(service);
        self
    }

    fn payload(&self) -> Vec<u8> {
        let mut data = AdvertisingData::new().with_flags(FLAGS_GENERAL_DISCOVERABLE);
        if let Some(name) = &self.name {
            data = data.with_local_name(name.clone());
        }
        for uuid in &self.advertised_services {
            data = data.with_service(*uuid);
        }
        for (company, bytes) in &self.manufacturer_data {
            data = data.with_manufacturer_data(*company, bytes.clone());
        }
        data.encode_unbounded()
    }

    fn report(&self) -> ScanReport {
        ScanReport {
            address: self.address,
            rssi: self.rssi,
            name: self.name.clone(),
            payload: self.payload(),
            connectable: self.connectable,
        }
    }

    fn characteristic_mut(
        &mut self,
        service: BleUuid,
        characteristic: BleUuid,
    ) -> Option<&mut SimCharacteristic> {
        self.services
            .iter_mut()
            .filter(|s| s.uuid == service)
            .flat_map(|s| s.characteristics.iter_mut())
            .find(|c| c.uuid == characteristic)
    }
}

// ----------------------------------------------------------------------------
// Radio State
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AttributeRef {
    service: BleUuid,
    characteristic: BleUuid,
    descriptor: Option<BleUuid>,
}

#[derive(Debug, Clone)]
struct Link {
    address: Address,
    attributes: BTreeMap<AttributeHandle, AttributeRef>,
    subscriptions: HashMap<AttributeHandle, NotificationSink>,
}

impl Link {
    fn new(address: Address) -> Self {
        Self {
            address,
            attributes: BTreeMap::new(),
            subscriptions: HashMap::new(),
        }
    }

    fn handle_of(&self, attribute: AttributeRef) -> Option<AttributeHandle> {
        self.attributes
            .iter()
            .find(|(_, a)| **a == attribute)
            .map(|(handle, _)| *handle)
    }
}

#[derive(Debug, Default)]
struct CentralState {
    enabled: bool,
    scan: Option<CancellationToken>,
}

/// A notification sent by the local GATT server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotification {
    pub service: BleUuid,
    pub characteristic: BleUuid,
    pub value: Vec<u8>,
    pub indicate: bool,
}

#[derive(Debug, Default)]
struct LocalServer {
    events: Option<PeripheralEventSink>,
    services: BTreeMap<BleUuid, Vec<CharacteristicDefinition>>,
    advertising: Option<Vec<u8>>,
    notifications: Vec<SentNotification>,
}

#[derive(Debug, Default)]
struct Faults {
    failures: HashMap<SimOp, VecDeque<ErrorCode>>,
    stalled: HashSet<SimOp>,
    /// Unsubscribe succeeds but the peer keeps notifying
    sticky_subscriptions: bool,
}

struct RadioInner {
    config: SimConfig,
    remotes: Mutex<BTreeMap<Address, SimPeripheral>>,
    links: HandleRegistry<Link>,
    /// Next attribute handle; links keep their own handle-to-attribute maps
    next_attribute: AtomicU64,
    central: Mutex<CentralState>,
    server: Mutex<LocalServer>,
    faults: Mutex<Faults>,
    calls: Mutex<HashMap<SimOp, usize>>,
}

impl RadioInner {
    fn remotes(&self) -> MutexGuard<'_, BTreeMap<Address, SimPeripheral>> {
        lock(&self.remotes)
    }

    /// Count the call, then apply any injected failure or stall
    async fn enter(&self, op: SimOp) -> BleResult<()> {
        *lock(&self.calls).entry(op).or_insert(0) += 1;
        let (failure, stalled) = {
            let mut faults = lock(&self.faults);
            let failure = faults.failures.get_mut(&op).and_then(VecDeque::pop_front);
            (failure, faults.stalled.contains(&op))
        };
        if let Some(code) = failure {
            debug!("Simulated {:?} failure: {}", op, code);
            return Err(BleError::new(code, format!("simulated {:?} failure", op)));
        }
        if stalled {
            trace!("Simulated {:?} stalled", op);
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    fn ensure_powered(&self) -> BleResult<()> {
        if lock(&self.central).enabled {
            Ok(())
        } else {
            Err(BleError::new(ErrorCode::ADAPTER_DISABLED, "radio is powered off"))
        }
    }

    fn link(&self, device: DeviceHandle) -> BleResult<Link> {
        self.links
            .get(device.0)
            .ok_or_else(|| BleError::not_connected(format!("handle {}", device.0)))
    }

    fn attribute(
        &self,
        device: DeviceHandle,
        handle: AttributeHandle,
    ) -> BleResult<(Address, AttributeRef)> {
        let link = self.link(device)?;
        let attribute = link.attributes.get(&handle).copied().ok_or_else(|| {
            BleError::new(ErrorCode::CHARACTERISTIC_NOT_FOUND, "unknown attribute handle")
                .with_context("target", handle.0)
        })?;
        Ok((link.address, attribute))
    }

    fn scan_reports(&self) -> Vec<ScanReport> {
        self.remotes().values().map(SimPeripheral::report).collect()
    }

    fn send_event(&self, event: PeripheralEvent) -> BleResult<()> {
        let events = lock(&self.server).events.clone().ok_or_else(|| {
            BleError::new(ErrorCode::ADAPTER_DISABLED, "peripheral role is not enabled")
        })?;
        events
            .send(event)
            .map_err(|_| BleError::new(ErrorCode::ADAPTER_DISABLED, "peripheral stopped listening"))
    }
}

/// Shared state of one simulated radio. Cheap to clone.
#[derive(Clone)]
pub struct SimRadio {
    inner: Arc<RadioInner>,
}

impl Default for SimRadio {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl SimRadio {
    pub fn new(config: SimConfig) -> Self {
        let powered = config.powered;
        Self {
            inner: Arc::new(RadioInner {
                config,
                remotes: Mutex::new(BTreeMap::new()),
                links: HandleRegistry::new(),
                next_attribute: AtomicU64::new(1),
                central: Mutex::new(CentralState {
                    enabled: powered,
                    scan: None,
                }),
                server: Mutex::new(LocalServer::default()),
                faults: Mutex::new(Faults::default()),
                calls: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// A radio with a battery sensor and a heart-rate strap in range
    pub fn demo() -> BleResult<Self> {
        let radio = Self::default();
        let heart_rate = BleUuid::from_u16(0x180D);
        let heart_rate_measurement = BleUuid::from_u16(0x2A37);
        let thermo = Address::new([0xC0, 0xFF, 0xEE, 0x00, 0x00, 0x01], AddressKind::Public)?;
        radio.add_peripheral(
            SimPeripheral::new(thermo)
                .with_name("Thermo")
                .with_rssi(-48)
                .advertising(assigned::BATTERY_SERVICE)
                .with_service(
                    SimService::new(assigned::BATTERY_SERVICE)
                        .with_characteristic(
                            assigned::BATTERY_LEVEL,
                            CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
                            [87u8],
                        )
                        .with_descriptor(
                            assigned::BATTERY_LEVEL,
                            assigned::CLIENT_CHARACTERISTIC_CONFIGURATION,
                            [0u8, 0u8],
                        ),
                )
                .with_service(SimService::new(assigned::GENERIC_ACCESS_SERVICE).with_characteristic(
                    assigned::DEVICE_NAME,
                    CharacteristicProperties::READ,
                    b"Thermo".to_vec(),
                )),
        );
        let strap = Address::new([0xC0, 0xFF, 0xEE, 0x00, 0x00, 0x02], AddressKind::Random)?;
        radio.add_peripheral(
            SimPeripheral::new(strap)
                .with_name("HR Strap")
                .with_rssi(-71)
                .advertising(heart_rate)
                .with_manufacturer_data(0xFFFF, [0x01, 0x02])
                .with_service(SimService::new(heart_rate).with_characteristic(
                    heart_rate_measurement,
                    CharacteristicProperties::NOTIFY,
                    [0x00u8, 72],
                )),
        );
        Ok(radio)
    }

    pub fn config(&self) -> &SimConfig {
        &self.inner.config
    }

    pub fn central_driver(&self) -> Arc<dyn CentralDriver> {
        Arc::new(SimCentralDriver {
            radio: self.inner.clone(),
        })
    }

    pub fn peripheral_driver(&self) -> Arc<dyn PeripheralDriver> {
        Arc::new(SimPeripheralDriver {
            radio: self.inner.clone(),
        })
    }

    // ------------------------------------------------------------------------
    // Remote devices
    // ------------------------------------------------------------------------

    /// Bring a remote peripheral into range, replacing one with the same address
    pub fn add_peripheral(&self, peripheral: SimPeripheral) {
        self.inner.remotes().insert(peripheral.address, peripheral);
    }

    /// Take a remote peripheral out of range; existing links stay up
    pub fn remove_peripheral(&self, address: &Address) -> bool {
        self.inner.remotes().remove(address).is_some()
    }

    /// Current value of a remote characteristic
    pub fn value(
        &self,
        address: &Address,
        service: BleUuid,
        characteristic: BleUuid,
    ) -> Option<Vec<u8>> {
        self.inner
            .remotes()
            .get_mut(address)
            .and_then(|p| p.characteristic_mut(service, characteristic))
            .map(|c| c.value.clone())
    }

    pub fn set_value(
        &self,
        address: &Address,
        service: BleUuid,
        characteristic: BleUuid,
        value: impl Into<Vec<u8>>,
    ) -> bool {
        let mut remotes = self.inner.remotes();
        match remotes
            .get_mut(address)
            .and_then(|p| p.characteristic_mut(service, characteristic))
        {
            Some(c) => {
                c.value = value.into();
                true
            }
            None => false,
        }
    }

    /// Number of open links to `address`
    pub fn link_count(&self, address: &Address) -> usize {
        self.inner.links.filter(|link| link.address == *address).len()
    }

    /// Drop every link to `address` as if the remote went away. Returns
    /// whether any link existed.
    pub fn disconnect_remote(&self, address: &Address) -> bool {
        let links = self.inner.links.filter(|link| link.address == *address);
        for (handle, _) in &links {
            self.inner.links.remove(*handle);
        }
        let dropped = !links.is_empty();
        if dropped {
            debug!("Simulated remote disconnect of {}", address);
        }
        dropped
    }

    /// Push a notification from a remote characteristic to every subscriber.
    /// Returns whether anyone was subscribed.
    pub fn notify(
        &self,
        address: &Address,
        service: BleUuid,
        characteristic: BleUuid,
        value: impl Into<Vec<u8>>,
    ) -> bool {
        let value = value.into();
        self.set_value(address, service, characteristic, value.clone());

        let target = AttributeRef {
            service,
            characteristic,
            descriptor: None,
        };
        let sinks: Vec<NotificationSink> = self
            .inner
            .links
            .filter(|link| link.address == *address)
            .into_iter()
            .filter_map(|(_, link)| {
                link.handle_of(target)
                    .and_then(|handle| link.subscriptions.get(&handle).cloned())
            })
            .collect();

        if sinks.is_empty() {
            return false;
        }
        tokio::spawn(async move {
            for sink in sinks {
                let _ = sink.send(value.clone());
            }
        });
        true
    }

    // ------------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------------

    /// Fail the next call of `op` with `code`
    pub fn fail_next(&self, op: SimOp, code: ErrorCode) {
        self.fail_times(op, code, 1);
    }

    /// Fail the next `times` calls of `op` with `code`
    pub fn fail_times(&self, op: SimOp, code: ErrorCode, times: usize) {
        let mut faults = lock(&self.inner.faults);
        let queue = faults.failures.entry(op).or_default();
        queue.extend(std::iter::repeat(code).take(times));
    }

    /// Keep notification sinks installed across unsubscribe, like a peer that
    /// never saw the CCCD write
    pub fn keep_sinks_after_unsubscribe(&self) {
        lock(&self.inner.faults).sticky_subscriptions = true;
    }

    /// Make every call of `op` hang until [`SimRadio::unstall`]
    pub fn stall(&self, op: SimOp) {
        lock(&self.inner.faults).stalled.insert(op);
    }

    /// Only affects calls made afterwards
    pub fn unstall(&self, op: SimOp) {
        lock(&self.inner.faults).stalled.remove(&op);
    }

    /// Number of times `op` reached the radio, failed or not
    pub fn calls(&self, op: SimOp) -> usize {
        lock(&self.inner.calls).get(&op).copied().unwrap_or(0)
    }

    pub fn is_scanning(&self) -> bool {
        lock(&self.inner.central).scan.is_some()
    }

    // ------------------------------------------------------------------------
    // Local GATT server
    // ------------------------------------------------------------------------

    pub fn central_connects(&self, central: Address) -> BleResult<()> {
        self.inner.send_event(PeripheralEvent::CentralConnected(central))
    }

    pub fn central_disconnects(&self, central: Address) -> BleResult<()> {
        self.inner.send_event(PeripheralEvent::CentralDisconnected(central))
    }

    /// Issue a read from a remote central and wait for the answer
    pub async fn remote_read(
        &self,
        central: Address,
        service: BleUuid,
        characteristic: BleUuid,
    ) -> BleResult<Vec<u8>> {
        let (responder, answer) = oneshot::channel();
        self.inner.send_event(PeripheralEvent::ReadRequest {
            central,
            service,
            characteristic,
            responder,
        })?;
        answer
            .await
            .map_err(|_| BleError::new(ErrorCode::READ_FAILED, "read request was dropped"))?
    }

    /// Issue a write with response from a remote central
    pub async fn remote_write(
        &self,
        central: Address,
        service: BleUuid,
        characteristic: BleUuid,
        value: impl Into<Vec<u8>>,
    ) -> BleResult<()> {
        let (responder, answer) = oneshot::channel();
        self.inner.send_event(PeripheralEvent::WriteRequest {
            central,
            service,
            characteristic,
            value: value.into(),
            responder: Some(responder),
        })?;
        answer
            .await
            .map_err(|_| BleError::new(ErrorCode::WRITE_FAILED, "write request was dropped"))?
    }

    /// Issue a write without response; nothing comes back
    pub fn remote_write_command(
        &self,
        central: Address,
        service: BleUuid,
        characteristic: BleUuid,
        value: impl Into<Vec<u8>>,
    ) -> BleResult<()> {
        self.inner.send_event(PeripheralEvent::WriteRequest {
            central,
            service,
            characteristic,
            value: value.into(),
            responder: None,
        })
    }

    pub fn remote_subscribe(
        &self,
        central: Address,
        service: BleUuid,
        characteristic: BleUuid,
    ) -> BleResult<()> {
        self.inner.send_event(PeripheralEvent::Subscribed {
            central,
            service,
            characteristic,
        })
    }

    pub fn remote_unsubscribe(
        &self,
        central: Address,
        service: BleUuid,
        characteristic: BleUuid,
    ) -> BleResult<()> {
        self.inner.send_event(PeripheralEvent::Unsubscribed {
            central,
            service,
            characteristic,
        })
    }

    /// Notifications the local server has sent, oldest first
    pub fn notifications(&self) -> Vec<SentNotification> {
        lock(&self.inner.server).notifications.clone()
    }

    /// Payload currently being advertised
    pub fn advertising_payload(&self) -> Option<Vec<u8>> {
        lock(&self.inner.server).advertising.clone()
    }

    /// Services published on the local server
    pub fn local_services(&self) -> Vec<BleUuid> {
        lock(&self.inner.server).services.keys().copied().collect()
    }

    /// Characteristics published under a local service
    pub fn local_characteristics(&self, service: BleUuid) -> Vec<CharacteristicDefinition> {
        lock(&self.inner.server)
            .services
            .get(&service)
            .cloned()
            .unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// Central Driver
// ----------------------------------------------------------------------------

struct SimCentralDriver {
    radio: Arc<RadioInner>,
}

async fn report_loop(
    radio: Weak<RadioInner>,
    period: Duration,
    sink: ScanSink,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(radio) = radio.upgrade() else { break };
                for report in radio.scan_reports() {
                    if sink.send(report).is_err() {
                        return;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl CentralDriver for SimCentralDriver {
    async fn enable(&self) -> BleResult<()> {
        self.radio.enter(SimOp::EnableCentral).await?;
        lock(&self.radio.central).enabled = true;
        Ok(())
    }

    async fn disable(&self) -> BleResult<()> {
        self.radio.enter(SimOp::DisableCentral).await?;
        let scan = {
            let mut central = lock(&self.radio.central);
            central.enabled = false;
            central.scan.take()
        };
        if let Some(scan) = scan {
            scan.cancel();
        }
        self.radio.links.drain();
        Ok(())
    }

    async fn is_enabled(&self) -> bool {
        lock(&self.radio.central).enabled
    }

    async fn start_scan(&self, _params: &ScanParams, sink: ScanSink) -> BleResult<()> {
        self.radio.enter(SimOp::StartScan).await?;
        self.radio.ensure_powered()?;
        let cancel = CancellationToken::new();
        if let Some(previous) = lock(&self.radio.central).scan.replace(cancel.clone()) {
            previous.cancel();
        }
        tokio::spawn(report_loop(
            Arc::downgrade(&self.radio),
            self.radio.config.report_interval,
            sink,
            cancel,
        ));
        Ok(())
    }

    async fn stop_scan(&self) -> BleResult<()> {
        self.radio.enter(SimOp::StopScan).await?;
        if let Some(scan) = lock(&self.radio.central).scan.take() {
            scan.cancel();
        }
        Ok(())
    }

    async fn connect(
        &self,
        address: &Address,
        _params: &ConnectionParams,
    ) -> BleResult<ConnectedDevice> {
        self.radio.enter(SimOp::Connect).await?;
        self.radio.ensure_powered()?;
        let remote = self.radio.remotes().get(address).cloned().ok_or_else(|| {
            BleError::new(ErrorCode::CONNECTION_FAILED, "device not in range")
                .with_context("target", address)
        })?;
        if !remote.connectable {
            return Err(BleError::new(ErrorCode::CONNECTION_FAILED, "device is not connectable")
                .with_context("target", address));
        }
        let handle = self.radio.links.insert(Link::new(*address));
        debug!("Simulated link {} to {}", handle, address);
        Ok(ConnectedDevice {
            handle: DeviceHandle(handle),
            name: remote.name,
            rssi: Some(remote.rssi),
        })
    }

    async fn disconnect(&self, device: DeviceHandle) -> BleResult<()> {
        self.radio.enter(SimOp::Disconnect).await?;
        self.radio.links.remove(device.0);
        Ok(())
    }

    async fn is_connected(&self, device: DeviceHandle) -> bool {
        self.radio.links.contains(device.0)
    }

    async fn discover_services(
        &self,
        device: DeviceHandle,
        filter: &[BleUuid],
    ) -> BleResult<Vec<ServiceInfo>> {
        self.radio.enter(SimOp::Discover).await?;
        let address = self.radio.link(device)?.address;
        let remote = self.radio.remotes().get(&address).cloned().ok_or_else(|| {
            BleError::new(ErrorCode::DISCOVERY_FAILED, "device went out of range")
                .with_context("target", address)
        })?;

        let radio = &self.radio;
        let services = radio
            .links
            .with(device.0, |link| {
                let mut handle_for = |attribute: AttributeRef| match link.handle_of(attribute) {
                    Some(handle) => handle,
                    None => {
                        let handle =
                            AttributeHandle(radio.next_attribute.fetch_add(1, Ordering::Relaxed));
                        link.attributes.insert(handle, attribute);
                        handle
                    }
                };

                let mut services = Vec::new();
                for service in &remote.services {
                    if !filter.is_empty() && !filter.contains(&service.uuid) {
                        continue;
                    }
                    let mut characteristics = Vec::new();
                    for c in &service.characteristics {
                        let handle = handle_for(AttributeRef {
                            service: service.uuid,
                            characteristic: c.uuid,
                            descriptor: None,
                        });
                        let mut descriptors = Vec::new();
                        for (uuid, _) in &c.descriptors {
                            descriptors.push(DescriptorInfo {
                                handle: handle_for(AttributeRef {
                                    service: service.uuid,
                                    characteristic: c.uuid,
                                    descriptor: Some(*uuid),
                                }),
                                uuid: *uuid,
                            });
                        }
                        characteristics.push(CharacteristicInfo {
                            handle,
                            uuid: c.uuid,
                            properties: c.properties,
                            descriptors,
                        });
                    }
                    services.push(ServiceInfo {
                        uuid: service.uuid,
                        primary: service.primary,
                        characteristics,
                    });
                }
                services
            })
            .ok_or_else(|| BleError::not_connected(address))?;
        Ok(services)
    }

    async fn read(
        &self,
        device: DeviceHandle,
        characteristic: AttributeHandle,
    ) -> BleResult<Vec<u8>> {
        self.radio.enter(SimOp::Read).await?;
        let (address, attribute) = self.radio.attribute(device, characteristic)?;
        let mut remotes = self.radio.remotes();
        remotes
            .get_mut(&address)
            .and_then(|p| p.characteristic_mut(attribute.service, attribute.characteristic))
            .map(|c| c.value.clone())
            .ok_or_else(|| BleError::new(ErrorCode::READ_FAILED, "device went out of range"))
    }

    async fn write(
        &self,
        device: DeviceHandle,
        characteristic: AttributeHandle,
        value: &[u8],
        _write_type: WriteType,
    ) -> BleResult<()> {
        self.radio.enter(SimOp::Write).await?;
        let (address, attribute) = self.radio.attribute(device, characteristic)?;
        let mut remotes = self.radio.remotes();
        let target = remotes
            .get_mut(&address)
            .and_then(|p| p.characteristic_mut(attribute.service, attribute.characteristic))
            .ok_or_else(|| BleError::new(ErrorCode::WRITE_FAILED, "device went out of range"))?;
        target.value = value.to_vec();
        Ok(())
    }

    async fn subscribe(
        &self,
        device: DeviceHandle,
        characteristic: AttributeHandle,
        sink: NotificationSink,
    ) -> BleResult<()> {
        self.radio.enter(SimOp::Subscribe).await?;
        self.radio.attribute(device, characteristic)?;
        self.radio
            .links
            .with(device.0, |link| link.subscriptions.insert(characteristic, sink))
            .ok_or_else(|| BleError::not_connected(format!("handle {}", device.0)))?;
        Ok(())
    }

    async fn unsubscribe(
        &self,
        device: DeviceHandle,
        characteristic: AttributeHandle,
    ) -> BleResult<()> {
        self.radio.enter(SimOp::Unsubscribe).await?;
        if lock(&self.radio.faults).sticky_subscriptions {
            return Ok(());
        }
        self.radio
            .links
            .with(device.0, |link| link.subscriptions.remove(&characteristic))
            .ok_or_else(|| BleError::not_connected(format!("handle {}", device.0)))?;
        Ok(())
    }

    async fn read_descriptor(
        &self,
        device: DeviceHandle,
        descriptor: AttributeHandle,
    ) -> BleResult<Vec<u8>> {
        self.radio.enter(SimOp::ReadDescriptor).await?;
        let (address, attribute) = self.radio.attribute(device, descriptor)?;
        let uuid = attribute.descriptor.ok_or_else(|| {
            BleError::new(ErrorCode::DESCRIPTOR_NOT_FOUND, "handle is not a descriptor")
        })?;
        let mut remotes = self.radio.remotes();
        remotes
            .get_mut(&address)
            .and_then(|p| p.characteristic_mut(attribute.service, attribute.characteristic))
            .and_then(|c| c.descriptors.iter().find(|(d, _)| *d == uuid))
            .map(|(_, value)| value.clone())
            .ok_or_else(|| BleError::new(ErrorCode::DESCRIPTOR_NOT_FOUND, "descriptor not found"))
    }

    async fn write_descriptor(
        &self,
        device: DeviceHandle,
        descriptor: AttributeHandle,
        value: &[u8],
    ) -> BleResult<()> {
        self.radio.enter(SimOp::WriteDescriptor).await?;
        let (address, attribute) = self.radio.attribute(device, descriptor)?;
        let uuid = attribute.descriptor.ok_or_else(|| {
            BleError::new(ErrorCode::DESCRIPTOR_NOT_FOUND, "handle is not a descriptor")
        })?;
        let mut remotes = self.radio.remotes();
        let slot = remotes
            .get_mut(&address)
            .and_then(|p| p.characteristic_mut(attribute.service, attribute.characteristic))
            .and_then(|c| c.descriptors.iter_mut().find(|(d, _)| *d == uuid))
            .ok_or_else(|| BleError::new(ErrorCode::DESCRIPTOR_NOT_FOUND, "descriptor not found"))?;
        slot.1 = value.to_vec();
        Ok(())
    }

    async fn read_rssi(&self, device: DeviceHandle) -> BleResult<i16> {
        self.radio.enter(SimOp::ReadRssi).await?;
        let address = self.radio.link(device)?.address;
        self.radio
            .remotes()
            .get(&address)
            .map(|p| p.rssi)
            .ok_or_else(|| BleError::new(ErrorCode::CONNECTION_LOST, "device went out of range"))
    }

    async fn mtu(&self, device: DeviceHandle) -> BleResult<u16> {
        self.radio.link(device)?;
        Ok(self.radio.config.mtu)
    }
}

// ----------------------------------------------------------------------------
// Peripheral Driver
// ----------------------------------------------------------------------------

struct SimPeripheralDriver {
    radio: Arc<RadioInner>,
}

impl SimPeripheralDriver {
    fn server(&self) -> MutexGuard<'_, LocalServer> {
        lock(&self.radio.server)
    }

    fn ensure_enabled(&self) -> BleResult<()> {
        if self.server().events.is_some() {
            Ok(())
        } else {
            Err(BleError::new(ErrorCode::ADAPTER_DISABLED, "peripheral role is not enabled"))
        }
    }
}

#[async_trait]
impl PeripheralDriver for SimPeripheralDriver {
    async fn enable(&self, events: PeripheralEventSink) -> BleResult<()> {
        self.radio.enter(SimOp::EnablePeripheral).await?;
        self.server().events = Some(events);
        Ok(())
    }

    async fn disable(&self) -> BleResult<()> {
        self.radio.enter(SimOp::DisablePeripheral).await?;
        let mut server = self.server();
        server.events = None;
        server.advertising = None;
        Ok(())
    }

    async fn is_enabled(&self) -> bool {
        self.server().events.is_some()
    }

    async fn add_service(&self, uuid: BleUuid, _primary: bool) -> BleResult<()> {
        self.radio.enter(SimOp::AddService).await?;
        self.ensure_enabled()?;
        self.server().services.entry(uuid).or_default();
        Ok(())
    }

    async fn add_characteristic(
        &self,
        service: BleUuid,
        definition: &CharacteristicDefinition,
    ) -> BleResult<()> {
        self.radio.enter(SimOp::AddCharacteristic).await?;
        let mut server = self.server();
        let characteristics = server.services.get_mut(&service).ok_or_else(|| {
            BleError::new(ErrorCode::SERVICE_NOT_FOUND, "service not registered")
                .with_context("target", service)
        })?;
        characteristics.push(definition.clone());
        Ok(())
    }

    async fn remove_service(&self, uuid: BleUuid) -> BleResult<()> {
        self.radio.enter(SimOp::RemoveService).await?;
        self.server().services.remove(&uuid);
        Ok(())
    }

    async fn start_advertising(
        &self,
        _params: &AdvertisingParams,
        payload: &[u8],
    ) -> BleResult<()> {
        self.radio.enter(SimOp::StartAdvertising).await?;
        self.ensure_enabled()?;
        self.server().advertising = Some(payload.to_vec());
        Ok(())
    }

    async fn stop_advertising(&self) -> BleResult<()> {
        self.radio.enter(SimOp::StopAdvertising).await?;
        self.server().advertising = None;
        Ok(())
    }

    async fn send_notification(
        &self,
        service: BleUuid,
        characteristic: BleUuid,
        value: &[u8],
        indicate: bool,
    ) -> BleResult<()> {
        self.radio.enter(SimOp::Notify).await?;
        self.ensure_enabled()?;
        self.server().notifications.push(SentNotification {
            service,
            characteristic,
            value: value.to_vec(),
            indicate,
        });
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Platform
// ----------------------------------------------------------------------------

/// Platform backed by a single [`SimRadio`]
pub struct SimulatedPlatform {
    radio: SimRadio,
    adapter: AdapterInfo,
}

impl Default for SimulatedPlatform {
    fn default() -> Self {
        Self::new(SimRadio::default())
    }
}

impl SimulatedPlatform {
    pub fn new(radio: SimRadio) -> Self {
        Self {
            radio,
            adapter: AdapterInfo {
                id: "sim0".to_string(),
                name: "Simulated radio".to_string(),
                address: None,
            },
        }
    }

    pub fn radio(&self) -> &SimRadio {
        &self.radio
    }

    fn check_adapter(&self, adapter: &AdapterInfo) -> BleResult<()> {
        if adapter.id == self.adapter.id {
            Ok(())
        } else {
            Err(BleError::new(ErrorCode::ADAPTER_NOT_AVAILABLE, "unknown adapter")
                .with_context("target", &adapter.id))
        }
    }
}

#[async_trait]
impl Platform for SimulatedPlatform {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn adapters(&self) -> BleResult<Vec<AdapterInfo>> {
        Ok(vec![self.adapter.clone()])
    }

    async fn central_driver(&self, adapter: &AdapterInfo) -> BleResult<Arc<dyn CentralDriver>> {
        self.check_adapter(adapter)?;
        Ok(self.radio.central_driver())
    }

    async fn peripheral_driver(
        &self,
        adapter: &AdapterInfo,
    ) -> BleResult<Arc<dyn PeripheralDriver>> {
        self.check_adapter(adapter)?;
        Ok(self.radio.peripheral_driver())
    }
}
