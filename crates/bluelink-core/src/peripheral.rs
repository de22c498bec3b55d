//! Peripheral (server role) orchestrator
//!
//! Publishes local services and characteristics, answers remote reads and
//! writes, pushes notifications and runs advertisements. Native events arrive
//! on a channel and are dispatched by a dedicated pump task; hooks and
//! connect/disconnect handlers always run with no orchestrator lock held.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::advertisement::AdvertisingData;
use crate::config::{PeripheralConfig, MAX_ATTRIBUTE_LEN};
use crate::driver::{CharacteristicDefinition, PeripheralDriver, PeripheralEvent};
use crate::error::{BleError, BleResult, ErrorCode, ValidationError};
use crate::gatt::{is_discouraged, validate_properties, CharacteristicProperties};
use crate::params::AdvertisingParams;
use crate::resource::{AdvertiserResource, Resource, ResourceManager};
use crate::session::{SessionGuard, SessionHandle, SessionOwner, SessionSlot};
use crate::sync::lock;
use crate::types::{Address, BleUuid};

/// Invoked with the remote central's address
pub type CentralHandler = Arc<dyn Fn(Address) + Send + Sync>;

/// Produces the value returned to a remote read
pub type ReadHook = Arc<dyn Fn(Address) -> BleResult<Vec<u8>> + Send + Sync>;

/// Accepts or rejects a remote write before it is stored
pub type WriteHook = Arc<dyn Fn(Address, &[u8]) -> BleResult<()> + Send + Sync>;

pub type SubscriptionHook = Arc<dyn Fn(Address) + Send + Sync>;

/// How long `stop_advertising` waits for the session to wind down
const STOP_GRACE: Duration = Duration::from_secs(1);

// ----------------------------------------------------------------------------
// Peripheral
// ----------------------------------------------------------------------------

#[derive(Default)]
struct PeripheralState {
    services: BTreeMap<BleUuid, PeripheralService>,
    centrals: BTreeSet<Address>,
    on_connect: Vec<CentralHandler>,
    on_disconnect: Vec<CentralHandler>,
    pump: Option<CancellationToken>,
}

struct PeripheralInner {
    adapter_id: String,
    driver: Arc<dyn PeripheralDriver>,
    resources: ResourceManager,
    config: PeripheralConfig,
    advertising: SessionSlot,
    state: Mutex<PeripheralState>,
}

impl PeripheralInner {
    fn state(&self) -> MutexGuard<'_, PeripheralState> {
        lock(&self.state)
    }

    fn find(
        &self,
        service: BleUuid,
        characteristic: BleUuid,
    ) -> BleResult<PeripheralCharacteristic> {
        let service = self.state().services.get(&service).cloned().ok_or_else(|| {
            BleError::new(ErrorCode::SERVICE_NOT_FOUND, "service not published")
                .with_context("target", service)
        })?;
        service.characteristic(characteristic).ok_or_else(|| {
            BleError::new(ErrorCode::CHARACTERISTIC_NOT_FOUND, "characteristic not published")
                .with_context("target", characteristic)
        })
    }

    fn dispatch(&self, event: PeripheralEvent) {
        match event {
            PeripheralEvent::CentralConnected(central) => {
                let handlers = {
                    let mut state = self.state();
                    state.centrals.insert(central);
                    state.on_connect.clone()
                };
                info!("Central {} connected", central);
                for handler in handlers {
                    handler(central);
                }
            }
            PeripheralEvent::CentralDisconnected(central) => {
                let (handlers, services) = {
                    let mut state = self.state();
                    state.centrals.remove(&central);
                    let services: Vec<PeripheralService> =
                        state.services.values().cloned().collect();
                    (state.on_disconnect.clone(), services)
                };
                for service in services {
                    for characteristic in service.characteristics() {
                        lock(&characteristic.inner.subscribers).remove(&central);
                    }
                }
                info!("Central {} disconnected", central);
                for handler in handlers {
                    handler(central);
                }
            }
            PeripheralEvent::ReadRequest {
                central,
                service,
                characteristic,
                responder,
            } => {
                let result = self
                    .find(service, characteristic)
                    .and_then(|c| c.answer_read(central));
                if responder.send(result).is_err() {
                    debug!("Read requester for {} went away", characteristic);
                }
            }
            PeripheralEvent::WriteRequest {
                central,
                service,
                characteristic,
                value,
                responder,
            } => {
                let result = self
                    .find(service, characteristic)
                    .and_then(|c| c.accept_write(central, value));
                match responder {
                    Some(responder) => {
                        if responder.send(result).is_err() {
                            debug!("Write requester for {} went away", characteristic);
                        }
                    }
                    None => {
                        if let Err(err) = result {
                            debug!("Dropped write without response: {}", err);
                        }
                    }
                }
            }
            PeripheralEvent::Subscribed {
                central,
                service,
                characteristic,
            } => match self.find(service, characteristic) {
                Ok(c) => c.add_subscriber(central),
                Err(err) => warn!("Subscription from {} rejected: {}", central, err),
            },
            PeripheralEvent::Unsubscribed {
                central,
                service,
                characteristic,
            } => {
                if let Ok(c) = self.find(service, characteristic) {
                    c.remove_subscriber(central);
                }
            }
        }
    }
}

async fn event_pump(
    peripheral: Weak<PeripheralInner>,
    mut events: mpsc::UnboundedReceiver<PeripheralEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                let Some(inner) = peripheral.upgrade() else { break };
                inner.dispatch(event);
            }
        }
    }
    debug!("Peripheral event pump exited");
}

/// Server-role handle for one adapter. Cheap to clone.
#[derive(Clone)]
pub struct Peripheral {
    inner: Arc<PeripheralInner>,
}

/// Non-owning handle held by the advertiser resource
#[derive(Clone)]
pub(crate) struct WeakPeripheral(Weak<PeripheralInner>);

impl WeakPeripheral {
    pub(crate) fn upgrade(&self) -> Option<Peripheral> {
        self.0.upgrade().map(|inner| Peripheral { inner })
    }
}

impl fmt::Debug for Peripheral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state();
        f.debug_struct("Peripheral")
            .field("adapter", &self.inner.adapter_id)
            .field("services", &state.services.len())
            .field("centrals", &state.centrals.len())
            .field("advertising", &self.inner.advertising.is_active())
            .finish()
    }
}

impl Peripheral {
    pub fn new(
        adapter_id: impl Into<String>,
        driver: Arc<dyn PeripheralDriver>,
        resources: ResourceManager,
        config: PeripheralConfig,
    ) -> Self {
        Self {
            inner: Arc::new(PeripheralInner {
                adapter_id: adapter_id.into(),
                driver,
                resources,
                config,
                advertising: SessionSlot::new(),
                state: Mutex::new(PeripheralState::default()),
            }),
        }
    }

    pub fn adapter_id(&self) -> &str {
        &self.inner.adapter_id
    }

    pub(crate) fn downgrade(&self) -> WeakPeripheral {
        WeakPeripheral(Arc::downgrade(&self.inner))
    }

    fn advertiser_resource_id(&self) -> String {
        format!("adv-{}", self.inner.adapter_id)
    }

    // ------------------------------------------------------------------------
    // Power
    // ------------------------------------------------------------------------

    /// Power up the server role and start dispatching native events.
    /// Enabling an enabled peripheral is a no-op.
    pub async fn enable(&self) -> BleResult<()> {
        let pumping = self.inner.state().pump.is_some();
        if pumping && self.inner.driver.is_enabled().await {
            debug!("Peripheral {} already enabled", self.inner.adapter_id);
            return Ok(());
        }

        let (events, receiver) = mpsc::unbounded_channel();
        self.inner.driver.enable(events).await.map_err(|err| {
            BleError::from_driver(
                err,
                ErrorCode::ADAPTER_ENABLE_FAILED,
                "enable",
                &self.inner.adapter_id,
            )
        })?;

        let cancel = CancellationToken::new();
        if let Some(previous) = self.inner.state().pump.replace(cancel.clone()) {
            previous.cancel();
        }
        tokio::spawn(event_pump(Arc::downgrade(&self.inner), receiver, cancel));
        info!("Peripheral {} enabled", self.inner.adapter_id);
        Ok(())
    }

    /// Stop advertising, stop event dispatch and power down. Disabling a
    /// disabled peripheral is a no-op.
    pub async fn disable(&self) -> BleResult<()> {
        if !self.inner.driver.is_enabled().await {
            return Ok(());
        }
        if let Err(err) = self.stop_advertising().await {
            warn!("Stopping advertisement before disable failed: {}", err);
        }
        let pump = self.inner.state().pump.take();
        if let Some(pump) = pump {
            pump.cancel();
        }
        self.inner.driver.disable().await.map_err(|err| {
            BleError::from_driver(
                err,
                ErrorCode::ADAPTER_DISABLE_FAILED,
                "disable",
                &self.inner.adapter_id,
            )
        })?;
        self.inner.state().centrals.clear();
        info!("Peripheral {} disabled", self.inner.adapter_id);
        Ok(())
    }

    pub async fn is_enabled(&self) -> bool {
        self.inner.driver.is_enabled().await
    }

    // ------------------------------------------------------------------------
    // Services
    // ------------------------------------------------------------------------

    pub async fn add_service(&self, uuid: BleUuid, primary: bool) -> BleResult<PeripheralService> {
        if self.inner.state().services.contains_key(&uuid) {
            return Err(BleError::invalid_operation("service already published")
                .with_context("target", uuid));
        }
        self.inner
            .driver
            .add_service(uuid, primary)
            .await
            .map_err(|err| {
                BleError::from_driver(
                    err,
                    ErrorCode::SERVICE_REGISTRATION_FAILED,
                    "add service",
                    uuid,
                )
            })?;

        let service = PeripheralService {
            inner: Arc::new(ServiceInner {
                uuid,
                primary,
                peripheral: Arc::downgrade(&self.inner),
                removed: AtomicBool::new(false),
                characteristics: Mutex::new(BTreeMap::new()),
            }),
        };
        self.inner.state().services.insert(uuid, service.clone());
        info!("Published service {}", uuid);
        Ok(service)
    }

    pub async fn remove_service(&self, uuid: BleUuid) -> BleResult<()> {
        let service = self.inner.state().services.remove(&uuid).ok_or_else(|| {
            BleError::new(ErrorCode::SERVICE_NOT_FOUND, "service not published")
                .with_context("target", uuid)
        })?;
        service.inner.removed.store(true, Ordering::Release);
        self.inner
            .driver
            .remove_service(uuid)
            .await
            .map_err(|err| {
                BleError::from_driver(
                    err,
                    ErrorCode::SERVICE_REGISTRATION_FAILED,
                    "remove service",
                    uuid,
                )
            })?;
        info!("Removed service {}", uuid);
        Ok(())
    }

    pub fn service(&self, uuid: BleUuid) -> Option<PeripheralService> {
        self.inner.state().services.get(&uuid).cloned()
    }

    pub fn services(&self) -> Vec<PeripheralService> {
        self.inner.state().services.values().cloned().collect()
    }

    // ------------------------------------------------------------------------
    // Advertising
    // ------------------------------------------------------------------------

    /// Advertise `data` until the timeout elapses, [`Peripheral::stop_advertising`]
    /// is called or `cancel` fires.
    ///
    /// Only one advertisement runs per Peripheral. The payload is encoded and
    /// size-checked before the driver is touched, and the native stop runs on
    /// every exit path once advertising was requested.
    pub async fn start_advertising(
        &self,
        cancel: &CancellationToken,
        params: &AdvertisingParams,
        data: &AdvertisingData,
    ) -> BleResult<()> {
        params.validate()?;
        let payload = data.encode()?;
        if !self.inner.driver.is_enabled().await {
            return Err(BleError::new(ErrorCode::ADAPTER_DISABLED, "adapter is disabled")
                .with_context("adapter", &self.inner.adapter_id));
        }

        let handle = self.inner.advertising.try_begin().ok_or_else(|| {
            BleError::resource_busy("advertising already in progress")
                .with_context("adapter", &self.inner.adapter_id)
        })?;
        let mut session = SessionGuard::new(self.clone(), handle.clone());

        let resource: Arc<dyn Resource> = Arc::new(AdvertiserResource::new(
            self.advertiser_resource_id(),
            self.downgrade(),
        ));
        if let Err(err) = self.inner.resources.register(resource.clone()) {
            if let Err(stop_err) = session.finish().await {
                debug!("Release after failed advertiser registration: {}", stop_err);
            }
            return Err(err);
        }
        session.registered(resource);

        session.native_started();
        if let Err(err) = self.inner.driver.start_advertising(params, &payload).await {
            if let Err(stop_err) = session.finish().await {
                debug!("Stop after failed advertising start: {}", stop_err);
            }
            return Err(BleError::from_driver(
                err,
                ErrorCode::ADVERTISING_FAILED,
                "start advertising",
                &self.inner.adapter_id,
            ));
        }
        info!(
            "Advertising on {} ({} bytes, timeout {:?})",
            self.inner.adapter_id,
            payload.len(),
            params.timeout
        );

        let deadline = async {
            match params.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BleError::cancelled("advertise")),
            _ = handle.stop.cancelled() => Ok(()),
            _ = deadline => Ok(()),
        };

        let stopped = session.finish().await;
        info!("Advertising on {} ended", self.inner.adapter_id);
        outcome.and(stopped)
    }

    /// End the active advertisement and wait for its native stop. A no-op
    /// when not advertising.
    pub async fn stop_advertising(&self) -> BleResult<()> {
        let Some(handle) = self.inner.advertising.current() else {
            return Ok(());
        };
        if handle.stop_and_wait(STOP_GRACE).await {
            return Ok(());
        }
        warn!(
            "Advertisement on {} did not wind down in time; stopping natively",
            self.inner.adapter_id
        );
        self.stop_native().await
    }

    pub fn is_advertising(&self) -> bool {
        self.inner.advertising.is_active()
    }

    // ------------------------------------------------------------------------
    // Remote centrals
    // ------------------------------------------------------------------------

    /// Add a handler for incoming connections; handlers accumulate
    pub fn on_connect<F>(&self, handler: F)
    where
        F: Fn(Address) + Send + Sync + 'static,
    {
        self.inner.state().on_connect.push(Arc::new(handler));
    }

    /// Add a handler for remote disconnects; handlers accumulate
    pub fn on_disconnect<F>(&self, handler: F)
    where
        F: Fn(Address) + Send + Sync + 'static,
    {
        self.inner.state().on_disconnect.push(Arc::new(handler));
    }

    /// Snapshot of the centrals currently connected to this peripheral
    pub fn connected_centrals(&self) -> Vec<Address> {
        self.inner.state().centrals.iter().copied().collect()
    }
}

#[async_trait]
impl SessionOwner for Peripheral {
    async fn stop_native(&self) -> BleResult<()> {
        self.inner.driver.stop_advertising().await.map_err(|err| {
            BleError::from_driver(
                err,
                ErrorCode::ADVERTISING_FAILED,
                "stop advertising",
                &self.inner.adapter_id,
            )
        })
    }

    fn release_session(&self, handle: &SessionHandle, registered: Option<&Arc<dyn Resource>>) {
        if let Some(resource) = registered {
            self.inner.resources.remove_registered(resource);
        }
        self.inner.advertising.release(handle);
    }
}

// ----------------------------------------------------------------------------
// Peripheral Service
// ----------------------------------------------------------------------------

struct ServiceInner {
    uuid: BleUuid,
    primary: bool,
    peripheral: Weak<PeripheralInner>,
    removed: AtomicBool,
    characteristics: Mutex<BTreeMap<BleUuid, PeripheralCharacteristic>>,
}

/// A locally published service
#[derive(Clone)]
pub struct PeripheralService {
    inner: Arc<ServiceInner>,
}

impl fmt::Debug for PeripheralService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeripheralService")
            .field("uuid", &self.inner.uuid)
            .field("primary", &self.inner.primary)
            .finish()
    }
}

impl PeripheralService {
    pub fn uuid(&self) -> BleUuid {
        self.inner.uuid
    }

    pub fn is_primary(&self) -> bool {
        self.inner.primary
    }

    pub fn characteristics(&self) -> Vec<PeripheralCharacteristic> {
        lock(&self.inner.characteristics).values().cloned().collect()
    }

    pub fn characteristic(&self, uuid: BleUuid) -> Option<PeripheralCharacteristic> {
        lock(&self.inner.characteristics).get(&uuid).cloned()
    }

    fn peripheral(&self) -> BleResult<Arc<PeripheralInner>> {
        if self.inner.removed.load(Ordering::Acquire) {
            return Err(BleError::new(ErrorCode::SERVICE_NOT_FOUND, "service was removed")
                .with_context("target", self.inner.uuid));
        }
        self.inner.peripheral.upgrade().ok_or_else(|| {
            BleError::new(ErrorCode::ADAPTER_NOT_AVAILABLE, "peripheral released")
                .with_context("target", self.inner.uuid)
        })
    }

    /// Publish a characteristic.
    ///
    /// Invalid property combinations (broadcast together with write, or no
    /// properties at all) fail with [`ErrorCode::INVALID_PROPERTIES`] before
    /// the driver is called.
    pub async fn add_characteristic(
        &self,
        uuid: BleUuid,
        properties: CharacteristicProperties,
        initial_value: impl Into<Vec<u8>>,
    ) -> BleResult<PeripheralCharacteristic> {
        validate_properties(properties).map_err(|err| {
            BleError::new(ErrorCode::INVALID_PROPERTIES, err.to_string())
                .with_context("parameter", &err.parameter)
                .with_context("target", uuid)
                .with_cause(err)
        })?;
        if is_discouraged(properties) {
            warn!(
                "Characteristic {} sets both notify and indicate; notifications will be used",
                uuid
            );
        }
        let initial_value = initial_value.into();
        if initial_value.len() > MAX_ATTRIBUTE_LEN {
            return Err(ValidationError::new(
                "initial value",
                initial_value.len(),
                format!("must be at most {} bytes", MAX_ATTRIBUTE_LEN),
            )
            .into());
        }

        let peripheral = self.peripheral()?;
        if lock(&self.inner.characteristics).contains_key(&uuid) {
            return Err(BleError::invalid_operation("characteristic already published")
                .with_context("target", uuid));
        }

        let definition = CharacteristicDefinition {
            uuid,
            properties,
            initial_value: initial_value.clone(),
        };
        peripheral
            .driver
            .add_characteristic(self.inner.uuid, &definition)
            .await
            .map_err(|err| {
                BleError::from_driver(
                    err,
                    ErrorCode::SERVICE_REGISTRATION_FAILED,
                    "add characteristic",
                    uuid,
                )
            })?;

        let characteristic = PeripheralCharacteristic {
            inner: Arc::new(CharacteristicInner {
                uuid,
                properties,
                service: Arc::downgrade(&self.inner),
                value: Mutex::new(initial_value),
                hooks: Mutex::new(Hooks::default()),
                subscribers: Mutex::new(BTreeSet::new()),
            }),
        };
        lock(&self.inner.characteristics).insert(uuid, characteristic.clone());
        debug!("Published characteristic {} in {}", uuid, self.inner.uuid);
        Ok(characteristic)
    }
}

// ----------------------------------------------------------------------------
// Peripheral Characteristic
// ----------------------------------------------------------------------------

#[derive(Default, Clone)]
struct Hooks {
    on_read: Option<ReadHook>,
    on_write: Option<WriteHook>,
    on_subscribe: Option<SubscriptionHook>,
    on_unsubscribe: Option<SubscriptionHook>,
}

struct CharacteristicInner {
    uuid: BleUuid,
    properties: CharacteristicProperties,
    service: Weak<ServiceInner>,
    value: Mutex<Vec<u8>>,
    hooks: Mutex<Hooks>,
    subscribers: Mutex<BTreeSet<Address>>,
}

/// A locally published characteristic holding its current value
#[derive(Clone)]
pub struct PeripheralCharacteristic {
    inner: Arc<CharacteristicInner>,
}

impl fmt::Debug for PeripheralCharacteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeripheralCharacteristic")
            .field("uuid", &self.inner.uuid)
            .field("properties", &self.inner.properties)
            .field("value", &hex::encode(self.value()))
            .finish()
    }
}

impl PeripheralCharacteristic {
    pub fn uuid(&self) -> BleUuid {
        self.inner.uuid
    }

    pub fn properties(&self) -> CharacteristicProperties {
        self.inner.properties
    }

    pub fn value(&self) -> Vec<u8> {
        lock(&self.inner.value).clone()
    }

    /// Replace the stored value without notifying anyone
    pub fn set_value(&self, value: impl Into<Vec<u8>>) {
        *lock(&self.inner.value) = value.into();
    }

    /// Centrals currently subscribed
    pub fn subscribers(&self) -> Vec<Address> {
        lock(&self.inner.subscribers).iter().copied().collect()
    }

    pub fn on_read<F>(&self, hook: F)
    where
        F: Fn(Address) -> BleResult<Vec<u8>> + Send + Sync + 'static,
    {
        lock(&self.inner.hooks).on_read = Some(Arc::new(hook));
    }

    pub fn on_write<F>(&self, hook: F)
    where
        F: Fn(Address, &[u8]) -> BleResult<()> + Send + Sync + 'static,
    {
        lock(&self.inner.hooks).on_write = Some(Arc::new(hook));
    }

    pub fn on_subscribe<F>(&self, hook: F)
    where
        F: Fn(Address) + Send + Sync + 'static,
    {
        lock(&self.inner.hooks).on_subscribe = Some(Arc::new(hook));
    }

    pub fn on_unsubscribe<F>(&self, hook: F)
    where
        F: Fn(Address) + Send + Sync + 'static,
    {
        lock(&self.inner.hooks).on_unsubscribe = Some(Arc::new(hook));
    }

    fn hooks(&self) -> Hooks {
        lock(&self.inner.hooks).clone()
    }

    /// Store `data` and push it to every subscribed central
    pub async fn notify_subscribers(&self, data: &[u8]) -> BleResult<()> {
        let properties = self.inner.properties;
        let notifying = CharacteristicProperties::NOTIFY | CharacteristicProperties::INDICATE;
        if !properties.intersects(notifying) {
            return Err(BleError::not_supported("characteristic does not support notify")
                .with_context("operation", "notify")
                .with_context("target", self.inner.uuid));
        }

        let service = self.inner.service.upgrade().ok_or_else(|| {
            BleError::new(ErrorCode::SERVICE_NOT_FOUND, "service released")
                .with_context("target", self.inner.uuid)
        })?;
        let service = PeripheralService { inner: service };
        let peripheral = service.peripheral()?;

        let max = peripheral.config.max_notification_len;
        if data.len() > max {
            return Err(BleError::new(ErrorCode::VALUE_TOO_LONG, "notification payload too long")
                .with_context("target", self.inner.uuid)
                .with_context("len", data.len())
                .with_context("max", max));
        }

        self.set_value(data);
        if lock(&self.inner.subscribers).is_empty() {
            debug!("No subscribers for {}; value stored only", self.inner.uuid);
            return Ok(());
        }

        let indicate = !properties.contains(CharacteristicProperties::NOTIFY);
        peripheral
            .driver
            .send_notification(service.uuid(), self.inner.uuid, data, indicate)
            .await
            .map_err(|err| {
                BleError::from_driver(err, ErrorCode::NOTIFY_FAILED, "notify", self.inner.uuid)
            })
    }

    fn answer_read(&self, central: Address) -> BleResult<Vec<u8>> {
        if !self.inner.properties.contains(CharacteristicProperties::READ) {
            return Err(BleError::not_supported("characteristic is not readable")
                .with_context("target", self.inner.uuid));
        }
        match self.hooks().on_read {
            Some(hook) => hook(central),
            None => Ok(self.value()),
        }
    }

    /// The write hook may reject the value; accepted values are stored
    fn accept_write(&self, central: Address, value: Vec<u8>) -> BleResult<()> {
        let writable =
            CharacteristicProperties::WRITE | CharacteristicProperties::WRITE_WITHOUT_RESPONSE;
        if !self.inner.properties.intersects(writable) {
            return Err(BleError::not_supported("characteristic is not writable")
                .with_context("target", self.inner.uuid));
        }
        if value.len() > MAX_ATTRIBUTE_LEN {
            return Err(BleError::new(ErrorCode::VALUE_TOO_LONG, "written value too long")
                .with_context("target", self.inner.uuid)
                .with_context("len", value.len()));
        }
        if let Some(hook) = self.hooks().on_write {
            hook(central, &value)?;
        }
        self.set_value(value);
        Ok(())
    }

    fn add_subscriber(&self, central: Address) {
        let added = lock(&self.inner.subscribers).insert(central);
        if !added {
            return;
        }
        debug!("{} subscribed to {}", central, self.inner.uuid);
        if let Some(hook) = self.hooks().on_subscribe {
            hook(central);
        }
    }

    fn remove_subscriber(&self, central: Address) {
        let removed = lock(&self.inner.subscribers).remove(&central);
        if !removed {
            return;
        }
        debug!("{} unsubscribed from {}", central, self.inner.uuid);
        if let Some(hook) = self.hooks().on_unsubscribe {
            hook(central);
        }
    }
}
