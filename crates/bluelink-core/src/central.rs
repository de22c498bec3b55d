//! Central (client role) orchestrator
//!
//! State machines:
//!
//! - scanning: `Idle -> Scanning -> Idle`, left on [`Central::stop_scan`],
//!   the scan timeout or cancellation. At most one scan per Central.
//! - per address: `Idle -> Connecting -> Connected -> Disconnected`.
//!
//! Long-lived objects (the scan session, each connection) are registered
//! with the shared [`ResourceManager`] while they exist.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::advertisement::Advertisement;
use crate::config::CentralConfig;
use crate::driver::{CentralDriver, ConnectedDevice};
use crate::error::{BleError, BleResult, ErrorCode};
use crate::gatt::{Device, Service};
use crate::params::{ConnectionParams, ScanParams};
use crate::resource::{ConnectionResource, Resource, ResourceManager, ScannerResource};
use crate::retry::retry_until_cancelled;
use crate::session::{SessionGuard, SessionHandle, SessionOwner, SessionSlot};
use crate::sync::lock;
use crate::types::{Address, BleUuid};

#[derive(Default)]
struct Links {
    devices: HashMap<Address, Device>,
    connecting: HashSet<Address>,
}

struct CentralInner {
    adapter_id: String,
    driver: Arc<dyn CentralDriver>,
    resources: ResourceManager,
    config: CentralConfig,
    scan: SessionSlot,
    links: Mutex<Links>,
}

impl CentralInner {
    fn links(&self) -> MutexGuard<'_, Links> {
        lock(&self.links)
    }
}

/// Client-role handle for one adapter. Cheap to clone.
#[derive(Clone)]
pub struct Central {
    inner: Arc<CentralInner>,
}

/// Non-owning handle held by resources and devices
#[derive(Clone)]
pub(crate) struct WeakCentral(Weak<CentralInner>);

impl WeakCentral {
    pub(crate) fn upgrade(&self) -> Option<Central> {
        self.0.upgrade().map(|inner| Central { inner })
    }
}

impl fmt::Debug for Central {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Central")
            .field("adapter", &self.inner.adapter_id)
            .field("scanning", &self.is_scanning())
            .field("devices", &self.inner.links().devices.len())
            .finish()
    }
}

/// Removes the address from the connecting set however the attempt ends
struct PendingConnect<'a> {
    inner: &'a CentralInner,
    address: Address,
}

impl Drop for PendingConnect<'_> {
    fn drop(&mut self) {
        self.inner.links().connecting.remove(&self.address);
    }
}

impl Central {
    pub fn new(
        adapter_id: impl Into<String>,
        driver: Arc<dyn CentralDriver>,
        resources: ResourceManager,
        config: CentralConfig,
    ) -> Self {
        Self {
            inner: Arc::new(CentralInner {
                adapter_id: adapter_id.into(),
                driver,
                resources,
                config,
                scan: SessionSlot::new(),
                links: Mutex::new(Links::default()),
            }),
        }
    }

    pub fn adapter_id(&self) -> &str {
        &self.inner.adapter_id
    }

    pub(crate) fn downgrade(&self) -> WeakCentral {
        WeakCentral(Arc::downgrade(&self.inner))
    }

    fn scan_resource_id(&self) -> String {
        format!("scan-{}", self.inner.adapter_id)
    }

    // ------------------------------------------------------------------------
    // Power
    // ------------------------------------------------------------------------

    /// Power up the radio. Enabling an enabled adapter is a no-op.
    pub async fn enable(&self) -> BleResult<()> {
        if self.inner.driver.is_enabled().await {
            debug!("Central {} already enabled", self.inner.adapter_id);
            return Ok(());
        }
        self.inner.driver.enable().await.map_err(|err| {
            BleError::from_driver(
                err,
                ErrorCode::ADAPTER_ENABLE_FAILED,
                "enable",
                &self.inner.adapter_id,
            )
        })?;
        info!("Central {} enabled", self.inner.adapter_id);
        Ok(())
    }

    /// Stop any scan, drop every connection and power down. Disabling a
    /// disabled adapter is a no-op.
    pub async fn disable(&self) -> BleResult<()> {
        if !self.inner.driver.is_enabled().await {
            return Ok(());
        }
        if let Err(err) = self.stop_scan().await {
            warn!("Stopping scan before disable failed: {}", err);
        }
        for device in self.connected_devices() {
            if let Err(err) = self.disconnect(&device).await {
                warn!("Disconnecting {} before disable failed: {}", device.address(), err);
            }
        }
        self.inner.driver.disable().await.map_err(|err| {
            BleError::from_driver(
                err,
                ErrorCode::ADAPTER_DISABLE_FAILED,
                "disable",
                &self.inner.adapter_id,
            )
        })?;
        info!("Central {} disabled", self.inner.adapter_id);
        Ok(())
    }

    pub async fn is_enabled(&self) -> bool {
        self.inner.driver.is_enabled().await
    }

    async fn ensure_enabled(&self) -> BleResult<()> {
        if self.inner.driver.is_enabled().await {
            Ok(())
        } else {
            Err(BleError::new(ErrorCode::ADAPTER_DISABLED, "adapter is disabled")
                .with_context("adapter", &self.inner.adapter_id))
        }
    }

    // ------------------------------------------------------------------------
    // Scanning
    // ------------------------------------------------------------------------

    /// Scan until the timeout elapses, [`Central::stop_scan`] is called or
    /// `cancel` fires, invoking `callback` for each matching advertisement.
    ///
    /// Fails with [`ErrorCode::RESOURCE_BUSY`] when a scan is already running,
    /// without touching the driver. Once the native scan has been requested,
    /// the native stop runs on every exit path before this returns.
    /// Cancellation yields [`ErrorCode::OPERATION_CANCELLED`].
    pub async fn scan<F>(
        &self,
        cancel: &CancellationToken,
        params: &ScanParams,
        mut callback: F,
    ) -> BleResult<()>
    where
        F: FnMut(Advertisement) + Send,
    {
        params.validate()?;
        self.ensure_enabled().await?;

        let handle = self.inner.scan.try_begin().ok_or_else(|| {
            BleError::resource_busy("scan already in progress")
                .with_context("adapter", &self.inner.adapter_id)
        })?;
        let mut session = SessionGuard::new(self.clone(), handle.clone());

        let resource: Arc<dyn Resource> =
            Arc::new(ScannerResource::new(self.scan_resource_id(), self.downgrade()));
        if let Err(err) = self.inner.resources.register(resource.clone()) {
            if let Err(stop_err) = session.finish().await {
                debug!("Release after failed scan registration: {}", stop_err);
            }
            return Err(err);
        }
        session.registered(resource);

        let (sink, mut reports) = mpsc::unbounded_channel();
        session.native_started();
        if let Err(err) = self.inner.driver.start_scan(params, sink).await {
            if let Err(stop_err) = session.finish().await {
                debug!("Stop after failed scan start: {}", stop_err);
            }
            return Err(BleError::from_driver(
                err,
                ErrorCode::SCAN_FAILED,
                "start scan",
                &self.inner.adapter_id,
            ));
        }
        info!("Scanning on {} (timeout {:?})", self.inner.adapter_id, params.timeout);

        let deadline = async {
            match params.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        let mut seen = HashSet::new();
        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(BleError::cancelled("scan")),
                _ = handle.stop.cancelled() => break Ok(()),
                _ = &mut deadline => break Ok(()),
                report = reports.recv() => match report {
                    Some(report) => {
                        let advertisement = Advertisement::from_report(&report);
                        if !params.filter.matches(&advertisement) {
                            continue;
                        }
                        if !params.allow_duplicates && !seen.insert(advertisement.address) {
                            continue;
                        }
                        callback(advertisement);
                    }
                    None => {
                        let closed = "driver closed the scan stream";
                        break Err(BleError::new(ErrorCode::SCAN_FAILED, closed)
                            .with_context("adapter", &self.inner.adapter_id));
                    }
                },
            }
        };

        let stopped = session.finish().await;
        info!(
            "Scan on {} ended ({} devices seen)",
            self.inner.adapter_id,
            seen.len()
        );
        outcome.and(stopped)
    }

    /// End the active scan and wait for its native stop. A no-op when idle.
    pub async fn stop_scan(&self) -> BleResult<()> {
        let Some(handle) = self.inner.scan.current() else {
            return Ok(());
        };
        if handle.stop_and_wait(self.inner.config.operation_timeout).await {
            return Ok(());
        }
        warn!(
            "Scan on {} did not wind down in time; stopping natively",
            self.inner.adapter_id
        );
        self.stop_native().await
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.scan.is_active()
    }

    // ------------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------------

    /// Connect to `address` and register the connection.
    ///
    /// Connecting to an address that is already connected returns the existing
    /// [`Device`]. Temporary failures are retried per the configured
    /// `connect_retry` schedule; once it is exhausted the error keeps the
    /// last attempt's classification and records the `attempts` made.
    pub async fn connect(
        &self,
        cancel: &CancellationToken,
        address: &Address,
        params: &ConnectionParams,
    ) -> BleResult<Device> {
        params.validate()?;
        self.ensure_enabled().await?;

        // The known-device check and the claim share one lock acquisition
        loop {
            let existing = {
                let mut guard = self.inner.links();
                let links = &mut *guard;
                match links.devices.get(address) {
                    Some(device) => device.clone(),
                    None if links.connecting.insert(*address) => break,
                    None => {
                        return Err(BleError::resource_busy(
                            "connection attempt already in progress",
                        )
                        .with_context("target", address));
                    }
                }
            };
            if existing.is_connected().await {
                debug!("Already connected to {}", address);
                return Ok(existing);
            }
            debug!("Releasing stale connection to {}", address);
            if let Err(err) = self.disconnect(&existing).await {
                warn!("Releasing stale connection to {} failed: {}", address, err);
            }
            self.forget_device(&existing);
        }
        let _pending = PendingConnect {
            inner: &self.inner,
            address: *address,
        };

        info!("Connecting to {}", address);
        let retry = &self.inner.config.connect_retry;
        let connected = if retry.max_attempts > 1 {
            retry_until_cancelled(cancel, retry, move || self.connect_once(cancel, address, params))
                .await
                .map_err(|err| exhausted_connect(err, address))?
        } else {
            self.connect_once(cancel, address, params).await?
        };

        let device = Device::new(
            *address,
            connected,
            self.inner.driver.clone(),
            self.downgrade(),
            &self.inner.config,
        );
        self.inner.links().devices.insert(*address, device.clone());

        let resource = ConnectionResource::new(device.clone());
        if let Err(err) = self.inner.resources.register(Arc::new(resource)) {
            if let Err(close_err) = device.close().await {
                warn!("Closing unregistered connection to {} failed: {}", address, close_err);
            }
            return Err(err);
        }

        info!("Connected to {}", address);
        Ok(device)
    }

    async fn connect_once(
        &self,
        cancel: &CancellationToken,
        address: &Address,
        params: &ConnectionParams,
    ) -> BleResult<ConnectedDevice> {
        let attempt = tokio::time::timeout(
            params.connect_timeout,
            self.inner.driver.connect(address, params),
        );
        tokio::select! {
            _ = cancel.cancelled() => {
                Err(BleError::cancelled("connect").with_context("target", address))
            }
            result = attempt => match result {
                Ok(Ok(connected)) => Ok(connected),
                Ok(Err(err)) => Err(BleError::from_driver(
                    err,
                    ErrorCode::CONNECTION_FAILED,
                    "connect",
                    address,
                )),
                Err(_) => Err(BleError::new(
                    ErrorCode::CONNECTION_TIMEOUT,
                    "connection attempt timed out",
                )
                .with_context("target", address)
                .with_context("timeout_ms", params.connect_timeout.as_millis())),
            },
        }
    }

    /// Disconnect `device`, releasing its connection resource. Disconnecting a
    /// closed device is a no-op.
    pub async fn disconnect(&self, device: &Device) -> BleResult<()> {
        if !device.is_open() {
            return Ok(());
        }
        let id = ConnectionResource::id_for(device);
        match self.inner.resources.unregister(&id).await {
            Err(err) if err.is(ErrorCode::RESOURCE_NOT_FOUND) => device.close().await,
            other => other,
        }
    }

    /// Discover services on `device`, abandoning the wait if `cancel` fires
    pub async fn discover_services(
        &self,
        cancel: &CancellationToken,
        device: &Device,
        uuids: &[BleUuid],
    ) -> BleResult<Vec<Service>> {
        tokio::select! {
            _ = cancel.cancelled() => {
                Err(BleError::cancelled("discover services")
                    .with_context("target", device.address()))
            }
            result = device.discover_services(uuids) => result,
        }
    }

    /// Point-in-time snapshot of connected devices, ordered by address
    pub fn connected_devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self
            .inner
            .links()
            .devices
            .values()
            .filter(|device| device.is_open())
            .cloned()
            .collect();
        devices.sort_by_key(|device| device.address());
        devices
    }

    pub(crate) fn forget_device(&self, device: &Device) {
        let mut links = self.inner.links();
        let same = links
            .devices
            .get(&device.address())
            .map_or(false, |current| current.ptr_eq(device));
        if same {
            links.devices.remove(&device.address());
        }
    }
}

/// Exhausted retries keep the classification of the last connect attempt;
/// the retry error, and the attempt behind it, become the cause chain
fn exhausted_connect(err: BleError, address: &Address) -> BleError {
    if !err.is(ErrorCode::RETRIES_EXHAUSTED) {
        return err;
    }
    let timed_out = err
        .ble_cause()
        .map_or(false, |last| last.is(ErrorCode::CONNECTION_TIMEOUT));
    let code = if timed_out {
        ErrorCode::CONNECTION_TIMEOUT
    } else {
        ErrorCode::CONNECTION_FAILED
    };
    let attempts = err.context_value("attempts").unwrap_or("0").to_string();
    BleError::new(code, format!("connect failed after {} attempts", attempts))
        .with_context("target", address)
        .with_context("attempts", attempts)
        .with_cause(err)
}

#[async_trait]
impl SessionOwner for Central {
    async fn stop_native(&self) -> BleResult<()> {
        self.inner.driver.stop_scan().await.map_err(|err| {
            BleError::from_driver(err, ErrorCode::SCAN_FAILED, "stop scan", &self.inner.adapter_id)
        })
    }

    fn release_session(&self, handle: &SessionHandle, registered: Option<&Arc<dyn Resource>>) {
        if let Some(resource) = registered {
            self.inner.resources.remove_registered(resource);
        }
        self.inner.scan.release(handle);
    }
}
