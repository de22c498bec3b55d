//! Resource lifecycle management
//!
//! Every long-lived native object opened on behalf of a caller (a connection,
//! a scan session, an advertisement) is registered with a [`ResourceManager`]
//! and released exactly once: explicitly through [`ResourceManager::unregister`],
//! by the background sweep once it has gone inactive and idle past the TTL,
//! or when the manager stops.
//!
//! An entry is removed from the table *before* its cleanup runs, so two paths
//! can never both obtain it. [`CleanupOnce`] additionally makes each
//! resource's own cleanup idempotent for callers that hold it directly.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::central::WeakCentral;
use crate::config::ResourceConfig;
use crate::error::{combine_errors, BleError, BleResult, ErrorCode};
use crate::gatt::Device;
use crate::peripheral::WeakPeripheral;

// ----------------------------------------------------------------------------
// Resource Contract
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Connection,
    Scanner,
    Advertiser,
    Custom(String),
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Connection => write!(f, "connection"),
            ResourceKind::Scanner => write!(f, "scanner"),
            ResourceKind::Advertiser => write!(f, "advertiser"),
            ResourceKind::Custom(name) => write!(f, "{}", name),
        }
    }
}

/// Anything the manager can track and reclaim
#[async_trait]
pub trait Resource: Send + Sync {
    /// Unique per manager
    fn id(&self) -> &str;

    fn kind(&self) -> ResourceKind;

    /// Live state of the underlying object, never a cached flag
    async fn is_active(&self) -> bool;

    fn last_activity(&self) -> Instant;

    /// Release the underlying object. Calling this more than once is a no-op.
    async fn cleanup(&self) -> BleResult<()>;
}

/// Latch guarding a cleanup so that only the first caller runs it
#[derive(Debug, Default)]
pub struct CleanupOnce(AtomicBool);

impl CleanupOnce {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true exactly once
    pub fn begin(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    pub fn is_done(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Point-in-time description of a registered resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: String,
    pub kind: ResourceKind,
}

// ----------------------------------------------------------------------------
// Resource Manager
// ----------------------------------------------------------------------------

struct Sweeper {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct ManagerInner {
    config: ResourceConfig,
    resources: Mutex<HashMap<String, Arc<dyn Resource>>>,
    /// Serializes the periodic sweep and explicit `cleanup_inactive` requests
    sweep_lock: tokio::sync::Mutex<()>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl ManagerInner {
    fn table(&self) -> MutexGuard<'_, HashMap<String, Arc<dyn Resource>>> {
        self.resources.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sweeper(&self) -> MutexGuard<'_, Option<Sweeper>> {
        self.sweeper.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn sweep(&self) -> BleResult<usize> {
        let _serialized = self.sweep_lock.lock().await;

        let candidates: Vec<Arc<dyn Resource>> = self.table().values().cloned().collect();
        let mut expired = Vec::new();
        for resource in candidates {
            if resource.is_active().await {
                continue;
            }
            if resource.last_activity().elapsed() < self.config.ttl {
                continue;
            }
            // Skip entries unregistered or replaced while we were checking
            let removed = {
                let mut table = self.table();
                let unchanged = table
                    .get(resource.id())
                    .map_or(false, |current| Arc::ptr_eq(current, &resource));
                if unchanged {
                    table.remove(resource.id())
                } else {
                    None
                }
            };
            if let Some(resource) = removed {
                expired.push(resource);
            }
        }

        let count = expired.len();
        if count > 0 {
            debug!("Sweeping {} inactive resources", count);
        }
        let errors = cleanup_all(expired).await;
        match combine_errors(errors) {
            Some(err) => Err(err),
            None => Ok(count),
        }
    }
}

async fn cleanup_all(resources: Vec<Arc<dyn Resource>>) -> Vec<BleError> {
    let results = join_all(resources.iter().map(|resource| async move {
        resource.cleanup().await.map_err(|err| {
            warn!("Cleanup of {} {} failed: {}", resource.kind(), resource.id(), err);
            BleError::from_driver(
                err,
                ErrorCode::RESOURCE_CLEANUP_FAILED,
                "cleanup",
                resource.id(),
            )
        })
    }))
    .await;
    results.into_iter().filter_map(Result::err).collect()
}

/// Registry of cleanup-able resources with a background expiry sweep
#[derive(Clone)]
pub struct ResourceManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceManager")
            .field("resources", &self.len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new(ResourceConfig::default())
    }
}

impl ResourceManager {
    pub fn new(config: ResourceConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                resources: Mutex::new(HashMap::new()),
                sweep_lock: tokio::sync::Mutex::new(()),
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.inner.config
    }

    /// Start the background sweep. Starting a running manager is an error.
    pub fn start(&self) -> BleResult<()> {
        let mut sweeper = self.inner.sweeper();
        if sweeper.is_some() {
            return Err(BleError::invalid_operation("resource manager already started"));
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(sweep_loop(
            Arc::downgrade(&self.inner),
            self.inner.config.sweep_interval,
            cancel.clone(),
        ));
        *sweeper = Some(Sweeper { cancel, task });
        info!(
            "Resource manager started (sweep every {:?}, ttl {:?})",
            self.inner.config.sweep_interval, self.inner.config.ttl
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.sweeper().is_some()
    }

    /// Stop the sweep and clean up every remaining resource.
    ///
    /// All cleanups run even when some fail; the failures are returned joined.
    pub async fn stop(&self) -> BleResult<()> {
        let sweeper = self.inner.sweeper().take();
        if let Some(sweeper) = sweeper {
            sweeper.cancel.cancel();
            if let Err(err) = sweeper.task.await {
                warn!("Resource sweep task ended abnormally: {}", err);
            }
        }

        let result = self.cleanup_all().await;
        info!("Resource manager stopped");
        result
    }

    /// Clean up every registered resource without stopping the sweep
    pub async fn cleanup_all(&self) -> BleResult<()> {
        let drained: Vec<Arc<dyn Resource>> =
            self.inner.table().drain().map(|(_, resource)| resource).collect();
        if !drained.is_empty() {
            debug!("Cleaning up {} resources", drained.len());
        }
        match combine_errors(cleanup_all(drained).await) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn register(&self, resource: Arc<dyn Resource>) -> BleResult<()> {
        let mut table = self.inner.table();
        if table.contains_key(resource.id()) {
            return Err(BleError::resource_busy("resource id already registered")
                .with_context("id", resource.id()));
        }
        debug!("Registered {} {}", resource.kind(), resource.id());
        table.insert(resource.id().to_string(), resource);
        Ok(())
    }

    /// Remove the resource and clean it up before returning
    pub async fn unregister(&self, id: &str) -> BleResult<()> {
        let resource = self.inner.table().remove(id).ok_or_else(|| not_found(id))?;
        debug!("Unregistered {} {}", resource.kind(), id);
        resource.cleanup().await.map_err(|err| {
            BleError::from_driver(err, ErrorCode::RESOURCE_CLEANUP_FAILED, "cleanup", id)
        })
    }

    /// Remove `resource` without cleaning it up, for owners that released the
    /// object themselves. Leaves a different entry registered under the same
    /// id untouched.
    pub(crate) fn remove_registered(&self, resource: &Arc<dyn Resource>) -> bool {
        let mut table = self.inner.table();
        let same = table
            .get(resource.id())
            .map_or(false, |current| Arc::ptr_eq(current, resource));
        if same {
            table.remove(resource.id());
        }
        same
    }

    pub fn get(&self, id: &str) -> BleResult<Arc<dyn Resource>> {
        self.inner.table().get(id).cloned().ok_or_else(|| not_found(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.table().contains_key(id)
    }

    /// Snapshot of registered resources, sorted by id
    pub fn list(&self) -> Vec<ResourceInfo> {
        let mut infos: Vec<ResourceInfo> = self
            .inner
            .table()
            .values()
            .map(|resource| ResourceInfo {
                id: resource.id().to_string(),
                kind: resource.kind(),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn len(&self) -> usize {
        self.inner.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.table().is_empty()
    }

    /// Run one sweep now; shares the periodic sweep's code path and lock.
    /// Returns how many resources were reclaimed.
    pub async fn cleanup_inactive(&self) -> BleResult<usize> {
        self.inner.sweep().await
    }
}

fn not_found(id: &str) -> BleError {
    BleError::new(ErrorCode::RESOURCE_NOT_FOUND, "resource not registered").with_context("id", id)
}

async fn sweep_loop(
    manager: Weak<ManagerInner>,
    period: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(inner) = manager.upgrade() else { break };
                if let Err(err) = inner.sweep().await {
                    warn!("Resource sweep reported failures: {}", err);
                }
            }
        }
    }
    debug!("Resource sweep loop exited");
}

// ----------------------------------------------------------------------------
// Connection Resource
// ----------------------------------------------------------------------------

/// A live connection; cleanup disconnects the device if still connected
pub struct ConnectionResource {
    id: String,
    device: Device,
    once: CleanupOnce,
}

impl ConnectionResource {
    pub fn new(device: Device) -> Self {
        Self {
            id: Self::id_for(&device),
            device,
            once: CleanupOnce::new(),
        }
    }

    pub fn id_for(device: &Device) -> String {
        format!("conn-{}", device.address())
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

#[async_trait]
impl Resource for ConnectionResource {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Connection
    }

    async fn is_active(&self) -> bool {
        self.device.is_connected().await
    }

    fn last_activity(&self) -> Instant {
        self.device.last_activity()
    }

    async fn cleanup(&self) -> BleResult<()> {
        if !self.once.begin() {
            return Ok(());
        }
        self.device.close().await
    }
}

// ----------------------------------------------------------------------------
// Scanner Resource
// ----------------------------------------------------------------------------

/// An in-flight scan; cleanup stops it if still scanning
pub struct ScannerResource {
    id: String,
    central: WeakCentral,
    started: Instant,
    once: CleanupOnce,
}

impl ScannerResource {
    pub(crate) fn new(id: String, central: WeakCentral) -> Self {
        Self {
            id,
            central,
            started: Instant::now(),
            once: CleanupOnce::new(),
        }
    }
}

#[async_trait]
impl Resource for ScannerResource {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Scanner
    }

    async fn is_active(&self) -> bool {
        self.central
            .upgrade()
            .map(|central| central.is_scanning())
            .unwrap_or(false)
    }

    fn last_activity(&self) -> Instant {
        self.started
    }

    async fn cleanup(&self) -> BleResult<()> {
        if !self.once.begin() {
            return Ok(());
        }
        match self.central.upgrade() {
            Some(central) => central.stop_scan().await,
            None => Ok(()),
        }
    }
}

// ----------------------------------------------------------------------------
// Advertiser Resource
// ----------------------------------------------------------------------------

/// An in-flight advertisement; cleanup stops it if still advertising
pub struct AdvertiserResource {
    id: String,
    peripheral: WeakPeripheral,
    started: Instant,
    once: CleanupOnce,
}

impl AdvertiserResource {
    pub(crate) fn new(id: String, peripheral: WeakPeripheral) -> Self {
        Self {
            id,
            peripheral,
            started: Instant::now(),
            once: CleanupOnce::new(),
        }
    }
}

#[async_trait]
impl Resource for AdvertiserResource {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Advertiser
    }

    async fn is_active(&self) -> bool {
        self.peripheral
            .upgrade()
            .map(|peripheral| peripheral.is_advertising())
            .unwrap_or(false)
    }

    fn last_activity(&self) -> Instant {
        self.started
    }

    async fn cleanup(&self) -> BleResult<()> {
        if !self.once.begin() {
            return Ok(());
        }
        match self.peripheral.upgrade() {
            Some(peripheral) => peripheral.stop_advertising().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct TestResource {
        id: String,
        active: AtomicBool,
        cleanups: Arc<AtomicUsize>,
        fail: bool,
        last: Instant,
        once: CleanupOnce,
    }

    impl TestResource {
        fn new(id: &str, cleanups: Arc<AtomicUsize>) -> Self {
            Self {
                id: id.to_string(),
                active: AtomicBool::new(true),
                cleanups,
                fail: false,
                last: Instant::now(),
                once: CleanupOnce::new(),
            }
        }

        fn inactive(self) -> Self {
            self.active.store(false, Ordering::SeqCst);
            self
        }

        fn failing(mut self) -> Self {
            self.fail = true;
            self
        }
    }

    #[async_trait]
    impl Resource for TestResource {
        fn id(&self) -> &str {
            &self.id
        }

        fn kind(&self) -> ResourceKind {
            ResourceKind::Custom("test".to_string())
        }

        async fn is_active(&self) -> bool {
            self.active.load(Ordering::SeqCst)
        }

        fn last_activity(&self) -> Instant {
            self.last
        }

        async fn cleanup(&self) -> BleResult<()> {
            if !self.once.begin() {
                return Ok(());
            }
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(BleError::new(ErrorCode::PLATFORM_ERROR, "native release failed"))
            } else {
                Ok(())
            }
        }
    }

    fn config() -> ResourceConfig {
        ResourceConfig {
            sweep_interval: Duration::from_secs(30),
            ttl: Duration::from_secs(300),
        }
    }

    #[test]
    fn test_cleanup_once() {
        let once = CleanupOnce::new();
        assert!(!once.is_done());
        assert!(once.begin());
        assert!(!once.begin());
        assert!(once.is_done());
    }

    #[tokio::test]
    async fn test_register_rejects_duplicate_ids() {
        let manager = ResourceManager::new(config());
        let cleanups = Arc::new(AtomicUsize::new(0));
        manager
            .register(Arc::new(TestResource::new("conn-A", cleanups.clone())))
            .unwrap();

        let err = manager
            .register(Arc::new(TestResource::new("conn-A", cleanups.clone())))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::RESOURCE_BUSY);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_remove_registered_leaves_other_owner() {
        let manager = ResourceManager::new(config());
        let cleanups = Arc::new(AtomicUsize::new(0));
        let owner: Arc<dyn Resource> =
            Arc::new(TestResource::new("scan-hci0", cleanups.clone()));
        let rejected: Arc<dyn Resource> =
            Arc::new(TestResource::new("scan-hci0", cleanups.clone()));
        manager.register(owner.clone()).unwrap();
        assert!(manager.register(rejected.clone()).is_err());

        assert!(!manager.remove_registered(&rejected));
        assert!(manager.contains("scan-hci0"));

        assert!(manager.remove_registered(&owner));
        assert!(manager.is_empty());
        assert_eq!(cleanups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_start_twice_is_invalid() {
        let manager = ResourceManager::new(config());
        manager.start().unwrap();
        assert!(manager.is_running());
        let err = manager.start().unwrap_err();
        assert_eq!(err.code(), ErrorCode::INVALID_OPERATION);
        manager.stop().await.unwrap();
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_unregister_unknown_id() {
        let manager = ResourceManager::new(config());
        let err = manager.unregister("missing").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::RESOURCE_NOT_FOUND);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_inactive_respects_ttl() {
        let manager = ResourceManager::new(config());
        let cleanups = Arc::new(AtomicUsize::new(0));
        manager
            .register(Arc::new(TestResource::new("idle", cleanups.clone()).inactive()))
            .unwrap();
        manager
            .register(Arc::new(TestResource::new("busy", cleanups.clone())))
            .unwrap();

        // Inactive but not yet past the TTL
        assert_eq!(manager.cleanup_inactive().await.unwrap(), 0);

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(manager.cleanup_inactive().await.unwrap(), 1);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert!(!manager.contains("idle"));
        assert!(manager.contains("busy"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep() {
        let manager = ResourceManager::new(config());
        let cleanups = Arc::new(AtomicUsize::new(0));
        manager
            .register(Arc::new(TestResource::new("idle", cleanups.clone()).inactive()))
            .unwrap();
        manager.start().unwrap();

        tokio::time::sleep(Duration::from_secs(331)).await;
        assert!(manager.is_empty());
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_joins_cleanup_errors() {
        let manager = ResourceManager::new(config());
        let cleanups = Arc::new(AtomicUsize::new(0));
        manager
            .register(Arc::new(TestResource::new("a", cleanups.clone()).failing()))
            .unwrap();
        manager
            .register(Arc::new(TestResource::new("b", cleanups.clone())))
            .unwrap();
        manager
            .register(Arc::new(TestResource::new("c", cleanups.clone()).failing()))
            .unwrap();

        let err = manager.stop().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::MULTIPLE_ERRORS);
        assert_eq!(err.multi().unwrap().len(), 2);
        assert_eq!(cleanups.load(Ordering::SeqCst), 3);
        assert!(manager.is_empty());
    }
}
