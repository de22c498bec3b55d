//! Manager and Adapter
//!
//! The Manager is the entry point: it wraps the platform selected at startup,
//! owns the shared resource registry and hands out one [`Adapter`] per radio.
//! Each Adapter builds its Central and Peripheral orchestrators lazily and
//! keeps them for its lifetime.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::central::Central;
use crate::config::BleConfig;
use crate::driver::{AdapterInfo, Platform};
use crate::error::{combine_errors, BleError, BleResult, ErrorCode};
use crate::peripheral::Peripheral;
use crate::resource::ResourceManager;
use crate::sync::lock;

// ----------------------------------------------------------------------------
// Adapter
// ----------------------------------------------------------------------------

struct AdapterInner {
    info: AdapterInfo,
    platform: Arc<dyn Platform>,
    resources: ResourceManager,
    config: BleConfig,
    central: OnceCell<Central>,
    peripheral: OnceCell<Peripheral>,
}

/// One radio exposed by the platform
#[derive(Clone)]
pub struct Adapter {
    inner: Arc<AdapterInner>,
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapter")
            .field("info", &self.inner.info)
            .field("central", &self.inner.central.initialized())
            .field("peripheral", &self.inner.peripheral.initialized())
            .finish()
    }
}

impl Adapter {
    pub fn info(&self) -> &AdapterInfo {
        &self.inner.info
    }

    pub fn id(&self) -> &str {
        &self.inner.info.id
    }

    /// The client-role orchestrator for this radio
    pub async fn central(&self) -> BleResult<Central> {
        let inner = &self.inner;
        inner
            .central
            .get_or_try_init(|| async {
                let driver = inner.platform.central_driver(&inner.info).await?;
                debug!("Central role ready on {}", inner.info.id);
                Ok::<_, BleError>(Central::new(
                    inner.info.id.clone(),
                    driver,
                    inner.resources.clone(),
                    inner.config.central.clone(),
                ))
            })
            .await
            .cloned()
    }

    /// The server-role orchestrator for this radio
    pub async fn peripheral(&self) -> BleResult<Peripheral> {
        let inner = &self.inner;
        inner
            .peripheral
            .get_or_try_init(|| async {
                let driver = inner.platform.peripheral_driver(&inner.info).await?;
                debug!("Peripheral role ready on {}", inner.info.id);
                Ok::<_, BleError>(Peripheral::new(
                    inner.info.id.clone(),
                    driver,
                    inner.resources.clone(),
                    inner.config.peripheral.clone(),
                ))
            })
            .await
            .cloned()
    }

    /// Power down whichever roles were built
    async fn shutdown(&self) -> BleResult<()> {
        let mut errors = Vec::new();
        if let Some(central) = self.inner.central.get() {
            if let Err(err) = central.disable().await {
                errors.push(err);
            }
        }
        if let Some(peripheral) = self.inner.peripheral.get() {
            if let Err(err) = peripheral.disable().await {
                errors.push(err);
            }
        }
        combine_errors(errors).map_or(Ok(()), Err)
    }
}

// ----------------------------------------------------------------------------
// Manager
// ----------------------------------------------------------------------------

/// Entry point over one platform implementation
pub struct Manager {
    platform: Arc<dyn Platform>,
    config: BleConfig,
    resources: ResourceManager,
    adapters: Mutex<HashMap<String, Adapter>>,
    finalized: AtomicBool,
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("platform", &self.platform.name())
            .field("resources", &self.resources)
            .field("finalized", &self.finalized.load(Ordering::Acquire))
            .finish()
    }
}

impl Manager {
    /// Create a manager; the configuration is validated up front
    pub fn new(platform: Arc<dyn Platform>, config: BleConfig) -> BleResult<Self> {
        config.validate()?;
        let resources = ResourceManager::new(config.resources.clone());
        Ok(Self {
            platform,
            config,
            resources,
            adapters: Mutex::new(HashMap::new()),
            finalized: AtomicBool::new(false),
        })
    }

    pub fn platform_name(&self) -> &str {
        self.platform.name()
    }

    pub fn config(&self) -> &BleConfig {
        &self.config
    }

    /// The registry shared by every orchestrator this manager builds
    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    fn ensure_live(&self) -> BleResult<()> {
        if self.finalized.load(Ordering::Acquire) {
            return Err(BleError::invalid_operation("manager has been shut down"));
        }
        Ok(())
    }

    /// Start the resource sweep. Starting a running manager is a no-op.
    pub fn start(&self) -> BleResult<()> {
        self.ensure_live()?;
        if self.resources.is_running() {
            return Ok(());
        }
        self.resources.start()?;
        info!("Manager started on {}", self.platform.name());
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.resources.is_running()
    }

    /// Power down every adapter role and release every resource. Errors are
    /// joined; the manager cannot be restarted afterwards.
    pub async fn shutdown(&self) -> BleResult<()> {
        if self.finalized.swap(true, Ordering::AcqRel) {
            debug!("Manager already shut down");
            return Ok(());
        }

        let adapters: Vec<Adapter> = lock(&self.adapters).values().cloned().collect();
        let mut errors = Vec::new();
        for adapter in adapters {
            if let Err(err) = adapter.shutdown().await {
                warn!("Shutting down adapter {} failed: {}", adapter.id(), err);
                errors.push(err);
            }
        }
        if let Err(err) = self.resources.stop().await {
            errors.push(err);
        }
        info!("Manager on {} shut down", self.platform.name());
        combine_errors(errors).map_or(Ok(()), Err)
    }

    /// Radios the platform currently exposes
    pub async fn adapters(&self) -> BleResult<Vec<AdapterInfo>> {
        self.platform.adapters().await.map_err(|err| {
            BleError::from_driver(
                err,
                ErrorCode::ADAPTER_NOT_AVAILABLE,
                "list adapters",
                self.platform.name(),
            )
        })
    }

    /// The first adapter reported by the platform
    pub async fn default_adapter(&self) -> BleResult<Adapter> {
        self.ensure_live()?;
        let info = self.adapters().await?.into_iter().next().ok_or_else(|| {
            BleError::new(ErrorCode::ADAPTER_NOT_AVAILABLE, "no Bluetooth adapter found")
                .with_context("platform", self.platform.name())
        })?;
        Ok(self.adapter_for(info))
    }

    pub async fn adapter(&self, id: &str) -> BleResult<Adapter> {
        self.ensure_live()?;
        if let Some(adapter) = lock(&self.adapters).get(id).cloned() {
            return Ok(adapter);
        }
        let info = self
            .adapters()
            .await?
            .into_iter()
            .find(|info| info.id == id)
            .ok_or_else(|| {
                BleError::new(ErrorCode::ADAPTER_NOT_AVAILABLE, "adapter not found")
                    .with_context("target", id)
            })?;
        Ok(self.adapter_for(info))
    }

    /// Adapters are cached so each radio has a single Central and Peripheral
    fn adapter_for(&self, info: AdapterInfo) -> Adapter {
        let mut adapters = lock(&self.adapters);
        adapters
            .entry(info.id.clone())
            .or_insert_with(|| Adapter {
                inner: Arc::new(AdapterInner {
                    info,
                    platform: self.platform.clone(),
                    resources: self.resources.clone(),
                    config: self.config.clone(),
                    central: OnceCell::new(),
                    peripheral: OnceCell::new(),
                }),
            })
            .clone()
    }

    // ------------------------------------------------------------------------
    // Lifecycle hooks for hosting frameworks
    // ------------------------------------------------------------------------

    pub fn connect(&self) -> BleResult<()> {
        self.start()
    }

    /// Release every registered resource and pause the sweep; `connect`
    /// resumes it
    pub async fn disconnect(&self) -> BleResult<()> {
        self.resources.stop().await
    }

    /// Idempotent alias of [`Manager::shutdown`]
    pub async fn finalize(&self) -> BleResult<()> {
        self.shutdown().await
    }
}
