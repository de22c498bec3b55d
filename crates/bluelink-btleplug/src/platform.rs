//! btleplug platform entry point

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use btleplug::api::{Central as _, Manager as _};
use btleplug::platform::{Adapter, Manager};
use bluelink_core::driver::{AdapterInfo, CentralDriver, PeripheralDriver, Platform};
use bluelink_core::{BleError, BleResult, ErrorCode};
use tracing::{debug, info};

use crate::central::BtleplugCentral;
use crate::convert::map_error;

/// [`Platform`] over the operating system's Bluetooth stack through btleplug.
///
/// Adapters are identified as `ble0`, `ble1`, ... in the order btleplug
/// reports them. Only the Central role is available; asking for a
/// Peripheral driver fails with [`ErrorCode::PLATFORM_NOT_SUPPORTED`].
pub struct BtleplugPlatform {
    manager: Manager,
    adapters: Mutex<Vec<(AdapterInfo, Adapter)>>,
}

impl BtleplugPlatform {
    pub async fn new() -> BleResult<Self> {
        let manager = Manager::new().await.map_err(|err| {
            BleError::from_driver(
                map_error(err),
                ErrorCode::ADAPTER_NOT_AVAILABLE,
                "open manager",
                "btleplug",
            )
        })?;
        info!("btleplug manager opened");
        Ok(Self {
            manager,
            adapters: Mutex::new(Vec::new()),
        })
    }

    fn native(&self, adapter: &AdapterInfo) -> BleResult<Adapter> {
        self.adapters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .find(|(info, _)| info.id == adapter.id)
            .map(|(_, native)| native.clone())
            .ok_or_else(|| {
                BleError::new(ErrorCode::ADAPTER_NOT_AVAILABLE, "unknown adapter")
                    .with_context("target", &adapter.id)
            })
    }
}

#[async_trait]
impl Platform for BtleplugPlatform {
    fn name(&self) -> &str {
        "btleplug"
    }

    async fn adapters(&self) -> BleResult<Vec<AdapterInfo>> {
        let natives = self.manager.adapters().await.map_err(map_error)?;
        let mut listed = Vec::with_capacity(natives.len());
        for (index, native) in natives.into_iter().enumerate() {
            let name = native
                .adapter_info()
                .await
                .unwrap_or_else(|_| "unknown adapter".to_string());
            let info = AdapterInfo {
                id: format!("ble{}", index),
                name,
                address: None,
            };
            listed.push((info, native));
        }
        debug!("btleplug reports {} adapters", listed.len());

        let infos = listed.iter().map(|(info, _)| info.clone()).collect();
        *self.adapters.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = listed;
        Ok(infos)
    }

    async fn central_driver(&self, adapter: &AdapterInfo) -> BleResult<Arc<dyn CentralDriver>> {
        let native = self.native(adapter)?;
        Ok(Arc::new(BtleplugCentral::new(native)))
    }

    async fn peripheral_driver(
        &self,
        adapter: &AdapterInfo,
    ) -> BleResult<Arc<dyn PeripheralDriver>> {
        Err(BleError::new(
            ErrorCode::PLATFORM_NOT_SUPPORTED,
            "btleplug does not provide the peripheral role",
        )
        .with_context("adapter", &adapter.id))
    }
}
