//! Platform selection
//!
//! The platform is picked once at startup: the system Bluetooth stack when
//! built with the `btleplug` feature, the simulated radio otherwise or when
//! `--simulate` is given.

use std::sync::Arc;

use bluelink_core::sim::{SimRadio, SimulatedPlatform};
use bluelink_core::Platform;
use tracing::info;

use crate::error::Result;

pub async fn select_platform(simulate: bool) -> Result<Arc<dyn Platform>> {
    if simulate {
        return simulated_platform();
    }
    native_platform().await
}

/// The simulated radio with its demo devices in range
pub fn simulated_platform() -> Result<Arc<dyn Platform>> {
    info!("Using the simulated radio");
    Ok(Arc::new(SimulatedPlatform::new(SimRadio::demo()?)))
}

cfg_if::cfg_if! {
    if #[cfg(feature = "btleplug")] {
        async fn native_platform() -> Result<Arc<dyn Platform>> {
            let platform = bluelink_btleplug::BtleplugPlatform::new().await?;
            info!("Using the system Bluetooth stack");
            Ok(Arc::new(platform))
        }
    } else {
        async fn native_platform() -> Result<Arc<dyn Platform>> {
            tracing::warn!(
                "Built without the btleplug feature; falling back to the simulated radio"
            );
            simulated_platform()
        }
    }
}
