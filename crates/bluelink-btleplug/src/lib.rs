//! btleplug platform for bluelink
//!
//! Plugs the operating system's Bluetooth stack (BlueZ, Core Bluetooth,
//! WinRT) into the bluelink orchestrators through `btleplug`.
//!
//! - [`BtleplugPlatform`] lists adapters and hands out drivers
//! - [`BtleplugCentral`] implements the Central role
//!
//! btleplug is client-only, so the Peripheral role is reported as not
//! supported.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bluelink_btleplug::BtleplugPlatform;
//! use bluelink_core::{BleConfig, CancellationToken, Manager, ScanParams};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let platform = Arc::new(BtleplugPlatform::new().await?);
//! let manager = Manager::new(platform, BleConfig::default())?;
//! manager.start()?;
//!
//! let central = manager.default_adapter().await?.central().await?;
//! central.enable().await?;
//! let cancel = CancellationToken::new();
//! central
//!     .scan(&cancel, &ScanParams::default(), |adv| println!("{}", adv.address))
//!     .await?;
//! manager.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod central;
mod convert;
mod platform;
mod routes;

pub use central::BtleplugCentral;
pub use platform::BtleplugPlatform;
