//! Command handlers for the bluelink CLI

use std::time::Duration;

use bluelink_core::advertisement::FLAGS_GENERAL_DISCOVERABLE;
use bluelink_core::{
    Adapter, AdapterInfo, Address, Advertisement, AdvertisingData, AdvertisingParams, BleError,
    BleResult, BleUuid, CancellationToken, Central, ConnectionParams, Device, ErrorCode, Manager,
    ScanFilter, ScanParams,
};
use tracing::{debug, info, warn};

use crate::cli::{AdvertiseArgs, Commands, ScanArgs};
use crate::config::CliAppConfig;
use crate::error::{CliError, Result};

/// Turns a zero-second setting into "until interrupted"
fn seconds(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Runs one command against a started [`Manager`]. Every long-running
/// operation observes `cancel`, which Ctrl-C fires.
pub struct CommandDispatcher {
    manager: Manager,
    config: CliAppConfig,
    cancel: CancellationToken,
}

impl CommandDispatcher {
    pub fn new(manager: Manager, config: CliAppConfig, cancel: CancellationToken) -> Self {
        Self {
            manager,
            config,
            cancel,
        }
    }

    /// Execute a CLI command. An interrupted command is not a failure.
    pub async fn execute(&self, command: Commands) -> Result<()> {
        let outcome = match command {
            Commands::Scan(args) => self.scan(&args).await.map(|_| ()),
            Commands::Read {
                address,
                service,
                characteristic,
            } => self.read(address, service, characteristic).await.map(|_| ()),
            Commands::Advertise(args) => self.advertise(&args).await,
            Commands::Adapters => self.adapters().await.map(|_| ()),
            Commands::Config { example, save } => {
                Self::handle_config_command(&self.config, example, save)
            }
        };

        match outcome {
            Err(err) if err.is_interrupt() => {
                info!("Interrupted");
                Ok(())
            }
            other => other,
        }
    }

    /// Release everything the command left behind
    pub async fn shutdown(self) -> Result<()> {
        self.manager.shutdown().await?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Scan
    // ------------------------------------------------------------------------

    /// Print matching advertisements as they arrive and return them.
    /// Interrupting the scan still returns what was seen.
    pub async fn scan(&self, args: &ScanArgs) -> Result<Vec<Advertisement>> {
        let central = self.central().await?;
        let params = self.scan_params(args);

        let mut seen = Vec::new();
        let outcome = central
            .scan(&self.cancel, &params, |adv| {
                println!("{}", describe(&adv));
                seen.push(adv);
            })
            .await;

        if let Err(err) = outcome {
            if !err.is(ErrorCode::OPERATION_CANCELLED) {
                return Err(err.into());
            }
        }
        println!("{} device(s) found", seen.len());
        Ok(seen)
    }

    fn scan_params(&self, args: &ScanArgs) -> ScanParams {
        let defaults = &self.config.scan;
        let filter = ScanFilter {
            service_uuids: args.services.clone(),
            name_prefix: args.name_prefix.clone(),
            min_rssi: args.min_rssi.or(defaults.min_rssi),
        };
        let mut params = ScanParams::new()
            .with_timeout(seconds(args.timeout.unwrap_or(defaults.timeout_secs)))
            .with_filter(filter)
            .with_duplicates(defaults.allow_duplicates);
        params.active = defaults.active;
        params
    }

    // ------------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------------

    /// Locate, connect, read one characteristic and disconnect
    pub async fn read(
        &self,
        address: Address,
        service: BleUuid,
        characteristic: BleUuid,
    ) -> Result<Vec<u8>> {
        let central = self.central().await?;
        self.locate(&central, address).await?;

        let params = ConnectionParams::new()
            .with_connect_timeout(Duration::from_secs(self.config.read.connect_timeout_secs));
        let device = central.connect(&self.cancel, &address, &params).await?;
        info!("Connected to {}", address);

        let value = self.read_value(&central, &device, service, characteristic).await;
        if let Err(err) = central.disconnect(&device).await {
            warn!("Disconnect from {} failed: {}", address, err);
        }
        let value = value?;

        println!("{} {} = {}", service, characteristic, render_value(&value));
        Ok(value)
    }

    async fn read_value(
        &self,
        central: &Central,
        device: &Device,
        service: BleUuid,
        characteristic: BleUuid,
    ) -> BleResult<Vec<u8>> {
        central.discover_services(&self.cancel, device, &[service]).await?;
        device.characteristic(service, characteristic)?.read().await
    }

    /// Scan until `address` shows up. Platforms only connect to devices they
    /// have recently seen.
    async fn locate(&self, central: &Central, address: Address) -> Result<()> {
        let found = self.cancel.child_token();
        let signal = found.clone();
        let params = ScanParams::new()
            .with_timeout(Some(Duration::from_millis(self.config.read.locate_timeout_ms)));

        let outcome = central
            .scan(&found, &params, move |adv| {
                if adv.address == address {
                    signal.cancel();
                }
            })
            .await;

        match outcome {
            Ok(()) => {
                let unseen = "device not seen while scanning";
                Err(BleError::new(ErrorCode::DEVICE_NOT_FOUND, unseen)
                    .with_context("target", address)
                    .into())
            }
            Err(err) if err.is(ErrorCode::OPERATION_CANCELLED) && !self.cancel.is_cancelled() => {
                debug!("Located {}", address);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    // ------------------------------------------------------------------------
    // Advertise
    // ------------------------------------------------------------------------

    /// Advertise until the timeout elapses or the user interrupts
    pub async fn advertise(&self, args: &AdvertiseArgs) -> Result<()> {
        let name = args.name.clone().unwrap_or_else(|| self.config.advertise.name.clone());
        if name.is_empty() {
            return Err(CliError::InvalidArgument("advertised name must not be empty".to_string()));
        }

        let peripheral = self.adapter().await?.peripheral().await?;
        peripheral.enable().await?;

        let mut data = AdvertisingData::new()
            .with_flags(FLAGS_GENERAL_DISCOVERABLE)
            .with_local_name(name.clone());
        if let Some(uuid) = args.service {
            if peripheral.service(uuid).is_none() {
                peripheral.add_service(uuid, true).await?;
            }
            data = data.with_service(uuid);
        }

        let params = AdvertisingParams::new()
            .with_connectable(self.config.advertise.connectable)
            .with_timeout(seconds(args.timeout.unwrap_or(self.config.advertise.timeout_secs)));
        println!("Advertising as \"{}\" on {} (Ctrl-C to stop)", name, peripheral.adapter_id());

        let outcome = peripheral.start_advertising(&self.cancel, &params, &data).await;
        let disabled = peripheral.disable().await;
        outcome?;
        disabled?;
        println!("Advertising stopped");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Adapters
    // ------------------------------------------------------------------------

    pub async fn adapters(&self) -> Result<Vec<AdapterInfo>> {
        let adapters = self.manager.adapters().await?;
        if adapters.is_empty() {
            println!("No Bluetooth adapters found on {}", self.manager.platform_name());
        }
        for adapter in &adapters {
            match &adapter.address {
                Some(address) => println!("{:<8} {} ({})", adapter.id, adapter.name, address),
                None => println!("{:<8} {}", adapter.id, adapter.name),
            }
        }
        Ok(adapters)
    }

    // ------------------------------------------------------------------------
    // Config
    // ------------------------------------------------------------------------

    /// Print the example or effective configuration, or save the effective one
    pub fn handle_config_command(config: &CliAppConfig, example: bool, save: bool) -> Result<()> {
        if example {
            print!("{}", CliAppConfig::example_config());
        } else if save {
            let path = config.save()?;
            println!("Configuration written to {}", path.display());
        } else {
            print!("{}", config.to_toml()?);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    async fn adapter(&self) -> BleResult<Adapter> {
        match &self.config.runtime.adapter {
            Some(id) => self.manager.adapter(id).await,
            None => self.manager.default_adapter().await,
        }
    }

    async fn central(&self) -> BleResult<Central> {
        let central = self.adapter().await?.central().await?;
        central.enable().await?;
        Ok(central)
    }
}

/// One line per advertisement: address, signal, name and services
fn describe(adv: &Advertisement) -> String {
    let mut line = format!(
        "{}  {:>4} dBm  {}",
        adv.address,
        adv.rssi,
        adv.local_name.as_deref().unwrap_or("(unnamed)")
    );
    if !adv.service_uuids.is_empty() {
        let services: Vec<String> = adv.service_uuids.iter().map(ToString::to_string).collect();
        line.push_str(&format!("  [{}]", services.join(", ")));
    }
    line
}

/// Hex, followed by the text form when the value is printable UTF-8
fn render_value(value: &[u8]) -> String {
    let hex = hex::encode(value);
    match std::str::from_utf8(value) {
        Ok(text) if !text.is_empty() && text.chars().all(|c| !c.is_control()) => {
            format!("{} \"{}\"", hex, text)
        }
        _ => hex,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bluelink_core::sim::{SimOp, SimRadio, SimulatedPlatform};
    use bluelink_core::types::assigned;
    use bluelink_core::BleConfig;
    use std::sync::Arc;

    fn thermo() -> Address {
        Address::parse("C0:FF:EE:00:00:01").unwrap()
    }

    fn dispatcher_with(config: CliAppConfig) -> (SimRadio, CommandDispatcher) {
        let radio = SimRadio::demo().unwrap();
        let platform = Arc::new(SimulatedPlatform::new(radio.clone()));
        let manager = Manager::new(platform, config.ble.clone()).unwrap();
        manager.start().unwrap();
        (radio, CommandDispatcher::new(manager, config, CancellationToken::new()))
    }

    fn dispatcher() -> (SimRadio, CommandDispatcher) {
        let mut config = CliAppConfig::default();
        config.ble = BleConfig::testing();
        config.read.locate_timeout_ms = 500;
        dispatcher_with(config)
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_reports_each_device_once() {
        let (radio, dispatcher) = dispatcher();
        let args = ScanArgs {
            timeout: Some(2),
            ..ScanArgs::default()
        };

        let seen = dispatcher.scan(&args).await.unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(radio.calls(SimOp::StartScan), 1);
        assert_eq!(radio.calls(SimOp::StopScan), 1);
        assert!(!radio.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_filters() {
        let (_radio, dispatcher) = dispatcher();

        let by_name = ScanArgs {
            timeout: Some(1),
            name_prefix: Some("Ther".to_string()),
            ..ScanArgs::default()
        };
        let seen = dispatcher.scan(&by_name).await.unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].address, thermo());

        let by_service = ScanArgs {
            timeout: Some(1),
            services: vec![BleUuid::from_u16(0x180D)],
            ..ScanArgs::default()
        };
        let seen = dispatcher.scan(&by_service).await.unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].local_name.as_deref(), Some("HR Strap"));

        let by_rssi = ScanArgs {
            timeout: Some(1),
            min_rssi: Some(-60),
            ..ScanArgs::default()
        };
        let seen = dispatcher.scan(&by_rssi).await.unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].address, thermo());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_scan_keeps_results() {
        let (radio, dispatcher) = dispatcher();
        let cancel = dispatcher.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            cancel.cancel();
        });

        let args = ScanArgs {
            timeout: Some(0),
            ..ScanArgs::default()
        };
        let seen = dispatcher.scan(&args).await.unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(radio.calls(SimOp::StopScan), 1);
    }

    #[tokio::test]
    async fn test_read_battery_level() {
        let (radio, dispatcher) = dispatcher();

        let value = dispatcher
            .read(thermo(), assigned::BATTERY_SERVICE, assigned::BATTERY_LEVEL)
            .await
            .unwrap();
        assert_eq!(value, vec![87]);
        assert_eq!(radio.calls(SimOp::Connect), 1);
        assert_eq!(radio.calls(SimOp::Disconnect), 1);
        assert_eq!(radio.link_count(&thermo()), 0);
    }

    #[tokio::test]
    async fn test_read_missing_characteristic_still_disconnects() {
        let (radio, dispatcher) = dispatcher();

        let err = dispatcher
            .read(thermo(), assigned::BATTERY_SERVICE, BleUuid::from_u16(0x2A00))
            .await
            .unwrap_err();
        assert!(matches!(&err, CliError::Ble(e) if e.is(ErrorCode::CHARACTERISTIC_NOT_FOUND)));
        assert_eq!(radio.link_count(&thermo()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_unknown_device() {
        let (radio, dispatcher) = dispatcher();
        let stranger = Address::parse("AA:BB:CC:DD:EE:01").unwrap();

        let err = dispatcher
            .read(stranger, assigned::BATTERY_SERVICE, assigned::BATTERY_LEVEL)
            .await
            .unwrap_err();
        assert!(matches!(&err, CliError::Ble(e) if e.is(ErrorCode::DEVICE_NOT_FOUND)));
        assert_eq!(radio.calls(SimOp::Connect), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_advertise_until_timeout() {
        let (radio, dispatcher) = dispatcher();
        let args = AdvertiseArgs {
            name: Some("beacon".to_string()),
            service: Some(assigned::BATTERY_SERVICE),
            timeout: Some(3),
        };

        dispatcher.advertise(&args).await.unwrap();
        assert_eq!(radio.calls(SimOp::StartAdvertising), 1);
        assert_eq!(radio.calls(SimOp::StopAdvertising), 1);
        assert_eq!(radio.local_services(), vec![assigned::BATTERY_SERVICE]);
        assert!(radio.advertising_payload().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_advertise_is_not_a_failure() {
        let (radio, dispatcher) = dispatcher();
        let cancel = dispatcher.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        });

        dispatcher
            .execute(Commands::Advertise(AdvertiseArgs::default()))
            .await
            .unwrap();
        assert_eq!(radio.calls(SimOp::StopAdvertising), 1);
    }

    #[tokio::test]
    async fn test_oversized_advertisement_is_rejected() {
        let (radio, dispatcher) = dispatcher();
        let args = AdvertiseArgs {
            name: Some("a-name-that-does-not-fit-in-legacy-advertising".to_string()),
            ..AdvertiseArgs::default()
        };

        let err = dispatcher.advertise(&args).await.unwrap_err();
        assert!(matches!(&err, CliError::Ble(e) if e.is(ErrorCode::ADVERTISING_DATA_TOO_LARGE)));
        assert_eq!(radio.calls(SimOp::StartAdvertising), 0);
    }

    #[tokio::test]
    async fn test_adapters_and_unknown_adapter() {
        let (_radio, dispatcher) = dispatcher();
        let adapters = dispatcher.adapters().await.unwrap();
        assert_eq!(adapters.len(), 1);
        assert_eq!(adapters[0].id, "sim0");

        let mut config = CliAppConfig::default();
        config.runtime.adapter = Some("hci9".to_string());
        let (_radio, dispatcher) = dispatcher_with(config);
        let err = dispatcher.scan(&ScanArgs::default()).await.unwrap_err();
        assert!(matches!(&err, CliError::Ble(e) if e.is(ErrorCode::ADAPTER_NOT_AVAILABLE)));
    }

    #[test]
    fn test_value_rendering() {
        assert_eq!(render_value(&[87]), "57 \"W\"");
        assert_eq!(render_value(b"Thermo"), "546865726d6f \"Thermo\"");
        assert_eq!(render_value(&[0x00, 0x48]), "0048");
        assert_eq!(render_value(&[]), "");
    }

    #[test]
    fn test_describe_advertisement() {
        let mut adv = Advertisement::new(thermo(), -48);
        assert_eq!(describe(&adv), "C0:FF:EE:00:00:01   -48 dBm  (unnamed)");

        adv.local_name = Some("Thermo".to_string());
        adv.service_uuids = vec![assigned::BATTERY_SERVICE];
        assert!(describe(&adv).ends_with(&format!("Thermo  [{}]", assigned::BATTERY_SERVICE)));
    }
}
