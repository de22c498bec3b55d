//! Manager lifecycle and resource reclamation over the simulated platform

use std::sync::Arc;
use std::time::Duration;

use bluelink_core::resource::ConnectionResource;
use bluelink_core::sim::{SimOp, SimRadio, SimulatedPlatform};
use bluelink_core::*;

use test_utils::*;

fn manager() -> (SimRadio, Manager) {
    let radio = radio();
    let platform = Arc::new(SimulatedPlatform::new(radio.clone()));
    let manager = Manager::new(platform, BleConfig::testing()).unwrap();
    (radio, manager)
}

// ----------------------------------------------------------------------------
// Manager Tests
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let platform = Arc::new(SimulatedPlatform::default());
    let config = BleConfig::testing().with_resources(ResourceConfig {
        sweep_interval: Duration::ZERO,
        ttl: Duration::from_secs(1),
    });
    let err = Manager::new(platform, config).unwrap_err();
    assert!(err.is(ErrorCode::VALIDATION_FAILED));
}

#[tokio::test]
async fn test_adapters_are_cached() {
    let (_radio, manager) = manager();
    assert_eq!(manager.platform_name(), "simulated");

    let infos = manager.adapters().await.unwrap();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].id, "sim0");

    let first = manager.default_adapter().await.unwrap();
    let second = manager.adapter("sim0").await.unwrap();
    assert_eq!(first.id(), second.id());

    let cancel = CancellationToken::new();
    let central = first.central().await.unwrap();
    let device = central
        .connect(&cancel, &sensor_address(), &ConnectionParams::default())
        .await
        .unwrap();
    let same = second.central().await.unwrap();
    assert_eq!(same.connected_devices().len(), 1);
    assert_eq!(same.connected_devices()[0].address(), device.address());

    let err = manager.adapter("hci7").await.unwrap_err();
    assert!(err.is(ErrorCode::ADAPTER_NOT_AVAILABLE));
    assert_eq!(err.context_value("target"), Some("hci7"));
}

#[tokio::test]
async fn test_start_and_shutdown_are_idempotent() {
    let (_radio, manager) = manager();
    manager.start().unwrap();
    manager.start().unwrap();
    assert!(manager.is_running());

    manager.shutdown().await.unwrap();
    manager.shutdown().await.unwrap();
    manager.finalize().await.unwrap();
    assert!(!manager.is_running());

    let err = manager.start().unwrap_err();
    assert!(err.is(ErrorCode::INVALID_OPERATION));
    let err = manager.default_adapter().await.unwrap_err();
    assert!(err.is(ErrorCode::INVALID_OPERATION));
}

#[tokio::test]
async fn test_shutdown_releases_everything() {
    let (radio, manager) = manager();
    manager.start().unwrap();
    let adapter = manager.default_adapter().await.unwrap();
    let central = adapter.central().await.unwrap();
    let peripheral = adapter.peripheral().await.unwrap();
    peripheral.enable().await.unwrap();

    let cancel = CancellationToken::new();
    let device = central
        .connect(&cancel, &sensor_address(), &ConnectionParams::default())
        .await
        .unwrap();

    let advertiser = peripheral.clone();
    let advertising = tokio::spawn(async move {
        let cancel = CancellationToken::new();
        let data = AdvertisingData::new().with_local_name("hub");
        advertiser
            .start_advertising(&cancel, &AdvertisingParams::new(), &data)
            .await
    });
    let watcher = radio.clone();
    assert!(eventually(|| watcher.advertising_payload().is_some()).await);
    assert_eq!(manager.resources().len(), 2);

    manager.shutdown().await.unwrap();
    advertising.await.unwrap().unwrap();

    assert!(!device.is_connected().await);
    assert_eq!(radio.link_count(&sensor_address()), 0);
    assert!(radio.advertising_payload().is_none());
    assert!(!peripheral.is_enabled().await);
    assert!(!central.is_enabled().await);
    assert!(manager.resources().is_empty());
}

#[tokio::test]
async fn test_disconnect_hook_stops_scan() {
    let (radio, manager) = manager();
    manager.connect().unwrap();
    let central = manager.default_adapter().await.unwrap().central().await.unwrap();

    let scanner = central.clone();
    let scan = tokio::spawn(async move {
        let cancel = CancellationToken::new();
        scanner.scan(&cancel, &open_ended_scan(), |_| {}).await
    });
    let watcher = radio.clone();
    assert!(eventually(|| watcher.is_scanning()).await);
    assert!(manager.resources().contains("scan-sim0"));

    manager.disconnect().await.unwrap();
    scan.await.unwrap().unwrap();
    assert!(!radio.is_scanning());
    assert_eq!(radio.calls(SimOp::StopScan), 1);
    assert!(!manager.is_running());

    // The sweep can be resumed after a disconnect
    manager.connect().unwrap();
    assert!(manager.is_running());
    manager.finalize().await.unwrap();
}

// ----------------------------------------------------------------------------
// Reclamation Tests
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_sweep_reclaims_dropped_connections() {
    let (radio, manager) = manager();
    manager.start().unwrap();
    let central = manager.default_adapter().await.unwrap().central().await.unwrap();

    let cancel = CancellationToken::new();
    let device = central
        .connect(&cancel, &sensor_address(), &ConnectionParams::default())
        .await
        .unwrap();
    let id = ConnectionResource::id_for(&device);
    assert!(manager.resources().contains(&id));

    assert!(radio.disconnect_remote(&sensor_address()));
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(manager.resources().contains(&id));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!manager.resources().contains(&id));
    assert!(central.connected_devices().is_empty());
    assert_eq!(radio.calls(SimOp::Disconnect), 0);

    manager.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_inactive_keeps_live_connections() {
    let (radio, manager) = manager();
    let central = manager.default_adapter().await.unwrap().central().await.unwrap();
    let cancel = CancellationToken::new();
    let params = ConnectionParams::default();
    let sensor = central.connect(&cancel, &sensor_address(), &params).await.unwrap();
    let strap = central.connect(&cancel, &strap_address(), &params).await.unwrap();

    radio.disconnect_remote(&strap_address());
    tokio::time::advance(Duration::from_secs(2)).await;

    assert_eq!(manager.resources().cleanup_inactive().await.unwrap(), 1);
    assert!(sensor.is_connected().await);
    assert!(manager.resources().contains(&ConnectionResource::id_for(&sensor)));
    assert!(!manager.resources().contains(&ConnectionResource::id_for(&strap)));

    // Nothing left to reclaim
    assert_eq!(manager.resources().cleanup_inactive().await.unwrap(), 0);
}

#[tokio::test]
async fn test_unregister_disconnects_device() {
    let (radio, manager) = manager();
    let central = manager.default_adapter().await.unwrap().central().await.unwrap();
    let cancel = CancellationToken::new();
    let device = central
        .connect(&cancel, &sensor_address(), &ConnectionParams::default())
        .await
        .unwrap();

    let id = ConnectionResource::id_for(&device);
    assert_eq!(id, format!("conn-{}", sensor_address()));
    manager.resources().unregister(&id).await.unwrap();
    assert!(!device.is_connected().await);
    assert_eq!(radio.link_count(&sensor_address()), 0);

    // The device is already closed; a second disconnect is a no-op
    device.disconnect().await.unwrap();
    assert_eq!(radio.calls(SimOp::Disconnect), 1);
}

// ----------------------------------------------------------------------------
// Shared Manager Tests
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_rejected_scan_keeps_other_owners_resource() {
    let fx = central_fixture();
    let rival = Central::new(
        "sim0",
        fx.radio.central_driver(),
        fx.resources.clone(),
        BleConfig::testing().central,
    );

    let scanner = fx.central.clone();
    let scan = tokio::spawn(async move {
        let cancel = CancellationToken::new();
        scanner.scan(&cancel, &open_ended_scan(), |_| {}).await
    });
    let watcher = fx.radio.clone();
    assert!(eventually(|| watcher.is_scanning()).await);

    let cancel = CancellationToken::new();
    let err = rival
        .scan(&cancel, &open_ended_scan(), |_| {})
        .await
        .unwrap_err();
    assert!(err.is(ErrorCode::RESOURCE_BUSY));
    assert!(!rival.is_scanning());

    // The first scan is still tracked and still running natively
    assert!(fx.resources.contains("scan-sim0"));
    assert!(fx.radio.is_scanning());
    assert_eq!(fx.radio.calls(SimOp::StartScan), 1);
    assert_eq!(fx.radio.calls(SimOp::StopScan), 0);

    fx.central.stop_scan().await.unwrap();
    scan.await.unwrap().unwrap();
    assert!(!fx.resources.contains("scan-sim0"));
    assert_eq!(fx.radio.calls(SimOp::StopScan), 1);
}

#[tokio::test]
async fn test_rejected_advertisement_keeps_other_owners_resource() {
    let fx = peripheral_fixture().await;
    let rival = Peripheral::new(
        "sim0",
        fx.radio.peripheral_driver(),
        fx.resources.clone(),
        BleConfig::testing().peripheral,
    );

    let data = AdvertisingData::new().with_local_name("hub");
    let advertiser = fx.peripheral.clone();
    let advertised = data.clone();
    let advertising = tokio::spawn(async move {
        let cancel = CancellationToken::new();
        advertiser
            .start_advertising(&cancel, &AdvertisingParams::new(), &advertised)
            .await
    });
    let watcher = fx.radio.clone();
    assert!(eventually(|| watcher.advertising_payload().is_some()).await);

    let cancel = CancellationToken::new();
    let err = rival
        .start_advertising(&cancel, &AdvertisingParams::new(), &data)
        .await
        .unwrap_err();
    assert!(err.is(ErrorCode::RESOURCE_BUSY));

    assert!(fx.resources.contains("adv-sim0"));
    assert!(fx.radio.advertising_payload().is_some());
    assert_eq!(fx.radio.calls(SimOp::StopAdvertising), 0);

    fx.peripheral.stop_advertising().await.unwrap();
    advertising.await.unwrap().unwrap();
    assert!(!fx.resources.contains("adv-sim0"));
}
