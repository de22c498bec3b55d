//! Central orchestrator against the simulated radio
//!
//! Covers the scan session discipline (exclusivity and native stop on every
//! exit path), the connect/discover/read/disconnect round trip and the
//! classification of connect failures.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bluelink_core::resource::ConnectionResource;
use bluelink_core::sim::SimOp;
use bluelink_core::types::assigned;
use bluelink_core::*;

use test_utils::*;

// ----------------------------------------------------------------------------
// Connection Tests
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_connect_read_disconnect() {
    let fx = central_fixture();
    let cancel = CancellationToken::new();

    let device = fx
        .central
        .connect(&cancel, &sensor_address(), &ConnectionParams::default())
        .await
        .unwrap();
    assert!(device.is_connected().await);
    assert_eq!(device.name(), Some("Thermo"));
    assert!(fx.resources.contains(&ConnectionResource::id_for(&device)));

    let services = fx
        .central
        .discover_services(&cancel, &device, &[])
        .await
        .unwrap();
    assert_eq!(services.len(), 2);

    let level = device
        .characteristic(assigned::BATTERY_SERVICE, assigned::BATTERY_LEVEL)
        .unwrap()
        .read()
        .await
        .unwrap();
    assert_eq!(level, vec![0x2A]);

    fx.central.disconnect(&device).await.unwrap();
    assert!(!device.is_connected().await);
    assert!(fx.resources.is_empty());
    assert!(fx.central.connected_devices().is_empty());
    assert_eq!(fx.radio.calls(SimOp::Disconnect), 1);
    assert_eq!(fx.radio.link_count(&sensor_address()), 0);

    let err = device.find_characteristic(assigned::BATTERY_LEVEL).unwrap_err();
    assert!(err.is(ErrorCode::CHARACTERISTIC_NOT_FOUND));

    // A second disconnect is a no-op
    fx.central.disconnect(&device).await.unwrap();
    assert_eq!(fx.radio.calls(SimOp::Disconnect), 1);
}

#[tokio::test]
async fn test_device_disconnect_goes_through_central() {
    let fx = central_fixture();
    let cancel = CancellationToken::new();
    let device = fx
        .central
        .connect(&cancel, &sensor_address(), &ConnectionParams::default())
        .await
        .unwrap();

    device.disconnect().await.unwrap();
    assert!(fx.resources.is_empty());
    assert!(fx.central.connected_devices().is_empty());
}

#[tokio::test]
async fn test_connect_to_connected_address_returns_existing() {
    let fx = central_fixture();
    let cancel = CancellationToken::new();
    let params = ConnectionParams::default();

    let first = fx.central.connect(&cancel, &sensor_address(), &params).await.unwrap();
    let second = fx.central.connect(&cancel, &sensor_address(), &params).await.unwrap();
    assert_eq!(first.address(), second.address());
    assert_eq!(fx.radio.calls(SimOp::Connect), 1);
    assert_eq!(fx.resources.len(), 1);
}

#[tokio::test]
async fn test_stale_connection_is_replaced() {
    let fx = central_fixture();
    let cancel = CancellationToken::new();
    let params = ConnectionParams::default();

    let stale = fx.central.connect(&cancel, &sensor_address(), &params).await.unwrap();
    assert!(fx.radio.disconnect_remote(&sensor_address()));
    assert!(!stale.is_connected().await);

    let fresh = fx.central.connect(&cancel, &sensor_address(), &params).await.unwrap();
    assert!(fresh.is_connected().await);
    assert_eq!(fx.radio.calls(SimOp::Connect), 2);
    assert_eq!(fx.resources.len(), 1);
    assert_eq!(fx.central.connected_devices().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_connects_share_one_link() {
    let fx = central_fixture();
    let attempts: Vec<_> = (0..8)
        .map(|_| {
            let central = fx.central.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                central
                    .connect(&cancel, &sensor_address(), &ConnectionParams::default())
                    .await
            })
        })
        .collect();

    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(device) => assert_eq!(device.address(), sensor_address()),
            Err(err) => assert!(err.is(ErrorCode::RESOURCE_BUSY), "unexpected {}", err),
        }
    }

    let devices = fx.central.connected_devices();
    assert_eq!(devices.len(), 1);
    assert!(devices[0].is_connected().await);
    assert_eq!(fx.radio.link_count(&sensor_address()), 1);
    assert!(fx.resources.contains(&ConnectionResource::id_for(&devices[0])));
    assert_eq!(fx.resources.len(), 1);
}

#[tokio::test]
async fn test_connect_failure_is_classified() {
    let fx = central_fixture();
    let cancel = CancellationToken::new();
    fx.radio.fail_next(SimOp::Connect, ErrorCode::PLATFORM_ERROR);

    let err = fx
        .central
        .connect(&cancel, &sensor_address(), &ConnectionParams::default())
        .await
        .unwrap_err();
    assert!(err.is(ErrorCode::CONNECTION_FAILED));
    assert_eq!(err.context_value("operation"), Some("connect"));
    assert!(err.ble_cause().unwrap().is(ErrorCode::PLATFORM_ERROR));
    assert!(fx.resources.is_empty());
}

#[tokio::test]
async fn test_connect_out_of_range_fails() {
    let fx = central_fixture();
    let cancel = CancellationToken::new();
    let absent = Address::parse("01:02:03:04:05:06").unwrap();

    let err = fx
        .central
        .connect(&cancel, &absent, &ConnectionParams::default())
        .await
        .unwrap_err();
    assert!(err.is(ErrorCode::CONNECTION_FAILED));
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout() {
    let fx = central_fixture();
    let cancel = CancellationToken::new();
    fx.radio.stall(SimOp::Connect);

    let params = ConnectionParams::default().with_connect_timeout(Duration::from_millis(200));
    let err = fx
        .central
        .connect(&cancel, &sensor_address(), &params)
        .await
        .unwrap_err();
    assert!(err.is(ErrorCode::CONNECTION_TIMEOUT));
    assert!(err.is_retryable());
    assert!(fx.resources.is_empty());
}

#[tokio::test]
async fn test_connect_cancelled() {
    let fx = central_fixture();
    let cancel = CancellationToken::new();
    fx.radio.stall(SimOp::Connect);

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });
    let err = fx
        .central
        .connect(&cancel, &sensor_address(), &ConnectionParams::default())
        .await
        .unwrap_err();
    assert!(err.is(ErrorCode::OPERATION_CANCELLED));
}

#[tokio::test]
async fn test_invalid_connection_params_never_reach_driver() {
    let fx = central_fixture();
    let cancel = CancellationToken::new();
    let params = ConnectionParams::default()
        .with_interval(Duration::from_millis(100), Duration::from_millis(100))
        .with_supervision_timeout(Duration::from_millis(100));

    let err = fx
        .central
        .connect(&cancel, &sensor_address(), &params)
        .await
        .unwrap_err();
    assert!(err.is(ErrorCode::VALIDATION_FAILED));
    assert_eq!(err.validation().unwrap().parameter, "supervision timeout");
    assert_eq!(fx.radio.calls(SimOp::Connect), 0);
}

#[tokio::test]
async fn test_connect_retries_temporary_failures() {
    let config = BleConfig::testing().with_central(CentralConfig {
        connect_retry: RetryConfig::testing(),
        ..BleConfig::testing().central
    });
    let fx = central_fixture_with(config);
    let cancel = CancellationToken::new();
    fx.radio.fail_times(SimOp::Connect, ErrorCode::CONNECTION_TIMEOUT, 2);

    let device = fx
        .central
        .connect(&cancel, &sensor_address(), &ConnectionParams::default())
        .await
        .unwrap();
    assert!(device.is_connected().await);
    assert_eq!(fx.radio.calls(SimOp::Connect), 3);
}

#[tokio::test]
async fn test_disable_releases_connections() {
    let fx = central_fixture();
    let cancel = CancellationToken::new();
    let device = fx
        .central
        .connect(&cancel, &sensor_address(), &ConnectionParams::default())
        .await
        .unwrap();

    fx.central.disable().await.unwrap();
    assert!(!fx.central.is_enabled().await);
    assert!(!device.is_connected().await);
    assert!(fx.resources.is_empty());

    let err = fx
        .central
        .connect(&cancel, &sensor_address(), &ConnectionParams::default())
        .await
        .unwrap_err();
    assert!(err.is(ErrorCode::ADAPTER_DISABLED));
}

// ----------------------------------------------------------------------------
// GATT Tests
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_characteristic_capabilities_are_checked_first() {
    let fx = central_fixture();
    let cancel = CancellationToken::new();
    let device = fx
        .central
        .connect(&cancel, &sensor_address(), &ConnectionParams::default())
        .await
        .unwrap();
    device.discover_services(&[]).await.unwrap();

    let level = device.find_characteristic(assigned::BATTERY_LEVEL).unwrap();
    let err = level.write(&[1]).await.unwrap_err();
    assert!(err.is(ErrorCode::OPERATION_NOT_SUPPORTED));
    assert_eq!(fx.radio.calls(SimOp::Write), 0);

    let manufacturer = device.find_characteristic(BleUuid::from_u16(0x2A29)).unwrap();
    manufacturer.write(b"Initech").await.unwrap();
    assert_eq!(manufacturer.read().await.unwrap(), b"Initech".to_vec());
}

#[tokio::test]
async fn test_discovery_filter() {
    let fx = central_fixture();
    let cancel = CancellationToken::new();
    let device = fx
        .central
        .connect(&cancel, &sensor_address(), &ConnectionParams::default())
        .await
        .unwrap();

    let services = device
        .discover_services(&[assigned::BATTERY_SERVICE])
        .await
        .unwrap();
    assert_eq!(services.len(), 1);
    assert!(device.service(assigned::DEVICE_INFORMATION_SERVICE).is_none());
    let err = device
        .characteristic(assigned::DEVICE_INFORMATION_SERVICE, BleUuid::from_u16(0x2A29))
        .unwrap_err();
    assert!(err.is(ErrorCode::SERVICE_NOT_FOUND));
}

#[tokio::test(start_paused = true)]
async fn test_discovery_that_never_completes_times_out() {
    let fx = central_fixture();
    let cancel = CancellationToken::new();
    let device = fx
        .central
        .connect(&cancel, &sensor_address(), &ConnectionParams::default())
        .await
        .unwrap();
    fx.radio.stall(SimOp::Discover);

    let err = device.discover_services(&[]).await.unwrap_err();
    assert!(err.is(ErrorCode::DISCOVERY_TIMEOUT));
    assert!(device.services().is_empty());
}

#[tokio::test]
async fn test_descriptor_and_link_extras() {
    let fx = central_fixture();
    let cancel = CancellationToken::new();
    let device = fx
        .central
        .connect(&cancel, &sensor_address(), &ConnectionParams::default())
        .await
        .unwrap();
    device.discover_services(&[]).await.unwrap();

    let cccd = device
        .find_characteristic(assigned::BATTERY_LEVEL)
        .unwrap()
        .descriptor(assigned::CLIENT_CHARACTERISTIC_CONFIGURATION)
        .unwrap();
    assert_eq!(cccd.read().await.unwrap(), vec![0x00, 0x00]);
    cccd.write(&[0x01, 0x00]).await.unwrap();
    assert_eq!(cccd.read().await.unwrap(), vec![0x01, 0x00]);

    assert_eq!(device.rssi().await.unwrap(), -50);
    assert_eq!(device.mtu().await.unwrap(), 247);
}

#[tokio::test]
async fn test_subscribe_delivers_notifications() {
    let fx = central_fixture();
    let cancel = CancellationToken::new();
    let device = fx
        .central
        .connect(&cancel, &sensor_address(), &ConnectionParams::default())
        .await
        .unwrap();
    device.discover_services(&[]).await.unwrap();
    let level = device.find_characteristic(assigned::BATTERY_LEVEL).unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    level
        .subscribe(move |value| {
            let _ = tx.send(value);
        })
        .await
        .unwrap();
    assert!(level.is_subscribed());

    let err = level.subscribe(|_| {}).await.unwrap_err();
    assert!(err.is(ErrorCode::INVALID_OPERATION));

    assert!(fx.radio.notify(
        &sensor_address(),
        assigned::BATTERY_SERVICE,
        assigned::BATTERY_LEVEL,
        [0x29]
    ));
    let value = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value, vec![0x29]);

    level.unsubscribe().await.unwrap();
    assert!(!level.is_subscribed());
    assert_eq!(fx.radio.calls(SimOp::Unsubscribe), 1);
    assert!(!fx.radio.notify(
        &sensor_address(),
        assigned::BATTERY_SERVICE,
        assigned::BATTERY_LEVEL,
        [0x28]
    ));

    // Unsubscribing again does nothing
    level.unsubscribe().await.unwrap();
    assert_eq!(fx.radio.calls(SimOp::Unsubscribe), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unsubscribe_waits_for_running_callback() {
    let fx = central_fixture();
    fx.radio.keep_sinks_after_unsubscribe();
    let cancel = CancellationToken::new();
    let device = fx
        .central
        .connect(&cancel, &sensor_address(), &ConnectionParams::default())
        .await
        .unwrap();
    device.discover_services(&[]).await.unwrap();
    let level = device.find_characteristic(assigned::BATTERY_LEVEL).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));
    let (started, mut running) = tokio::sync::mpsc::unbounded_channel();
    let (counter, done) = (calls.clone(), finished.clone());
    level
        .subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = started.send(());
            std::thread::sleep(Duration::from_millis(100));
            done.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

    assert!(fx.radio.notify(
        &sensor_address(),
        assigned::BATTERY_SERVICE,
        assigned::BATTERY_LEVEL,
        [0x29]
    ));
    tokio::time::timeout(Duration::from_secs(1), running.recv())
        .await
        .unwrap()
        .unwrap();

    // The callback is still sleeping when unsubscribe starts
    level.unsubscribe().await.unwrap();
    assert_eq!(finished.load(Ordering::SeqCst), 1);

    // The peer still delivers, but nothing reaches the callback
    assert!(fx.radio.notify(
        &sensor_address(),
        assigned::BATTERY_SERVICE,
        assigned::BATTERY_LEVEL,
        [0x28]
    ));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_disconnect_ends_subscriptions() {
    let fx = central_fixture();
    let cancel = CancellationToken::new();
    let device = fx
        .central
        .connect(&cancel, &sensor_address(), &ConnectionParams::default())
        .await
        .unwrap();
    device.discover_services(&[]).await.unwrap();
    let level = device.find_characteristic(assigned::BATTERY_LEVEL).unwrap();
    level.subscribe(|_| {}).await.unwrap();

    fx.central.disconnect(&device).await.unwrap();
    assert!(!level.is_subscribed());
    let err = level.read().await.unwrap_err();
    assert!(err.is(ErrorCode::DEVICE_NOT_CONNECTED));
}

// ----------------------------------------------------------------------------
// Scan Tests
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_scan_reports_each_device_once() {
    let fx = central_fixture();
    let cancel = CancellationToken::new();
    let seen = shared(Vec::new());

    let sink = seen.clone();
    let params = ScanParams::new().with_timeout(Some(Duration::from_millis(100)));
    fx.central
        .scan(&cancel, &params, move |adv| sink.lock().unwrap().push(adv))
        .await
        .unwrap();

    let seen = seen.lock().unwrap();
    let mut addresses: Vec<Address> = seen.iter().map(|adv| adv.address).collect();
    addresses.sort();
    assert_eq!(addresses, vec![sensor_address(), strap_address()]);

    let sensor = seen.iter().find(|adv| adv.address == sensor_address()).unwrap();
    assert_eq!(sensor.local_name.as_deref(), Some("Thermo"));
    assert_eq!(sensor.service_uuids, vec![assigned::BATTERY_SERVICE]);
    assert!(sensor.connectable);

    assert_eq!(fx.radio.calls(SimOp::StartScan), 1);
    assert_eq!(fx.radio.calls(SimOp::StopScan), 1);
    assert!(!fx.central.is_scanning());
    assert!(fx.resources.is_empty());
}

#[tokio::test]
async fn test_scan_with_duplicates() {
    let fx = central_fixture();
    let cancel = CancellationToken::new();
    let count = shared(0usize);

    let counter = count.clone();
    let params = ScanParams::new()
        .with_timeout(Some(Duration::from_millis(100)))
        .with_duplicates(true)
        .with_filter(ScanFilter {
            service_uuids: vec![assigned::BATTERY_SERVICE],
            ..ScanFilter::default()
        });
    fx.central
        .scan(&cancel, &params, move |_| *counter.lock().unwrap() += 1)
        .await
        .unwrap();
    assert!(*count.lock().unwrap() > 1);
}

#[tokio::test]
async fn test_scan_filters() {
    let cases = [
        (
            ScanFilter {
                service_uuids: vec![HEART_RATE_SERVICE],
                ..ScanFilter::default()
            },
            strap_address(),
        ),
        (
            ScanFilter {
                name_prefix: Some("Ther".to_string()),
                ..ScanFilter::default()
            },
            sensor_address(),
        ),
        (
            ScanFilter {
                min_rssi: Some(-60),
                ..ScanFilter::default()
            },
            sensor_address(),
        ),
    ];

    for (filter, expected) in cases {
        let fx = central_fixture();
        let cancel = CancellationToken::new();
        let seen = shared(Vec::new());
        let sink = seen.clone();
        let params = ScanParams::new()
            .with_timeout(Some(Duration::from_millis(60)))
            .with_filter(filter);
        fx.central
            .scan(&cancel, &params, move |adv| sink.lock().unwrap().push(adv.address))
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![expected]);
    }
}

#[tokio::test]
async fn test_second_scan_is_busy() {
    let fx = central_fixture();
    let central = fx.central.clone();
    let first = tokio::spawn(async move {
        let cancel = CancellationToken::new();
        central.scan(&cancel, &open_ended_scan(), |_| {}).await
    });
    assert!(eventually(|| fx.central.is_scanning()).await);

    let cancel = CancellationToken::new();
    let err = fx
        .central
        .scan(&cancel, &open_ended_scan(), |_| {})
        .await
        .unwrap_err();
    assert!(err.is(ErrorCode::RESOURCE_BUSY));
    assert_eq!(fx.radio.calls(SimOp::StartScan), 1);

    fx.central.stop_scan().await.unwrap();
    first.await.unwrap().unwrap();
    assert_eq!(fx.radio.calls(SimOp::StopScan), 1);
    assert!(!fx.central.is_scanning());

    // The slot is free again
    let params = ScanParams::new().with_timeout(Some(Duration::from_millis(20)));
    fx.central.scan(&cancel, &params, |_| {}).await.unwrap();
    assert_eq!(fx.radio.calls(SimOp::StartScan), 2);
}

#[tokio::test]
async fn test_scan_cancel_stops_native_scan() {
    let fx = central_fixture();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let err = fx
        .central
        .scan(&cancel, &open_ended_scan(), |_| {})
        .await
        .unwrap_err();
    assert!(err.is(ErrorCode::OPERATION_CANCELLED));
    assert_eq!(fx.radio.calls(SimOp::StopScan), 1);
    assert!(!fx.radio.is_scanning());
    assert!(fx.resources.is_empty());
}

#[tokio::test]
async fn test_scan_start_failure_still_stops() {
    let fx = central_fixture();
    let cancel = CancellationToken::new();
    fx.radio.fail_next(SimOp::StartScan, ErrorCode::PLATFORM_ERROR);

    let err = fx
        .central
        .scan(&cancel, &open_ended_scan(), |_| {})
        .await
        .unwrap_err();
    assert!(err.is(ErrorCode::SCAN_FAILED));
    assert_eq!(fx.radio.calls(SimOp::StopScan), 1);
    assert!(!fx.central.is_scanning());
}

#[tokio::test]
async fn test_abandoned_scan_still_stops_natively() {
    let fx = central_fixture();
    let central = fx.central.clone();
    let scan = tokio::spawn(async move {
        let cancel = CancellationToken::new();
        central.scan(&cancel, &open_ended_scan(), |_| {}).await
    });
    assert!(eventually(|| fx.central.is_scanning()).await);

    scan.abort();
    assert!(scan.await.unwrap_err().is_cancelled());

    let radio = fx.radio.clone();
    assert!(eventually(|| radio.calls(SimOp::StopScan) == 1).await);
    assert!(eventually(|| !fx.central.is_scanning()).await);
    assert!(fx.resources.is_empty());
}

#[tokio::test]
async fn test_stop_scan_when_idle_is_noop() {
    let fx = central_fixture();
    fx.central.stop_scan().await.unwrap();
    assert_eq!(fx.radio.calls(SimOp::StopScan), 0);
}

#[tokio::test]
async fn test_invalid_scan_params_rejected() {
    let fx = central_fixture();
    let cancel = CancellationToken::new();
    let params =
        ScanParams::new().with_timing(Duration::from_millis(50), Duration::from_millis(100));

    let err = fx.central.scan(&cancel, &params, |_| {}).await.unwrap_err();
    assert!(err.is(ErrorCode::VALIDATION_FAILED));
    assert_eq!(fx.radio.calls(SimOp::StartScan), 0);
}
