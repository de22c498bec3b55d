//! Conversions between btleplug types and bluelink types

use btleplug::api::{AddressType, BDAddr, CharPropFlags, PeripheralProperties};
use bluelink_core::driver::ScanReport;
use bluelink_core::{
    Address, AddressKind, AdvertisingData, BleError, BleResult, BleUuid, CharacteristicProperties,
    ErrorCode,
};

// ----------------------------------------------------------------------------
// Identifiers
// ----------------------------------------------------------------------------

pub fn to_bdaddr(address: &Address) -> BDAddr {
    BDAddr::from(address.bytes())
}

pub fn from_bdaddr(address: BDAddr, kind: Option<AddressType>) -> BleResult<Address> {
    let kind = match kind {
        Some(AddressType::Random) => AddressKind::Random,
        _ => AddressKind::Public,
    };
    Address::new(address.into_inner(), kind)
}

/// btleplug uses the ATT property bit layout, so the bits carry over
pub fn properties(flags: CharPropFlags) -> CharacteristicProperties {
    CharacteristicProperties::from_bits_truncate(flags.bits())
}

// ----------------------------------------------------------------------------
// Errors
// ----------------------------------------------------------------------------

/// Classify a btleplug failure into the bluelink code bands
pub fn map_error(err: btleplug::Error) -> BleError {
    use btleplug::Error;

    let code = match &err {
        Error::PermissionDenied => ErrorCode::PERMISSION_DENIED,
        Error::DeviceNotFound => ErrorCode::DEVICE_NOT_FOUND,
        Error::NotConnected => ErrorCode::DEVICE_NOT_CONNECTED,
        Error::NoSuchCharacteristic | Error::UnexpectedCharacteristic => {
            ErrorCode::CHARACTERISTIC_NOT_FOUND
        }
        Error::NotSupported(_) => ErrorCode::PLATFORM_NOT_SUPPORTED,
        Error::TimedOut(_) => ErrorCode::OPERATION_TIMEOUT,
        _ => ErrorCode::PLATFORM_ERROR,
    };
    BleError::new(code, err.to_string()).with_cause(err)
}

// ----------------------------------------------------------------------------
// Scan Reports
// ----------------------------------------------------------------------------

/// Rebuild an advertising payload from the properties btleplug has collected.
///
/// btleplug does not expose the raw AD bytes, so the fields it parsed are
/// re-encoded and the core decodes them like any other report.
pub fn scan_report(props: &PeripheralProperties) -> Option<ScanReport> {
    let address = from_bdaddr(props.address, props.address_type).ok()?;

    let mut data = AdvertisingData::new();
    data.local_name = props.local_name.clone();
    data.service_uuids = props.services.iter().copied().map(BleUuid::from).collect();
    data.service_data = props
        .service_data
        .iter()
        .map(|(uuid, value)| (BleUuid::from(*uuid), value.clone()))
        .collect();
    data.manufacturer_data = props
        .manufacturer_data
        .iter()
        .map(|(company, value)| (*company, value.clone()))
        .collect();
    data.tx_power = props
        .tx_power_level
        .map(|dbm| dbm.clamp(i16::from(i8::MIN), i16::from(i8::MAX)) as i8);

    Some(ScanReport {
        address,
        rssi: props.rssi.unwrap_or(i16::MIN),
        name: props.local_name.clone(),
        payload: data.encode_unbounded(),
        connectable: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bluelink_core::parse_advertising_data;
    use bluelink_core::types::assigned;
    use std::collections::HashMap;

    #[test]
    fn test_property_bits_carry_over() {
        let flags =
            CharPropFlags::READ | CharPropFlags::NOTIFY | CharPropFlags::WRITE_WITHOUT_RESPONSE;
        let converted = properties(flags);
        assert_eq!(
            converted,
            CharacteristicProperties::READ
                | CharacteristicProperties::NOTIFY
                | CharacteristicProperties::WRITE_WITHOUT_RESPONSE
        );
        assert_eq!(properties(CharPropFlags::all()).bits(), 0xFF);
    }

    #[test]
    fn test_address_conversion() {
        let address = Address::parse("C0:FF:EE:00:00:01").unwrap();
        let native = to_bdaddr(&address);
        assert_eq!(native.to_string(), "C0:FF:EE:00:00:01");

        let back = from_bdaddr(native, Some(AddressType::Random)).unwrap();
        assert_eq!(back, address);
        assert_eq!(back.kind(), AddressKind::Random);

        assert!(from_bdaddr(BDAddr::from([0u8; 6]), None).is_err());
    }

    #[test]
    fn test_error_classification() {
        assert!(map_error(btleplug::Error::PermissionDenied).is(ErrorCode::PERMISSION_DENIED));
        assert!(map_error(btleplug::Error::NotConnected).is(ErrorCode::DEVICE_NOT_CONNECTED));

        let timeout = map_error(btleplug::Error::TimedOut(std::time::Duration::from_secs(1)));
        assert!(timeout.is(ErrorCode::OPERATION_TIMEOUT));
        assert!(timeout.is_retryable());

        let other = map_error(btleplug::Error::RuntimeError("dbus went away".into()));
        assert!(other.is(ErrorCode::PLATFORM_ERROR));
        assert!(other.message().contains("dbus went away"));
    }

    #[test]
    fn test_scan_report_reencodes_properties() {
        let mut manufacturer_data = HashMap::new();
        manufacturer_data.insert(0x004C, vec![1, 2]);
        let props = PeripheralProperties {
            address: BDAddr::from([0xC0, 0xFF, 0xEE, 0x00, 0x00, 0x01]),
            local_name: Some("Thermo".to_string()),
            rssi: Some(-55),
            tx_power_level: Some(-300),
            services: vec![*assigned::BATTERY_SERVICE.as_uuid()],
            manufacturer_data,
            ..PeripheralProperties::default()
        };

        let report = scan_report(&props).unwrap();
        assert_eq!(report.rssi, -55);
        let data = parse_advertising_data(&report.payload);
        assert_eq!(data.local_name.as_deref(), Some("Thermo"));
        assert_eq!(data.service_uuids, vec![assigned::BATTERY_SERVICE]);
        assert_eq!(data.manufacturer_data.get(&0x004C), Some(&vec![1, 2]));
        assert_eq!(data.tx_power, Some(i8::MIN));
    }
}
