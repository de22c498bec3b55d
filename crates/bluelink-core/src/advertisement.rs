//! Advertisements and the advertising-data (AD structure) codec
//!
//! Platform drivers hand the Central raw advertising payloads; this module
//! decodes them into [`Advertisement`] values. The Peripheral goes the other
//! way, encoding [`AdvertisingData`] before handing it to the driver.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::driver::ScanReport;
use crate::error::{BleError, BleResult, ErrorCode};
use crate::types::{Address, BleUuid};

// ----------------------------------------------------------------------------
// AD Types
// ----------------------------------------------------------------------------

pub const AD_FLAGS: u8 = 0x01;
pub const AD_INCOMPLETE_UUID16: u8 = 0x02;
pub const AD_COMPLETE_UUID16: u8 = 0x03;
pub const AD_INCOMPLETE_UUID32: u8 = 0x04;
pub const AD_COMPLETE_UUID32: u8 = 0x05;
pub const AD_INCOMPLETE_UUID128: u8 = 0x06;
pub const AD_COMPLETE_UUID128: u8 = 0x07;
pub const AD_SHORT_NAME: u8 = 0x08;
pub const AD_COMPLETE_NAME: u8 = 0x09;
pub const AD_TX_POWER: u8 = 0x0A;
pub const AD_SERVICE_DATA16: u8 = 0x16;
pub const AD_SERVICE_DATA32: u8 = 0x20;
pub const AD_SERVICE_DATA128: u8 = 0x21;
pub const AD_MANUFACTURER_DATA: u8 = 0xFF;

/// LE General Discoverable, BR/EDR not supported
pub const FLAGS_GENERAL_DISCOVERABLE: u8 = 0x06;

/// Payload limit of a legacy advertising PDU
pub const LEGACY_ADV_MAX_LEN: usize = 31;

// ----------------------------------------------------------------------------
// Advertising Data
// ----------------------------------------------------------------------------

/// Decoded contents of an advertising payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisingData {
    pub flags: Option<u8>,
    pub local_name: Option<String>,
    pub service_uuids: Vec<BleUuid>,
    pub service_data: BTreeMap<BleUuid, Vec<u8>>,
    /// Keyed by company identifier
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
    pub tx_power: Option<i8>,
}

impl AdvertisingData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = Some(flags);
        self
    }

    pub fn with_local_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self
    }

    pub fn with_service(mut self, uuid: BleUuid) -> Self {
        if !self.service_uuids.contains(&uuid) {
            self.service_uuids.push(uuid);
        }
        self
    }

    pub fn with_service_data(mut self, uuid: BleUuid, data: Vec<u8>) -> Self {
        self.service_data.insert(uuid, data);
        self
    }

    pub fn with_manufacturer_data(mut self, company_id: u16, data: Vec<u8>) -> Self {
        self.manufacturer_data.insert(company_id, data);
        self
    }

    pub fn with_tx_power(mut self, dbm: i8) -> Self {
        self.tx_power = Some(dbm);
        self
    }

    /// Encode for a legacy advertisement, failing when over 31 bytes
    pub fn encode(&self) -> BleResult<Vec<u8>> {
        let payload = self.encode_unbounded();
        if payload.len() > LEGACY_ADV_MAX_LEN {
            return Err(BleError::new(
                ErrorCode::ADVERTISING_DATA_TOO_LARGE,
                format!(
                    "advertising data is {} bytes (max {})",
                    payload.len(),
                    LEGACY_ADV_MAX_LEN
                ),
            )
            .with_context("size", payload.len()));
        }
        Ok(payload)
    }

    /// Encode without the legacy length limit
    pub fn encode_unbounded(&self) -> Vec<u8> {
        let mut out = Vec::new();

        if let Some(flags) = self.flags {
            push_structure(&mut out, AD_FLAGS, &[flags]);
        }

        let mut uuid16 = Vec::new();
        let mut uuid32 = Vec::new();
        let mut uuid128 = Vec::new();
        for uuid in &self.service_uuids {
            if let Some(short) = uuid.to_u16() {
                uuid16.extend_from_slice(&short.to_le_bytes());
            } else if let Some(short) = uuid.to_u32() {
                uuid32.extend_from_slice(&short.to_le_bytes());
            } else {
                uuid128.extend_from_slice(&uuid.as_u128().to_le_bytes());
            }
        }
        if !uuid16.is_empty() {
            push_structure(&mut out, AD_COMPLETE_UUID16, &uuid16);
        }
        if !uuid32.is_empty() {
            push_structure(&mut out, AD_COMPLETE_UUID32, &uuid32);
        }
        if !uuid128.is_empty() {
            push_structure(&mut out, AD_COMPLETE_UUID128, &uuid128);
        }

        if let Some(name) = &self.local_name {
            push_structure(&mut out, AD_COMPLETE_NAME, name.as_bytes());
        }

        if let Some(dbm) = self.tx_power {
            push_structure(&mut out, AD_TX_POWER, &dbm.to_le_bytes());
        }

        for (uuid, data) in &self.service_data {
            let (ad_type, mut body) = if let Some(short) = uuid.to_u16() {
                (AD_SERVICE_DATA16, short.to_le_bytes().to_vec())
            } else if let Some(short) = uuid.to_u32() {
                (AD_SERVICE_DATA32, short.to_le_bytes().to_vec())
            } else {
                (AD_SERVICE_DATA128, uuid.as_u128().to_le_bytes().to_vec())
            };
            body.extend_from_slice(data);
            push_structure(&mut out, ad_type, &body);
        }

        for (company_id, data) in &self.manufacturer_data {
            let mut body = company_id.to_le_bytes().to_vec();
            body.extend_from_slice(data);
            push_structure(&mut out, AD_MANUFACTURER_DATA, &body);
        }

        out
    }
}

fn push_structure(out: &mut Vec<u8>, ad_type: u8, data: &[u8]) {
    if data.len() > 254 {
        warn!("Dropping AD structure 0x{:02x}: {} bytes does not fit", ad_type, data.len());
        return;
    }
    out.push(data.len() as u8 + 1);
    out.push(ad_type);
    out.extend_from_slice(data);
}

/// Decode an advertising payload.
///
/// A zero length byte or a structure running past the end terminates parsing;
/// unknown AD types are skipped.
pub fn parse_advertising_data(payload: &[u8]) -> AdvertisingData {
    let mut parsed = AdvertisingData::default();
    let mut i = 0;

    while i < payload.len() {
        let len = payload[i] as usize;
        if len == 0 || i + 1 + len > payload.len() {
            break;
        }
        let ad_type = payload[i + 1];
        let data = &payload[i + 2..i + 1 + len];

        match ad_type {
            AD_FLAGS => parsed.flags = data.first().copied(),
            AD_INCOMPLETE_UUID16 | AD_COMPLETE_UUID16 => {
                for chunk in data.chunks_exact(2) {
                    let uuid = BleUuid::from_u16(u16::from_le_bytes([chunk[0], chunk[1]]));
                    push_unique(&mut parsed.service_uuids, uuid);
                }
            }
            AD_INCOMPLETE_UUID32 | AD_COMPLETE_UUID32 => {
                for chunk in data.chunks_exact(4) {
                    let short = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    push_unique(&mut parsed.service_uuids, BleUuid::from_u32(short));
                }
            }
            AD_INCOMPLETE_UUID128 | AD_COMPLETE_UUID128 => {
                for chunk in data.chunks_exact(16) {
                    push_unique(&mut parsed.service_uuids, uuid128_le(chunk));
                }
            }
            AD_SHORT_NAME => {
                if parsed.local_name.is_none() {
                    parsed.local_name = Some(String::from_utf8_lossy(data).into_owned());
                }
            }
            AD_COMPLETE_NAME => {
                parsed.local_name = Some(String::from_utf8_lossy(data).into_owned());
            }
            AD_TX_POWER => parsed.tx_power = data.first().map(|b| *b as i8),
            AD_SERVICE_DATA16 if data.len() >= 2 => {
                let uuid = BleUuid::from_u16(u16::from_le_bytes([data[0], data[1]]));
                parsed.service_data.insert(uuid, data[2..].to_vec());
            }
            AD_SERVICE_DATA32 if data.len() >= 4 => {
                let uuid =
                    BleUuid::from_u32(u32::from_le_bytes([data[0], data[1], data[2], data[3]]));
                parsed.service_data.insert(uuid, data[4..].to_vec());
            }
            AD_SERVICE_DATA128 if data.len() >= 16 => {
                parsed.service_data.insert(uuid128_le(&data[..16]), data[16..].to_vec());
            }
            AD_MANUFACTURER_DATA if data.len() >= 2 => {
                let company_id = u16::from_le_bytes([data[0], data[1]]);
                parsed.manufacturer_data.insert(company_id, data[2..].to_vec());
            }
            _ => {}
        }

        i += 1 + len;
    }

    parsed
}

fn uuid128_le(chunk: &[u8]) -> BleUuid {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(chunk);
    BleUuid::from_u128(u128::from_le_bytes(bytes))
}

fn push_unique(list: &mut Vec<BleUuid>, uuid: BleUuid) {
    if !list.contains(&uuid) {
        list.push(uuid);
    }
}

// ----------------------------------------------------------------------------
// Advertisement
// ----------------------------------------------------------------------------

/// One observation made while scanning. Not persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Advertisement {
    pub address: Address,
    pub rssi: i16,
    pub local_name: Option<String>,
    pub service_uuids: Vec<BleUuid>,
    pub service_data: BTreeMap<BleUuid, Vec<u8>>,
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
    pub tx_power: Option<i8>,
    pub connectable: bool,
}

impl Advertisement {
    pub fn new(address: Address, rssi: i16) -> Self {
        Self {
            address,
            rssi,
            local_name: None,
            service_uuids: Vec::new(),
            service_data: BTreeMap::new(),
            manufacturer_data: BTreeMap::new(),
            tx_power: None,
            connectable: false,
        }
    }

    /// Decode a driver scan report. A name reported by the platform fills in
    /// when the payload carries none.
    pub fn from_report(report: &ScanReport) -> Self {
        let data = parse_advertising_data(&report.payload);
        Self {
            address: report.address,
            rssi: report.rssi,
            local_name: data.local_name.or_else(|| report.name.clone()),
            service_uuids: data.service_uuids,
            service_data: data.service_data,
            manufacturer_data: data.manufacturer_data,
            tx_power: data.tx_power,
            connectable: report.connectable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_payload() {
        // flags, 16-bit UUID list (0x180F, 0x180A), complete name "Thermo",
        // manufacturer data for company 0x004C
        let payload = [
            0x02, 0x01, 0x06, //
            0x05, 0x03, 0x0F, 0x18, 0x0A, 0x18, //
            0x07, 0x09, b'T', b'h', b'e', b'r', b'm', b'o', //
            0x05, 0xFF, 0x4C, 0x00, 0x01, 0x02,
        ];
        let data = parse_advertising_data(&payload);
        assert_eq!(data.flags, Some(0x06));
        assert_eq!(
            data.service_uuids,
            vec![BleUuid::from_u16(0x180F), BleUuid::from_u16(0x180A)]
        );
        assert_eq!(data.local_name.as_deref(), Some("Thermo"));
        assert_eq!(data.manufacturer_data.get(&0x004C), Some(&vec![0x01, 0x02]));
    }

    #[test]
    fn test_parse_stops_on_truncation() {
        let payload = [0x02, 0x01, 0x06, 0x09, 0x09, b'a', b'b'];
        let data = parse_advertising_data(&payload);
        assert_eq!(data.flags, Some(0x06));
        assert!(data.local_name.is_none());

        let padded = [0x02, 0x0A, 0xF4, 0x00, 0x00, 0x00];
        let data = parse_advertising_data(&padded);
        assert_eq!(data.tx_power, Some(-12));
    }

    #[test]
    fn test_encode_then_parse_preserves_fields() {
        let custom = BleUuid::parse("6e400001-b5a3-f393-e0a9-e50e24dcca9e").unwrap();
        let data = AdvertisingData::new()
            .with_flags(FLAGS_GENERAL_DISCOVERABLE)
            .with_service(custom)
            .with_local_name("nus");
        let encoded = data.encode().unwrap();
        assert_eq!(encoded.len(), 3 + 18 + 5);
        assert_eq!(parse_advertising_data(&encoded), data);
    }

    #[test]
    fn test_encode_rejects_oversized_legacy_payload() {
        let data = AdvertisingData::new()
            .with_local_name("a-very-long-peripheral-name-that-overflows");
        let err = data.encode().unwrap_err();
        assert_eq!(err.code(), ErrorCode::ADVERTISING_DATA_TOO_LARGE);
        assert!(data.encode_unbounded().len() > LEGACY_ADV_MAX_LEN);
    }

    #[test]
    fn test_report_name_fallback() {
        let report = ScanReport {
            address: Address::parse("12:34:56:78:9A:BC").unwrap(),
            rssi: -40,
            name: Some("from-platform".to_string()),
            payload: vec![0x02, 0x01, 0x06],
            connectable: true,
        };
        let adv = Advertisement::from_report(&report);
        assert_eq!(adv.local_name.as_deref(), Some("from-platform"));
        assert!(adv.connectable);
    }
}
