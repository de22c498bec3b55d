//! Bluetooth UUIDs normalized to their canonical 128-bit form

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BleError, BleResult};

// ----------------------------------------------------------------------------
// Bluetooth Base UUID
// ----------------------------------------------------------------------------

/// `00000000-0000-1000-8000-00805f9b34fb`; 16- and 32-bit UUIDs are offsets into it
pub const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805F9B34FB;

/// Suffix shared by every UUID derived from the Base UUID
pub const BASE_UUID_SUFFIX: &str = "-0000-1000-8000-00805f9b34fb";

const BASE_MASK: u128 = 0x00000000_FFFF_FFFF_FFFF_FFFFFFFFFFFF;

// ----------------------------------------------------------------------------
// BleUuid
// ----------------------------------------------------------------------------

/// A Bluetooth UUID. Two values are equal iff their canonical 128-bit forms are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BleUuid(Uuid);

impl BleUuid {
    /// Expand a 16-bit assigned number
    pub const fn from_u16(short: u16) -> Self {
        Self::from_u32(short as u32)
    }

    /// Expand a 32-bit assigned number
    pub const fn from_u32(short: u32) -> Self {
        Self(Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96)))
    }

    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    /// Parse and normalize; see [`normalize_uuid`] for the accepted forms
    pub fn parse(input: &str) -> BleResult<Self> {
        let hex_digits = match input.len() {
            4 => {
                ensure_hex(input, input)?;
                let short = u16::from_str_radix(input, 16)
                    .map_err(|_| BleError::invalid_uuid(input, "not hexadecimal"))?;
                return Ok(Self::from_u16(short));
            }
            32 => input.to_string(),
            36 => {
                for (i, c) in input.char_indices() {
                    let hyphen_slot = matches!(i, 8 | 13 | 18 | 23);
                    if hyphen_slot != (c == '-') {
                        return Err(BleError::invalid_uuid(input, "misplaced separator"));
                    }
                }
                input.replace('-', "")
            }
            _ => {
                return Err(BleError::invalid_uuid(
                    input,
                    "expected 4, 32 or 36 characters",
                ))
            }
        };

        ensure_hex(&hex_digits, input)?;
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(&hex_digits, &mut bytes)
            .map_err(|_| BleError::invalid_uuid(input, "not hexadecimal"))?;
        Ok(Self(Uuid::from_bytes(bytes)))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn as_u128(&self) -> u128 {
        self.0.as_u128()
    }

    /// The 16-bit assigned number, when this UUID is derived from the Base UUID
    pub fn to_u16(&self) -> Option<u16> {
        self.to_u32().and_then(|v| u16::try_from(v).ok())
    }

    /// The 32-bit assigned number, when this UUID is derived from the Base UUID
    pub fn to_u32(&self) -> Option<u32> {
        let value = self.0.as_u128();
        if value & BASE_MASK == BLUETOOTH_BASE_UUID {
            Some((value >> 96) as u32)
        } else {
            None
        }
    }
}

fn ensure_hex(digits: &str, input: &str) -> BleResult<()> {
    if digits.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(BleError::invalid_uuid(input, "not hexadecimal"))
    }
}

/// Normalize a UUID string to lower-case hyphenated 128-bit form.
///
/// Accepts 4 hex digits (16-bit), 32 hex digits without separators, or the
/// 36-character hyphenated form. Idempotent.
pub fn normalize_uuid(input: &str) -> BleResult<String> {
    BleUuid::parse(input).map(|uuid| uuid.to_string())
}

impl fmt::Display for BleUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for BleUuid {
    type Err = BleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for BleUuid {
    type Error = BleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<BleUuid> for String {
    fn from(uuid: BleUuid) -> Self {
        uuid.to_string()
    }
}

impl From<Uuid> for BleUuid {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<BleUuid> for Uuid {
    fn from(uuid: BleUuid) -> Self {
        uuid.0
    }
}

impl From<u16> for BleUuid {
    fn from(short: u16) -> Self {
        Self::from_u16(short)
    }
}

// ----------------------------------------------------------------------------
// Well-known assigned numbers
// ----------------------------------------------------------------------------

pub mod assigned {
    use super::BleUuid;

    pub const GENERIC_ACCESS_SERVICE: BleUuid = BleUuid::from_u16(0x1800);
    pub const DEVICE_INFORMATION_SERVICE: BleUuid = BleUuid::from_u16(0x180A);
    pub const BATTERY_SERVICE: BleUuid = BleUuid::from_u16(0x180F);
    pub const DEVICE_NAME: BleUuid = BleUuid::from_u16(0x2A00);
    pub const BATTERY_LEVEL: BleUuid = BleUuid::from_u16(0x2A19);
    pub const CLIENT_CHARACTERISTIC_CONFIGURATION: BleUuid = BleUuid::from_u16(0x2902);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_short_form_expands_with_base_suffix() {
        assert_eq!(
            normalize_uuid("180F").unwrap(),
            "0000180f-0000-1000-8000-00805f9b34fb"
        );
        assert!(normalize_uuid("2a19").unwrap().ends_with(BASE_UUID_SUFFIX));
    }

    #[test]
    fn test_all_accepted_forms_agree() {
        let short = BleUuid::parse("180F").unwrap();
        let compact = BleUuid::parse("0000180F00001000800000805F9B34FB").unwrap();
        let canonical = BleUuid::parse("0000180f-0000-1000-8000-00805f9b34fb").unwrap();
        assert_eq!(short, compact);
        assert_eq!(short, canonical);
        assert_eq!(short, assigned::BATTERY_SERVICE);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let once = normalize_uuid("6E400001B5A3F393E0A9E50E24DCCA9E").unwrap();
        assert_eq!(once, "6e400001-b5a3-f393-e0a9-e50e24dcca9e");
        assert_eq!(normalize_uuid(&once).unwrap(), once);
    }

    #[test]
    fn test_rejects_bad_inputs() {
        for input in [
            "",
            "18",
            "180",
            "180G",
            "+180",
            "0000180f",
            "0000180f-0000-1000-8000-00805f9b34f",
            "0000180f00001000-8000-00805f9b34fb0",
            "0000180f-0000-1000-8000-00805f9b34fg",
            " 180F",
        ] {
            let err = normalize_uuid(input).unwrap_err();
            assert_eq!(err.code(), ErrorCode::INVALID_UUID, "input {:?}", input);
        }
    }

    #[test]
    fn test_short_form_extraction() {
        assert_eq!(assigned::BATTERY_LEVEL.to_u16(), Some(0x2A19));
        assert_eq!(BleUuid::from_u32(0x1234_5678).to_u32(), Some(0x1234_5678));
        assert_eq!(BleUuid::from_u32(0x1234_5678).to_u16(), None);
        let custom = BleUuid::parse("6e400001-b5a3-f393-e0a9-e50e24dcca9e").unwrap();
        assert_eq!(custom.to_u32(), None);
    }

    #[test]
    fn test_serde_uses_canonical_string() {
        let json = serde_json::to_string(&assigned::BATTERY_LEVEL).unwrap();
        assert_eq!(json, "\"00002a19-0000-1000-8000-00805f9b34fb\"");
        let back: BleUuid = serde_json::from_str("\"2A19\"").unwrap();
        assert_eq!(back, assigned::BATTERY_LEVEL);
    }
}
