//! 48-bit Bluetooth device addresses

use core::fmt;
use core::hash::{Hash, Hasher};
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{BleError, BleResult};

/// BLE addresses are either the device's public address or one of the random kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AddressKind {
    #[default]
    Public,
    Random,
}

/// A validated device address.
///
/// Equality and hashing consider only the six address bytes; the kind is
/// metadata reported by the platform.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    bytes: [u8; 6],
    kind: AddressKind,
}

impl Address {
    /// Validate and build an address from its bytes, most significant first
    pub fn new(bytes: [u8; 6], kind: AddressKind) -> BleResult<Self> {
        let rendered = render(&bytes);
        if bytes == [0u8; 6] {
            return Err(BleError::invalid_address(&rendered, "zero address is reserved"));
        }
        if bytes.iter().all(|b| *b == bytes[0]) {
            return Err(BleError::invalid_address(
                &rendered,
                "all-identical bytes are reserved",
            ));
        }
        Ok(Self { bytes, kind })
    }

    /// Parse `XX:XX:XX:XX:XX:XX` (hex digits in either case) as a public address
    pub fn parse(input: &str) -> BleResult<Self> {
        if input.len() != 17 {
            return Err(BleError::invalid_address(input, "expected XX:XX:XX:XX:XX:XX"));
        }
        let mut bytes = [0u8; 6];
        for (i, part) in input.split(':').enumerate() {
            if i >= 6 || part.len() != 2 || !part.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(BleError::invalid_address(input, "expected XX:XX:XX:XX:XX:XX"));
            }
            bytes[i] = u8::from_str_radix(part, 16)
                .map_err(|_| BleError::invalid_address(input, "not hexadecimal"))?;
        }
        Self::new(bytes, AddressKind::Public)
    }

    pub fn bytes(&self) -> [u8; 6] {
        self.bytes
    }

    pub fn kind(&self) -> AddressKind {
        self.kind
    }

    pub fn with_kind(mut self, kind: AddressKind) -> Self {
        self.kind = kind;
        self
    }
}

fn render(bytes: &[u8; 6]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
    }
}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.bytes.cmp(&other.bytes)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&render(&self.bytes))
    }
}

impl FromStr for Address {
    type Err = BleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = BleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_parse_and_render() {
        let addr = Address::parse("12:34:56:78:9a:bc").unwrap();
        assert_eq!(addr.bytes(), [0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC]);
        assert_eq!(addr.kind(), AddressKind::Public);
        assert_eq!(addr.to_string(), "12:34:56:78:9A:BC");
        assert_eq!(Address::parse(&addr.to_string()).unwrap(), addr);
    }

    #[test]
    fn test_rejects_reserved_patterns() {
        for input in ["00:00:00:00:00:00", "FF:FF:FF:FF:FF:FF", "aa:AA:aa:AA:aa:AA"] {
            let err = Address::parse(input).unwrap_err();
            assert_eq!(err.code(), ErrorCode::INVALID_ADDRESS);
        }
    }

    #[test]
    fn test_rejects_malformed_input() {
        for input in [
            "",
            "12:34:56:78:9A",
            "12-34-56-78-9A-BC",
            "12:34:56:78:9A:BCD",
            "1:234:56:78:9A:BC",
            "12:34:56:78:9A:BG",
            "+1:34:56:78:9A:BC",
            "12:34:56:78:9A:BC:",
        ] {
            assert!(Address::parse(input).is_err(), "input {:?}", input);
        }
    }

    #[test]
    fn test_kind_is_not_part_of_identity() {
        let public = Address::parse("12:34:56:78:9A:BC").unwrap();
        let random = public.with_kind(AddressKind::Random);
        assert_eq!(public, random);
        assert_eq!(random.kind(), AddressKind::Random);
    }
}
