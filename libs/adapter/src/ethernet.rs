//! Ethernet addressing helpers

use crate::error::{AdapterError, Result};
use relay_config::defaults::ethernet::{ADDRESS_LENGTH, HEADER_SIZE};
use std::fmt;
use std::str::FromStr;

/// 48-bit IEEE MAC address
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddress(pub [u8; ADDRESS_LENGTH]);

impl MacAddress {
    pub const BROADCAST: MacAddress = MacAddress([0xff; ADDRESS_LENGTH]);

    /// Prefix of addresses the driver hands out as permanent addresses
    const PERMANENT_PREFIX: [u8; 5] = [0x02, 0x50, 0xf2, 0x00, 0x01];

    /// Distinct permanent addresses one driver can hand out
    pub const MAX_PERMANENT: usize = 128;

    /// Permanent address for the `index`-th adapter instance of a driver.
    /// Indices from `MAX_PERMANENT` on repeat earlier addresses.
    pub fn permanent(index: u8) -> Self {
        let p = Self::PERMANENT_PREFIX;
        MacAddress([p[0], p[1], p[2], p[3], p[4], 0x80 | (index & 0x7f)])
    }

    /// Destination address of a frame, if it is long enough to carry one
    pub fn destination_of(frame: &[u8]) -> Option<Self> {
        if frame.len() < HEADER_SIZE {
            return None;
        }
        let mut bytes = [0u8; ADDRESS_LENGTH];
        bytes.copy_from_slice(&frame[..ADDRESS_LENGTH]);
        Some(MacAddress(bytes))
    }

    pub fn octets(&self) -> [u8; ADDRESS_LENGTH] {
        self.0
    }

    /// Group bit set; includes broadcast
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn is_unicast(&self) -> bool {
        !self.is_multicast()
    }

    pub fn is_locally_administered(&self) -> bool {
        self.0[0] & 0x02 != 0
    }

    /// Check an address is usable as a configured station address override
    pub fn validate_override(&self) -> Result<()> {
        if !self.is_unicast() {
            return Err(AdapterError::invalid_address(format!(
                "{} is a group address",
                self
            )));
        }
        if !self.is_locally_administered() {
            return Err(AdapterError::invalid_address(format!(
                "{} is not locally administered",
                self
            )));
        }
        Ok(())
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}-{:02X}-{:02X}-{:02X}-{:02X}-{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddress({})", self)
    }
}

impl FromStr for MacAddress {
    type Err = AdapterError;

    /// Accepts `aa-bb-cc-dd-ee-ff`, `aa:bb:cc:dd:ee:ff` or twelve bare hex digits
    fn from_str(s: &str) -> Result<Self> {
        let digits: String = s
            .trim()
            .chars()
            .filter(|c| *c != '-' && *c != ':')
            .collect();

        if digits.len() != ADDRESS_LENGTH * 2 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(AdapterError::invalid_address(format!(
                "'{}' is not a MAC address",
                s
            )));
        }

        let mut bytes = [0u8; ADDRESS_LENGTH];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&digits[i * 2..i * 2 + 2], 16)
                .map_err(|e| AdapterError::invalid_address(format!("'{}': {}", s, e)))?;
        }
        Ok(MacAddress(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_address_layout() {
        let mac = MacAddress::permanent(3);
        assert_eq!(mac.to_string(), "02-50-F2-00-01-83");
        assert!(mac.is_locally_administered());
        assert!(mac.is_unicast());
        let last = MacAddress::permanent((MacAddress::MAX_PERMANENT - 1) as u8);
        assert_eq!(last.octets()[5], 0xff);
    }

    #[test]
    fn test_parse_formats() {
        let expected = MacAddress([0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee]);
        assert_eq!("02-AA-BB-CC-DD-EE".parse::<MacAddress>().unwrap(), expected);
        assert_eq!("02:aa:bb:cc:dd:ee".parse::<MacAddress>().unwrap(), expected);
        assert_eq!("02aabbccddee".parse::<MacAddress>().unwrap(), expected);
        assert!("02-aa-bb".parse::<MacAddress>().is_err());
        assert!("zz-aa-bb-cc-dd-ee".parse::<MacAddress>().is_err());
    }

    #[test]
    fn test_override_validation() {
        assert!(MacAddress::permanent(1).validate_override().is_ok());
        // Universally administered
        assert!(MacAddress([0x00, 0x11, 0x22, 0x33, 0x44, 0x55])
            .validate_override()
            .is_err());
        // Multicast and broadcast
        assert!(MacAddress([0x03, 0, 0, 0, 0, 1]).validate_override().is_err());
        assert!(MacAddress::BROADCAST.validate_override().is_err());
    }

    #[test]
    fn test_destination_of() {
        let mut frame = vec![0u8; 14];
        frame[..6].copy_from_slice(&[0xff; 6]);
        assert!(MacAddress::destination_of(&frame).unwrap().is_broadcast());
        assert!(MacAddress::destination_of(&frame[..13]).is_none());
    }
}
