//! Bluetooth device addresses.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Length of a BD_ADDR in bytes.
pub const ADDRESS_LEN: usize = 6;

/// A 48-bit Bluetooth device address, stored most significant byte first
/// (the order it is written in, `AA:BB:CC:DD:EE:FF`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(pub [u8; ADDRESS_LEN]);

impl Address {
   pub const fn new(bytes: [u8; ADDRESS_LEN]) -> Self {
      Self(bytes)
   }

   pub const fn any() -> Self {
      Self([0; ADDRESS_LEN])
   }

   /// Byte order used on the HCI wire (least significant byte first).
   pub fn to_le_bytes(self) -> [u8; ADDRESS_LEN] {
      let mut bytes = self.0;
      bytes.reverse();
      bytes
   }

   pub fn from_le_bytes(mut bytes: [u8; ADDRESS_LEN]) -> Self {
      bytes.reverse();
      Self(bytes)
   }
}

impl fmt::Display for Address {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let [a, b, c, d, e, g] = self.0;
      write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
   }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid Bluetooth address: {0:?}")]
pub struct InvalidAddress(pub String);

impl FromStr for Address {
   type Err = InvalidAddress;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      let invalid = || InvalidAddress(s.to_string());
      let mut bytes = [0u8; ADDRESS_LEN];
      let mut parts = s.split(':');
      for byte in &mut bytes {
         let part = parts.next().ok_or_else(invalid)?;
         if part.len() != 2 {
            return Err(invalid());
         }
         *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
      }
      if parts.next().is_some() {
         return Err(invalid());
      }
      Ok(Self(bytes))
   }
}

impl Serialize for Address {
   fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
      serializer.collect_str(self)
   }
}

impl<'de> Deserialize<'de> for Address {
   fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
      let s = String::deserialize(deserializer)?;
      s.parse().map_err(serde::de::Error::custom)
   }
}

/// Address type tag carried alongside an [`Address`].
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Default,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AddressType {
   #[default]
   Public = 0x00,
   Random = 0x01,
   PublicIdentity = 0x02,
   RandomIdentity = 0x03,
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_parse_and_display() {
      let addr: Address = "AA:BB:CC:DD:EE:FF".parse().unwrap();
      assert_eq!(addr, Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]));
      assert_eq!(addr.to_string(), "AA:BB:CC:DD:EE:FF");

      let lower: Address = "0a:1b:2c:3d:4e:5f".parse().unwrap();
      assert_eq!(lower.to_string(), "0A:1B:2C:3D:4E:5F");
   }

   #[test]
   fn test_parse_rejects_malformed() {
      assert!("AA:BB:CC:DD:EE".parse::<Address>().is_err());
      assert!("AA:BB:CC:DD:EE:FF:00".parse::<Address>().is_err());
      assert!("AA:BB:CC:DD:EE:GG".parse::<Address>().is_err());
      assert!("AABB:CC:DD:EE:FF".parse::<Address>().is_err());
      assert!("".parse::<Address>().is_err());
   }

   #[test]
   fn test_wire_order_is_reversed() {
      let addr = Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
      assert_eq!(addr.to_le_bytes(), [0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]);
      assert_eq!(Address::from_le_bytes(addr.to_le_bytes()), addr);
   }

   #[test]
   fn test_address_type_names() {
      assert_eq!(AddressType::from_repr(0x01), Some(AddressType::Random));
      assert_eq!(AddressType::Public.to_string(), "public");
      assert_eq!(
         "random_identity".parse::<AddressType>().unwrap(),
         AddressType::RandomIdentity
      );
   }
}
