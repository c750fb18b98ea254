//! Identity types for local controllers and remote devices.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use thiserror::Error;

/// A Bluetooth device address, stored in display order (`AA:BB:CC:DD:EE:FF`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Address(pub [u8; 6]);

impl Address {
   /// The all-zero address.
   pub const ANY: Self = Self([0; 6]);

   pub const fn new(bytes: [u8; 6]) -> Self {
      Self(bytes)
   }

   pub fn is_any(&self) -> bool {
      *self == Self::ANY
   }
}

impl fmt::Display for Address {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let [a, b, c, d, e, g] = self.0;
      write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
   }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid Bluetooth address: {0}")]
pub struct InvalidAddress(pub SmolStr);

impl FromStr for Address {
   type Err = InvalidAddress;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      let invalid = || InvalidAddress(SmolStr::new(s));
      let mut bytes = [0u8; 6];
      let mut parts = s.split([':', '_', '-']);
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

/// Transport and address kind of a remote device.
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
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
pub enum AddressType {
   #[default]
   #[strum(serialize = "bredr")]
   BrEdr,
   #[strum(serialize = "le-public")]
   LePublic,
   #[strum(serialize = "le-random")]
   LeRandom,
}

impl AddressType {
   pub const fn is_le(self) -> bool {
      matches!(self, Self::LePublic | Self::LeRandom)
   }
}

/// Index of a local controller, rendered as `hciN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AdapterId(pub u16);

impl fmt::Display for AdapterId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "hci{}", self.0)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_address_parse_and_display() {
      let addr: Address = "00:1a:7D:da:71:13".parse().unwrap();
      assert_eq!(addr.0, [0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x13]);
      assert_eq!(addr.to_string(), "00:1A:7D:DA:71:13");

      // Object-path style separators are accepted too
      let underscored: Address = "00_1A_7D_DA_71_13".parse().unwrap();
      assert_eq!(addr, underscored);
   }

   #[test]
   fn test_address_parse_rejects_garbage() {
      assert!("00:1A:7D:DA:71".parse::<Address>().is_err());
      assert!("00:1A:7D:DA:71:13:00".parse::<Address>().is_err());
      assert!("00:1A:7D:DA:71:1".parse::<Address>().is_err());
      assert!("zz:1A:7D:DA:71:13".parse::<Address>().is_err());
   }

   #[test]
   fn test_address_type_strings() {
      assert_eq!(AddressType::LeRandom.to_string(), "le-random");
      assert_eq!("bredr".parse::<AddressType>().unwrap(), AddressType::BrEdr);
      assert!(AddressType::LePublic.is_le());
      assert!(!AddressType::BrEdr.is_le());
      assert_eq!(AdapterId(1).to_string(), "hci1");
   }
}
