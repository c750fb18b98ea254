//! Well-known service UUIDs and Bluetooth base-UUID helpers.

use uuid::Uuid;

/// `00000000-0000-1000-8000-00805F9B34FB`
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Expands a 16-bit assigned number into a full UUID.
pub const fn from_u16(short: u16) -> Uuid {
   from_u32(short as u32)
}

/// Expands a 32-bit assigned number into a full UUID.
pub const fn from_u32(short: u32) -> Uuid {
   Uuid::from_u128(((short as u128) << 96) | BASE_UUID)
}

/// Returns the 16-bit short form if the UUID lies on the base UUID.
pub fn to_u16(uuid: &Uuid) -> Option<u16> {
   let value = uuid.as_u128();
   if value & ((1u128 << 96) - 1) != BASE_UUID {
      return None;
   }
   u16::try_from(value >> 96).ok()
}

// SDP browse roots
pub const L2CAP: Uuid = from_u16(0x0100);
pub const PUBLIC_BROWSE_GROUP: Uuid = from_u16(0x1002);
pub const PNP_INFO: Uuid = from_u16(0x1200);

// Audio-class profiles
pub const HSP_HS: Uuid = from_u16(0x1108);
pub const A2DP_SOURCE: Uuid = from_u16(0x110a);
pub const A2DP_SINK: Uuid = from_u16(0x110b);
pub const AVRCP_TARGET: Uuid = from_u16(0x110c);
pub const AVRCP_REMOTE: Uuid = from_u16(0x110e);
pub const HSP_AG: Uuid = from_u16(0x1112);
pub const HFP_HF: Uuid = from_u16(0x111e);
pub const HFP_AG: Uuid = from_u16(0x111f);

// Generic LE services
pub const GAP: Uuid = from_u16(0x1800);
pub const GATT: Uuid = from_u16(0x1801);

/// UUIDs searched on every classic browse, in order.
pub const BROWSE_ROOTS: [Uuid; 3] = [L2CAP, PNP_INFO, PUBLIC_BROWSE_GROUP];

/// Default audio-class profile UUIDs.
pub const AUDIO_PROFILES: [Uuid; 8] = [
   HSP_HS,
   A2DP_SOURCE,
   A2DP_SINK,
   AVRCP_TARGET,
   AVRCP_REMOTE,
   HSP_AG,
   HFP_HF,
   HFP_AG,
];

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_short_uuid_expansion() {
      assert_eq!(
         A2DP_SINK.to_string(),
         "0000110b-0000-1000-8000-00805f9b34fb"
      );
      assert_eq!(to_u16(&A2DP_SINK), Some(0x110b));
      assert_eq!(to_u16(&Uuid::from_u128(0x1234)), None);
   }
}
