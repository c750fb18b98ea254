//! Extended Inquiry Response parsing.
//!
//! EIR (and LE advertising) data is a sequence of `len | type | payload`
//! structures. Unknown types are skipped; a truncated structure ends parsing
//! without discarding what was read before it.

use log::debug;
use smallvec::SmallVec;
use smol_str::SmolStr;
use uuid::Uuid;

use crate::uuids;

const EIR_FLAGS: u8 = 0x01;
const EIR_UUID16_SOME: u8 = 0x02;
const EIR_UUID16_ALL: u8 = 0x03;
const EIR_UUID32_SOME: u8 = 0x04;
const EIR_UUID32_ALL: u8 = 0x05;
const EIR_UUID128_SOME: u8 = 0x06;
const EIR_UUID128_ALL: u8 = 0x07;
const EIR_NAME_SHORT: u8 = 0x08;
const EIR_NAME_COMPLETE: u8 = 0x09;
const EIR_TX_POWER: u8 = 0x0a;
const EIR_CLASS_OF_DEV: u8 = 0x0d;

/// Fields extracted from an EIR blob.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EirData {
   pub flags: Option<u8>,
   pub name: Option<SmolStr>,
   /// `false` when only a shortened name was present.
   pub name_complete: bool,
   pub class: Option<u32>,
   pub tx_power: Option<i8>,
   pub uuids: SmallVec<[Uuid; 4]>,
}

impl EirData {
   fn push_uuid(&mut self, uuid: Uuid) {
      if !self.uuids.contains(&uuid) {
         self.uuids.push(uuid);
      }
   }
}

pub fn parse(data: &[u8]) -> EirData {
   let mut eir = EirData::default();
   let mut rest = data;

   while let [len, tail @ ..] = rest {
      let len = *len as usize;
      if len == 0 {
         break;
      }
      if len > tail.len() {
         debug!("Truncated EIR structure: {}", hex::encode(rest));
         break;
      }
      let (field, next) = tail.split_at(len);
      rest = next;

      let (kind, payload) = (field[0], &field[1..]);
      match kind {
         EIR_FLAGS => eir.flags = payload.first().copied(),
         EIR_UUID16_SOME | EIR_UUID16_ALL => {
            for chunk in payload.chunks_exact(2) {
               eir.push_uuid(uuids::from_u16(u16::from_le_bytes([chunk[0], chunk[1]])));
            }
         },
         EIR_UUID32_SOME | EIR_UUID32_ALL => {
            for chunk in payload.chunks_exact(4) {
               eir.push_uuid(uuids::from_u32(u32::from_le_bytes([
                  chunk[0], chunk[1], chunk[2], chunk[3],
               ])));
            }
         },
         EIR_UUID128_SOME | EIR_UUID128_ALL => {
            for chunk in payload.chunks_exact(16) {
               let mut bytes = [0u8; 16];
               bytes.copy_from_slice(chunk);
               bytes.reverse();
               eir.push_uuid(Uuid::from_bytes(bytes));
            }
         },
         EIR_NAME_SHORT | EIR_NAME_COMPLETE => {
            let complete = kind == EIR_NAME_COMPLETE;
            // A complete name always wins over a shortened one
            if complete || !eir.name_complete {
               let name = String::from_utf8_lossy(payload);
               let name = name.trim_end_matches('\0');
               if !name.is_empty() {
                  eir.name = Some(SmolStr::new(name));
                  eir.name_complete = complete;
               }
            }
         },
         EIR_TX_POWER => eir.tx_power = payload.first().map(|&p| p as i8),
         EIR_CLASS_OF_DEV => {
            if let [a, b, c] = payload {
               eir.class = Some(u32::from_le_bytes([*a, *b, *c, 0]));
            }
         },
         _ => {},
      }
   }

   eir
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_parse_typical_inquiry_response() {
      let data = hex::decode(concat!(
         "020106",               // flags
         "09094865616473657400", // complete name "Headset", NUL padded
         "050308110b11",         // 16-bit: 0x1108, 0x110b
         "040d040420",           // class 0x200404
         "020a08",               // tx power 8
      ))
      .unwrap();

      let eir = parse(&data);
      assert_eq!(eir.flags, Some(0x06));
      assert_eq!(eir.name.as_deref(), Some("Headset"));
      assert!(eir.name_complete);
      assert_eq!(eir.class, Some(0x20_0404));
      assert_eq!(eir.tx_power, Some(8));
      assert_eq!(eir.uuids.as_slice(), &[uuids::HSP_HS, uuids::A2DP_SINK]);
   }

   #[test]
   fn test_shortened_name_does_not_override_complete() {
      let data = [
         0x04, EIR_NAME_COMPLETE, b'a', b'b', b'c', //
         0x02, EIR_NAME_SHORT, b'a',
      ];
      let eir = parse(&data);
      assert_eq!(eir.name.as_deref(), Some("abc"));
      assert!(eir.name_complete);
   }

   #[test]
   fn test_uuid128_is_little_endian() {
      let mut data = vec![17, EIR_UUID128_ALL];
      let mut bytes = *uuids::GATT.as_bytes();
      bytes.reverse();
      data.extend_from_slice(&bytes);

      assert_eq!(parse(&data).uuids.as_slice(), &[uuids::GATT]);
   }

   #[test]
   fn test_truncated_structure_keeps_earlier_fields() {
      let data = [0x02, EIR_FLAGS, 0x04, 0x09, EIR_NAME_COMPLETE, b'x'];
      let eir = parse(&data);
      assert_eq!(eir.flags, Some(0x04));
      assert_eq!(eir.name, None);
   }

   #[test]
   fn test_zero_length_terminates() {
      let data = [0x02, EIR_FLAGS, 0x02, 0x00, 0x02, EIR_FLAGS, 0x05];
      assert_eq!(parse(&data).flags, Some(0x02));
   }
}
