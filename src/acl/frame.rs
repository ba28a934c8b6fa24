//! L2CAP basic frames and their fragmentation onto ACL packets.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
   error::{AclError, Result},
   hci::packet::{AclPacket, ConnectionHandle, PacketBoundary},
};

/// Size of the L2CAP basic header (length + channel id).
pub const L2CAP_HEADER_LEN: usize = 4;

/// L2CAP channel identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct ChannelId(pub u16);

impl ChannelId {
   pub const SIGNALING: Self = Self(0x0001);
   pub const CONNECTIONLESS: Self = Self(0x0002);
   pub const ATT: Self = Self(0x0004);
   pub const LE_SIGNALING: Self = Self(0x0005);
   pub const LE_SECURITY_MANAGER: Self = Self(0x0006);
   pub const SECURITY_MANAGER: Self = Self(0x0007);
   pub const DYNAMIC_START: Self = Self(0x0040);
}

impl fmt::Display for ChannelId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "0x{:04x}", self.0)
   }
}

/// A complete L2CAP frame received on (or destined to) a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L2capFrame {
   pub handle: ConnectionHandle,
   pub channel: ChannelId,
   pub payload: Vec<u8>,
}

impl L2capFrame {
   /// Payload length as carried in the header.
   pub fn length(&self) -> u16 {
      self.payload.len() as u16
   }

   /// Header followed by payload.
   pub fn to_bytes(&self) -> Vec<u8> {
      let mut out = Vec::with_capacity(L2CAP_HEADER_LEN + self.payload.len());
      out.extend_from_slice(&self.length().to_le_bytes());
      out.extend_from_slice(&self.channel.0.to_le_bytes());
      out.extend_from_slice(&self.payload);
      out
   }
}

/// Prefixes `payload` with the basic L2CAP header.
pub fn encode(channel: ChannelId, payload: &[u8]) -> Result<Vec<u8>> {
   let length = u16::try_from(payload.len()).map_err(|_| AclError::PayloadTooLarge(payload.len()))?;
   let mut out = Vec::with_capacity(L2CAP_HEADER_LEN + payload.len());
   out.extend_from_slice(&length.to_le_bytes());
   out.extend_from_slice(&channel.0.to_le_bytes());
   out.extend_from_slice(payload);
   Ok(out)
}

/// Splits an encoded frame into ACL packets carrying at most `max_len` bytes.
///
/// The first packet is marked as the start of an automatically flushable
/// frame, the rest as continuing fragments.
pub fn fragment(
   handle: ConnectionHandle,
   frame: &[u8],
   max_len: usize,
) -> impl Iterator<Item = AclPacket> + '_ {
   frame
      .chunks(max_len.max(1))
      .enumerate()
      .map(move |(i, chunk)| {
         let boundary = if i == 0 {
            PacketBoundary::FirstFlushable
         } else {
            PacketBoundary::Continuing
         };
         AclPacket::new(handle, boundary, chunk.to_vec())
      })
}

#[cfg(test)]
mod tests {
   use super::*;

   const CERT_DATA: &[u8] = b"This is just SomeAclData from the Cert";

   fn handle() -> ConnectionHandle {
      ConnectionHandle::new(1).unwrap()
   }

   #[test]
   fn test_encode_header() {
      let bytes = encode(ChannelId::SECURITY_MANAGER, CERT_DATA).unwrap();
      assert_eq!(&bytes[..4], &[0x26, 0x00, 0x07, 0x00]);
      assert_eq!(&bytes[4..], CERT_DATA);

      let frame = L2capFrame {
         handle: handle(),
         channel: ChannelId::SECURITY_MANAGER,
         payload: CERT_DATA.to_vec(),
      };
      assert_eq!(frame.length(), 38);
      assert_eq!(frame.to_bytes(), bytes);
   }

   #[test]
   fn test_encode_rejects_oversized_payload() {
      let payload = vec![0u8; usize::from(u16::MAX) + 1];
      assert!(matches!(
         encode(ChannelId::DYNAMIC_START, &payload),
         Err(AclError::PayloadTooLarge(65536))
      ));
      assert!(encode(ChannelId::DYNAMIC_START, &payload[1..]).is_ok());
   }

   #[test]
   fn test_fragment_single() {
      let bytes = encode(ChannelId::SECURITY_MANAGER, CERT_DATA).unwrap();
      let fragments: Vec<_> = fragment(handle(), &bytes, 1021).collect();
      assert_eq!(fragments.len(), 1);
      assert_eq!(fragments[0].boundary, PacketBoundary::FirstFlushable);
      assert_eq!(fragments[0].data, bytes);
   }

   #[test]
   fn test_fragment_multiple() {
      let payload: Vec<u8> = (0..=255u8).cycle().take(100).collect();
      let bytes = encode(ChannelId::DYNAMIC_START, &payload).unwrap();
      let fragments: Vec<_> = fragment(handle(), &bytes, 27).collect();

      // 104 bytes in 27-byte chunks
      assert_eq!(fragments.len(), 4);
      assert_eq!(fragments[0].boundary, PacketBoundary::FirstFlushable);
      assert!(fragments[1..]
         .iter()
         .all(|f| f.boundary == PacketBoundary::Continuing));
      assert_eq!(fragments[3].data.len(), 104 - 3 * 27);

      let joined: Vec<u8> = fragments.into_iter().flat_map(|f| f.data).collect();
      assert_eq!(joined, bytes);
   }
}
