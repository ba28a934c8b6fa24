//! Reassembly of ACL fragments into L2CAP frames.
//!
//! Each connection handle carries at most one frame in flight. A first
//! fragment carries the 4-byte basic header (declared payload length and
//! channel id); continuing fragments append payload until the declared
//! length is reached.

use std::{cmp::Ordering, collections::HashMap};

use log::debug;
use smallvec::SmallVec;
use thiserror::Error;

use crate::{
   acl::frame::{ChannelId, L2CAP_HEADER_LEN, L2capFrame},
   hci::packet::{AclPacket, ConnectionHandle, PacketBoundary},
};

/// Framing problems detected while reassembling.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
   /// More payload arrived than the header declared
   #[error("Frame overflow on {handle}: declared {declared} bytes, received {received}")]
   Overflow {
      handle: ConnectionHandle,
      declared: u16,
      received: usize,
   },

   /// A new frame started before the previous one completed
   #[error("Incomplete frame on {handle} discarded: declared {declared} bytes, received {received}")]
   UnderflowDiscard {
      handle: ConnectionHandle,
      declared: u16,
      received: usize,
   },

   /// Continuing fragment with no frame in progress
   #[error("Continuing fragment of {len} bytes on {handle} without a frame in progress")]
   OrphanContinuation { handle: ConnectionHandle, len: usize },

   /// First fragment too short to hold the basic header
   #[error("First fragment of {len} bytes on {handle} cannot hold an L2CAP header")]
   ShortHeader { handle: ConnectionHandle, len: usize },
}

/// A fragment as seen by the reassembler.
#[derive(Debug, Clone, Copy)]
pub struct AclFragment<'a> {
   pub boundary: PacketBoundary,
   pub data: &'a [u8],
}

impl<'a> From<&'a AclPacket> for AclFragment<'a> {
   fn from(packet: &'a AclPacket) -> Self {
      Self {
         boundary: packet.boundary,
         data: &packet.data,
      }
   }
}

/// Outcome of feeding one fragment.
#[derive(Debug, Default)]
pub struct Feed {
   /// Frame completed by this fragment.
   pub frame: Option<L2capFrame>,
   /// Framing errors raised while consuming it.
   pub errors: SmallVec<[FramingError; 2]>,
}

#[derive(Debug)]
struct PartialFrame {
   declared: u16,
   channel: ChannelId,
   payload: Vec<u8>,
}

/// Per-handle reassembly buffers.
#[derive(Debug, Default)]
pub struct Reassembler {
   partial: HashMap<ConnectionHandle, PartialFrame>,
}

impl Reassembler {
   pub fn new() -> Self {
      Self::default()
   }

   /// Consumes one fragment received on `handle`.
   pub fn feed(&mut self, handle: ConnectionHandle, fragment: AclFragment<'_>) -> Feed {
      let mut out = Feed::default();
      let data = fragment.data;

      if fragment.boundary.is_first() {
         if let Some(prev) = self.partial.remove(&handle) {
            out.errors.push(FramingError::UnderflowDiscard {
               handle,
               declared: prev.declared,
               received: prev.payload.len(),
            });
         }
         if data.len() < L2CAP_HEADER_LEN {
            out.errors.push(FramingError::ShortHeader {
               handle,
               len: data.len(),
            });
            return out;
         }

         let declared = u16::from_le_bytes([data[0], data[1]]);
         let channel = ChannelId(u16::from_le_bytes([data[2], data[3]]));
         let body = &data[L2CAP_HEADER_LEN..];
         debug!("{handle}: new frame on {channel}, {declared} bytes declared");

         let mut payload = Vec::with_capacity(usize::from(declared));
         payload.extend_from_slice(body);
         self.partial.insert(
            handle,
            PartialFrame {
               declared,
               channel,
               payload,
            },
         );
      } else {
         let Some(partial) = self.partial.get_mut(&handle) else {
            out.errors.push(FramingError::OrphanContinuation {
               handle,
               len: data.len(),
            });
            return out;
         };
         partial.payload.extend_from_slice(data);
      }

      self.settle(handle, &mut out);
      out
   }

   fn settle(&mut self, handle: ConnectionHandle, out: &mut Feed) {
      let Some(partial) = self.partial.get(&handle) else {
         return;
      };
      match partial.payload.len().cmp(&usize::from(partial.declared)) {
         Ordering::Less => {},
         Ordering::Equal => {
            if let Some(done) = self.partial.remove(&handle) {
               out.frame = Some(L2capFrame {
                  handle,
                  channel: done.channel,
                  payload: done.payload,
               });
            }
         },
         Ordering::Greater => {
            if let Some(bad) = self.partial.remove(&handle) {
               out.errors.push(FramingError::Overflow {
                  handle,
                  declared: bad.declared,
                  received: bad.payload.len(),
               });
            }
         },
      }
   }

   /// Drops any partial frame for `handle`. Returns whether one existed.
   pub fn release(&mut self, handle: ConnectionHandle) -> bool {
      self.partial.remove(&handle).is_some()
   }

   pub fn in_progress(&self, handle: ConnectionHandle) -> bool {
      self.partial.contains_key(&handle)
   }
}

#[cfg(test)]
mod tests {
   use rand::{Rng, SeedableRng, rngs::StdRng};

   use super::*;

   fn handle(raw: u16) -> ConnectionHandle {
      ConnectionHandle::new(raw).unwrap()
   }

   fn first(data: &[u8]) -> AclFragment<'_> {
      AclFragment {
         boundary: PacketBoundary::FirstFlushable,
         data,
      }
   }

   fn cont(data: &[u8]) -> AclFragment<'_> {
      AclFragment {
         boundary: PacketBoundary::Continuing,
         data,
      }
   }

   fn header(len: u16, channel: u16) -> Vec<u8> {
      let mut out = len.to_le_bytes().to_vec();
      out.extend_from_slice(&channel.to_le_bytes());
      out
   }

   #[test]
   fn test_single_fragment_frame() {
      let mut r = Reassembler::new();
      let mut data = header(5, 0x0040);
      data.extend_from_slice(b"Hello");

      let feed = r.feed(handle(1), first(&data));
      assert!(feed.errors.is_empty());
      let frame = feed.frame.expect("frame should complete");
      assert_eq!(frame.channel, ChannelId(0x0040));
      assert_eq!(frame.payload, b"Hello");
      assert!(!r.in_progress(handle(1)));
   }

   #[test]
   fn test_hello_then_large_frame_in_order() {
      let mut r = Reassembler::new();
      let h = handle(1);

      let mut hello = header(6, 0x0007);
      hello.extend_from_slice(b"Hello");
      assert!(r.feed(h, first(&hello)).frame.is_none());
      let frame = r.feed(h, cont(b"!")).frame.unwrap();
      assert_eq!(frame.payload, b"Hello!");

      let mut big = vec![0xe8, 0x03, 0x07, 0x00];
      big.extend_from_slice(&b"Hello".repeat(200));
      let feed = r.feed(h, first(&big));
      assert!(feed.errors.is_empty());
      let frame = feed.frame.unwrap();
      assert_eq!(frame.length(), 1000);
      assert_eq!(frame.payload, b"Hello".repeat(200));
   }

   #[test]
   fn test_empty_payload_frame() {
      let mut r = Reassembler::new();
      let frame = r.feed(handle(3), first(&header(0, 0x0001))).frame.unwrap();
      assert!(frame.payload.is_empty());
   }

   #[test]
   fn test_new_first_fragment_discards_partial() {
      let mut r = Reassembler::new();
      let h = handle(1);

      let mut partial = header(10, 0x0040);
      partial.extend_from_slice(b"abc");
      assert!(r.feed(h, first(&partial)).frame.is_none());

      let mut fresh = header(2, 0x0041);
      fresh.extend_from_slice(b"xy");
      let feed = r.feed(h, first(&fresh));
      assert_eq!(
         feed.errors.as_slice(),
         &[FramingError::UnderflowDiscard {
            handle: h,
            declared: 10,
            received: 3,
         }]
      );
      let frame = feed.frame.unwrap();
      assert_eq!(frame.channel, ChannelId(0x0041));
      assert_eq!(frame.payload, b"xy");
   }

   #[test]
   fn test_overflow_drops_frame() {
      let mut r = Reassembler::new();
      let h = handle(1);

      let mut data = header(4, 0x0040);
      data.extend_from_slice(b"abc");
      assert!(r.feed(h, first(&data)).frame.is_none());

      let feed = r.feed(h, cont(b"de"));
      assert!(feed.frame.is_none());
      assert_eq!(
         feed.errors.as_slice(),
         &[FramingError::Overflow {
            handle: h,
            declared: 4,
            received: 5,
         }]
      );
      assert!(!r.in_progress(h));

      // Buffer was reset: a trailing continuation is an orphan.
      let feed = r.feed(h, cont(b"f"));
      assert!(matches!(
         feed.errors.as_slice(),
         [FramingError::OrphanContinuation { len: 1, .. }]
      ));
   }

   #[test]
   fn test_overflow_in_first_fragment() {
      let mut r = Reassembler::new();
      let mut data = header(1, 0x0040);
      data.extend_from_slice(b"ab");
      let feed = r.feed(handle(1), first(&data));
      assert!(feed.frame.is_none());
      assert!(matches!(
         feed.errors.as_slice(),
         [FramingError::Overflow {
            declared: 1,
            received: 2,
            ..
         }]
      ));
   }

   #[test]
   fn test_continuation_without_start() {
      let mut r = Reassembler::new();
      let feed = r.feed(handle(9), cont(b"stray"));
      assert!(feed.frame.is_none());
      assert_eq!(
         feed.errors.as_slice(),
         &[FramingError::OrphanContinuation {
            handle: handle(9),
            len: 5,
         }]
      );
      assert!(!r.in_progress(handle(9)));
   }

   #[test]
   fn test_short_header() {
      let mut r = Reassembler::new();
      let feed = r.feed(handle(1), first(&[0x05, 0x00, 0x40]));
      assert!(feed.frame.is_none());
      assert!(matches!(
         feed.errors.as_slice(),
         [FramingError::ShortHeader { len: 3, .. }]
      ));
      assert!(!r.in_progress(handle(1)));
   }

   #[test]
   fn test_interleaved_handles_are_independent() {
      let mut r = Reassembler::new();
      let (a, b) = (handle(1), handle(2));

      let mut a_first = header(6, 0x0040);
      a_first.extend_from_slice(b"AAA");
      let mut b_first = header(4, 0x0041);
      b_first.extend_from_slice(b"BB");

      assert!(r.feed(a, first(&a_first)).frame.is_none());
      assert!(r.feed(b, first(&b_first)).frame.is_none());
      assert!(r.feed(a, cont(b"aa")).frame.is_none());

      let fb = r.feed(b, cont(b"bb")).frame.unwrap();
      assert_eq!(fb.handle, b);
      assert_eq!(fb.payload, b"BBbb");

      let fa = r.feed(a, cont(b"a")).frame.unwrap();
      assert_eq!(fa.handle, a);
      assert_eq!(fa.payload, b"AAAaaa");
   }

   #[test]
   fn test_release_drops_partial() {
      let mut r = Reassembler::new();
      let mut data = header(8, 0x0040);
      data.extend_from_slice(b"abc");
      r.feed(handle(1), first(&data));
      assert!(r.release(handle(1)));
      assert!(!r.release(handle(1)));
      assert!(r.feed(handle(1), cont(b"defgh")).frame.is_none());
   }

   #[test]
   fn test_random_splits_reassemble_exactly() {
      let mut rng = StdRng::seed_from_u64(0x5eed);
      let mut r = Reassembler::new();

      for round in 0..200 {
         let len = rng.gen_range(0..2048usize);
         let payload: Vec<u8> = (0..len).map(|_| rng.r#gen()).collect();
         let mut wire = header(len as u16, 0x0040);
         wire.extend_from_slice(&payload);

         // Header always fits in the first fragment.
         let mut cuts = vec![rng.gen_range(L2CAP_HEADER_LEN..=wire.len())];
         while *cuts.last().unwrap() < wire.len() {
            let last = *cuts.last().unwrap();
            cuts.push(rng.gen_range(last + 1..=wire.len()));
         }

         let h = handle(round % 3);
         let mut start = 0;
         let mut frames = Vec::new();
         for (i, end) in cuts.iter().copied().enumerate() {
            let chunk = &wire[start..end];
            let feed = if i == 0 {
               r.feed(h, first(chunk))
            } else {
               r.feed(h, cont(chunk))
            };
            assert!(feed.errors.is_empty(), "round {round}: {:?}", feed.errors);
            frames.extend(feed.frame);
            start = end;
         }

         assert_eq!(frames.len(), 1, "round {round}");
         assert_eq!(frames[0].payload, payload, "round {round}");
      }
   }
}
