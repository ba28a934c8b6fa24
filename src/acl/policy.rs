//! Policy hook for peer-initiated connections.

use std::collections::HashSet;

use crate::hci::{address::Address, packet::Status};

/// Outcome of an accept decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
   Accept,
   /// Reject with the given reason (one of the 0x0D..=0x0F rejection codes).
   Reject(Status),
}

/// Decides whether an incoming connection request is accepted.
pub trait AcceptPolicy: Send + Sync {
   fn decide(&self, address: Address, class_of_device: u32) -> Decision;
}

/// Accepts every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl AcceptPolicy for AcceptAll {
   fn decide(&self, _address: Address, _class_of_device: u32) -> Decision {
      Decision::Accept
   }
}

/// Accepts only listed peers.
#[derive(Debug, Default, Clone)]
pub struct AllowList {
   allowed: HashSet<Address>,
}

impl AllowList {
   pub fn new(allowed: impl IntoIterator<Item = Address>) -> Self {
      Self {
         allowed: allowed.into_iter().collect(),
      }
   }
}

impl AcceptPolicy for AllowList {
   fn decide(&self, address: Address, _class_of_device: u32) -> Decision {
      if self.allowed.contains(&address) {
         Decision::Accept
      } else {
         Decision::Reject(Status::REJECTED_UNACCEPTABLE_ADDRESS)
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_allow_list() {
      let known = Address([1, 2, 3, 4, 5, 6]);
      let policy = AllowList::new([known]);
      assert_eq!(policy.decide(known, 0), Decision::Accept);
      assert_eq!(
         policy.decide(Address::any(), 0),
         Decision::Reject(Status::REJECTED_UNACCEPTABLE_ADDRESS)
      );
      assert_eq!(AcceptAll.decide(Address::any(), 0x5A020C), Decision::Accept);
   }
}
