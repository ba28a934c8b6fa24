//! Diagnostic events emitted by the ACL manager.
//!
//! Lifecycle changes, framing errors and protocol anomalies are reported to
//! an [`EventBus`]. Nothing emitted here feeds back into the data path.

use std::{collections::VecDeque, sync::Arc};

use parking_lot::Mutex;
use serde_json::json;
use thiserror::Error;

use crate::{
   acl::{
      frame::ChannelId,
      reassembler::FramingError,
      state::LinkState,
      table::ConnectionInfo,
   },
   hci::{
      address::Address,
      packet::{ConnectionHandle, LinkType, Opcode, Status},
   },
};

/// Controller input that does not fit the current state. Never fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Anomaly {
   #[error("{context} for unknown handle {handle}")]
   UnknownHandle {
      handle: ConnectionHandle,
      context: &'static str,
   },

   #[error("Connection complete ({status}) for {address} without a pending request")]
   UnexpectedConnectionComplete { address: Address, status: Status },

   #[error("Handle {handle} reported for {address} is already in use")]
   DuplicateHandle {
      handle: ConnectionHandle,
      address: Address,
   },

   #[error("Connection request from {address} which already has a link")]
   DuplicateConnectionRequest { address: Address },

   #[error("Connection request from {address} for unsupported {link_type} link")]
   UnsupportedLinkType { address: Address, link_type: LinkType },

   #[error("Unexpected response for command {opcode}")]
   UnexpectedCommandResponse { opcode: Opcode },

   #[error("Invalid transition from {state} on {input}")]
   InvalidTransition {
      state: LinkState,
      input: &'static str,
   },
}

/// Events that can be emitted by the ACL manager.
#[derive(Debug, Clone)]
pub enum AclEvent {
   Connected(ConnectionInfo),
   ConnectionFailed {
      address: Address,
      status: Status,
   },
   ConnectionRejected {
      address: Address,
      reason: Status,
   },
   Disconnected {
      handle: ConnectionHandle,
      address: Address,
      reason: Status,
   },
   DisconnectFailed {
      handle: ConnectionHandle,
      status: Status,
   },
   Framing(FramingError),
   FrameDropped {
      handle: ConnectionHandle,
      channel: ChannelId,
   },
   IncomingDropped {
      handle: ConnectionHandle,
      address: Address,
   },
   Anomaly(Anomaly),
   ControllerLost,
}

impl AclEvent {
   pub fn to_json(&self) -> serde_json::Value {
      match self {
         Self::Connected(info) => json!({ "event": "connected", "connection": info }),
         Self::ConnectionFailed { address, status } => json!({
            "event": "connection_failed",
            "address": address,
            "status": status.to_string(),
         }),
         Self::ConnectionRejected { address, reason } => json!({
            "event": "connection_rejected",
            "address": address,
            "reason": reason.to_string(),
         }),
         Self::Disconnected {
            handle,
            address,
            reason,
         } => json!({
            "event": "disconnected",
            "handle": handle,
            "address": address,
            "reason": reason.to_string(),
         }),
         Self::DisconnectFailed { handle, status } => json!({
            "event": "disconnect_failed",
            "handle": handle,
            "status": status.to_string(),
         }),
         Self::Framing(e) => json!({ "event": "framing_error", "detail": e.to_string() }),
         Self::FrameDropped { handle, channel } => json!({
            "event": "frame_dropped",
            "handle": handle,
            "channel": channel,
         }),
         Self::IncomingDropped { handle, address } => json!({
            "event": "incoming_dropped",
            "handle": handle,
            "address": address,
         }),
         Self::Anomaly(a) => json!({ "event": "anomaly", "detail": a.to_string() }),
         Self::ControllerLost => json!({ "event": "controller_lost" }),
      }
   }
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: AclEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

/// Keeps the most recent events in memory.
pub struct EventLog {
   events: Mutex<VecDeque<AclEvent>>,
   capacity: usize,
}

impl EventLog {
   pub fn new(capacity: usize) -> Arc<Self> {
      Arc::new(Self {
         events: Mutex::new(VecDeque::with_capacity(capacity)),
         capacity,
      })
   }

   pub fn snapshot(&self) -> Vec<AclEvent> {
      self.events.lock().iter().cloned().collect()
   }
}

impl EventBus for EventLog {
   fn emit(&self, event: AclEvent) {
      let mut events = self.events.lock();
      while events.len() >= self.capacity.max(1) {
         events.pop_front();
      }
      events.push_back(event);
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_event_log_keeps_latest() {
      let log = EventLog::new(2);
      log.emit(AclEvent::ControllerLost);
      log.emit(AclEvent::ConnectionFailed {
         address: Address::any(),
         status: Status::PAGE_TIMEOUT,
      });
      log.emit(AclEvent::Anomaly(Anomaly::UnexpectedCommandResponse {
         opcode: Opcode::RESET,
      }));

      let events = log.snapshot();
      assert_eq!(events.len(), 2);
      assert!(matches!(events[0], AclEvent::ConnectionFailed { .. }));
      assert!(matches!(events[1], AclEvent::Anomaly(_)));
   }

   #[test]
   fn test_json_shape() {
      let event = AclEvent::Disconnected {
         handle: ConnectionHandle::new(1).unwrap(),
         address: "AA:BB:CC:DD:EE:FF".parse().unwrap(),
         reason: Status::REMOTE_USER_TERMINATED,
      };
      let value = event.to_json();
      assert_eq!(value["event"], "disconnected");
      assert_eq!(value["handle"], 1);
      assert_eq!(value["address"], "AA:BB:CC:DD:EE:FF");
      assert_eq!(value["reason"], "remote user terminated connection (0x13)");
   }
}
