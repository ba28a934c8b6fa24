//! Connection table.
//!
//! Tracks outstanding connection attempts by peer address and established
//! connections by handle. The table owns every per-connection resource:
//! reassembly buffer, outbound fragment queue and undelivered frames.

use std::{
   collections::{BTreeMap, HashMap, VecDeque},
   ops::Bound,
};

use log::debug;
use serde::Serialize;

use crate::{
   acl::{
      frame::L2capFrame,
      reassembler::{AclFragment, Feed, Reassembler},
      state::{LinkInput, LinkState, Role},
   },
   error::{AclError, Result},
   event::Anomaly,
   hci::{
      address::{Address, AddressType},
      packet::{AclPacket, ConnectionHandle, Status},
   },
};

/// Snapshot of a connection handed out to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
   pub handle: ConnectionHandle,
   pub address: Address,
   pub address_type: AddressType,
   pub role: Role,
   pub state: LinkState,
}

/// A connection attempt the controller has not resolved yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
   pub address: Address,
   pub address_type: AddressType,
   pub role: Role,
   pub state: LinkState,
}

/// An established connection.
#[derive(Debug)]
pub struct Connection {
   pub handle: ConnectionHandle,
   pub address: Address,
   pub address_type: AddressType,
   pub role: Role,
   state: LinkState,
   outbound: VecDeque<AclPacket>,
   in_flight: u16,
   undelivered: VecDeque<L2capFrame>,
}

impl Connection {
   pub const fn state(&self) -> LinkState {
      self.state
   }

   pub fn info(&self) -> ConnectionInfo {
      ConnectionInfo {
         handle: self.handle,
         address: self.address,
         address_type: self.address_type,
         role: self.role,
         state: self.state,
      }
   }

   /// Applies a lifecycle input.
   pub fn advance(&mut self, input: LinkInput) -> std::result::Result<LinkState, Anomaly> {
      let next = self.state.next(input).ok_or(Anomaly::InvalidTransition {
         state: self.state,
         input: input_name(input),
      })?;
      debug!("{}: {} → {next}", self.handle, self.state);
      self.state = next;
      Ok(next)
   }

   /// Queues ACL packets for submission, in order.
   pub fn enqueue(&mut self, packets: impl IntoIterator<Item = AclPacket>) {
      self.outbound.extend(packets);
   }

   /// Drops queued outbound data. Returns how many packets were discarded.
   pub fn discard_outbound(&mut self) -> usize {
      let n = self.outbound.len();
      self.outbound.clear();
      n
   }

   pub fn queued(&self) -> usize {
      self.outbound.len()
   }

   pub const fn in_flight(&self) -> u16 {
      self.in_flight
   }

   /// Records `count` packets completed by the controller; returns how many
   /// were actually outstanding.
   pub fn complete_packets(&mut self, count: u16) -> u16 {
      let done = count.min(self.in_flight);
      self.in_flight -= done;
      done
   }

   /// Parks a frame no subscriber has claimed. Returns the evicted frame when
   /// the backlog is full.
   pub fn park(&mut self, frame: L2capFrame, limit: usize) -> Option<L2capFrame> {
      self.undelivered.push_back(frame);
      if self.undelivered.len() > limit {
         self.undelivered.pop_front()
      } else {
         None
      }
   }

   pub fn take_undelivered(&mut self) -> VecDeque<L2capFrame> {
      std::mem::take(&mut self.undelivered)
   }
}

const fn input_name(input: LinkInput) -> &'static str {
   match input {
      LinkInput::Connect => "connect",
      LinkInput::IncomingRequest => "incoming request",
      LinkInput::Complete(_) => "connection complete",
      LinkInput::CommandFailed(_) => "command failure",
      LinkInput::Cancel => "cancel",
      LinkInput::Disconnect => "disconnect",
      LinkInput::DisconnectFailed(_) => "failed disconnection",
      LinkInput::DisconnectionComplete => "disconnection complete",
   }
}

/// Pending requests by address and live connections by handle.
#[derive(Debug, Default)]
pub struct ConnectionTable {
   pending: HashMap<Address, PendingRequest>,
   connections: BTreeMap<ConnectionHandle, Connection>,
   reassembler: Reassembler,
}

impl ConnectionTable {
   pub fn new() -> Self {
      Self::default()
   }

   /// Whether `address` has a pending request or a live connection.
   pub fn is_linked(&self, address: Address) -> bool {
      self.pending.contains_key(&address)
         || self.connections.values().any(|c| c.address == address)
   }

   /// Records a connection attempt towards or from `address`.
   pub fn register_pending(
      &mut self,
      address: Address,
      address_type: AddressType,
      role: Role,
   ) -> Result<&PendingRequest> {
      if self.is_linked(address) {
         return Err(AclError::DuplicateConnectRequest(address));
      }
      let input = match role {
         Role::Initiator => LinkInput::Connect,
         Role::Acceptor => LinkInput::IncomingRequest,
      };
      // Idle always accepts Connect and IncomingRequest.
      let state = LinkState::Idle.next(input).unwrap_or(LinkState::Failed);
      Ok(self.pending.entry(address).or_insert(PendingRequest {
         address,
         address_type,
         role,
         state,
      }))
   }

   pub fn pending(&self, address: Address) -> Option<&PendingRequest> {
      self.pending.get(&address)
   }

   /// Resolves a pending request with a failure input and removes it.
   pub fn fail_pending(
      &mut self,
      address: Address,
      input: LinkInput,
   ) -> std::result::Result<PendingRequest, Anomaly> {
      let Some(pending) = self.pending.get(&address) else {
         return Err(Anomaly::UnexpectedConnectionComplete {
            address,
            status: match input {
               LinkInput::Complete(s) | LinkInput::CommandFailed(s) => s,
               _ => Status::UNKNOWN_CONNECTION,
            },
         });
      };
      match pending.state.next(input) {
         Some(LinkState::Failed) => {},
         _ => {
            return Err(Anomaly::InvalidTransition {
               state: pending.state,
               input: input_name(input),
            });
         },
      }
      let mut pending = self
         .pending
         .remove(&address)
         .ok_or(Anomaly::UnexpectedConnectionComplete {
            address,
            status: Status::UNKNOWN_CONNECTION,
         })?;
      pending.state = LinkState::Failed;
      Ok(pending)
   }

   /// Binds `handle` to the pending request for `address`, creating the
   /// connection in the `Active` state.
   pub fn promote(
      &mut self,
      address: Address,
      handle: ConnectionHandle,
   ) -> std::result::Result<&Connection, Anomaly> {
      let status = Status::SUCCESS;
      let Some(pending) = self.pending.get(&address) else {
         return Err(Anomaly::UnexpectedConnectionComplete { address, status });
      };
      if self.connections.contains_key(&handle) {
         return Err(Anomaly::DuplicateHandle { handle, address });
      }
      let state = pending
         .state
         .next(LinkInput::Complete(status))
         .ok_or(Anomaly::InvalidTransition {
            state: pending.state,
            input: input_name(LinkInput::Complete(status)),
         })?;

      let Some(pending) = self.pending.remove(&address) else {
         return Err(Anomaly::UnexpectedConnectionComplete { address, status });
      };
      // A stale partial frame from a previous holder of the handle must not
      // leak into this connection.
      self.reassembler.release(handle);

      let conn = self.connections.entry(handle).or_insert(Connection {
         handle,
         address,
         address_type: pending.address_type,
         role: pending.role,
         state,
         outbound: VecDeque::new(),
         in_flight: 0,
         undelivered: VecDeque::new(),
      });
      Ok(conn)
   }

   pub fn lookup(&self, handle: ConnectionHandle) -> Option<&Connection> {
      self.connections.get(&handle)
   }

   pub fn lookup_mut(&mut self, handle: ConnectionHandle) -> Option<&mut Connection> {
      self.connections.get_mut(&handle)
   }

   /// Removes a connection and releases its reassembly buffer.
   pub fn remove(&mut self, handle: ConnectionHandle) -> Option<Connection> {
      let conn = self.connections.remove(&handle)?;
      if self.reassembler.release(handle) {
         debug!("{handle}: dropped partial frame on removal");
      }
      Some(conn)
   }

   /// Feeds an inbound ACL packet into the owning connection's buffer.
   pub fn reassemble(&mut self, packet: &AclPacket) -> std::result::Result<Feed, Anomaly> {
      if !self.connections.contains_key(&packet.handle) {
         return Err(Anomaly::UnknownHandle {
            handle: packet.handle,
            context: "ACL data",
         });
      }
      Ok(self
         .reassembler
         .feed(packet.handle, AclFragment::from(packet)))
   }

   /// Takes the next outbound packet, serving handles round-robin starting
   /// after `after`.
   pub fn pop_outbound(&mut self, after: Option<ConnectionHandle>) -> Option<AclPacket> {
      let start = after.map_or(Bound::Unbounded, Bound::Excluded);
      let handle = self
         .connections
         .range((start, Bound::Unbounded))
         .chain(self.connections.iter())
         .find(|(_, c)| !c.outbound.is_empty())
         .map(|(h, _)| *h)?;
      let conn = self.connections.get_mut(&handle)?;
      let packet = conn.outbound.pop_front()?;
      conn.in_flight += 1;
      Some(packet)
   }

   pub fn connections(&self) -> impl Iterator<Item = &Connection> {
      self.connections.values()
   }

   pub fn len(&self) -> usize {
      self.connections.len()
   }

   pub fn is_empty(&self) -> bool {
      self.connections.is_empty()
   }
}
