//! Scripted in-process controller for tests.

use std::time::Duration;

use smallvec::{SmallVec, smallvec};
use tokio::time;

use crate::hci::{
   address::Address,
   packet::{
      AclPacket, BufferSize, Command, ConnectionHandle, ControllerPacket, Event, HostPacket,
      LinkType, Opcode, PacketBoundary, ScanEnable, Status,
   },
   transport::{self, ControllerLink, ControllerPeer},
};

const TIMEOUT: Duration = Duration::from_secs(2);
const QUIET_PERIOD: Duration = Duration::from_millis(100);

/// Controller double. Commands are answered as soon as they are received,
/// successfully unless fetched with [`FakeController::expect_raw_command`].
pub struct FakeController {
   peer: ControllerPeer,
   pub buffer: BufferSize,
}

impl FakeController {
   pub fn new(buffer: BufferSize) -> (ControllerLink, Self) {
      let (link, peer) = transport::channel(256);
      (link, Self { peer, buffer })
   }

   /// Next host packet without answering it. `None` once the host is gone.
   pub async fn next(&mut self) -> Option<HostPacket> {
      time::timeout(TIMEOUT, self.peer.inbound.recv())
         .await
         .expect("timed out waiting for host packet")
   }

   /// Whether the host stays silent for a short while.
   pub async fn is_quiet(&mut self) -> bool {
      time::timeout(QUIET_PERIOD, self.peer.inbound.recv())
         .await
         .is_err()
   }

   pub async fn expect_raw_command(&mut self) -> Command {
      match self.next().await {
         Some(HostPacket::Command(cmd)) => cmd,
         other => panic!("expected command, got {other:?}"),
      }
   }

   /// Next command, answered with success.
   pub async fn expect_command(&mut self) -> Command {
      let cmd = self.expect_raw_command().await;
      self.answer(&cmd).await;
      cmd
   }

   pub async fn expect_acl(&mut self) -> AclPacket {
      match self.next().await {
         Some(HostPacket::Acl(packet)) => packet,
         other => panic!("expected ACL data, got {other:?}"),
      }
   }

   /// Consumes the start-up command sequence of a default configuration.
   pub async fn init(&mut self) {
      assert_eq!(self.expect_command().await, Command::Reset);
      assert_eq!(self.expect_command().await, Command::ReadBufferSize);
      assert_eq!(
         self.expect_command().await,
         Command::WriteScanEnable(ScanEnable::PageOnly)
      );
   }

   async fn answer(&self, cmd: &Command) {
      let opcode = cmd.opcode();
      if cmd.expects_status() {
         self.command_status(opcode, Status::SUCCESS).await;
         return;
      }
      let mut params: SmallVec<[u8; 16]> = smallvec![Status::SUCCESS.0];
      if *cmd == Command::ReadBufferSize {
         params.extend_from_slice(&self.buffer.acl_data_packet_length.to_le_bytes());
         params.push(64);
         params.extend_from_slice(&self.buffer.total_num_acl_data_packets.to_le_bytes());
         params.extend_from_slice(&0u16.to_le_bytes());
      }
      self
         .event(Event::CommandComplete {
            num_hci_command_packets: 1,
            opcode,
            return_parameters: params,
         })
         .await;
   }

   pub async fn command_status(&self, opcode: Opcode, status: Status) {
      self
         .event(Event::CommandStatus {
            status,
            num_hci_command_packets: 1,
            opcode,
         })
         .await;
   }

   pub async fn event(&self, event: Event) {
      self
         .peer
         .outbound
         .send(ControllerPacket::Event(event))
         .await
         .expect("host feed closed");
   }

   pub async fn connection_complete(&self, status: Status, handle: u16, address: Address) {
      self
         .event(Event::ConnectionComplete {
            status,
            handle: ConnectionHandle::from_wire(handle),
            address,
            link_type: LinkType::Acl,
            encryption_enabled: false,
         })
         .await;
   }

   pub async fn connection_request(&self, address: Address, link_type: LinkType) {
      self
         .event(Event::ConnectionRequest {
            address,
            class_of_device: 0x5A020C,
            link_type,
         })
         .await;
   }

   pub async fn disconnection_complete(&self, handle: ConnectionHandle, reason: Status) {
      self
         .event(Event::DisconnectionComplete {
            status: Status::SUCCESS,
            handle,
            reason,
         })
         .await;
   }

   pub async fn complete_packets(&self, handle: ConnectionHandle, count: u16) {
      self
         .event(Event::NumberOfCompletedPackets(smallvec![(handle, count)]))
         .await;
   }

   pub async fn acl(&self, handle: ConnectionHandle, boundary: PacketBoundary, data: &[u8]) {
      self
         .peer
         .outbound
         .send(ControllerPacket::Acl(AclPacket::new(handle, boundary, data.to_vec())))
         .await
         .expect("host feed closed");
   }

   /// Reflects `count` host ACL packets back to the host, completing each.
   pub async fn loopback(&mut self, count: usize) {
      for _ in 0..count {
         let packet = self.expect_acl().await;
         self.complete_packets(packet.handle, 1).await;
         self
            .peer
            .outbound
            .send(ControllerPacket::Acl(packet))
            .await
            .expect("host feed closed");
      }
   }
}
