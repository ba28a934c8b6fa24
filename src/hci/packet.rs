//! HCI packet definitions and wire codec.
//!
//! Host → controller packets (commands, ACL data) are encoded and
//! controller → host packets (events, ACL data) are decoded using the
//! Bluetooth Core v5.x layouts. All multi-byte fields are little-endian and
//! device addresses travel byte-reversed.

use std::fmt;

use serde::Serialize;
use smallvec::SmallVec;
use thiserror::Error;

use crate::hci::address::{ADDRESS_LEN, Address};

/// Encoded command packet. Every command we issue fits inline.
pub type Packet = SmallVec<[u8; 32]>;

/// Size of the ACL data header (handle/flags + length).
pub const ACL_HEADER_LEN: usize = 4;
/// Size of the command header (opcode + parameter length).
pub const COMMAND_HEADER_LEN: usize = 3;
/// Size of the event header (event code + parameter length).
pub const EVENT_HEADER_LEN: usize = 2;

/// Packet type used for outgoing Create_Connection (DM1, DH1, DM3, DH3, DM5, DH5).
const CREATE_CONNECTION_PACKET_TYPE: u16 = 0xCC18;
/// Page scan repetition mode R1.
const PAGE_SCAN_REPETITION_MODE_R1: u8 = 0x01;

/// Error type for HCI packet decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
   #[error("Packet too short: expected at least {expected} bytes, got {actual}")]
   TooShort { expected: usize, actual: usize },

   #[error("Length mismatch: header declares {declared} bytes, got {actual}")]
   LengthMismatch { declared: usize, actual: usize },

   #[error("Invalid {field}: 0x{value:04x}")]
   InvalidField { field: &'static str, value: u16 },

   #[error("Unknown H4 packet indicator: 0x{0:02x}")]
   UnknownIndicator(u8),
}

fn need(data: &[u8], expected: usize) -> Result<(), PacketError> {
   if data.len() < expected {
      Err(PacketError::TooShort {
         expected,
         actual: data.len(),
      })
   } else {
      Ok(())
   }
}

fn read_u16(data: &[u8], at: usize) -> u16 {
   u16::from_le_bytes([data[at], data[at + 1]])
}

fn read_address(data: &[u8], at: usize) -> Address {
   let mut bytes = [0u8; ADDRESS_LEN];
   bytes.copy_from_slice(&data[at..at + ADDRESS_LEN]);
   Address::from_le_bytes(bytes)
}

// === Identifiers ===

/// Controller-assigned connection handle (12 significant bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[repr(transparent)]
pub struct ConnectionHandle(u16);

impl ConnectionHandle {
   /// Largest handle a controller may assign; 0x0F00..=0x0FFF are reserved.
   pub const MAX: u16 = 0x0EFF;

   pub const fn new(raw: u16) -> Option<Self> {
      if raw <= Self::MAX { Some(Self(raw)) } else { None }
   }

   /// Takes the low 12 bits of a wire field without range checking.
   pub const fn from_wire(raw: u16) -> Self {
      Self(raw & 0x0FFF)
   }

   pub const fn raw(self) -> u16 {
      self.0
   }
}

impl fmt::Display for ConnectionHandle {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "0x{:04x}", self.0)
   }
}

/// HCI error/status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(transparent)]
pub struct Status(pub u8);

impl Status {
   pub const SUCCESS: Self = Self(0x00);
   pub const UNKNOWN_COMMAND: Self = Self(0x01);
   pub const UNKNOWN_CONNECTION: Self = Self(0x02);
   pub const HARDWARE_FAILURE: Self = Self(0x03);
   pub const PAGE_TIMEOUT: Self = Self(0x04);
   pub const AUTHENTICATION_FAILURE: Self = Self(0x05);
   pub const MEMORY_CAPACITY_EXCEEDED: Self = Self(0x07);
   pub const CONNECTION_TIMEOUT: Self = Self(0x08);
   pub const CONNECTION_LIMIT_EXCEEDED: Self = Self(0x09);
   pub const CONNECTION_ALREADY_EXISTS: Self = Self(0x0B);
   pub const COMMAND_DISALLOWED: Self = Self(0x0C);
   pub const REJECTED_LIMITED_RESOURCES: Self = Self(0x0D);
   pub const REJECTED_SECURITY: Self = Self(0x0E);
   pub const REJECTED_UNACCEPTABLE_ADDRESS: Self = Self(0x0F);
   pub const CONNECTION_ACCEPT_TIMEOUT: Self = Self(0x10);
   pub const UNSUPPORTED_FEATURE: Self = Self(0x11);
   pub const INVALID_PARAMETERS: Self = Self(0x12);
   pub const REMOTE_USER_TERMINATED: Self = Self(0x13);
   pub const LOCAL_HOST_TERMINATED: Self = Self(0x16);

   pub const fn is_success(self) -> bool {
      self.0 == Self::SUCCESS.0
   }
}

const STATUS_NAMES: &[(u8, &str)] = &[
   (Status::SUCCESS.0, "success"),
   (Status::UNKNOWN_COMMAND.0, "unknown command"),
   (Status::UNKNOWN_CONNECTION.0, "unknown connection identifier"),
   (Status::HARDWARE_FAILURE.0, "hardware failure"),
   (Status::PAGE_TIMEOUT.0, "page timeout"),
   (Status::AUTHENTICATION_FAILURE.0, "authentication failure"),
   (Status::MEMORY_CAPACITY_EXCEEDED.0, "memory capacity exceeded"),
   (Status::CONNECTION_TIMEOUT.0, "connection timeout"),
   (Status::CONNECTION_LIMIT_EXCEEDED.0, "connection limit exceeded"),
   (Status::CONNECTION_ALREADY_EXISTS.0, "connection already exists"),
   (Status::COMMAND_DISALLOWED.0, "command disallowed"),
   (Status::REJECTED_LIMITED_RESOURCES.0, "rejected: limited resources"),
   (Status::REJECTED_SECURITY.0, "rejected: security reasons"),
   (Status::REJECTED_UNACCEPTABLE_ADDRESS.0, "rejected: unacceptable address"),
   (Status::CONNECTION_ACCEPT_TIMEOUT.0, "connection accept timeout"),
   (Status::UNSUPPORTED_FEATURE.0, "unsupported feature or parameter"),
   (Status::INVALID_PARAMETERS.0, "invalid parameters"),
   (Status::REMOTE_USER_TERMINATED.0, "remote user terminated connection"),
   (Status::LOCAL_HOST_TERMINATED.0, "connection terminated by local host"),
];

impl fmt::Display for Status {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match STATUS_NAMES.iter().find(|(code, _)| *code == self.0) {
         Some((_, name)) => write!(f, "{name} (0x{:02x})", self.0),
         None => write!(f, "status 0x{:02x}", self.0),
      }
   }
}

/// HCI command opcode (OGF << 10 | OCF).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Opcode(pub u16);

impl Opcode {
   /// Sent by controllers to grant command credits without completing anything.
   pub const NONE: Self = Self(0x0000);
   pub const CREATE_CONNECTION: Self = Self(0x0405);
   pub const DISCONNECT: Self = Self(0x0406);
   pub const CREATE_CONNECTION_CANCEL: Self = Self(0x0408);
   pub const ACCEPT_CONNECTION_REQUEST: Self = Self(0x0409);
   pub const REJECT_CONNECTION_REQUEST: Self = Self(0x040A);
   pub const RESET: Self = Self(0x0C03);
   pub const WRITE_SCAN_ENABLE: Self = Self(0x0C1A);
   pub const READ_BUFFER_SIZE: Self = Self(0x1005);
}

impl fmt::Display for Opcode {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "0x{:04x}", self.0)
   }
}

// === ACL data ===

/// Packet boundary flag of an ACL data packet.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::FromRepr, strum::Display)]
pub enum PacketBoundary {
   FirstNonFlushable = 0b00,
   Continuing = 0b01,
   FirstFlushable = 0b10,
   CompletePdu = 0b11,
}

impl PacketBoundary {
   /// Whether this fragment starts a new upper-layer frame.
   pub const fn is_first(self) -> bool {
      !matches!(self, Self::Continuing)
   }
}

/// Broadcast flag of an ACL data packet.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, strum::FromRepr, strum::Display)]
pub enum BroadcastFlag {
   #[default]
   PointToPoint = 0b00,
   ActivePeripheralBroadcast = 0b01,
   Reserved2 = 0b10,
   Reserved3 = 0b11,
}

/// One ACL data packet as it crosses the HCI boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclPacket {
   pub handle: ConnectionHandle,
   pub boundary: PacketBoundary,
   pub broadcast: BroadcastFlag,
   pub data: Vec<u8>,
}

impl AclPacket {
   pub fn new(handle: ConnectionHandle, boundary: PacketBoundary, data: Vec<u8>) -> Self {
      Self {
         handle,
         boundary,
         broadcast: BroadcastFlag::PointToPoint,
         data,
      }
   }

   /// Encodes header and data. The data length must fit the 16-bit field.
   pub fn encode(&self) -> Vec<u8> {
      let flags = self.handle.raw()
         | (u16::from(self.boundary as u8) << 12)
         | (u16::from(self.broadcast as u8) << 14);
      let len = u16::try_from(self.data.len()).unwrap_or(u16::MAX);
      let mut out = Vec::with_capacity(ACL_HEADER_LEN + self.data.len());
      out.extend_from_slice(&flags.to_le_bytes());
      out.extend_from_slice(&len.to_le_bytes());
      out.extend_from_slice(&self.data[..usize::from(len)]);
      out
   }

   pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
      need(bytes, ACL_HEADER_LEN)?;
      let flags = read_u16(bytes, 0);
      let declared = usize::from(read_u16(bytes, 2));
      let data = &bytes[ACL_HEADER_LEN..];
      if data.len() != declared {
         return Err(PacketError::LengthMismatch {
            declared,
            actual: data.len(),
         });
      }

      let boundary = PacketBoundary::from_repr(((flags >> 12) & 0b11) as u8).ok_or(
         PacketError::InvalidField {
            field: "packet boundary flag",
            value: flags,
         },
      )?;
      let broadcast = BroadcastFlag::from_repr(((flags >> 14) & 0b11) as u8).ok_or(
         PacketError::InvalidField {
            field: "broadcast flag",
            value: flags,
         },
      )?;

      Ok(Self {
         handle: ConnectionHandle::from_wire(flags),
         boundary,
         broadcast,
         data: data.to_vec(),
      })
   }
}

// === Commands ===

/// Role requested when accepting an incoming connection.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum AcceptRole {
   BecomeCentral = 0x00,
   RemainPeripheral = 0x01,
}

/// Scan_Enable parameter of Write_Scan_Enable.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum ScanEnable {
   NoScans = 0x00,
   InquiryOnly = 0x01,
   PageOnly = 0x02,
   InquiryAndPage = 0x03,
}

/// Commands the manager issues to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
   Reset,
   ReadBufferSize,
   WriteScanEnable(ScanEnable),
   CreateConnection {
      address: Address,
      allow_role_switch: bool,
   },
   CreateConnectionCancel {
      address: Address,
   },
   AcceptConnectionRequest {
      address: Address,
      role: AcceptRole,
   },
   RejectConnectionRequest {
      address: Address,
      reason: Status,
   },
   Disconnect {
      handle: ConnectionHandle,
      reason: Status,
   },
}

impl Command {
   pub const fn opcode(&self) -> Opcode {
      match self {
         Self::Reset => Opcode::RESET,
         Self::ReadBufferSize => Opcode::READ_BUFFER_SIZE,
         Self::WriteScanEnable(_) => Opcode::WRITE_SCAN_ENABLE,
         Self::CreateConnection { .. } => Opcode::CREATE_CONNECTION,
         Self::CreateConnectionCancel { .. } => Opcode::CREATE_CONNECTION_CANCEL,
         Self::AcceptConnectionRequest { .. } => Opcode::ACCEPT_CONNECTION_REQUEST,
         Self::RejectConnectionRequest { .. } => Opcode::REJECT_CONNECTION_REQUEST,
         Self::Disconnect { .. } => Opcode::DISCONNECT,
      }
   }

   /// Whether the controller answers with Command_Status (the outcome arrives
   /// in a later event) rather than Command_Complete.
   pub const fn expects_status(&self) -> bool {
      matches!(
         self,
         Self::CreateConnection { .. }
            | Self::AcceptConnectionRequest { .. }
            | Self::RejectConnectionRequest { .. }
            | Self::Disconnect { .. }
      )
   }

   /// Encodes opcode, parameter length and parameters.
   pub fn encode(&self) -> Packet {
      let mut params = Packet::new();
      match self {
         Self::Reset | Self::ReadBufferSize => {},
         Self::WriteScanEnable(scan) => params.push(*scan as u8),
         Self::CreateConnection {
            address,
            allow_role_switch,
         } => {
            params.extend_from_slice(&address.to_le_bytes());
            params.extend_from_slice(&CREATE_CONNECTION_PACKET_TYPE.to_le_bytes());
            params.push(PAGE_SCAN_REPETITION_MODE_R1);
            params.push(0x00); // reserved
            params.extend_from_slice(&0u16.to_le_bytes()); // clock offset
            params.push(u8::from(*allow_role_switch));
         },
         Self::CreateConnectionCancel { address } => {
            params.extend_from_slice(&address.to_le_bytes());
         },
         Self::AcceptConnectionRequest { address, role } => {
            params.extend_from_slice(&address.to_le_bytes());
            params.push(*role as u8);
         },
         Self::RejectConnectionRequest { address, reason } => {
            params.extend_from_slice(&address.to_le_bytes());
            params.push(reason.0);
         },
         Self::Disconnect { handle, reason } => {
            params.extend_from_slice(&handle.raw().to_le_bytes());
            params.push(reason.0);
         },
      }

      let mut out = Packet::new();
      out.extend_from_slice(&self.opcode().0.to_le_bytes());
      out.push(params.len() as u8);
      out.extend_from_slice(&params);
      out
   }
}

// === Events ===

/// Link type reported in connection events.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum LinkType {
   Sco = 0x00,
   Acl = 0x01,
   Esco = 0x02,
}

impl LinkType {
   fn decode(raw: u8) -> Result<Self, PacketError> {
      Self::from_repr(raw).ok_or(PacketError::InvalidField {
         field: "link type",
         value: u16::from(raw),
      })
   }
}

/// Controller ACL buffer configuration reported by Read_Buffer_Size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSize {
   /// Maximum data length of one ACL packet.
   pub acl_data_packet_length: u16,
   /// Number of ACL packets the controller can buffer.
   pub total_num_acl_data_packets: u16,
}

impl BufferSize {
   /// Parses Read_Buffer_Size return parameters (status included).
   pub fn parse(params: &[u8]) -> Result<Self, PacketError> {
      need(params, 8)?;
      Ok(Self {
         acl_data_packet_length: read_u16(params, 1),
         total_num_acl_data_packets: read_u16(params, 4),
      })
   }
}

/// Events the manager understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
   ConnectionComplete {
      status: Status,
      handle: ConnectionHandle,
      address: Address,
      link_type: LinkType,
      encryption_enabled: bool,
   },
   ConnectionRequest {
      address: Address,
      class_of_device: u32,
      link_type: LinkType,
   },
   DisconnectionComplete {
      status: Status,
      handle: ConnectionHandle,
      reason: Status,
   },
   CommandComplete {
      num_hci_command_packets: u8,
      opcode: Opcode,
      return_parameters: SmallVec<[u8; 16]>,
   },
   CommandStatus {
      status: Status,
      num_hci_command_packets: u8,
      opcode: Opcode,
   },
   NumberOfCompletedPackets(SmallVec<[(ConnectionHandle, u16); 4]>),
   Unknown {
      code: u8,
      parameters: Vec<u8>,
   },
}

impl Event {
   pub const CONNECTION_COMPLETE: u8 = 0x03;
   pub const CONNECTION_REQUEST: u8 = 0x04;
   pub const DISCONNECTION_COMPLETE: u8 = 0x05;
   pub const COMMAND_COMPLETE: u8 = 0x0E;
   pub const COMMAND_STATUS: u8 = 0x0F;
   pub const NUMBER_OF_COMPLETED_PACKETS: u8 = 0x13;

   /// Decodes an event packet (event code, parameter length, parameters).
   pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
      need(bytes, EVENT_HEADER_LEN)?;
      let code = bytes[0];
      let declared = usize::from(bytes[1]);
      let p = &bytes[EVENT_HEADER_LEN..];
      if p.len() != declared {
         return Err(PacketError::LengthMismatch {
            declared,
            actual: p.len(),
         });
      }

      let event = match code {
         Self::CONNECTION_COMPLETE => {
            need(p, 11)?;
            Self::ConnectionComplete {
               status: Status(p[0]),
               handle: ConnectionHandle::from_wire(read_u16(p, 1)),
               address: read_address(p, 3),
               link_type: LinkType::decode(p[9])?,
               encryption_enabled: p[10] != 0,
            }
         },
         Self::CONNECTION_REQUEST => {
            need(p, 10)?;
            Self::ConnectionRequest {
               address: read_address(p, 0),
               class_of_device: u32::from_le_bytes([p[6], p[7], p[8], 0]),
               link_type: LinkType::decode(p[9])?,
            }
         },
         Self::DISCONNECTION_COMPLETE => {
            need(p, 4)?;
            Self::DisconnectionComplete {
               status: Status(p[0]),
               handle: ConnectionHandle::from_wire(read_u16(p, 1)),
               reason: Status(p[3]),
            }
         },
         Self::COMMAND_COMPLETE => {
            need(p, 3)?;
            Self::CommandComplete {
               num_hci_command_packets: p[0],
               opcode: Opcode(read_u16(p, 1)),
               return_parameters: SmallVec::from_slice(&p[3..]),
            }
         },
         Self::COMMAND_STATUS => {
            need(p, 4)?;
            Self::CommandStatus {
               status: Status(p[0]),
               num_hci_command_packets: p[1],
               opcode: Opcode(read_u16(p, 2)),
            }
         },
         Self::NUMBER_OF_COMPLETED_PACKETS => {
            need(p, 1)?;
            let count = usize::from(p[0]);
            let expected = 1 + 4 * count;
            if p.len() != expected {
               return Err(PacketError::LengthMismatch {
                  declared: expected,
                  actual: p.len(),
               });
            }
            Self::NumberOfCompletedPackets(
               p[1..]
                  .chunks_exact(4)
                  .map(|entry| {
                     (
                        ConnectionHandle::from_wire(read_u16(entry, 0)),
                        read_u16(entry, 2),
                     )
                  })
                  .collect(),
            )
         },
         _ => Self::Unknown {
            code,
            parameters: p.to_vec(),
         },
      };
      Ok(event)
   }
}

/// Host → controller traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPacket {
   Command(Command),
   Acl(AclPacket),
}

/// Controller → host traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerPacket {
   Event(Event),
   Acl(AclPacket),
}
