//! Error types for the ACL manager.
//!
//! This module defines the errors surfaced to callers of the manager as well
//! as the ambient failures of the daemon (I/O, configuration, transport).

use thiserror::Error;

use crate::{
   acl::reassembler::FramingError,
   hci::{
      address::{Address, InvalidAddress},
      packet::{ConnectionHandle, PacketError, Status},
   },
};

/// Main error type for the ACL manager.
#[derive(Error, Debug)]
pub enum AclError {
   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Malformed HCI packet: {0}")]
   Packet(#[from] PacketError),

   #[error("Framing error: {0}")]
   Framing(#[from] FramingError),

   #[error(transparent)]
   InvalidAddress(#[from] InvalidAddress),

   #[error("Unknown connection handle: {0}")]
   UnknownHandle(ConnectionHandle),

   #[error("A connection to {0} is already pending or active")]
   DuplicateConnectRequest(Address),

   #[error("No pending connection request for {0}")]
   NoPendingRequest(Address),

   #[error("Connection failed: {0}")]
   ConnectionFailed(Status),

   #[error("Connection request cancelled")]
   Cancelled,

   #[error("Payload of {0} bytes exceeds the L2CAP frame limit")]
   PayloadTooLarge(usize),

   #[error("Controller link closed")]
   ControllerClosed,

   #[error("Request timeout")]
   RequestTimeout,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Manager has been shut down")]
   ManagerShutdown,
}

/// Convenience type alias for Results with `AclError`.
pub type Result<T> = std::result::Result<T, AclError>;
