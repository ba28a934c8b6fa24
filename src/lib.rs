//! Bluetooth ACL connection manager.
//!
//! Sits between a Bluetooth controller, reached over HCI, and the
//! applications that want to exchange L2CAP frames with remote peers. It
//! establishes and tears down ACL links, fragments outbound frames to the
//! controller's buffer size and reassembles inbound fragments per
//! connection handle.

pub mod acl;
pub mod config;
pub mod error;
pub mod event;
pub mod hci;

pub use acl::manager::{AclManager, FrameStream, IncomingConnections, PendingConnection};
pub use error::{AclError, Result};
