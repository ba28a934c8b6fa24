//! ACL data path and connection management.
//!
//! Outbound payloads are wrapped in L2CAP basic frames and fragmented to the
//! controller's buffer size; inbound fragments are reassembled per handle.
//! The [`manager`] ties both to the connection lifecycle.

pub mod frame;
pub mod manager;
pub mod policy;
pub mod reassembler;
pub mod state;
pub mod table;
