//! Host controller interface.
//!
//! Wire-level types and the transport that carries them between the manager
//! and a Bluetooth controller.

pub mod address;
pub mod packet;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;
