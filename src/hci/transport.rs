//! Controller transport.
//!
//! The manager talks to the controller through a [`ControllerLink`]: a feed
//! of controller packets and a sink for host packets. The link is either
//! backed by an H4 byte stream (UART-style framing, e.g. a virtual controller
//! over TCP) or handed directly to an in-process peer.

use std::{io, time::Duration};

use log::{debug, error, warn};
use tokio::{
   io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
   net::TcpStream,
   sync::mpsc,
   task::JoinSet,
   time,
};

use crate::{
   error::{AclError, Result},
   hci::packet::{
      ACL_HEADER_LEN, AclPacket, ControllerPacket, EVENT_HEADER_LEN, Event, HostPacket,
      PacketError,
   },
};

/// H4 packet indicators
pub const H4_COMMAND: u8 = 0x01;
pub const H4_ACL: u8 = 0x02;
pub const H4_SCO: u8 = 0x03;
pub const H4_EVENT: u8 = 0x04;
pub const H4_ISO: u8 = 0x05;

/// Timeout for connecting to a TCP controller endpoint
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The manager's side of a controller connection.
#[derive(Debug)]
pub struct ControllerLink {
   pub(crate) feed: mpsc::Receiver<ControllerPacket>,
   pub(crate) sink: mpsc::Sender<HostPacket>,
}

impl ControllerLink {
   pub const fn new(
      feed: mpsc::Receiver<ControllerPacket>,
      sink: mpsc::Sender<HostPacket>,
   ) -> Self {
      Self { feed, sink }
   }
}

/// The controller's side of an in-process link.
#[derive(Debug)]
pub struct ControllerPeer {
   /// Packets the host sent to the controller.
   pub inbound: mpsc::Receiver<HostPacket>,
   /// Packets delivered to the host.
   pub outbound: mpsc::Sender<ControllerPacket>,
}

/// Creates a connected link/peer pair with the given queue depth.
pub fn channel(depth: usize) -> (ControllerLink, ControllerPeer) {
   let (feed_tx, feed_rx) = mpsc::channel(depth);
   let (sink_tx, sink_rx) = mpsc::channel(depth);
   (
      ControllerLink::new(feed_rx, sink_tx),
      ControllerPeer {
         inbound: sink_rx,
         outbound: feed_tx,
      },
   )
}

/// Runs H4 framing over `io`, spawning the reader and writer tasks on `jset`.
pub fn attach<T>(jset: &mut JoinSet<()>, io: T, depth: usize) -> ControllerLink
where
   T: AsyncRead + AsyncWrite + Send + 'static,
{
   let (reader, writer) = tokio::io::split(io);
   let (link, peer) = channel(depth);
   jset.spawn(recv_thread(reader, peer.outbound));
   jset.spawn(send_thread(writer, peer.inbound));
   link
}

/// Connects to an H4-over-TCP controller endpoint.
pub async fn connect_tcp(jset: &mut JoinSet<()>, addr: &str, depth: usize) -> Result<ControllerLink> {
   debug!("Connecting to controller at {addr}");
   let stream = time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
      .await
      .map_err(|_| AclError::RequestTimeout)??;
   stream.set_nodelay(true)?;
   Ok(attach(jset, stream, depth))
}

/// Reads one H4 packet. `Ok(None)` means a packet type the host ignores.
async fn read_packet<R>(reader: &mut R) -> Result<Option<ControllerPacket>>
where
   R: AsyncRead + Unpin,
{
   let indicator = reader.read_u8().await?;
   match indicator {
      H4_EVENT => {
         let mut buf = vec![0u8; EVENT_HEADER_LEN];
         reader.read_exact(&mut buf).await?;
         let len = usize::from(buf[1]);
         buf.resize(EVENT_HEADER_LEN + len, 0);
         reader.read_exact(&mut buf[EVENT_HEADER_LEN..]).await?;
         debug!("← event: {}", hex::encode(&buf));
         Ok(Some(ControllerPacket::Event(Event::decode(&buf)?)))
      },
      H4_ACL => {
         let mut buf = vec![0u8; ACL_HEADER_LEN];
         reader.read_exact(&mut buf).await?;
         let len = usize::from(u16::from_le_bytes([buf[2], buf[3]]));
         buf.resize(ACL_HEADER_LEN + len, 0);
         reader.read_exact(&mut buf[ACL_HEADER_LEN..]).await?;
         debug!("← acl: {}", hex::encode(&buf));
         Ok(Some(ControllerPacket::Acl(AclPacket::decode(&buf)?)))
      },
      H4_SCO => {
         let mut hdr = [0u8; 3];
         reader.read_exact(&mut hdr).await?;
         skip(reader, usize::from(hdr[2])).await?;
         Ok(None)
      },
      H4_ISO => {
         let mut hdr = [0u8; 4];
         reader.read_exact(&mut hdr).await?;
         skip(reader, usize::from(u16::from_le_bytes([hdr[2], hdr[3]]) & 0x3FFF)).await?;
         Ok(None)
      },
      other => Err(PacketError::UnknownIndicator(other).into()),
   }
}

async fn skip<R>(reader: &mut R, len: usize) -> io::Result<()>
where
   R: AsyncRead + Unpin,
{
   let mut buf = vec![0u8; len];
   reader.read_exact(&mut buf).await?;
   Ok(())
}

async fn recv_thread<R>(mut reader: R, tx: mpsc::Sender<ControllerPacket>)
where
   R: AsyncRead + Unpin,
{
   loop {
      match read_packet(&mut reader).await {
         Ok(Some(packet)) => {
            if tx.send(packet).await.is_err() {
               debug!("Controller feed dropped by host");
               return;
            }
         },
         Ok(None) => {},
         // Malformed contents inside an intact frame: skip the packet.
         Err(AclError::Packet(e @ (PacketError::LengthMismatch { .. }
         | PacketError::TooShort { .. }
         | PacketError::InvalidField { .. }))) => {
            warn!("Dropping malformed controller packet: {e}");
         },
         Err(AclError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
            warn!("Controller closed the transport");
            return;
         },
         Err(e) => {
            error!("Controller transport failed: {e}");
            return;
         },
      }
   }
}

async fn send_thread<W>(mut writer: W, mut rx: mpsc::Receiver<HostPacket>)
where
   W: AsyncWrite + Unpin,
{
   while let Some(packet) = rx.recv().await {
      let mut bytes = Vec::new();
      match &packet {
         HostPacket::Command(cmd) => {
            bytes.push(H4_COMMAND);
            bytes.extend_from_slice(&cmd.encode());
         },
         HostPacket::Acl(acl) => {
            bytes.push(H4_ACL);
            bytes.extend_from_slice(&acl.encode());
         },
      }
      debug!("→ {}", hex::encode(&bytes[1..]));
      if let Err(e) = writer.write_all(&bytes).await {
         warn!("Failed to write to controller: {e}");
         return;
      }
      if let Err(e) = writer.flush().await {
         warn!("Failed to flush controller transport: {e}");
         return;
      }
   }
   debug!("Host closed the controller sink");
}

#[cfg(test)]
mod tests {
   use tokio::io::duplex;

   use super::*;
   use crate::hci::{
      address::Address,
      packet::{Command, ConnectionHandle, LinkType, PacketBoundary, Status},
   };

   const TIMEOUT: Duration = Duration::from_secs(1);

   async fn next(link: &mut ControllerLink) -> Option<ControllerPacket> {
      time::timeout(TIMEOUT, link.feed.recv())
         .await
         .expect("timed out waiting for controller packet")
   }

   #[tokio::test]
   async fn test_decodes_events_and_acl() {
      let mut jset = JoinSet::new();
      let (host, mut controller) = duplex(1024);
      let mut link = attach(&mut jset, host, 8);

      controller
         .write_all(&[
            H4_EVENT, 0x03, 0x0B, 0x00, 0x01, 0x00, 0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA, 0x01,
            0x00,
         ])
         .await
         .unwrap();
      controller
         .write_all(&[H4_ACL, 0x01, 0x20, 0x05, 0x00, 0x01, 0x00, 0x07, 0x00, b'!'])
         .await
         .unwrap();

      assert_eq!(
         next(&mut link).await,
         Some(ControllerPacket::Event(Event::ConnectionComplete {
            status: Status::SUCCESS,
            handle: ConnectionHandle::new(1).unwrap(),
            address: Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]),
            link_type: LinkType::Acl,
            encryption_enabled: false,
         }))
      );
      let Some(ControllerPacket::Acl(acl)) = next(&mut link).await else {
         panic!("expected ACL data");
      };
      assert_eq!(acl.handle.raw(), 1);
      assert_eq!(acl.boundary, PacketBoundary::FirstFlushable);
      assert_eq!(acl.data, vec![0x01, 0x00, 0x07, 0x00, b'!']);
   }

   #[tokio::test]
   async fn test_skips_malformed_and_ignored_packets() {
      let mut jset = JoinSet::new();
      let (host, mut controller) = duplex(1024);
      let mut link = attach(&mut jset, host, 8);

      // Connection request with an invalid link type, then a SCO packet.
      controller
         .write_all(&[
            H4_EVENT, 0x04, 0x0A, 0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA, 0x0C, 0x02, 0x5A, 0x07,
         ])
         .await
         .unwrap();
      controller
         .write_all(&[H4_SCO, 0x01, 0x00, 0x02, 0xAB, 0xCD])
         .await
         .unwrap();
      controller
         .write_all(&[H4_EVENT, 0x05, 0x04, 0x00, 0x01, 0x00, 0x13])
         .await
         .unwrap();

      assert_eq!(
         next(&mut link).await,
         Some(ControllerPacket::Event(Event::DisconnectionComplete {
            status: Status::SUCCESS,
            handle: ConnectionHandle::new(1).unwrap(),
            reason: Status::REMOTE_USER_TERMINATED,
         }))
      );
   }

   #[tokio::test]
   async fn test_eof_closes_feed() {
      let mut jset = JoinSet::new();
      let (host, controller) = duplex(64);
      let mut link = attach(&mut jset, host, 8);
      drop(controller);
      assert_eq!(next(&mut link).await, None);
   }

   #[tokio::test]
   async fn test_writes_h4_framed_packets() {
      let mut jset = JoinSet::new();
      let (host, mut controller) = duplex(1024);
      let link = attach(&mut jset, host, 8);

      link.sink.send(HostPacket::Command(Command::Reset)).await.unwrap();
      link
         .sink
         .send(HostPacket::Acl(AclPacket::new(
            ConnectionHandle::new(2).unwrap(),
            PacketBoundary::Continuing,
            vec![0x55],
         )))
         .await
         .unwrap();

      let mut buf = [0u8; 10];
      time::timeout(TIMEOUT, controller.read_exact(&mut buf))
         .await
         .unwrap()
         .unwrap();
      assert_eq!(
         buf,
         [H4_COMMAND, 0x03, 0x0C, 0x00, H4_ACL, 0x02, 0x10, 0x01, 0x00, 0x55]
      );
   }
}
