//! ACL connection manager.
//!
//! A single actor task owns the connection table, the controller link and
//! every subscriber. Applications talk to it through [`AclManager`], which is
//! cheap to clone; the controller talks to it through the link's feed.

use std::{
   collections::{HashMap, HashSet, VecDeque},
   pin::Pin,
   sync::Arc,
   task::{Context, Poll},
};

use futures::Stream;
use log::{debug, error, info, warn};
use tokio::{
   select,
   sync::{
      mpsc::{self, error::TrySendError},
      oneshot,
   },
};

use crate::{
   acl::{
      frame::{self, ChannelId, L2capFrame},
      policy::{AcceptAll, AcceptPolicy, Decision},
      state::{LinkInput, LinkState, Role},
      table::{Connection, ConnectionInfo, ConnectionTable, PendingRequest},
   },
   config::Config,
   error::{AclError, Result},
   event::{AclEvent, Anomaly, EventSender},
   hci::{
      address::{Address, AddressType},
      packet::{
         AcceptRole, AclPacket, BufferSize, Command, ConnectionHandle, ControllerPacket, Event,
         HostPacket, LinkType, Opcode, ScanEnable, Status,
      },
      transport::ControllerLink,
   },
};

/// Result of handling one controller input.
type Handled = std::result::Result<(), Anomaly>;

/// Reason sent with application-initiated disconnects.
const DISCONNECT_REASON: Status = Status::REMOTE_USER_TERMINATED;

// === Commands ===

#[derive(Debug)]
enum ManagerCommand {
   Connect {
      address: Address,
      address_type: AddressType,
      accepted: oneshot::Sender<Result<()>>,
      complete: oneshot::Sender<Result<ConnectionInfo>>,
   },
   CancelConnect(Address, oneshot::Sender<Result<()>>),
   Disconnect(ConnectionHandle, oneshot::Sender<Result<()>>),
   Send {
      handle: ConnectionHandle,
      channel: Option<ChannelId>,
      payload: Vec<u8>,
      reply: oneshot::Sender<Result<()>>,
   },
   AcceptIncoming(mpsc::Sender<ConnectionInfo>, oneshot::Sender<()>),
   SubscribeFrames(
      Option<ConnectionHandle>,
      mpsc::Sender<L2capFrame>,
      oneshot::Sender<Result<()>>,
   ),
   GetConnection(ConnectionHandle, oneshot::Sender<Option<ConnectionInfo>>),
   GetAllConnections(oneshot::Sender<Vec<ConnectionInfo>>),
   Shutdown,
}

// === Main Manager ===

/// Handle to the ACL manager.
///
/// Every method is safe to call concurrently from any task. Once the manager
/// has stopped (after [`AclManager::shutdown`] or when the controller link is
/// lost) calls fail with [`AclError::ManagerShutdown`].
#[derive(Clone)]
pub struct AclManager {
   inbox: mpsc::Sender<ManagerCommand>,
   queue_depth: usize,
}

impl AclManager {
   /// Starts a manager that accepts every incoming connection.
   pub fn new(link: ControllerLink, config: Config, event_tx: EventSender) -> Self {
      Self::with_policy(link, config, event_tx, Arc::new(AcceptAll))
   }

   pub fn with_policy(
      link: ControllerLink,
      config: Config,
      event_tx: EventSender,
      policy: Arc<dyn AcceptPolicy>,
   ) -> Self {
      let (command_tx, command_rx) = mpsc::channel(config.channel_buffer_size.max(1));
      let queue_depth = config.frame_queue_depth.max(1);
      tokio::spawn(ManagerActor::new(config, event_tx, policy, command_rx, link).run());
      Self {
         inbox: command_tx,
         queue_depth,
      }
   }

   /// Requests an outbound connection to a public address.
   pub async fn connect(&self, address: Address) -> Result<PendingConnection> {
      self.connect_with_type(address, AddressType::Public).await
   }

   /// Requests an outbound connection. Fails immediately with
   /// [`AclError::DuplicateConnectRequest`] when the peer already has a
   /// pending request or a live connection.
   pub async fn connect_with_type(
      &self,
      address: Address,
      address_type: AddressType,
   ) -> Result<PendingConnection> {
      let (accepted_tx, accepted_rx) = oneshot::channel();
      let (complete_tx, complete_rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::Connect {
            address,
            address_type,
            accepted: accepted_tx,
            complete: complete_tx,
         })
         .await
         .map_err(|_| AclError::ManagerShutdown)?;
      accepted_rx.await.map_err(|_| AclError::ManagerShutdown)??;

      Ok(PendingConnection {
         address,
         complete: complete_rx,
         manager: self.clone(),
      })
   }

   /// Cancels an outstanding outbound request.
   pub async fn cancel_connect(&self, address: Address) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::CancelConnect(address, tx))
         .await
         .map_err(|_| AclError::ManagerShutdown)?;
      rx.await.map_err(|_| AclError::ManagerShutdown)?
   }

   /// Starts disconnecting an active connection. Queued outbound data for
   /// the handle is discarded.
   pub async fn disconnect(&self, handle: ConnectionHandle) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::Disconnect(handle, tx))
         .await
         .map_err(|_| AclError::ManagerShutdown)?;
      rx.await.map_err(|_| AclError::ManagerShutdown)?
   }

   /// Sends `payload` on the configured default channel.
   pub async fn send(&self, handle: ConnectionHandle, payload: impl Into<Vec<u8>>) -> Result<()> {
      self.submit(handle, None, payload.into()).await
   }

   /// Sends `payload` as one L2CAP frame on `channel`.
   ///
   /// Returns once the frame is queued; fragments go out as controller
   /// buffers free up, in submission order per handle.
   pub async fn send_to(
      &self,
      handle: ConnectionHandle,
      channel: ChannelId,
      payload: impl Into<Vec<u8>>,
   ) -> Result<()> {
      self.submit(handle, Some(channel), payload.into()).await
   }

   async fn submit(
      &self,
      handle: ConnectionHandle,
      channel: Option<ChannelId>,
      payload: Vec<u8>,
   ) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::Send {
            handle,
            channel,
            payload,
            reply: tx,
         })
         .await
         .map_err(|_| AclError::ManagerShutdown)?;
      rx.await.map_err(|_| AclError::ManagerShutdown)?
   }

   /// Subscribes to peer-initiated connections that completed successfully.
   /// Replaces any previous subscription. Connections that completed while
   /// nobody was subscribed are announced first.
   pub async fn accept_incoming(&self) -> Result<IncomingConnections> {
      let (conn_tx, conn_rx) = mpsc::channel(self.queue_depth);
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::AcceptIncoming(conn_tx, tx))
         .await
         .map_err(|_| AclError::ManagerShutdown)?;
      rx.await.map_err(|_| AclError::ManagerShutdown)?;
      Ok(IncomingConnections { rx: conn_rx })
   }

   /// Subscribes to reassembled frames, from one handle or from all of them.
   ///
   /// Frames that arrived before anyone subscribed are handed to the first
   /// matching subscription. A per-handle stream ends when its connection
   /// closes.
   pub async fn receive_stream(&self, handle: Option<ConnectionHandle>) -> Result<FrameStream> {
      let (frame_tx, frame_rx) = mpsc::channel(self.queue_depth);
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::SubscribeFrames(handle, frame_tx, tx))
         .await
         .map_err(|_| AclError::ManagerShutdown)?;
      rx.await.map_err(|_| AclError::ManagerShutdown)??;
      Ok(FrameStream { rx: frame_rx })
   }

   pub async fn connection(&self, handle: ConnectionHandle) -> Result<ConnectionInfo> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::GetConnection(handle, tx))
         .await
         .map_err(|_| AclError::ManagerShutdown)?;

      rx.await
         .map_err(|_| AclError::ManagerShutdown)?
         .ok_or(AclError::UnknownHandle(handle))
   }

   pub async fn connections(&self) -> Result<Vec<ConnectionInfo>> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::GetAllConnections(tx))
         .await
         .map_err(|_| AclError::ManagerShutdown)?;
      rx.await.map_err(|_| AclError::ManagerShutdown)
   }

   /// Stops the manager. Pending requests fail and all streams end.
   pub async fn shutdown(&self) {
      let _ = self.inbox.send(ManagerCommand::Shutdown).await;
   }
}

/// An outbound connection request accepted by the manager.
pub struct PendingConnection {
   address: Address,
   complete: oneshot::Receiver<Result<ConnectionInfo>>,
   manager: AclManager,
}

impl PendingConnection {
   pub const fn address(&self) -> Address {
      self.address
   }

   pub async fn cancel(&self) -> Result<()> {
      self.manager.cancel_connect(self.address).await
   }

   /// Waits for the controller to resolve the request.
   pub async fn wait(self) -> Result<ConnectionInfo> {
      self
         .complete
         .await
         .map_err(|_| AclError::ManagerShutdown)?
   }
}

/// Stream of reassembled frames.
pub struct FrameStream {
   rx: mpsc::Receiver<L2capFrame>,
}

impl FrameStream {
   pub async fn recv(&mut self) -> Option<L2capFrame> {
      self.rx.recv().await
   }
}

impl Stream for FrameStream {
   type Item = L2capFrame;

   fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
      self.rx.poll_recv(cx)
   }
}

/// Stream of accepted incoming connections.
pub struct IncomingConnections {
   rx: mpsc::Receiver<ConnectionInfo>,
}

impl IncomingConnections {
   pub async fn recv(&mut self) -> Option<ConnectionInfo> {
      self.rx.recv().await
   }
}

impl Stream for IncomingConnections {
   type Item = ConnectionInfo;

   fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
      self.rx.poll_recv(cx)
   }
}

// === Flow control ===

/// HCI commands waiting for the controller. One is outstanding at a time and
/// only while the controller grants a command credit.
#[derive(Debug)]
struct CommandQueue {
   queue: VecDeque<Command>,
   outstanding: Option<Command>,
   credits: u8,
}

impl CommandQueue {
   fn new() -> Self {
      Self {
         queue: VecDeque::new(),
         outstanding: None,
         credits: 1,
      }
   }

   fn push(&mut self, cmd: Command) {
      self.queue.push_back(cmd);
   }

   fn next_ready(&mut self) -> Option<Command> {
      if self.outstanding.is_some() || self.credits == 0 {
         return None;
      }
      let cmd = self.queue.pop_front()?;
      self.credits -= 1;
      self.outstanding = Some(cmd.clone());
      Some(cmd)
   }

   /// Matches a Command_Status/Command_Complete to the outstanding command.
   fn resolve(
      &mut self,
      opcode: Opcode,
      credits: u8,
   ) -> std::result::Result<Option<Command>, Anomaly> {
      self.credits = credits;
      if opcode == Opcode::NONE {
         return Ok(None);
      }
      match &self.outstanding {
         Some(cmd) if cmd.opcode() == opcode => Ok(self.outstanding.take()),
         _ => Err(Anomaly::UnexpectedCommandResponse { opcode }),
      }
   }

   /// Drops queued (not yet sent) commands matching `pred`.
   fn remove_queued(&mut self, pred: impl Fn(&Command) -> bool) -> bool {
      let before = self.queue.len();
      self.queue.retain(|cmd| !pred(cmd));
      self.queue.len() != before
   }
}

/// Bounded queue towards one subscriber. Items the receiver has no room for
/// wait in the backlog; the actor stops reading the controller until it drains.
struct Outlet<T> {
   tx: mpsc::Sender<T>,
   backlog: VecDeque<T>,
   closed: bool,
}

impl<T> Outlet<T> {
   const fn new(tx: mpsc::Sender<T>) -> Self {
      Self {
         tx,
         backlog: VecDeque::new(),
         closed: false,
      }
   }

   /// Queues `item`. Hands it back when the receiver is gone.
   fn offer(&mut self, item: T) -> Option<T> {
      if self.closed {
         return Some(item);
      }
      if !self.backlog.is_empty() {
         self.backlog.push_back(item);
         return None;
      }
      match self.tx.try_send(item) {
         Ok(()) => None,
         Err(TrySendError::Full(item)) => {
            self.backlog.push_back(item);
            None
         },
         Err(TrySendError::Closed(item)) => {
            self.closed = true;
            Some(item)
         },
      }
   }

   fn flush(&mut self) {
      while let Some(item) = self.backlog.pop_front() {
         match self.tx.try_send(item) {
            Ok(()) => {},
            Err(TrySendError::Full(item)) => {
               self.backlog.push_front(item);
               break;
            },
            Err(TrySendError::Closed(item)) => {
               self.backlog.push_front(item);
               self.closed = true;
               break;
            },
         }
      }
   }

   fn is_backlogged(&self) -> bool {
      !self.closed && !self.backlog.is_empty()
   }
}

struct FrameSubscriber {
   filter: Option<ConnectionHandle>,
   outlet: Outlet<L2capFrame>,
   retiring: bool,
}

impl FrameSubscriber {
   const fn new(filter: Option<ConnectionHandle>, tx: mpsc::Sender<L2capFrame>) -> Self {
      Self {
         filter,
         outlet: Outlet::new(tx),
         retiring: false,
      }
   }

   fn wants(&self, handle: ConnectionHandle) -> bool {
      !self.retiring && !self.outlet.closed && self.filter.is_none_or(|f| f == handle)
   }

   fn is_live(&self) -> bool {
      !self.outlet.closed && !(self.retiring && self.outlet.backlog.is_empty())
   }
}

/// The subscriber whose backlog is holding up the controller feed.
enum Blocked {
   Frames(mpsc::Sender<L2capFrame>),
   Incoming(mpsc::Sender<ConnectionInfo>),
}

// === Manager Actor ===

struct ManagerActor {
   config: Config,
   event_tx: EventSender,
   policy: Arc<dyn AcceptPolicy>,
   command_rx: mpsc::Receiver<ManagerCommand>,
   feed: mpsc::Receiver<ControllerPacket>,
   sink: mpsc::Sender<HostPacket>,

   // State
   table: ConnectionTable,
   waiters: HashMap<Address, oneshot::Sender<Result<ConnectionInfo>>>,
   orphans: HashSet<ConnectionHandle>, // Completed links nobody asked for
   rejected: HashMap<Address, usize>,  // Rejections awaiting their Connection_Complete
   commands: CommandQueue,
   acl_mtu: usize,
   acl_total: u16,
   acl_credits: u16,
   last_served: Option<ConnectionHandle>,
   incoming: Option<Outlet<ConnectionInfo>>,
   unannounced: VecDeque<ConnectionInfo>,
   subscribers: Vec<FrameSubscriber>,
}

impl ManagerActor {
   fn new(
      config: Config,
      event_tx: EventSender,
      policy: Arc<dyn AcceptPolicy>,
      command_rx: mpsc::Receiver<ManagerCommand>,
      link: ControllerLink,
   ) -> Self {
      let acl_mtu = usize::from(config.acl_buffer_length.max(1));
      let acl_total = config.acl_buffer_count.max(1);
      Self {
         config,
         event_tx,
         policy,
         command_rx,
         feed: link.feed,
         sink: link.sink,
         table: ConnectionTable::new(),
         waiters: HashMap::new(),
         orphans: HashSet::new(),
         rejected: HashMap::new(),
         commands: CommandQueue::new(),
         acl_mtu,
         acl_total,
         acl_credits: acl_total,
         last_served: None,
         incoming: None,
         unannounced: VecDeque::new(),
         subscribers: Vec::new(),
      }
   }

   async fn run(mut self) {
      info!("ACL manager starting up");
      self.initialize();

      loop {
         if let Err(e) = self.pump().await {
            error!("Controller link failed: {e}");
            self.event_tx.emit(AclEvent::ControllerLost);
            break;
         }

         // While a subscriber is backed up, stop reading the controller.
         let blocked = self.blocked();

         select! {
             biased;
             packet = self.feed.recv(), if blocked.is_none() => {
                 let Some(packet) = packet else {
                     error!("Controller feed closed");
                     self.event_tx.emit(AclEvent::ControllerLost);
                     break;
                 };
                 self.handle_controller_packet(packet);
             }
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("ACL manager shutting down");
                     break;
                 };
                 if !self.handle_command(cmd) {
                     break;
                 }
             }
             () = wait_capacity(blocked.as_ref()), if blocked.is_some() => {
                 self.flush_backlogs();
             }
         }
      }

      self.cleanup();
   }

   fn initialize(&mut self) {
      if self.config.reset_on_start {
         self.commands.push(Command::Reset);
      }
      self.commands.push(Command::ReadBufferSize);
      if self.config.page_scan {
         self.commands.push(Command::WriteScanEnable(ScanEnable::PageOnly));
      }
   }

   /// Submits whatever the controller currently has room for.
   async fn pump(&mut self) -> Result<()> {
      if let Some(cmd) = self.commands.next_ready() {
         debug!("Sending command {:?}", cmd);
         self
            .sink
            .send(HostPacket::Command(cmd))
            .await
            .map_err(|_| AclError::ControllerClosed)?;
      }

      while self.acl_credits > 0 {
         let Some(packet) = self.table.pop_outbound(self.last_served) else {
            break;
         };
         self.acl_credits -= 1;
         self.last_served = Some(packet.handle);
         self
            .sink
            .send(HostPacket::Acl(packet))
            .await
            .map_err(|_| AclError::ControllerClosed)?;
      }
      Ok(())
   }

   fn handle_command(&mut self, cmd: ManagerCommand) -> bool {
      match cmd {
         ManagerCommand::Connect {
            address,
            address_type,
            accepted,
            complete,
         } => {
            let result = self.connect(address, address_type, complete);
            let _ = accepted.send(result);
         },
         ManagerCommand::CancelConnect(address, reply) => {
            let _ = reply.send(self.cancel_connect(address));
         },
         ManagerCommand::Disconnect(handle, reply) => {
            let _ = reply.send(self.disconnect(handle));
         },
         ManagerCommand::Send {
            handle,
            channel,
            payload,
            reply,
         } => {
            let _ = reply.send(self.send(handle, channel, &payload));
         },
         ManagerCommand::AcceptIncoming(tx, reply) => {
            self.subscribe_incoming(tx);
            let _ = reply.send(());
         },
         ManagerCommand::SubscribeFrames(filter, tx, reply) => {
            let _ = reply.send(self.subscribe(filter, tx));
         },
         ManagerCommand::GetConnection(handle, reply) => {
            let info = self.table.lookup(handle).map(Connection::info);
            let _ = reply.send(info);
         },
         ManagerCommand::GetAllConnections(reply) => {
            let all = self.table.connections().map(Connection::info).collect();
            let _ = reply.send(all);
         },
         ManagerCommand::Shutdown => {
            info!("ACL manager shutting down");
            return false;
         },
      }
      true
   }

   // === Application requests ===

   fn connect(
      &mut self,
      address: Address,
      address_type: AddressType,
      complete: oneshot::Sender<Result<ConnectionInfo>>,
   ) -> Result<()> {
      self
         .table
         .register_pending(address, address_type, Role::Initiator)?;
      info!("Connecting to {address}");
      self.waiters.insert(address, complete);
      self.commands.push(Command::CreateConnection {
         address,
         allow_role_switch: true,
      });
      Ok(())
   }

   fn cancel_connect(&mut self, address: Address) -> Result<()> {
      self
         .table
         .fail_pending(address, LinkInput::Cancel)
         .map_err(|_| AclError::NoPendingRequest(address))?;

      let unsent = self.commands.remove_queued(
         |cmd| matches!(cmd, Command::CreateConnection { address: a, .. } if *a == address),
      );
      if !unsent {
         self.commands.push(Command::CreateConnectionCancel { address });
      }

      info!("Cancelled connection to {address}");
      if let Some(waiter) = self.waiters.remove(&address) {
         let _ = waiter.send(Err(AclError::Cancelled));
      }
      Ok(())
   }

   fn disconnect(&mut self, handle: ConnectionHandle) -> Result<()> {
      let conn = self
         .table
         .lookup_mut(handle)
         .ok_or(AclError::UnknownHandle(handle))?;
      conn
         .advance(LinkInput::Disconnect)
         .map_err(|_| AclError::UnknownHandle(handle))?;

      let dropped = conn.discard_outbound();
      if dropped > 0 {
         debug!("{handle}: discarded {dropped} queued packets");
      }
      info!("Disconnecting {handle} ({})", conn.address);
      self.commands.push(Command::Disconnect {
         handle,
         reason: DISCONNECT_REASON,
      });
      Ok(())
   }

   fn send(
      &mut self,
      handle: ConnectionHandle,
      channel: Option<ChannelId>,
      payload: &[u8],
   ) -> Result<()> {
      let channel = channel.unwrap_or(self.config.default_channel);
      let conn = self
         .table
         .lookup_mut(handle)
         .filter(|c| c.state() == LinkState::Active)
         .ok_or(AclError::UnknownHandle(handle))?;
      let bytes = frame::encode(channel, payload)?;
      conn.enqueue(frame::fragment(handle, &bytes, self.acl_mtu));
      debug!("{handle}: queued {} bytes on {channel}", payload.len());
      Ok(())
   }

   fn subscribe(
      &mut self,
      filter: Option<ConnectionHandle>,
      tx: mpsc::Sender<L2capFrame>,
   ) -> Result<()> {
      if let Some(handle) = filter
         && self.table.lookup(handle).is_none()
      {
         return Err(AclError::UnknownHandle(handle));
      }

      let mut subscriber = FrameSubscriber::new(filter, tx);
      let handles: Vec<ConnectionHandle> = self
         .table
         .connections()
         .map(|c| c.handle)
         .filter(|h| filter.is_none_or(|f| f == *h))
         .collect();
      for handle in handles {
         if let Some(conn) = self.table.lookup_mut(handle) {
            for frame in conn.take_undelivered() {
               subscriber.outlet.offer(frame);
            }
         }
      }
      self.subscribers.push(subscriber);
      Ok(())
   }

   fn subscribe_incoming(&mut self, tx: mpsc::Sender<ConnectionInfo>) {
      let mut outlet = Outlet::new(tx);
      if let Some(previous) = self.incoming.take() {
         debug!("Replacing incoming connection subscriber");
         // Notices the old subscriber never received go to the new one.
         for info in previous.backlog {
            outlet.offer(info);
         }
      }
      while let Some(info) = self.unannounced.pop_front() {
         outlet.offer(info);
      }
      self.incoming = Some(outlet);
   }

   // === Controller input ===

   fn handle_controller_packet(&mut self, packet: ControllerPacket) {
      let result = match packet {
         ControllerPacket::Acl(acl) => self.handle_acl_data(&acl),
         ControllerPacket::Event(event) => self.handle_event(event),
      };
      if let Err(anomaly) = result {
         warn!("{anomaly}");
         self.event_tx.emit(AclEvent::Anomaly(anomaly));
      }
   }

   fn handle_event(&mut self, event: Event) -> Handled {
      match event {
         Event::ConnectionComplete {
            status,
            handle,
            address,
            link_type,
            ..
         } => self.handle_connection_complete(status, handle, address, link_type),
         Event::ConnectionRequest {
            address,
            class_of_device,
            link_type,
         } => self.handle_connection_request(address, class_of_device, link_type),
         Event::DisconnectionComplete {
            status,
            handle,
            reason,
         } => self.handle_disconnection_complete(status, handle, reason),
         Event::CommandComplete {
            num_hci_command_packets,
            opcode,
            return_parameters,
         } => self.handle_command_complete(num_hci_command_packets, opcode, &return_parameters),
         Event::CommandStatus {
            status,
            num_hci_command_packets,
            opcode,
         } => self.handle_command_status(status, num_hci_command_packets, opcode),
         Event::NumberOfCompletedPackets(entries) => self.handle_completed_packets(&entries),
         Event::Unknown { code, .. } => {
            debug!("Ignoring event 0x{code:02x}");
            Ok(())
         },
      }
   }

   fn handle_connection_complete(
      &mut self,
      status: Status,
      handle: ConnectionHandle,
      address: Address,
      link_type: LinkType,
   ) -> Handled {
      if link_type != LinkType::Acl {
         debug!("Ignoring {link_type} connection complete for {address}");
         return Ok(());
      }

      if !status.is_success() {
         if self.take_rejected(address) {
            debug!("Rejected request from {address} closed: {status}");
            return Ok(());
         }
         let pending = self
            .table
            .fail_pending(address, LinkInput::Complete(status))?;
         self.fail_request(&pending, status);
         return Ok(());
      }

      match self.table.promote(address, handle) {
         Ok(conn) => {
            let info = conn.info();
            info!("Connected to {address} on {handle} as {}", info.role);
            self.handle_connected(info);
            Ok(())
         },
         Err(anomaly @ Anomaly::UnexpectedConnectionComplete { .. }) => {
            // Nobody wants this link any more.
            self.orphans.insert(handle);
            self.commands.push(Command::Disconnect {
               handle,
               reason: Status::LOCAL_HOST_TERMINATED,
            });
            Err(anomaly)
         },
         Err(anomaly @ Anomaly::DuplicateHandle { .. }) => {
            // The live connection on that handle stays; the request fails.
            let status = Status::CONNECTION_ALREADY_EXISTS;
            if let Ok(pending) = self
               .table
               .fail_pending(address, LinkInput::Complete(status))
            {
               self.fail_request(&pending, status);
            }
            Err(anomaly)
         },
         Err(anomaly) => Err(anomaly),
      }
   }

   fn handle_connected(&mut self, info: ConnectionInfo) {
      self.event_tx.emit(AclEvent::Connected(info.clone()));
      match info.role {
         Role::Initiator => {
            if let Some(waiter) = self.waiters.remove(&info.address) {
               let _ = waiter.send(Ok(info));
            }
         },
         Role::Acceptor => self.notify_incoming(info),
      }
   }

   fn notify_incoming(&mut self, info: ConnectionInfo) {
      let unclaimed = match self.incoming.as_mut() {
         Some(outlet) => outlet.offer(info),
         None => Some(info),
      };
      let Some(info) = unclaimed else {
         return;
      };
      if self.incoming.as_ref().is_some_and(|o| o.closed) {
         debug!("Incoming subscriber went away");
         self.incoming = None;
      }
      self.hold_incoming(info);
   }

   /// Keeps a notice for the next [`AclManager::accept_incoming`] caller.
   fn hold_incoming(&mut self, info: ConnectionInfo) {
      debug!("No incoming subscriber for {}, holding notice", info.address);
      self.unannounced.push_back(info);
      if self.unannounced.len() > self.config.frame_queue_depth.max(1)
         && let Some(evicted) = self.unannounced.pop_front()
      {
         warn!("Dropping unclaimed incoming notice for {}", evicted.address);
         self.event_tx.emit(AclEvent::IncomingDropped {
            handle: evicted.handle,
            address: evicted.address,
         });
      }
   }

   fn reject(&mut self, address: Address, reason: Status) {
      *self.rejected.entry(address).or_default() += 1;
      self
         .commands
         .push(Command::RejectConnectionRequest { address, reason });
   }

   /// Consumes one outstanding rejection of `address`.
   fn take_rejected(&mut self, address: Address) -> bool {
      let Some(count) = self.rejected.get_mut(&address) else {
         return false;
      };
      *count -= 1;
      if *count == 0 {
         self.rejected.remove(&address);
      }
      true
   }

   fn fail_request(&mut self, pending: &PendingRequest, status: Status) {
      warn!("Connection with {} failed: {status}", pending.address);
      self.event_tx.emit(AclEvent::ConnectionFailed {
         address: pending.address,
         status,
      });
      if let Some(waiter) = self.waiters.remove(&pending.address) {
         let _ = waiter.send(Err(AclError::ConnectionFailed(status)));
      }
   }

   fn handle_connection_request(
      &mut self,
      address: Address,
      class_of_device: u32,
      link_type: LinkType,
   ) -> Handled {
      if link_type != LinkType::Acl {
         self.commands.push(Command::RejectConnectionRequest {
            address,
            reason: Status::REJECTED_LIMITED_RESOURCES,
         });
         return Err(Anomaly::UnsupportedLinkType { address, link_type });
      }

      if self.table.is_linked(address) {
         self.reject(address, Status::REJECTED_UNACCEPTABLE_ADDRESS);
         return Err(Anomaly::DuplicateConnectionRequest { address });
      }

      match self.policy.decide(address, class_of_device) {
         Decision::Accept => {
            if let Err(e) = self
               .table
               .register_pending(address, AddressType::Public, Role::Acceptor)
            {
               warn!("Cannot accept {address}: {e}");
               return Ok(());
            }
            info!("Accepting connection from {address}");
            self.commands.push(Command::AcceptConnectionRequest {
               address,
               role: AcceptRole::RemainPeripheral,
            });
         },
         Decision::Reject(reason) => {
            info!("Rejecting connection from {address}: {reason}");
            self
               .event_tx
               .emit(AclEvent::ConnectionRejected { address, reason });
            self.reject(address, reason);
         },
      }
      Ok(())
   }

   fn handle_disconnection_complete(
      &mut self,
      status: Status,
      handle: ConnectionHandle,
      reason: Status,
   ) -> Handled {
      if self.orphans.contains(&handle) {
         if status.is_success() {
            self.orphans.remove(&handle);
            debug!("Orphaned link {handle} closed: {reason}");
         } else {
            warn!("Disconnecting orphaned link {handle} failed: {status}");
         }
         return Ok(());
      }

      let Some(conn) = self.table.lookup_mut(handle) else {
         return Err(Anomaly::UnknownHandle {
            handle,
            context: "Disconnection complete",
         });
      };

      if !status.is_success() {
         conn.advance(LinkInput::DisconnectFailed(status))?;
         warn!("Disconnecting {handle} failed: {status}");
         self
            .event_tx
            .emit(AclEvent::DisconnectFailed { handle, status });
         return Ok(());
      }

      conn.advance(LinkInput::DisconnectionComplete)?;
      let Some(conn) = self.table.remove(handle) else {
         return Ok(());
      };
      self.acl_credits = self
         .acl_credits
         .saturating_add(conn.in_flight())
         .min(self.acl_total);
      if self.last_served == Some(handle) {
         self.last_served = None;
      }

      info!("Disconnected from {} ({handle}): {reason}", conn.address);
      self.event_tx.emit(AclEvent::Disconnected {
         handle,
         address: conn.address,
         reason,
      });
      self.retire_subscribers(handle);
      Ok(())
   }

   fn handle_command_complete(&mut self, credits: u8, opcode: Opcode, params: &[u8]) -> Handled {
      let Some(cmd) = self.commands.resolve(opcode, credits)? else {
         return Ok(());
      };
      let status = params.first().copied().map_or(Status::SUCCESS, Status);

      match cmd {
         Command::ReadBufferSize if status.is_success() => match BufferSize::parse(params) {
            Ok(size) => self.apply_buffer_size(size),
            Err(e) => warn!("Invalid buffer size response: {e}"),
         },
         Command::CreateConnectionCancel { address } => {
            debug!("Create connection cancel for {address}: {status}");
         },
         other if !status.is_success() => warn!("Command {other:?} failed: {status}"),
         _ => {},
      }
      Ok(())
   }

   fn apply_buffer_size(&mut self, size: BufferSize) {
      if size.acl_data_packet_length == 0 || size.total_num_acl_data_packets == 0 {
         warn!("Controller reported no ACL buffers, keeping configured sizes");
         return;
      }
      info!(
         "Controller buffers: {} x {} bytes",
         size.total_num_acl_data_packets, size.acl_data_packet_length
      );
      let in_flight: u16 = self.table.connections().map(Connection::in_flight).sum();
      self.acl_mtu = usize::from(size.acl_data_packet_length);
      self.acl_total = size.total_num_acl_data_packets;
      self.acl_credits = self.acl_total.saturating_sub(in_flight);
   }

   fn handle_command_status(&mut self, status: Status, credits: u8, opcode: Opcode) -> Handled {
      let Some(cmd) = self.commands.resolve(opcode, credits)? else {
         return Ok(());
      };
      if status.is_success() {
         return Ok(());
      }

      match cmd {
         Command::CreateConnection { address, .. }
         | Command::AcceptConnectionRequest { address, .. } => {
            let pending = self
               .table
               .fail_pending(address, LinkInput::CommandFailed(status))?;
            self.fail_request(&pending, status);
         },
         Command::RejectConnectionRequest { address, .. } => {
            // No Connection_Complete follows a refused reject.
            self.take_rejected(address);
            warn!("Rejecting {address} failed: {status}");
         },
         Command::Disconnect { handle, .. } => {
            if self.orphans.contains(&handle) {
               warn!("Disconnecting orphaned link {handle} failed: {status}");
               return Ok(());
            }
            let conn = self.table.lookup_mut(handle).ok_or(Anomaly::UnknownHandle {
               handle,
               context: "Disconnect status",
            })?;
            conn.advance(LinkInput::DisconnectFailed(status))?;
            warn!("Disconnecting {handle} failed: {status}");
            self
               .event_tx
               .emit(AclEvent::DisconnectFailed { handle, status });
         },
         other => warn!("Command {other:?} failed: {status}"),
      }
      Ok(())
   }

   fn handle_completed_packets(&mut self, entries: &[(ConnectionHandle, u16)]) -> Handled {
      let mut unknown = None;
      for &(handle, count) in entries {
         if self.orphans.contains(&handle) {
            continue;
         }
         let Some(conn) = self.table.lookup_mut(handle) else {
            unknown = Some(handle);
            continue;
         };
         let done = conn.complete_packets(count);
         self.acl_credits = self.acl_credits.saturating_add(done).min(self.acl_total);
      }

      match unknown {
         Some(handle) => Err(Anomaly::UnknownHandle {
            handle,
            context: "Completed packets",
         }),
         None => Ok(()),
      }
   }

   fn handle_acl_data(&mut self, packet: &AclPacket) -> Handled {
      if self.orphans.contains(&packet.handle) {
         return Ok(());
      }
      let feed = self.table.reassemble(packet)?;
      for error in feed.errors {
         warn!("{error}");
         self.event_tx.emit(AclEvent::Framing(error));
      }
      if let Some(frame) = feed.frame {
         self.deliver(frame);
      }
      Ok(())
   }

   // === Delivery ===

   fn deliver(&mut self, frame: L2capFrame) {
      let handle = frame.handle;
      let mut claimed = false;
      for subscriber in self.subscribers.iter_mut().filter(|s| s.wants(handle)) {
         claimed |= subscriber.outlet.offer(frame.clone()).is_none();
      }
      self.subscribers.retain(FrameSubscriber::is_live);
      if claimed {
         return;
      }

      let limit = self.config.frame_queue_depth.max(1);
      if let Some(conn) = self.table.lookup_mut(handle)
         && let Some(evicted) = conn.park(frame, limit)
      {
         warn!("{handle}: no subscriber, dropping oldest frame on {}", evicted.channel);
         self.event_tx.emit(AclEvent::FrameDropped {
            handle,
            channel: evicted.channel,
         });
      }
   }

   fn blocked(&self) -> Option<Blocked> {
      if let Some(outlet) = &self.incoming
         && outlet.is_backlogged()
      {
         return Some(Blocked::Incoming(outlet.tx.clone()));
      }
      self
         .subscribers
         .iter()
         .find(|s| s.outlet.is_backlogged())
         .map(|s| Blocked::Frames(s.outlet.tx.clone()))
   }

   fn flush_backlogs(&mut self) {
      for subscriber in &mut self.subscribers {
         subscriber.outlet.flush();
      }
      self.subscribers.retain(FrameSubscriber::is_live);

      if let Some(outlet) = self.incoming.as_mut() {
         outlet.flush();
         if outlet.closed {
            let rest = std::mem::take(&mut outlet.backlog);
            self.incoming = None;
            for info in rest {
               self.hold_incoming(info);
            }
         }
      }
   }

   /// Ends per-handle streams once their remaining frames are handed over.
   fn retire_subscribers(&mut self, handle: ConnectionHandle) {
      for subscriber in &mut self.subscribers {
         if subscriber.filter == Some(handle) {
            subscriber.retiring = true;
         }
      }
      self.subscribers.retain(FrameSubscriber::is_live);
   }

   fn cleanup(&mut self) {
      info!("Cleaning up ACL manager");
      for (_, waiter) in self.waiters.drain() {
         let _ = waiter.send(Err(AclError::ManagerShutdown));
      }
      self.subscribers.clear();
      self.incoming = None;
      self.unannounced.clear();
   }
}

async fn wait_capacity(blocked: Option<&Blocked>) {
   match blocked {
      Some(Blocked::Frames(tx)) => {
         let _ = tx.reserve().await;
      },
      Some(Blocked::Incoming(tx)) => {
         let _ = tx.reserve().await;
      },
      None => std::future::pending().await,
   }
}
