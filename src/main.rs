//! `acld`: Bluetooth ACL connection manager daemon.
//!
//! Attaches to an H4-over-TCP controller, connects to the configured peers,
//! accepts incoming links and prints manager events as JSON lines.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use futures::StreamExt;
use log::{info, warn};
use tokio::{select, signal, sync::Notify, task::JoinSet, time};

use aclmgr::{
   AclManager,
   acl::policy::{AcceptAll, AcceptPolicy, AllowList},
   config::Config,
   error::Result,
   event::{AclEvent, EventBus},
   hci::transport,
};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting acld...");

   // Load configuration
   let config = Config::load()?;
   info!(
      "Loaded configuration with {} known devices",
      config.known_devices.len()
   );

   let event_bus = EventProcessor::new();

   let mut jset = JoinSet::new();
   let link =
      transport::connect_tcp(&mut jset, &config.controller, config.channel_buffer_size).await?;
   info!("Attached to controller at {}", config.controller);

   let policy: Arc<dyn AcceptPolicy> = if config.accept_known_only {
      Arc::new(AllowList::new(
         config.known_devices.iter().map(|d| d.address),
      ))
   } else {
      Arc::new(AcceptAll)
   };
   let manager = AclManager::with_policy(link, config.clone(), event_bus.clone(), policy);

   event_bus.spawn_printer();

   let mut incoming = manager.accept_incoming().await?;
   let names = config.clone();
   tokio::spawn(async move {
      while let Some(conn) = incoming.next().await {
         let name = names.is_known_device(conn.address).unwrap_or("unknown device");
         info!("Accepted {} ({name}) on {}", conn.address, conn.handle);
      }
   });

   let mut frames = manager.receive_stream(None).await?;
   let echo = config.echo.then(|| manager.clone());
   tokio::spawn(async move {
      while let Some(frame) = frames.next().await {
         info!(
            "{} on {}: {}",
            frame.handle,
            frame.channel,
            hex::encode(&frame.payload)
         );
         if let Some(manager) = &echo
            && let Err(e) = manager
               .send_to(frame.handle, frame.channel, frame.payload)
               .await
         {
            warn!("Echo on {} failed: {e}", frame.handle);
         }
      }
   });

   for device in config.known_devices.iter().filter(|d| d.connect) {
      let pending = match manager.connect(device.address).await {
         Ok(pending) => pending,
         Err(e) => {
            warn!("Cannot connect to {}: {e}", device.name);
            continue;
         },
      };
      let name = device.name.clone();
      tokio::spawn(async move {
         match pending.wait().await {
            Ok(conn) => info!("Connected to {name} on {}", conn.handle),
            Err(e) => warn!("Connecting to {name} failed: {e}"),
         }
      });
   }

   // Wait for shutdown signal or loss of the controller
   select! {
       result = signal::ctrl_c() => result?,
       _ = jset.join_next() => warn!("Controller transport ended"),
   }
   info!("Shutting down acld...");
   manager.shutdown().await;

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<AclEvent>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }

   async fn recv(self: &Arc<Self>) -> Option<AclEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   fn spawn_printer(self: &Arc<Self>) {
      let this = Arc::clone(self);
      tokio::spawn(async move {
         while let Some(event) = this.recv().await {
            println!("{}", event.to_json());
         }
      });
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: AclEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}
