//! L2CAP socket implementation for `AirPods` communication.
//!
//! This module provides async L2CAP socket handling with separate
//! sender and receiver channels for communicating with `AirPods`, and the
//! [`Connector`] seam the connection tasks open links through.

use std::{sync::Arc, time::Duration};

use bluer::{
   Address, AddressType,
   l2cap::{SeqPacket, Socket, SocketAddr},
};
use futures::future::BoxFuture;
use log::{debug, warn};
use smallvec::SmallVec;
use tokio::{
   sync::{mpsc, oneshot},
   task::JoinSet,
   time,
};

use crate::error::{AirPodsError, Result};

pub type Packet = SmallVec<[u8; 32]>;

/// PSM (Protocol Service Multiplexer) for `AirPods` control channel
pub const PSM_CONTROL: u16 = 0x1001;
/// Maximum transmission unit for L2CAP packets
const L2CAP_MTU: usize = 672;
/// Timeout for write operations
const WRITE_TIMEOUT: Duration = Duration::from_secs(25);
/// Timeout for connection attempts
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Depth of the per-link packet queues
const QUEUE_DEPTH: usize = 128;

enum Command {
   Send {
      data: Packet,
      then: oneshot::Sender<Result<()>>,
   },
}

/// Receiver half of an L2CAP connection.
///
/// Provides async packet reception from the `AirPods` device.
#[derive(Debug)]
pub struct L2CapReceiver {
   rx: mpsc::Receiver<Result<Packet>>,
}

impl L2CapReceiver {
   pub async fn recv(&mut self) -> Result<Packet> {
      self.rx.recv().await.ok_or(AirPodsError::ConnectionClosed)?
   }
}

/// Sender half of an L2CAP connection.
///
/// Provides async packet transmission to the `AirPods` device.
/// This type is cheaply cloneable.
#[derive(Debug, Clone)]
pub struct L2CapSender {
   tx: mpsc::Sender<Command>,
}

impl L2CapSender {
   pub fn is_connected(&self) -> bool {
      !self.tx.is_closed()
   }

   pub async fn send(&self, data: &[u8]) -> Result<()> {
      if !self.is_connected() {
         return Err(AirPodsError::ConnectionClosed);
      }

      let (tx, rx) = oneshot::channel();
      self
         .tx
         .send(Command::Send {
            data: Packet::from_slice(data),
            then: tx,
         })
         .await
         .map_err(|_| AirPodsError::ConnectionClosed)?;

      time::timeout(WRITE_TIMEOUT, rx)
         .await
         .map_err(|_| AirPodsError::RequestTimeout)?
         .map_err(|_| AirPodsError::ConnectionClosed)?
   }
}

#[derive(Debug, Clone, Copy)]
pub enum HookDisposition {
   Discard,
   Retain,
}

/// Callbacks run on received packets before they are queued.
pub struct Hooks {
   hooks: Vec<Hook>,
}

impl Hooks {
   pub const fn new() -> Self {
      Self { hooks: Vec::new() }
   }

   pub fn install(mut self, hook: Hook) -> Self {
      self.hooks.push(hook);
      self
   }

   pub fn prefix_once<F>(self, pfx: &[u8], cb: F) -> Self
   where
      F: FnOnce(&[u8]) + Send + 'static,
   {
      self.install(Hook::once(cb).prefix(pfx))
   }

   pub fn passthrough(&mut self, bytes: &[u8]) {
      self
         .hooks
         .retain_mut(|hook| matches!(hook.passthrough(bytes), HookDisposition::Retain));
   }
}

pub type Callback = Box<dyn FnMut(&[u8]) + Send>;

pub struct Hook {
   pfx: SmallVec<[u8; 8]>,
   cb: Callback,
   disposition: HookDisposition,
}

impl Hook {
   pub fn once<F>(cb: F) -> Self
   where
      F: FnOnce(&[u8]) + Send + 'static,
   {
      let mut cb = Some(cb);
      Self {
         pfx: SmallVec::new(),
         cb: Box::new(move |bytes| {
            if let Some(cb) = cb.take() {
               cb(bytes);
            }
         }),
         disposition: HookDisposition::Discard,
      }
   }

   pub fn prefix(mut self, pfx: &[u8]) -> Self {
      self.pfx = SmallVec::from_slice(pfx);
      self
   }

   pub fn passthrough(&mut self, bytes: &[u8]) -> HookDisposition {
      if bytes.starts_with(&self.pfx) {
         (self.cb)(bytes);
         self.disposition
      } else {
         HookDisposition::Retain
      }
   }
}

/// An open link to a device.
///
/// The I/O tasks live in `tasks` and are aborted when it is dropped, which
/// closes the socket and interrupts any pending read.
pub struct Link {
   pub receiver: L2CapReceiver,
   pub sender: L2CapSender,
   pub tasks: JoinSet<()>,
}

/// Opens links to devices.
pub trait Connector: Send + Sync {
   fn connect(&self, address: Address, hooks: Hooks) -> BoxFuture<'_, Result<Link>>;
}

/// Connector for the `AirPods` control channel over BlueZ L2CAP sockets.
pub struct L2CapConnector {
   psm: u16,
}

impl L2CapConnector {
   pub const fn new(psm: u16) -> Self {
      Self { psm }
   }
}

impl Default for L2CapConnector {
   fn default() -> Self {
      Self::new(PSM_CONTROL)
   }
}

impl Connector for L2CapConnector {
   fn connect(&self, address: Address, hooks: Hooks) -> BoxFuture<'_, Result<Link>> {
      Box::pin(connect(hooks, address, self.psm))
   }
}

pub async fn connect(hooks: Hooks, address: Address, psm: u16) -> Result<Link> {
   debug!("Creating L2CAP socket for {address}");

   let socket = Socket::new_seq_packet()?;
   let addr = SocketAddr::new(address, AddressType::BrEdr, psm);
   debug!("Connecting to {address}:{psm}");

   let seq_packet = time::timeout(CONNECT_TIMEOUT, socket.connect(addr))
      .await
      .map_err(|_| AirPodsError::RequestTimeout)??;

   let (cmd_tx, cmd_rx) = mpsc::channel(QUEUE_DEPTH);
   let (in_tx, in_rx) = mpsc::channel(QUEUE_DEPTH);

   let seq_packet = Arc::new(seq_packet);
   let mut tasks = JoinSet::new();
   tasks.spawn(recv_thread(address, in_tx, seq_packet.clone(), hooks));
   tasks.spawn(send_thread(address, cmd_rx, seq_packet));

   Ok(Link {
      receiver: L2CapReceiver { rx: in_rx },
      sender: L2CapSender { tx: cmd_tx },
      tasks,
   })
}

async fn recv_thread(
   adr: Address,
   tx: mpsc::Sender<Result<Packet>>,
   sp: Arc<SeqPacket>,
   mut hooks: Hooks,
) {
   let mut stack = [0u8; L2CAP_MTU];
   loop {
      let n = match sp.recv(&mut stack).await {
         Ok(0) => {
            warn!("{adr}: Connection lost");
            let _ = tx.send(Err(AirPodsError::ConnectionLost)).await;
            return;
         },
         Ok(n) => n,
         Err(e) => {
            warn!("{adr}: Receive failed: {e}");
            let _ = tx.send(Err(AirPodsError::Io(e))).await;
            return;
         },
      };
      let recvd = &stack[..n];
      debug!("← {adr}: {}", hex::encode(recvd));
      let bytes = Packet::from_slice(recvd);
      hooks.passthrough(&bytes);
      if tx.send(Ok(bytes)).await.is_err() {
         debug!("{adr}: Receiver dropped");
         return;
      }
      stack[..n].fill(0);
   }
}

async fn send_thread(adr: Address, mut rx: mpsc::Receiver<Command>, sp: Arc<SeqPacket>) {
   while let Some(cmd) = rx.recv().await {
      match cmd {
         Command::Send { data, then } => {
            debug!("→ {adr}: {}", hex::encode(&data));
            if let Err(e) = sp.send(&data).await {
               warn!("Failed to send data: {e}");
               let _ = then.send(Err(AirPodsError::Io(e)));
            } else {
               _ = then.send(Ok(()));
            }
         },
      }
   }
   debug!("{adr}: Sender closed");
}

/// Device end of an in-memory link.
#[cfg(test)]
pub struct Peer {
   /// Packets the device sends to the host.
   pub inbound: mpsc::Sender<Packet>,
   /// Packets the host wrote to the device.
   pub outbound: mpsc::Receiver<Packet>,
}

/// Creates an in-memory link whose device end is driven by the caller.
///
/// Dropping `Peer::inbound` reads as a lost connection on the host side.
#[cfg(test)]
pub fn channel(mut hooks: Hooks) -> (Link, Peer) {
   let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(QUEUE_DEPTH);
   let (in_tx, in_rx) = mpsc::channel(QUEUE_DEPTH);
   let (peer_tx, mut peer_rx) = mpsc::channel::<Packet>(QUEUE_DEPTH);
   let (out_tx, out_rx) = mpsc::channel(QUEUE_DEPTH);

   let mut tasks = JoinSet::new();
   tasks.spawn(async move {
      while let Some(packet) = peer_rx.recv().await {
         hooks.passthrough(&packet);
         if in_tx.send(Ok(packet)).await.is_err() {
            return;
         }
      }
      let _ = in_tx.send(Err(AirPodsError::ConnectionLost)).await;
   });
   tasks.spawn(async move {
      while let Some(Command::Send { data, then }) = cmd_rx.recv().await {
         let result = out_tx
            .send(data)
            .await
            .map_err(|_| AirPodsError::ConnectionLost);
         let _ = then.send(result);
      }
   });

   let link = Link {
      receiver: L2CapReceiver { rx: in_rx },
      sender: L2CapSender { tx: cmd_tx },
      tasks,
   };
   (link, Peer {
      inbound: peer_tx,
      outbound: out_rx,
   })
}
