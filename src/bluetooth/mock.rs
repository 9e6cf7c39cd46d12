//! Scripted accessory behind an in-memory link.
//!
//! Answers the handshake, reports a battery status when notifications are
//! requested and echoes control packets, which is what a real accessory
//! does to acknowledge a command.

use std::sync::{
   Arc,
   atomic::{AtomicU32, Ordering},
};

use bluer::Address;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{
   airpods::protocol::{HDR_CMD_CTL, PKT_HANDSHAKE, PKT_REQUEST_NOTIFY, PKT_SET_FEATURES},
   bluetooth::l2cap::{self, Connector, Hooks, Link, Packet},
   error::{AirPodsError, Result},
};

const HANDSHAKE_ACK: &[u8] = &[0x01, 0x00, 0x04, 0x00, 0x00, 0x00];
const FEATURES_ACK: &[u8] = &[0x04, 0x00, 0x04, 0x00, 0x2b, 0x00, 0x01];
/// Left 85%, right 90%, case 75% and charging.
pub const BATTERY_STATUS: &[u8] = &[
   0x04, 0x00, 0x04, 0x00, 0x04, 0x00, 0x03, //
   0x04, 0x01, 85, 0x02, 0x01, //
   0x02, 0x01, 90, 0x02, 0x01, //
   0x08, 0x01, 75, 0x01, 0x01,
];

/// Behaviour of the fake accessory.
#[derive(Debug, Clone, Default)]
pub struct Accessory {
   /// Every connection attempt fails.
   pub refuse: bool,
   /// The handshake is never acknowledged.
   pub ignore_handshake: bool,
   /// Nothing is sent after the handshake acknowledgement.
   pub mute_after_handshake: bool,
   /// Control packets are not echoed.
   pub ignore_commands: bool,
}

#[derive(Default)]
struct MockState {
   written: Vec<Packet>,
   inbound: Option<mpsc::Sender<Packet>>,
}

pub struct MockConnector {
   script: Accessory,
   attempts: AtomicU32,
   state: Arc<Mutex<MockState>>,
}

impl MockConnector {
   pub fn new(script: Accessory) -> Arc<Self> {
      Arc::new(Self {
         script,
         attempts: AtomicU32::new(0),
         state: Arc::default(),
      })
   }

   pub fn attempts(&self) -> u32 {
      self.attempts.load(Ordering::Relaxed)
   }

   /// Packets the host wrote, across all connections.
   pub fn written(&self) -> Vec<Packet> {
      self.state.lock().written.clone()
   }

   /// Sends a packet from the accessory on the current link.
   pub async fn inject(&self, packet: &[u8]) {
      let inbound = self.state.lock().inbound.clone();
      if let Some(inbound) = inbound {
         let _ = inbound.send(Packet::from_slice(packet)).await;
      }
   }

   /// Closes the current link from the accessory side.
   pub fn drop_link(&self) {
      self.state.lock().inbound.take();
   }
}

impl Connector for MockConnector {
   fn connect(&self, _address: Address, hooks: Hooks) -> BoxFuture<'_, Result<Link>> {
      Box::pin(async move {
         self.attempts.fetch_add(1, Ordering::Relaxed);
         if self.script.refuse {
            return Err(AirPodsError::Io(std::io::ErrorKind::ConnectionRefused.into()));
         }

         let (link, peer) = l2cap::channel(hooks);
         self.state.lock().inbound = Some(peer.inbound);
         tokio::spawn(run_accessory(
            self.script.clone(),
            self.state.clone(),
            peer.outbound,
         ));
         Ok(link)
      })
   }
}

async fn run_accessory(
   script: Accessory,
   state: Arc<Mutex<MockState>>,
   mut outbound: mpsc::Receiver<Packet>,
) {
   let mut muted = false;
   while let Some(packet) = outbound.recv().await {
      let reply: Option<&[u8]> = match packet.as_slice() {
         PKT_HANDSHAKE if !script.ignore_handshake => Some(HANDSHAKE_ACK),
         PKT_SET_FEATURES => Some(FEATURES_ACK),
         PKT_REQUEST_NOTIFY => Some(BATTERY_STATUS),
         p if p.starts_with(HDR_CMD_CTL) && !script.ignore_commands => Some(p),
         _ => None,
      };

      let inbound = {
         let mut state = state.lock();
         state.written.push(packet.clone());
         state.inbound.clone()
      };
      if let (Some(reply), Some(inbound)) = (reply, inbound)
         && !muted
      {
         let _ = inbound.send(Packet::from_slice(reply)).await;
      }
      muted |= script.mute_after_handshake && packet.as_slice() == PKT_HANDSHAKE;
   }
}
