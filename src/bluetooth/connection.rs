//! Per-device connection lifecycle.
//!
//! A [`ConnectionTask`] owns the socket of one device and walks it through
//! connect, handshake and steady state, reconnecting with backoff when the
//! link drops. The [`DeviceLink`] it shares with the command dispatcher
//! exposes the current sender and the commands waiting for an echo.

use std::{sync::Arc, time::Duration};

use bluer::Address;
use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::Rng;
use tokio::{
   select,
   sync::oneshot,
   time::{self, Instant},
};

use crate::{
   airpods::{
      codec::{self, Frame},
      dispatcher::PendingCommands,
      protocol::{HDR_ACK_HANDSHAKE, PKT_HANDSHAKE, PKT_REQUEST_NOTIFY, PKT_SET_FEATURES},
      registry::DeviceRegistry,
   },
   bluetooth::l2cap::{Connector, Hooks, L2CapSender, Link, Packet},
   error::{AirPodsError, Result},
};

/// Delays between notification re-requests until a battery status arrives.
const NOTIFY_RETRY_SCHEDULE: &[Duration] = &[
   Duration::from_secs(1),
   Duration::from_secs(2),
   Duration::from_secs(3),
   Duration::from_secs(5),
   Duration::from_secs(10),
];
/// Upper bound of the random delay added to each reconnect.
const RETRY_JITTER_MS: u64 = 1000;

/// Link state of a device, as seen by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum LinkState {
   Disconnected,
   Connecting,
   Handshaking,
   Connected,
   Reconnecting,
}

impl LinkState {
   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// Timing and retry parameters for device links.
#[derive(Debug, Clone, Copy)]
pub struct LinkPolicy {
   /// Failed attempts in a row before giving up on a device
   pub retry_count: u32,
   pub reconnect_delay: Duration,
   pub max_reconnect_delay: Duration,
   pub handshake_timeout: Duration,
   /// Idle time before the link is probed
   pub keepalive_interval: Duration,
   /// Silence after which the link is considered dead
   pub keepalive_timeout: Duration,
   pub command_timeout: Duration,
   pub command_retries: u32,
}

impl Default for LinkPolicy {
   fn default() -> Self {
      Self {
         retry_count: 10,
         reconnect_delay: Duration::from_secs(2),
         max_reconnect_delay: Duration::from_secs(120),
         handshake_timeout: Duration::from_secs(5),
         keepalive_interval: Duration::from_secs(30),
         keepalive_timeout: Duration::from_secs(95),
         command_timeout: Duration::from_secs(3),
         command_retries: 2,
      }
   }
}

impl LinkPolicy {
   /// Backoff before reconnect attempt `retry` (zero based), with jitter.
   pub fn retry_delay(&self, retry: u32) -> Duration {
      let exponential = self.reconnect_delay.saturating_mul(1 << retry.min(4));
      let delay = exponential.min(self.max_reconnect_delay);
      let jitter = rand::thread_rng().gen_range(0..RETRY_JITTER_MS);
      delay.saturating_add(Duration::from_millis(jitter))
   }
}

/// Writable side of a device link, shared with the dispatcher.
pub struct DeviceLink {
   address: Address,
   sender: Mutex<Option<L2CapSender>>,
   pending: PendingCommands,
}

impl DeviceLink {
   pub fn new(address: Address) -> Self {
      Self {
         address,
         sender: Mutex::new(None),
         pending: PendingCommands::default(),
      }
   }

   pub fn sender(&self) -> Option<L2CapSender> {
      self.sender.lock().clone()
   }

   pub fn attach(&self, sender: L2CapSender) {
      *self.sender.lock() = Some(sender);
   }

   /// Drops the sender and fails every waiting command with `ConnectionLost`.
   pub fn detach(&self) {
      self.sender.lock().take();
      let failed = self.pending.fail_all();
      if failed > 0 {
         debug!("{}: Failed {failed} pending commands", self.address);
      }
   }

   pub const fn pending(&self) -> &PendingCommands {
      &self.pending
   }
}

/// Drives the link of one device until it is given up or aborted.
pub struct ConnectionTask {
   address: Address,
   connector: Arc<dyn Connector>,
   registry: Arc<DeviceRegistry>,
   link: Arc<DeviceLink>,
   policy: LinkPolicy,
}

impl ConnectionTask {
   pub fn new(
      address: Address,
      connector: Arc<dyn Connector>,
      registry: Arc<DeviceRegistry>,
      link: Arc<DeviceLink>,
      policy: LinkPolicy,
   ) -> Self {
      Self {
         address,
         connector,
         registry,
         link,
         policy,
      }
   }

   /// Runs the connection state machine.
   ///
   /// Only returns once `retry_count` attempts in a row have failed, leaving
   /// the device `Disconnected`; the error is the last failure.
   pub async fn run(self) -> AirPodsError {
      let addr = self.address;
      let mut failures = 0;
      self.set_state(LinkState::Connecting);

      loop {
         let err = match self.establish().await {
            Ok(mut link) => {
               failures = 0;
               let err = self.serve(&mut link).await;
               self.link.detach();
               info!("{addr}: Link lost: {err}");
               err
            },
            Err(e) => {
               warn!("{addr}: Connection attempt failed: {e}");
               e
            },
         };

         failures += 1;
         if failures >= self.policy.retry_count {
            warn!("{addr}: Giving up after {failures} failed attempts");
            self.link.detach();
            self.set_state(LinkState::Disconnected);
            return err;
         }

         let delay = self.policy.retry_delay(failures - 1);
         self.set_state(LinkState::Reconnecting);
         info!("{addr}: Reconnecting in {delay:?} ({failures}/{})", self.policy.retry_count);
         time::sleep(delay).await;
      }
   }

   fn set_state(&self, state: LinkState) {
      if let Err(e) = self.registry.set_link_state(self.address, state) {
         debug!("{}: Cannot record link state {state}: {e}", self.address);
      }
   }

   async fn establish(&self) -> Result<Link> {
      let addr = self.address;
      let (ack_tx, ack_rx) = oneshot::channel();
      let hooks = Hooks::new().prefix_once(HDR_ACK_HANDSHAKE, move |_| {
         let _ = ack_tx.send(());
      });

      info!("{addr}: Connecting");
      let link = self.connector.connect(addr, hooks).await?;
      self.set_state(LinkState::Handshaking);

      info!("{addr}: Starting handshake sequence");
      link.sender.send(PKT_HANDSHAKE).await?;
      time::timeout(self.policy.handshake_timeout, ack_rx)
         .await
         .map_err(|_| AirPodsError::HandshakeFailed("no acknowledgement"))?
         .map_err(|_| AirPodsError::ConnectionLost)?;
      debug!("{addr}: Handshake acknowledged");

      link.sender.send(PKT_SET_FEATURES).await?;
      link.sender.send(PKT_REQUEST_NOTIFY).await?;

      self.link.attach(link.sender.clone());
      self.set_state(LinkState::Connected);
      info!("{addr}: Handshake sequence completed");
      Ok(link)
   }

   /// Processes inbound packets until the link fails.
   async fn serve(&self, link: &mut Link) -> AirPodsError {
      let addr = self.address;
      let mut last_rx = Instant::now();
      let mut last_probe = last_rx;
      let mut notify_retries = NOTIFY_RETRY_SCHEDULE.iter();
      let mut next_notify = notify_retries.next().map(|d| last_rx + *d);

      loop {
         let probe_at = last_rx.max(last_probe) + self.policy.keepalive_interval;
         let dead_at = last_rx + self.policy.keepalive_timeout;
         let wake_at = next_notify.map_or(probe_at, |at| at.min(probe_at)).min(dead_at);

         select! {
            packet = link.receiver.recv() => {
               let packet = match packet {
                  Ok(packet) => packet,
                  Err(e) => return e,
               };
               last_rx = Instant::now();
               if self.handle_packet(&packet) && next_notify.take().is_some() {
                  info!("{addr}: Battery status established");
               }
            }
            () = time::sleep_until(wake_at) => {
               let now = Instant::now();
               if now >= dead_at {
                  warn!("{addr}: Nothing received for {:?}", self.policy.keepalive_timeout);
                  return AirPodsError::KeepAliveMissed;
               }
               if next_notify.is_some_and(|at| now >= at) {
                  warn!("{addr}: No battery status yet, requesting notifications again");
                  next_notify = notify_retries.next().map(|d| now + *d);
               } else {
                  debug!("{addr}: Link idle, probing");
               }
               if let Err(e) = link.sender.send(PKT_REQUEST_NOTIFY).await {
                  return e;
               }
               last_probe = now;
            }
         }
      }
   }

   /// Applies one packet. Returns whether it carried a battery status.
   fn handle_packet(&self, packet: &Packet) -> bool {
      let addr = self.address;
      let frame = match codec::decode(packet) {
         Ok(frame) => frame,
         Err(e) => {
            warn!("{addr}: Discarding malformed packet: {e}");
            return false;
         },
      };

      let correlation = frame.correlation();
      let update = match frame {
         Frame::Status(update) | Frame::Control { update, .. } => update,
         Frame::HandshakeAck => return false,
         Frame::FeaturesAck => {
            debug!("{addr}: Features acknowledged");
            return false;
         },
         Frame::Unknown { opcode } => {
            debug!("{addr}: Skipping packet with opcode 0x{opcode:04x}");
            return false;
         },
      };

      let has_battery = update.battery.is_some();
      if !update.is_empty()
         && let Err(e) = self.registry.apply_update(addr, update)
      {
         debug!("{addr}: Dropped update: {e}");
      }
      // State first, so a caller woken by the ack observes it
      if let Some(id) = correlation {
         self.link.pending().resolve(id);
      }
      has_battery
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{
      airpods::protocol::Model,
      bluetooth::mock::{Accessory, MockConnector},
      event::{AirPodsEvent, Notifier},
   };

   const ADDR: Address = Address::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

   fn setup(accessory: Accessory) -> (Arc<MockConnector>, Arc<DeviceRegistry>, Arc<Notifier>) {
      let notifier = Arc::new(Notifier::new(64));
      let registry = Arc::new(DeviceRegistry::new(notifier.clone(), Duration::from_secs(7200)));
      registry.insert(ADDR, "AirPods Pro".into(), Model::AirPodsPro);
      (MockConnector::new(accessory), registry, notifier)
   }

   fn task(
      connector: &Arc<MockConnector>,
      registry: &Arc<DeviceRegistry>,
      policy: LinkPolicy,
   ) -> (ConnectionTask, Arc<DeviceLink>) {
      let link = Arc::new(DeviceLink::new(ADDR));
      let task =
         ConnectionTask::new(ADDR, connector.clone(), registry.clone(), link.clone(), policy);
      (task, link)
   }

   async fn wait_for_state(registry: &DeviceRegistry, state: LinkState) {
      while registry.link_state(ADDR).ok() != Some(state) {
         time::sleep(Duration::from_millis(10)).await;
      }
   }

   #[test]
   fn test_retry_delay() {
      let policy = LinkPolicy::default();
      let first = policy.retry_delay(0);
      assert!(first >= Duration::from_secs(2) && first < Duration::from_secs(3));
      let fourth = policy.retry_delay(3);
      assert!(fourth >= Duration::from_secs(16) && fourth < Duration::from_secs(17));
      let capped = LinkPolicy {
         max_reconnect_delay: Duration::from_secs(20),
         ..policy
      };
      assert!(capped.retry_delay(9) < Duration::from_secs(21));
      assert!(policy.retry_delay(30) < Duration::from_secs(33));
   }

   #[test]
   fn test_retry_delay_saturates() {
      let policy = LinkPolicy {
         reconnect_delay: Duration::MAX,
         max_reconnect_delay: Duration::MAX,
         ..LinkPolicy::default()
      };
      assert_eq!(policy.retry_delay(u32::MAX), Duration::MAX);
   }

   #[test]
   fn test_link_state_names() {
      assert_eq!(LinkState::Connected.to_str(), "connected");
      assert_eq!(LinkState::Reconnecting.to_string(), "reconnecting");
   }

   #[tokio::test(start_paused = true)]
   async fn test_handshake_then_status() {
      let (connector, registry, notifier) = setup(Accessory::default());
      let events = notifier.subscribe();
      let (task, link) = task(&connector, &registry, LinkPolicy::default());
      let handle = tokio::spawn(task.run());

      wait_for_state(&registry, LinkState::Connected).await;
      assert!(link.sender().is_some());
      // Battery follows the notification request
      while registry.get(ADDR).ok().and_then(|d| d.battery).is_none() {
         time::sleep(Duration::from_millis(10)).await;
      }

      let written = connector.written();
      assert_eq!(written[0].as_slice(), PKT_HANDSHAKE);
      assert_eq!(written[1].as_slice(), PKT_SET_FEATURES);
      assert_eq!(written[2].as_slice(), PKT_REQUEST_NOTIFY);

      let (addr, event) = events.try_recv().expect("connected event");
      assert_eq!(addr, ADDR);
      assert!(matches!(event, AirPodsEvent::DeviceConnected));
      handle.abort();
   }

   #[tokio::test(start_paused = true)]
   async fn test_handshake_timeout_is_retried() {
      let (connector, registry, _) = setup(Accessory {
         ignore_handshake: true,
         ..Accessory::default()
      });
      let policy = LinkPolicy {
         retry_count: 2,
         ..LinkPolicy::default()
      };
      let (task, _) = task(&connector, &registry, policy);
      let err = task.run().await;
      assert!(matches!(err, AirPodsError::HandshakeFailed(_)));
      assert_eq!(connector.attempts(), 2);
      assert_eq!(registry.link_state(ADDR).ok(), Some(LinkState::Disconnected));
   }

   #[tokio::test(start_paused = true)]
   async fn test_reconnects_after_link_loss() {
      let (connector, registry, _) = setup(Accessory::default());
      let (task, link) = task(&connector, &registry, LinkPolicy::default());
      let handle = tokio::spawn(task.run());

      wait_for_state(&registry, LinkState::Connected).await;
      connector.drop_link();
      wait_for_state(&registry, LinkState::Reconnecting).await;
      assert!(link.sender().is_none());

      wait_for_state(&registry, LinkState::Connected).await;
      assert_eq!(connector.attempts(), 2);
      handle.abort();
   }

   #[tokio::test(start_paused = true)]
   async fn test_silent_link_misses_keepalive() {
      let (connector, registry, _) = setup(Accessory {
         mute_after_handshake: true,
         ..Accessory::default()
      });
      let policy = LinkPolicy {
         retry_count: 1,
         ..LinkPolicy::default()
      };
      let (task, _) = task(&connector, &registry, policy);
      let started = Instant::now();
      let err = task.run().await;
      assert!(matches!(err, AirPodsError::KeepAliveMissed));
      assert!(started.elapsed() >= policy.keepalive_timeout);

      // Probes were sent while idle
      let probes = connector
         .written()
         .iter()
         .filter(|p| p.as_slice() == PKT_REQUEST_NOTIFY)
         .count();
      assert!(probes > 1, "only {probes} probes");
   }

   #[tokio::test(start_paused = true)]
   async fn test_malformed_packet_is_skipped() {
      let (connector, registry, _) = setup(Accessory::default());
      let (task, _) = task(&connector, &registry, LinkPolicy::default());
      let handle = tokio::spawn(task.run());
      wait_for_state(&registry, LinkState::Connected).await;

      connector.inject(&[0x04, 0x00, 0x04, 0x00, 0x04, 0x00, 0x02, 0x04]).await;
      connector
         .inject(&[0x04, 0x00, 0x04, 0x00, 0x09, 0x00, 0x0d, 0x03, 0x00, 0x00, 0x00])
         .await;
      while registry.get(ADDR).ok().and_then(|d| d.noise_mode).is_none() {
         time::sleep(Duration::from_millis(10)).await;
      }
      assert_eq!(registry.link_state(ADDR).ok(), Some(LinkState::Connected));
      assert_eq!(connector.attempts(), 1);
      handle.abort();
   }
}
