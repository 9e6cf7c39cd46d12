//! Per-device command dispatch.
//!
//! Each device owns one worker task draining a FIFO queue, so commands for a
//! device hit the wire in submission order while devices proceed in
//! parallel. A command is written, registered under the correlation id its
//! acknowledgement will carry, and resent on timeout until the retry budget
//! runs out.

use std::{collections::HashMap, sync::Arc, time::Duration};

use bluer::Address;
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::{
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time::{self, Instant},
};

use crate::{
   airpods::{
      codec::{self, CommandIntent},
      protocol::CorrelationId,
      registry::DeviceRegistry,
   },
   bluetooth::connection::{DeviceLink, LinkPolicy, LinkState},
   error::{AirPodsError, Result},
};

/// Depth of the per-device command queue
const QUEUE_DEPTH: usize = 32;

type Waiter = oneshot::Sender<Result<()>>;

/// Commands awaiting an acknowledgement, keyed by correlation id.
#[derive(Default)]
pub struct PendingCommands {
   waiters: Mutex<HashMap<CorrelationId, Waiter>>,
}

impl PendingCommands {
   pub fn register(&self, id: CorrelationId) -> oneshot::Receiver<Result<()>> {
      let (tx, rx) = oneshot::channel();
      self.waiters.lock().insert(id, tx);
      rx
   }

   /// Completes the command waiting on `id`. Returns whether one was waiting.
   pub fn resolve(&self, id: CorrelationId) -> bool {
      let waiter = self.waiters.lock().remove(&id);
      waiter.is_some_and(|tx| tx.send(Ok(())).is_ok())
   }

   pub fn cancel(&self, id: CorrelationId) {
      self.waiters.lock().remove(&id);
   }

   /// Fails every waiting command with `ConnectionLost`.
   pub fn fail_all(&self) -> usize {
      let waiters: Vec<_> = self.waiters.lock().drain().collect();
      let count = waiters.len();
      for (_, tx) in waiters {
         let _ = tx.send(Err(AirPodsError::ConnectionLost));
      }
      count
   }

   #[cfg(test)]
   pub fn is_empty(&self) -> bool {
      self.waiters.lock().is_empty()
   }
}

/// Acknowledged completion of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
   /// Id of the echo that acknowledged the command, `None` for raw packets.
   pub correlation: Option<CorrelationId>,
   pub attempts: u32,
}

/// A command queued for a device.
struct Command {
   address: Address,
   action: &'static str,
   intent: CommandIntent,
   correlation: Option<CorrelationId>,
   issued: Instant,
   retries: u32,
   reply: oneshot::Sender<Result<Ack>>,
}

/// Submits commands to one device's worker. Cheaply cloneable.
#[derive(Clone)]
pub struct Dispatcher {
   address: Address,
   registry: Arc<DeviceRegistry>,
   tx: mpsc::Sender<Command>,
}

impl Dispatcher {
   pub fn spawn(
      address: Address,
      registry: Arc<DeviceRegistry>,
      link: Arc<DeviceLink>,
      policy: &LinkPolicy,
   ) -> (Self, JoinHandle<()>) {
      let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
      let worker = Worker {
         link,
         rx,
         timeout: policy.command_timeout,
         retries: policy.command_retries,
      };
      let handle = tokio::spawn(worker.run());
      (
         Self {
            address,
            registry,
            tx,
         },
         handle,
      )
   }

   /// Queues a command and waits for its acknowledgement.
   ///
   /// Fails with `DeviceNotConnected` without touching the wire when the
   /// device link is not up.
   pub async fn send(&self, intent: CommandIntent) -> Result<Ack> {
      if self.registry.link_state(self.address)? != LinkState::Connected {
         return Err(AirPodsError::DeviceNotConnected);
      }

      let (reply, rx) = oneshot::channel();
      let command = Command {
         address: self.address,
         action: intent.action(),
         correlation: intent.correlation(),
         intent,
         issued: Instant::now(),
         retries: 0,
         reply,
      };
      self
         .tx
         .send(command)
         .await
         .map_err(|_| AirPodsError::ManagerShutdown)?;
      rx.await.map_err(|_| AirPodsError::ConnectionLost)?
   }
}

struct Worker {
   link: Arc<DeviceLink>,
   rx: mpsc::Receiver<Command>,
   timeout: Duration,
   retries: u32,
}

impl Worker {
   async fn run(mut self) {
      while let Some(mut cmd) = self.rx.recv().await {
         let result = self.execute(&mut cmd).await;
         match &result {
            Ok(ack) => debug!(
               "{}: {} completed in {:?} ({} attempts)",
               cmd.address,
               cmd.action,
               cmd.issued.elapsed(),
               ack.attempts
            ),
            Err(e) => warn!("{}: {} failed: {e}", cmd.address, cmd.action),
         }
         let _ = cmd.reply.send(result);
      }
   }

   async fn execute(&self, cmd: &mut Command) -> Result<Ack> {
      let packet = codec::encode(&cmd.intent);

      let Some(id) = cmd.correlation else {
         // Nothing echoes a raw packet; a successful write completes it
         let sender = self.link.sender().ok_or(AirPodsError::ConnectionLost)?;
         sender.send(&packet).await?;
         return Ok(Ack {
            correlation: None,
            attempts: 1,
         });
      };

      loop {
         let attempts = cmd.retries.saturating_add(1);
         let sender = self.link.sender().ok_or(AirPodsError::ConnectionLost)?;
         let waiter = self.link.pending().register(id);
         if let Err(e) = sender.send(&packet).await {
            self.link.pending().cancel(id);
            debug!("{}: Write for {} failed: {e}", cmd.address, cmd.action);
            return Err(AirPodsError::ConnectionLost);
         }

         match time::timeout(self.timeout, waiter).await {
            Ok(Ok(result)) => {
               return result.map(|()| Ack {
                  correlation: Some(id),
                  attempts,
               });
            },
            Ok(Err(_)) => return Err(AirPodsError::ConnectionLost),
            Err(_) => self.link.pending().cancel(id),
         }

         if cmd.retries >= self.retries {
            return Err(AirPodsError::CommandTimeout { attempts });
         }
         cmd.retries += 1;
         warn!(
            "{}: No acknowledgement for {} ({id}), resending ({}/{})",
            cmd.address, cmd.action, cmd.retries, self.retries
         );
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{
      airpods::protocol::{FeatureId, Model, NoiseControlMode},
      bluetooth::l2cap::{self, Hooks, Packet, Peer},
      event::Notifier,
   };

   const ADDR: Address = Address::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

   struct Fixture {
      registry: Arc<DeviceRegistry>,
      link: Arc<DeviceLink>,
      dispatcher: Dispatcher,
      peer: Peer,
      _link: l2cap::Link,
   }

   fn fixture(policy: &LinkPolicy) -> Fixture {
      let notifier = Arc::new(Notifier::new(16));
      let registry = Arc::new(DeviceRegistry::new(notifier, Duration::from_secs(7200)));
      registry.insert(ADDR, "AirPods Pro".into(), Model::AirPodsPro);
      registry
         .set_link_state(ADDR, LinkState::Connected)
         .expect("known device");

      let (link_io, peer) = l2cap::channel(Hooks::new());
      let link = Arc::new(DeviceLink::new(ADDR));
      link.attach(link_io.sender.clone());
      let (dispatcher, _) = Dispatcher::spawn(ADDR, registry.clone(), link.clone(), policy);
      Fixture {
         registry,
         link,
         dispatcher,
         peer,
         _link: link_io,
      }
   }

   /// Acknowledges every control packet, recording what was written.
   fn echo(link: Arc<DeviceLink>, mut peer: Peer) -> JoinHandle<Vec<Packet>> {
      tokio::spawn(async move {
         let mut written = Vec::new();
         while let Some(packet) = peer.outbound.recv().await {
            if let Some(id) = codec::decode(&packet).ok().and_then(|f| f.correlation()) {
               link.pending().resolve(id);
            }
            written.push(packet);
         }
         written
      })
   }

   #[tokio::test]
   async fn test_not_connected_fails_fast() {
      let fx = fixture(&LinkPolicy::default());
      fx.registry
         .set_link_state(ADDR, LinkState::Disconnected)
         .expect("known device");
      let result = fx
         .dispatcher
         .send(CommandIntent::SetNoiseMode(NoiseControlMode::Anc))
         .await;
      assert!(matches!(result, Err(AirPodsError::DeviceNotConnected)));

      let mut peer = fx.peer;
      assert!(peer.outbound.try_recv().is_err());
   }

   #[tokio::test]
   async fn test_unknown_device() {
      let fx = fixture(&LinkPolicy::default());
      let other = Address::new([0, 1, 2, 3, 4, 5]);
      let (dispatcher, _) =
         Dispatcher::spawn(other, fx.registry.clone(), fx.link.clone(), &LinkPolicy::default());
      let result = dispatcher
         .send(CommandIntent::SetNoiseMode(NoiseControlMode::Off))
         .await;
      assert!(matches!(result, Err(AirPodsError::DeviceNotFound(a)) if a == other));
   }

   #[tokio::test]
   async fn test_echo_acknowledges() {
      let fx = fixture(&LinkPolicy::default());
      let accessory = echo(fx.link.clone(), fx.peer);
      let ack = fx
         .dispatcher
         .send(CommandIntent::SetNoiseMode(NoiseControlMode::Anc))
         .await
         .expect("acknowledged");
      assert_eq!(ack.attempts, 1);
      assert_eq!(
         ack.correlation,
         Some(CorrelationId::control(
            FeatureId::NOISE_CONTROL,
            NoiseControlMode::Anc as u32
         ))
      );
      assert!(fx.link.pending().is_empty());
      accessory.abort();
   }

   #[tokio::test]
   async fn test_commands_keep_submission_order() {
      let fx = fixture(&LinkPolicy::default());
      let accessory = echo(fx.link.clone(), fx.peer);
      let intents = [
         CommandIntent::SetNoiseMode(NoiseControlMode::Anc),
         CommandIntent::SetFeature {
            feature: FeatureId::CONVERSATIONAL,
            enabled: true,
         },
         CommandIntent::SetNoiseMode(NoiseControlMode::Transparency),
         CommandIntent::Raw(Packet::from_slice(&[0x04, 0x00, 0x04, 0x00, 0x0f, 0x00])),
         CommandIntent::SetFeature {
            feature: FeatureId::ONE_BUD_ANC,
            enabled: false,
         },
      ];

      let results = futures::future::join_all(
         intents
            .iter()
            .map(|intent| fx.dispatcher.send(intent.clone())),
      )
      .await;
      assert!(results.iter().all(Result::is_ok));

      // Closing the link ends the accessory loop
      fx.link.detach();
      drop(fx._link);
      let written = accessory.await.expect("accessory");
      let expected: Vec<Packet> = intents.iter().map(codec::encode).collect();
      assert_eq!(written, expected);
   }

   #[tokio::test(start_paused = true)]
   async fn test_timeout_after_retries() {
      let policy = LinkPolicy {
         command_timeout: Duration::from_secs(3),
         command_retries: 2,
         ..LinkPolicy::default()
      };
      let fx = fixture(&policy);
      let mut peer = fx.peer;
      let started = Instant::now();
      let result = fx
         .dispatcher
         .send(CommandIntent::SetNoiseMode(NoiseControlMode::Adaptive))
         .await;
      assert!(matches!(
         result,
         Err(AirPodsError::CommandTimeout { attempts: 3 })
      ));
      assert!(started.elapsed() >= Duration::from_secs(9));

      let packet = codec::encode(&CommandIntent::SetNoiseMode(NoiseControlMode::Adaptive));
      for _ in 0..3 {
         assert_eq!(peer.outbound.try_recv().ok(), Some(packet.clone()));
      }
      assert!(peer.outbound.try_recv().is_err());
      assert!(fx.link.pending().is_empty());
   }

   #[tokio::test(start_paused = true)]
   async fn test_echo_with_other_value_times_out() {
      let policy = LinkPolicy {
         command_timeout: Duration::from_secs(3),
         command_retries: 2,
         ..LinkPolicy::default()
      };
      let fx = fixture(&policy);
      let link = fx.link.clone();
      let mut peer = fx.peer;
      // The accessory keeps reporting transparency whatever it is asked
      let accessory = tokio::spawn(async move {
         let report = codec::encode(&CommandIntent::SetNoiseMode(NoiseControlMode::Transparency));
         while peer.outbound.recv().await.is_some() {
            if let Some(id) = codec::decode(&report).ok().and_then(|f| f.correlation()) {
               link.pending().resolve(id);
            }
         }
      });

      let result = fx
         .dispatcher
         .send(CommandIntent::SetNoiseMode(NoiseControlMode::Anc))
         .await;
      assert!(matches!(
         result,
         Err(AirPodsError::CommandTimeout { attempts: 3 })
      ));
      assert!(fx.link.pending().is_empty());
      accessory.abort();
   }

   #[tokio::test]
   async fn test_link_loss_fails_pending() {
      let fx = fixture(&LinkPolicy::default());
      let dispatcher = fx.dispatcher.clone();
      let first = tokio::spawn(async move {
         dispatcher
            .send(CommandIntent::SetNoiseMode(NoiseControlMode::Anc))
            .await
      });
      let dispatcher = fx.dispatcher.clone();
      let second = tokio::spawn(async move {
         dispatcher
            .send(CommandIntent::SetNoiseMode(NoiseControlMode::Off))
            .await
      });

      while fx.link.pending().is_empty() {
         tokio::task::yield_now().await;
      }
      fx.link.detach();

      let first = first.await.expect("task");
      let second = second.await.expect("task");
      assert!(matches!(first, Err(AirPodsError::ConnectionLost)));
      assert!(matches!(second, Err(AirPodsError::ConnectionLost)));
   }
}
