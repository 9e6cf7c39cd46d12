//! Event handling system for `AirPods` status updates.
//!
//! This module provides the event infrastructure for notifying about
//! `AirPods` state changes such as battery updates, connection status,
//! and feature changes. Subscribers get their own bounded queue; a slow
//! subscriber loses its oldest events instead of stalling the emitter.

use std::sync::{
   Arc, Weak,
   atomic::{AtomicU64, Ordering},
};

use bluer::Address;
use crossbeam::queue::ArrayQueue;
use log::debug;
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::sync::Notify;

use crate::airpods::{
   device::{Battery, EarDetection},
   protocol::NoiseControlMode,
};

/// Events that can be emitted by the `AirPods` service.
#[derive(Debug, Clone, PartialEq)]
pub enum AirPodsEvent {
   DeviceConnected,
   DeviceDisconnected,
   DeviceError,
   BatteryUpdated(Battery),
   NoiseControlChanged(NoiseControlMode),
   EarDetectionChanged(EarDetection),
   DeviceNameChanged(SmolStr),
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners. Must not block.
   fn emit(&self, address: Address, event: AirPodsEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

struct Queue {
   events: ArrayQueue<(Address, AirPodsEvent)>,
   ready: Notify,
   dropped: AtomicU64,
}

/// Fans events out to subscribers.
pub struct Notifier {
   capacity: usize,
   subscribers: Mutex<Vec<Weak<Queue>>>,
}

impl Notifier {
   pub fn new(capacity: usize) -> Self {
      Self {
         capacity: capacity.max(1),
         subscribers: Mutex::new(Vec::new()),
      }
   }

   pub fn subscribe(&self) -> Subscription {
      let queue = Arc::new(Queue {
         events: ArrayQueue::new(self.capacity),
         ready: Notify::new(),
         dropped: AtomicU64::new(0),
      });
      self.subscribers.lock().push(Arc::downgrade(&queue));
      Subscription { queue }
   }
}

impl EventBus for Notifier {
   fn emit(&self, address: Address, event: AirPodsEvent) {
      let mut subscribers = self.subscribers.lock();
      subscribers.retain(|sub| {
         let Some(queue) = sub.upgrade() else {
            return false;
         };
         if queue.events.force_push((address, event.clone())).is_some() {
            let dropped = queue.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            debug!("Subscriber lagging, dropped oldest event ({dropped} total)");
         }
         queue.ready.notify_one();
         true
      });
   }
}

/// Receiving end of a subscriber queue. Unsubscribes when dropped.
pub struct Subscription {
   queue: Arc<Queue>,
}

impl Subscription {
   pub async fn recv(&self) -> (Address, AirPodsEvent) {
      loop {
         if let Some(event) = self.queue.events.pop() {
            return event;
         }
         self.queue.ready.notified().await;
      }
   }

   pub fn try_recv(&self) -> Option<(Address, AirPodsEvent)> {
      self.queue.events.pop()
   }

   /// Events lost to overflow so far.
   pub fn dropped(&self) -> u64 {
      self.queue.dropped.load(Ordering::Relaxed)
   }
}
