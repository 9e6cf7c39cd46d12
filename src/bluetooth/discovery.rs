//! Adapter supervision and `AirPods` discovery.
//!
//! Watches every Bluetooth adapter known to bluetoothd, powers it on,
//! recovers it with backoff when it disappears, and reports `AirPods` that
//! the system has connected to the device manager. bluetoothd only signals
//! devices being added or removed, so connection changes are detected by
//! polling.

use std::{collections::HashMap, time::Duration};

use bluer::{Adapter, AdapterEvent, Address, Session};
use futures::StreamExt;
use log::{debug, error, info, warn};
use smol_str::SmolStr;
use tokio::{
   select,
   sync::mpsc,
   task::JoinHandle,
   time::{self, MissedTickBehavior},
};

use crate::{
   airpods::{protocol::Model, recognition},
   bluetooth::{connection::LinkPolicy, manager::BluetoothManager},
   config::Config,
   error::Result,
};

/// Health check interval
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);
/// Adapter check interval
const ADAPTER_CHECK_INTERVAL: Duration = Duration::from_secs(10);
/// Delay before retrying to power on an adapter
const POWER_ON_RETRY_DELAY: Duration = Duration::from_secs(5);
const LOOPBACK_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
enum AdapterState {
   Active,
   Lost,
   Failed(String),
}

struct AdapterSlot {
   adapter: Adapter,
   state: AdapterState,
   monitor: Option<JoinHandle<()>>,
   failures: u32,
}

/// What bluetoothd last told us about a recognized device.
#[derive(Debug, Clone)]
struct Sighting {
   adapter: SmolStr,
   connected: bool,
}

/// Connection change observed between two polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
   Connected,
   Disconnected,
}

impl Transition {
   const fn between(was: bool, now: bool) -> Option<Self> {
      match (was, now) {
         (false, true) => Some(Self::Connected),
         (true, false) => Some(Self::Disconnected),
         _ => None,
      }
   }
}

enum DiscoveryEvent {
   AdapterAvailable(SmolStr, Adapter),
   AdapterLost(SmolStr),
   AdapterError(SmolStr, String),
   DeviceAdded(Address, SmolStr),
   DeviceRemoved(Address),
}

/// Starts adapter supervision on the system bus.
pub async fn spawn(manager: BluetoothManager, config: Config) -> Result<JoinHandle<()>> {
   let session = Session::new().await?;
   let (loopback_tx, loopback_rx) = mpsc::channel(LOOPBACK_DEPTH);
   let discovery = Discovery {
      session,
      policy: config.link_policy(),
      config,
      manager,
      adapters: HashMap::new(),
      sightings: HashMap::new(),
      loopback_tx,
      loopback_rx,
   };
   Ok(tokio::spawn(discovery.run()))
}

struct Discovery {
   session: Session,
   config: Config,
   policy: LinkPolicy,
   manager: BluetoothManager,
   adapters: HashMap<SmolStr, AdapterSlot>,
   sightings: HashMap<Address, Sighting>,
   loopback_tx: mpsc::Sender<DiscoveryEvent>,
   loopback_rx: mpsc::Receiver<DiscoveryEvent>,
}

impl Discovery {
   async fn run(mut self) {
      self.initialize_adapters().await;

      let mut health_check = time::interval(HEALTH_CHECK_INTERVAL);
      health_check.set_missed_tick_behavior(MissedTickBehavior::Skip);
      let mut adapter_check = time::interval(ADAPTER_CHECK_INTERVAL);
      adapter_check.set_missed_tick_behavior(MissedTickBehavior::Skip);

      loop {
         select! {
            _ = health_check.tick() => {
               self.check_connection_health().await;
               self.scan_adapters().await;
            }
            _ = adapter_check.tick() => {
               self.discover_new_adapters().await;
            }
            Some(event) = self.loopback_rx.recv() => {
               self.handle_event(event).await;
            }
         }
      }
   }

   async fn handle_event(&mut self, event: DiscoveryEvent) {
      match event {
         DiscoveryEvent::AdapterAvailable(name, adapter) => {
            self.handle_adapter_available(name, adapter).await;
         },
         DiscoveryEvent::AdapterLost(name) => self.handle_adapter_lost(name).await,
         DiscoveryEvent::AdapterError(name, error) => {
            error!("Adapter error on {name}: {error}");
            if let Some(slot) = self.adapters.get_mut(&name) {
               slot.state = AdapterState::Failed(error);
            }
         },
         DiscoveryEvent::DeviceAdded(addr, adapter) => self.consider(addr, adapter).await,
         DiscoveryEvent::DeviceRemoved(addr) => {
            if self.sightings.remove(&addr).is_some() {
               info!("{addr}: Removed from bluetoothd");
               self.manager.device_lost(addr).await;
            }
         },
      }
   }

   async fn initialize_adapters(&mut self) {
      match self.session.adapter_names().await {
         Ok(names) => {
            for name in names {
               self.initialize_adapter(name.into()).await;
            }
         },
         Err(e) => error!("Failed to get adapter names: {e}"),
      }

      if self.adapters.is_empty() {
         self.initialize_adapter(SmolStr::new_static("hci0")).await;
      }
   }

   async fn initialize_adapter(&mut self, name: SmolStr) {
      let adapter = match self.session.adapter(&name) {
         Ok(adapter) => adapter,
         Err(e) => {
            warn!("Failed to initialize adapter {name}: {e}");
            return;
         },
      };
      info!("Initializing adapter: {name}");

      if adapter.is_powered().await == Ok(false) {
         if let Err(e) = adapter.set_powered(true).await {
            warn!("Failed to power on adapter {name}: {e}");
            let loopback = self.loopback_tx.clone();
            tokio::spawn(async move {
               time::sleep(POWER_ON_RETRY_DELAY).await;
               let _ = loopback
                  .send(DiscoveryEvent::AdapterAvailable(name, adapter))
                  .await;
            });
            return;
         }
         info!("Powered on adapter: {name}");
      }

      let monitor = self.start_monitor(name.clone(), adapter.clone());
      self.adapters.insert(name.clone(), AdapterSlot {
         adapter,
         state: AdapterState::Active,
         monitor: Some(monitor),
         failures: 0,
      });
      self.scan_adapter(&name).await;
   }

   fn start_monitor(&self, name: SmolStr, adapter: Adapter) -> JoinHandle<()> {
      let loopback = self.loopback_tx.clone();
      tokio::spawn(async move {
         let mut events = match adapter.events().await {
            Ok(events) => events,
            Err(e) => {
               let _ = loopback
                  .send(DiscoveryEvent::AdapterError(name, format!("No adapter events: {e}")))
                  .await;
               return;
            },
         };

         while let Some(event) = events.next().await {
            let event = match event {
               AdapterEvent::DeviceAdded(addr) => {
                  debug!("Device added on {name}: {addr}");
                  DiscoveryEvent::DeviceAdded(addr, name.clone())
               },
               AdapterEvent::DeviceRemoved(addr) => {
                  debug!("Device removed on {name}: {addr}");
                  DiscoveryEvent::DeviceRemoved(addr)
               },
               _ => continue,
            };
            if loopback.send(event).await.is_err() {
               return;
            }
         }

         // The event stream only ends when the adapter goes away
         let _ = loopback.send(DiscoveryEvent::AdapterLost(name)).await;
      })
   }

   async fn handle_adapter_available(&mut self, name: SmolStr, adapter: Adapter) {
      info!("Adapter available: {name}");
      let monitor = self.start_monitor(name.clone(), adapter.clone());
      let Some(slot) = self.adapters.get_mut(&name) else {
         monitor.abort();
         self.initialize_adapter(name).await;
         return;
      };

      slot.adapter = adapter;
      slot.state = AdapterState::Active;
      slot.failures = 0;
      if let Some(old) = slot.monitor.replace(monitor) {
         old.abort();
      }
      self.scan_adapter(&name).await;
   }

   async fn handle_adapter_lost(&mut self, name: SmolStr) {
      warn!("Adapter lost: {name}");
      let Some(slot) = self.adapters.get_mut(&name) else {
         return;
      };
      slot.state = AdapterState::Lost;
      slot.failures += 1;
      if let Some(monitor) = slot.monitor.take() {
         monitor.abort();
      }
      let delay = self.policy.retry_delay(slot.failures - 1);

      // Devices come back through the health check once the adapter does
      for sighting in self.sightings.values_mut() {
         if sighting.adapter == name {
            sighting.connected = false;
         }
      }
      self.manager.adapter_lost(name.clone()).await;

      info!("Recovering adapter {name} in {delay:?}");
      let loopback = self.loopback_tx.clone();
      let session = self.session.clone();
      tokio::spawn(async move {
         time::sleep(delay).await;
         let event = match session.adapter(&name) {
            Ok(adapter) => DiscoveryEvent::AdapterAvailable(name, adapter),
            Err(e) => DiscoveryEvent::AdapterError(name, format!("Recovery failed: {e}")),
         };
         let _ = loopback.send(event).await;
      });
   }

   async fn discover_new_adapters(&mut self) {
      let names = match self.session.adapter_names().await {
         Ok(names) => names,
         Err(e) => {
            warn!("Failed to poll adapter names: {e}. Retrying later.");
            return;
         },
      };
      for name in names.into_iter().map(SmolStr::from) {
         let usable = self
            .adapters
            .get(&name)
            .is_some_and(|slot| slot.state == AdapterState::Active);
         if !usable {
            self.initialize_adapter(name).await;
         }
      }
   }

   /// Recognizes a device, using the configured list before probing.
   async fn identify(&self, device: &bluer::Device) -> Option<Model> {
      let model = recognition::identify(device).await;
      if model.is_none() && self.config.known_device(device.address()).is_some() {
         return Some(Model::Unknown);
      }
      model
   }

   /// Reports a device to the manager once bluetoothd has connected it.
   async fn consider(&mut self, addr: Address, adapter_name: SmolStr) {
      if self.sightings.contains_key(&addr) {
         return;
      }
      let Some(slot) = self.adapters.get(&adapter_name) else {
         return;
      };
      let Ok(device) = slot.adapter.device(addr) else {
         return;
      };
      let Some(model) = self.identify(&device).await else {
         return;
      };
      if !device.is_connected().await.unwrap_or(false) {
         debug!("Discovered AirPods at {addr} but not connected by system");
         return;
      }

      let name = match self.config.known_device(addr) {
         Some(name) => SmolStr::from(name),
         None => device
            .name()
            .await
            .ok()
            .flatten()
            .map_or_else(|| SmolStr::from(addr.to_string()), SmolStr::from),
      };
      info!("Found connected AirPods: {name} ({addr}), model {model}");
      self.sightings.insert(addr, Sighting {
         adapter: adapter_name.clone(),
         connected: true,
      });
      self
         .manager
         .device_discovered(addr, name, model, adapter_name)
         .await;
   }

   async fn scan_adapter(&mut self, name: &SmolStr) {
      let Some(slot) = self.adapters.get(name) else {
         return;
      };
      let Ok(addresses) = slot.adapter.device_addresses().await else {
         return;
      };
      for addr in addresses {
         self.consider(addr, name.clone()).await;
      }
   }

   async fn scan_adapters(&mut self) {
      let active: Vec<SmolStr> = self
         .adapters
         .iter()
         .filter(|(_, slot)| slot.state == AdapterState::Active)
         .map(|(name, _)| name.clone())
         .collect();
      for name in active {
         self.scan_adapter(&name).await;
      }
   }

   async fn check_connection_health(&mut self) {
      let mut transitions = Vec::new();
      for (addr, sighting) in &self.sightings {
         let Some(slot) = self
            .adapters
            .get(&sighting.adapter)
            .filter(|slot| slot.state == AdapterState::Active)
         else {
            continue;
         };
         let Ok(device) = slot.adapter.device(*addr) else {
            continue;
         };
         let connected = device.is_connected().await.unwrap_or(false);
         if let Some(transition) = Transition::between(sighting.connected, connected) {
            transitions.push((*addr, transition));
         }
      }

      for (addr, transition) in transitions {
         if let Some(sighting) = self.sightings.get_mut(&addr) {
            sighting.connected = transition == Transition::Connected;
         }
         match transition {
            Transition::Connected => {
               info!("{addr}: Connected by the system");
               self.manager.bluetooth_connected(addr).await;
            },
            Transition::Disconnected => {
               self.manager.bluetooth_disconnected(addr).await;
            },
         }
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_transitions() {
      assert_eq!(Transition::between(false, true), Some(Transition::Connected));
      assert_eq!(Transition::between(true, false), Some(Transition::Disconnected));
      assert_eq!(Transition::between(true, true), None);
      assert_eq!(Transition::between(false, false), None);
   }
}
