//! Bluetooth device manager for `AirPods`.
//!
//! This module owns the per-device tasks: one connection task driving the
//! link and one dispatcher worker serializing commands. Lifecycle requests
//! from D-Bus and from adapter discovery are funneled through a single
//! actor; device state reads go straight to the registry.

use std::{collections::HashMap, sync::Arc, time::Duration};

use bluer::Address;
use log::{debug, info, warn};
use smol_str::SmolStr;
use tokio::{
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time,
};

use crate::{
   airpods::{
      codec::CommandIntent,
      device::Device,
      dispatcher::{Ack, Dispatcher},
      protocol::Model,
      registry::DeviceRegistry,
   },
   bluetooth::{
      connection::{ConnectionTask, DeviceLink, LinkPolicy, LinkState},
      l2cap::Connector,
   },
   config::Config,
   error::{AirPodsError, Result},
   event::{AirPodsEvent, EventSender},
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;
/// Time allowed for an aborted connection task to unwind
const ABORT_GRACE: Duration = Duration::from_secs(1);

struct ManagedDevice {
   link: Arc<DeviceLink>,
   dispatcher: Dispatcher,
   worker: JoinHandle<()>,
   connection: Option<JoinHandle<AirPodsError>>,
   adapter: Option<SmolStr>,
   /// Set by an explicit disconnect; suppresses automatic reconnects
   user_disconnected: bool,
}

impl ManagedDevice {
   fn is_running(&self) -> bool {
      self.connection.as_ref().is_some_and(|h| !h.is_finished())
   }
}

// === Commands ===

enum ManagerCommand {
   // Discovery events
   DeviceDiscovered {
      address: Address,
      name: SmolStr,
      model: Model,
      adapter: SmolStr,
   },
   BluetoothConnected(Address),
   BluetoothDisconnected(Address),
   DeviceLost(Address),
   AdapterLost(SmolStr),

   // User commands
   Connect(Address, oneshot::Sender<Result<()>>),
   Disconnect(Address, oneshot::Sender<Result<()>>),
   Dispatcher(Address, oneshot::Sender<Result<Dispatcher>>),
}

// === Main Manager ===

/// Handle to the device manager.
///
/// This type provides a high-level interface for managing `AirPods` devices.
/// It is cheaply cloneable.
#[derive(Clone)]
pub struct BluetoothManager {
   inbox: mpsc::Sender<ManagerCommand>,
   registry: Arc<DeviceRegistry>,
}

impl BluetoothManager {
   pub fn new(config: &Config, connector: Arc<dyn Connector>, events: EventSender) -> Self {
      let registry = Arc::new(DeviceRegistry::new(events.clone(), config.battery_horizon()));
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let actor = ManagerActor {
         config: config.clone(),
         policy: config.link_policy(),
         registry: registry.clone(),
         connector,
         events,
         command_rx,
         devices: HashMap::new(),
      };
      tokio::spawn(actor.run());
      Self {
         inbox: command_tx,
         registry,
      }
   }

   async fn request<T>(
      &self,
      make: impl FnOnce(oneshot::Sender<Result<T>>) -> ManagerCommand,
   ) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(make(tx))
         .await
         .map_err(|_| AirPodsError::ManagerShutdown)?;
      rx.await.map_err(|_| AirPodsError::ManagerShutdown)?
   }

   async fn notify(&self, cmd: ManagerCommand) {
      if self.inbox.send(cmd).await.is_err() {
         warn!("Bluetooth manager is gone, dropping notification");
      }
   }

   /// Starts the connection task of a managed or configured device.
   pub async fn connect_device(&self, address: Address) -> Result<()> {
      self
         .request(|tx| ManagerCommand::Connect(address, tx))
         .await
   }

   /// Tears the link down and keeps it down until `connect_device`.
   pub async fn disconnect_device(&self, address: Address) -> Result<()> {
      self
         .request(|tx| ManagerCommand::Disconnect(address, tx))
         .await
   }

   /// Sends a command and waits for the accessory to acknowledge it.
   pub async fn send_command(&self, address: Address, intent: CommandIntent) -> Result<Ack> {
      let device = self.registry.get(address)?;
      if matches!(intent, CommandIntent::SetNoiseMode(_))
         && device.model.is_known()
         && !device.capabilities().noise_control
      {
         return Err(AirPodsError::FeatureNotSupported(format!(
            "{} has no noise control",
            device.model
         )));
      }

      let dispatcher = self
         .request(|tx| ManagerCommand::Dispatcher(address, tx))
         .await?;
      dispatcher.send(intent).await
   }

   pub fn get_device(&self, address: Address) -> Result<Device> {
      self.registry.get(address)
   }

   pub fn all_devices(&self) -> Vec<Device> {
      self.registry.list()
   }

   pub fn connected_count(&self) -> u32 {
      self.registry.connected_count()
   }

   pub async fn device_discovered(
      &self,
      address: Address,
      name: SmolStr,
      model: Model,
      adapter: SmolStr,
   ) {
      self
         .notify(ManagerCommand::DeviceDiscovered {
            address,
            name,
            model,
            adapter,
         })
         .await;
   }

   pub async fn bluetooth_connected(&self, address: Address) {
      self.notify(ManagerCommand::BluetoothConnected(address)).await;
   }

   pub async fn bluetooth_disconnected(&self, address: Address) {
      self
         .notify(ManagerCommand::BluetoothDisconnected(address))
         .await;
   }

   pub async fn device_lost(&self, address: Address) {
      self.notify(ManagerCommand::DeviceLost(address)).await;
   }

   pub async fn adapter_lost(&self, adapter: SmolStr) {
      self.notify(ManagerCommand::AdapterLost(adapter)).await;
   }
}

// === Manager Actor ===

struct ManagerActor {
   config: Config,
   policy: LinkPolicy,
   registry: Arc<DeviceRegistry>,
   connector: Arc<dyn Connector>,
   events: EventSender,
   command_rx: mpsc::Receiver<ManagerCommand>,

   // State
   devices: HashMap<Address, ManagedDevice>,
}

impl ManagerActor {
   async fn run(mut self) {
      info!("Bluetooth manager starting up");
      while let Some(cmd) = self.command_rx.recv().await {
         self.handle_command(cmd).await;
      }
      info!("Bluetooth manager shutting down");
      self.cleanup().await;
   }

   async fn handle_command(&mut self, cmd: ManagerCommand) {
      match cmd {
         ManagerCommand::DeviceDiscovered {
            address,
            name,
            model,
            adapter,
         } => {
            let device = self.ensure_device(address, name, model);
            device.adapter = Some(adapter);
            if !device.user_disconnected {
               self.start_connection(address);
            }
         },
         ManagerCommand::BluetoothConnected(addr) => {
            if self.devices.get(&addr).is_some_and(|d| !d.user_disconnected) {
               self.start_connection(addr);
            }
         },
         ManagerCommand::BluetoothDisconnected(addr) => {
            if self.devices.contains_key(&addr) {
               info!("{addr}: Disconnected by the system");
               self.stop_connection(addr).await;
            }
         },
         ManagerCommand::DeviceLost(addr) => {
            self.handle_device_lost(addr).await;
         },
         ManagerCommand::AdapterLost(name) => {
            self.handle_adapter_lost(&name).await;
         },
         ManagerCommand::Connect(addr, reply) => {
            let _ = reply.send(self.connect(addr));
         },
         ManagerCommand::Disconnect(addr, reply) => {
            let result = if let Some(device) = self.devices.get_mut(&addr) {
               device.user_disconnected = true;
               self.stop_connection(addr).await;
               Ok(())
            } else {
               Err(AirPodsError::DeviceNotFound(addr))
            };
            let _ = reply.send(result);
         },
         ManagerCommand::Dispatcher(addr, reply) => {
            let dispatcher = self
               .devices
               .get(&addr)
               .map(|d| d.dispatcher.clone())
               .ok_or(AirPodsError::DeviceNotFound(addr));
            let _ = reply.send(dispatcher);
         },
      }
   }

   fn ensure_device(
      &mut self,
      address: Address,
      name: SmolStr,
      model: Model,
   ) -> &mut ManagedDevice {
      self.registry.insert(address, name, model);
      self.devices.entry(address).or_insert_with(|| {
         let link = Arc::new(DeviceLink::new(address));
         let (dispatcher, worker) =
            Dispatcher::spawn(address, self.registry.clone(), link.clone(), &self.policy);
         ManagedDevice {
            link,
            dispatcher,
            worker,
            connection: None,
            adapter: None,
            user_disconnected: false,
         }
      })
   }

   fn connect(&mut self, address: Address) -> Result<()> {
      if !self.devices.contains_key(&address) {
         let name = self
            .config
            .known_device(address)
            .ok_or(AirPodsError::DeviceNotFound(address))?;
         let name = SmolStr::from(name);
         self.ensure_device(address, name, Model::Unknown);
      }
      if let Some(device) = self.devices.get_mut(&address) {
         device.user_disconnected = false;
      }
      self.start_connection(address);
      Ok(())
   }

   fn start_connection(&mut self, address: Address) {
      let Some(device) = self.devices.get_mut(&address) else {
         return;
      };
      if device.is_running() {
         debug!("{address}: Connection task already running");
         return;
      }
      let task = ConnectionTask::new(
         address,
         self.connector.clone(),
         self.registry.clone(),
         device.link.clone(),
         self.policy,
      );
      device.connection = Some(tokio::spawn(task.run()));
   }

   /// Aborts the connection task and fails whatever was waiting on it.
   async fn stop_connection(&mut self, address: Address) {
      let Some(device) = self.devices.get_mut(&address) else {
         return;
      };
      if let Some(handle) = device.connection.take() {
         handle.abort();
         let _ = time::timeout(ABORT_GRACE, handle).await;
      }
      device.link.detach();
      if let Err(e) = self.registry.set_link_state(address, LinkState::Disconnected) {
         debug!("{address}: {e}");
      }
   }

   async fn handle_device_lost(&mut self, address: Address) {
      self.stop_connection(address).await;
      if let Some(device) = self.devices.remove(&address) {
         device.worker.abort();
         info!("{address}: Device removed");
      }
      self.registry.remove(address);
   }

   async fn handle_adapter_lost(&mut self, adapter: &str) {
      let affected: Vec<Address> = self
         .devices
         .iter()
         .filter(|(_, d)| d.adapter.as_deref() == Some(adapter))
         .map(|(addr, _)| *addr)
         .collect();
      for addr in affected {
         self.stop_connection(addr).await;
         self.events.emit(addr, AirPodsEvent::DeviceError);
      }
   }

   async fn cleanup(&mut self) {
      info!("Cleaning up Bluetooth manager");
      let addresses: Vec<Address> = self.devices.keys().copied().collect();
      for addr in addresses {
         self.stop_connection(addr).await;
      }
      for device in self.devices.values() {
         device.worker.abort();
      }
   }
}
