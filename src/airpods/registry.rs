//! Authoritative per-device state.
//!
//! The registry owns every device record. Membership sits behind a short
//! outer lock and each record behind its own mutex, so an update touches a
//! single device and events for it leave in the order the updates landed.

use std::{
   sync::Arc,
   time::{Duration, Instant},
};

use bluer::Address;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use smol_str::SmolStr;

use crate::{
   airpods::{
      battery::BatteryTracker,
      device::{Device, DeviceStatusUpdate, UpdateOp},
      protocol::Model,
   },
   bluetooth::connection::LinkState,
   error::{AirPodsError, Result},
   event::{AirPodsEvent, EventSender},
};

struct Record {
   device: Device,
   battery: BatteryTracker,
}

type Slot = Arc<Mutex<Record>>;

pub struct DeviceRegistry {
   // First-seen order
   slots: RwLock<Vec<(Address, Slot)>>,
   events: EventSender,
   horizon: Duration,
}

impl DeviceRegistry {
   pub fn new(events: EventSender, horizon: Duration) -> Self {
      Self {
         slots: RwLock::new(Vec::new()),
         events,
         horizon,
      }
   }

   fn slot(&self, address: Address) -> Result<Slot> {
      self
         .slots
         .read()
         .iter()
         .find(|(addr, _)| *addr == address)
         .map(|(_, slot)| slot.clone())
         .ok_or(AirPodsError::DeviceNotFound(address))
   }

   /// Adds a device. Returns `false` if it was already known.
   pub fn insert(&self, address: Address, name: SmolStr, model: Model) -> bool {
      let mut slots = self.slots.write();
      if slots.iter().any(|(addr, _)| *addr == address) {
         return false;
      }
      info!("Tracking {name} ({address}) as {model}");
      slots.push((
         address,
         Arc::new(Mutex::new(Record {
            device: Device::new(address, name, model),
            battery: BatteryTracker::new(self.horizon),
         })),
      ));
      true
   }

   pub fn remove(&self, address: Address) -> Option<Device> {
      let mut slots = self.slots.write();
      let index = slots.iter().position(|(addr, _)| *addr == address)?;
      let (_, slot) = slots.remove(index);
      drop(slots);
      let device = slot.lock().device.clone();
      Some(device)
   }

   pub fn get(&self, address: Address) -> Result<Device> {
      Ok(self.slot(address)?.lock().device.clone())
   }

   pub fn list(&self) -> Vec<Device> {
      let slots: Vec<Slot> = self.slots.read().iter().map(|(_, s)| s.clone()).collect();
      slots.iter().map(|slot| slot.lock().device.clone()).collect()
   }

   pub fn connected_count(&self) -> u32 {
      let slots: Vec<Slot> = self.slots.read().iter().map(|(_, s)| s.clone()).collect();
      slots.iter().filter(|slot| slot.lock().device.is_connected()).count() as u32
   }

   pub fn link_state(&self, address: Address) -> Result<LinkState> {
      Ok(self.slot(address)?.lock().device.link)
   }

   /// Records a link transition, emitting `DeviceConnected` on entering
   /// `Connected` and `DeviceDisconnected` on entering `Disconnected`.
   pub fn set_link_state(&self, address: Address, state: LinkState) -> Result<()> {
      let slot = self.slot(address)?;
      let mut record = slot.lock();
      let prev = std::mem::replace(&mut record.device.link, state);
      if prev == state {
         return Ok(());
      }
      debug!("{address}: {prev} -> {state}");
      match state {
         LinkState::Connected => self.events.emit(address, AirPodsEvent::DeviceConnected),
         LinkState::Disconnected => self.events.emit(address, AirPodsEvent::DeviceDisconnected),
         _ => {},
      }
      Ok(())
   }

   pub fn apply_update(&self, address: Address, update: DeviceStatusUpdate) -> Result<()> {
      self.apply_update_at(address, update, Instant::now())
   }

   /// Merges the present fields of `update` into the device record.
   ///
   /// One event is emitted per field whose value changed. Updates for a
   /// device whose link is not `Connected` are dropped.
   pub fn apply_update_at(
      &self,
      address: Address,
      update: DeviceStatusUpdate,
      now: Instant,
   ) -> Result<()> {
      let slot = self.slot(address)?;
      let mut record = slot.lock();
      let Record { device, battery } = &mut *record;
      if !device.is_connected() {
         debug!("{address}: Dropping update, link is {}", device.link);
         return Ok(());
      }

      if let Some(model) = update.model
         && model.is_known()
         && device.model != model
      {
         info!("{address}: Identified as {model}");
         device.model = model;
      }

      if let Some(name) = update.name
         && device.name != name
      {
         device.name = name.clone();
         self.events.emit(address, AirPodsEvent::DeviceNameChanged(name));
      }

      if let Some(reading) = update.battery {
         match device.family() {
            Some(family) if family != reading.family() => {
               warn!(
                  "{address}: Ignoring {:?} battery for a {family:?} device",
                  reading.family()
               );
            },
            _ => {
               device.battery_ttl = battery.update(&reading, now);
               if UpdateOp::apply(&mut device.battery, Some(reading)).is_updated() {
                  self.events.emit(address, AirPodsEvent::BatteryUpdated(reading));
               }
            },
         }
      }

      if let Some(mode) = update.noise_mode
         && UpdateOp::apply(&mut device.noise_mode, Some(mode)).is_updated()
      {
         self.events.emit(address, AirPodsEvent::NoiseControlChanged(mode));
      }

      if let Some(ears) = update
         .ear_detection
         .and_then(|e| e.for_family(device.family()))
         && UpdateOp::apply(&mut device.ear_detection, Some(ears)).is_updated()
      {
         self.events.emit(address, AirPodsEvent::EarDetectionChanged(ears));
      }

      for (feature, enabled) in update.features {
         if device.features.insert(feature, enabled) != Some(enabled) {
            debug!("{address}: {feature} = {enabled}");
         }
      }
      Ok(())
   }
}
