//! `AirPods` device state.
//!
//! This module defines the device record held by the registry, the partial
//! status updates produced by the codec, and their JSON renderings.

use std::collections::BTreeMap;

use bluer::Address;
use serde_json::json;
use smol_str::SmolStr;

use crate::{
   airpods::protocol::{Capabilities, FeatureId, Model, ModelFamily, NoiseControlMode},
   bluetooth::connection::LinkState,
};

/// Charge state of a single battery-bearing component.
///
/// Either field may be absent when the accessory did not report it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ComponentBattery {
   pub level: Option<u8>,
   pub charging: Option<bool>,
}

impl ComponentBattery {
   pub const fn new(level: u8, charging: bool) -> Self {
      Self {
         level: Some(level),
         charging: Some(charging),
      }
   }

   pub fn is_charging(&self) -> bool {
      self.charging == Some(true)
   }

   pub fn to_json(self) -> serde_json::Value {
      json!({
          "level": self.level,
          "charging": self.charging,
      })
   }
}

/// Battery layout of a device.
///
/// The variant is decided by the accessory family, so a device can never
/// report bud and headphone components at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Battery {
   Dual {
      left: Option<ComponentBattery>,
      right: Option<ComponentBattery>,
      case: Option<ComponentBattery>,
   },
   Single {
      headphone: Option<ComponentBattery>,
   },
}

impl Battery {
   pub const fn family(&self) -> ModelFamily {
      match self {
         Self::Dual { .. } => ModelFamily::DualEarbud,
         Self::Single { .. } => ModelFamily::SingleHeadphone,
      }
   }

   pub fn any_charging(&self) -> bool {
      match self {
         Self::Dual { left, right, case } => [left, right, case]
            .into_iter()
            .flatten()
            .any(ComponentBattery::is_charging),
         Self::Single { headphone } => headphone.is_some_and(|h| h.is_charging()),
      }
   }

   /// Levels of the components that drain while worn, in a fixed slot order.
   pub fn worn_levels(&self) -> [Option<u8>; 2] {
      match self {
         Self::Dual { left, right, .. } => {
            [left.and_then(|c| c.level), right.and_then(|c| c.level)]
         },
         Self::Single { headphone } => [headphone.and_then(|c| c.level), None],
      }
   }

   pub fn to_json(self) -> serde_json::Value {
      let render = |c: Option<ComponentBattery>| c.map_or(serde_json::Value::Null, |c| c.to_json());
      let (left, right, case, headphone) = match self {
         Self::Dual { left, right, case } => (left, right, case, None),
         Self::Single { headphone } => (None, None, None, headphone),
      };
      json!({
          "left": render(left),
          "right": render(right),
          "case": render(case),
          "headphone": render(headphone),
      })
   }
}

/// In-ear state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EarDetection {
   Buds {
      left: Option<bool>,
      right: Option<bool>,
   },
   Worn(bool),
}

impl EarDetection {
   pub fn to_json(self) -> serde_json::Value {
      match self {
         Self::Buds { left, right } => json!({
             "left": left,
             "right": right,
             "worn": null,
         }),
         Self::Worn(worn) => json!({
             "left": null,
             "right": null,
             "worn": worn,
         }),
      }
   }

   /// Reshapes a per-bud reading for a device of the given family.
   ///
   /// Single headphones report their worn state in the primary slot.
   pub fn for_family(self, family: Option<ModelFamily>) -> Option<Self> {
      match (self, family) {
         (Self::Buds { left, .. }, Some(ModelFamily::SingleHeadphone)) => left.map(Self::Worn),
         (Self::Worn(_), Some(ModelFamily::DualEarbud)) => None,
         (other, _) => Some(other),
      }
   }
}

/// Partial device state decoded from one packet.
///
/// Only present fields are merged into the device record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceStatusUpdate {
   pub battery: Option<Battery>,
   pub noise_mode: Option<NoiseControlMode>,
   pub ear_detection: Option<EarDetection>,
   pub model: Option<Model>,
   pub name: Option<SmolStr>,
   pub features: Vec<(FeatureId, bool)>,
}

impl DeviceStatusUpdate {
   pub fn is_empty(&self) -> bool {
      *self == Self::default()
   }
}

/// Represents the result of an update operation on device state.
#[derive(Debug, Clone, Copy)]
pub enum UpdateOp<T> {
   /// No change occurred
   Noop,
   /// A new value was inserted (None -> Some)
   Inserted,
   /// A value was deleted (Some -> None)
   Deleted(T),
   /// An existing value was updated
   Updated(T),
}

impl<T: PartialEq> UpdateOp<T> {
   /// Replaces `dst` with `new` and reports what happened.
   pub fn apply(dst: &mut Option<T>, new: Option<T>) -> Self {
      let prev = std::mem::replace(dst, new);
      match (prev, dst.as_ref()) {
         (Some(p), Some(n)) if p == *n => Self::Noop,
         (None, Some(_)) => Self::Inserted,
         (Some(p), None) => Self::Deleted(p),
         (Some(p), Some(_)) => Self::Updated(p),
         (None, None) => Self::Noop,
      }
   }

   pub const fn is_updated(&self) -> bool {
      matches!(self, Self::Inserted | Self::Updated(_))
   }
}

/// Snapshot of a device record.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
   pub address: Address,
   pub name: SmolStr,
   pub model: Model,
   pub link: LinkState,
   pub battery: Option<Battery>,
   pub battery_ttl: Option<u32>,
   pub noise_mode: Option<NoiseControlMode>,
   pub ear_detection: Option<EarDetection>,
   pub features: BTreeMap<FeatureId, bool>,
}

impl Device {
   pub fn new(address: Address, name: SmolStr, model: Model) -> Self {
      Self {
         address,
         name,
         model,
         link: LinkState::Disconnected,
         battery: None,
         battery_ttl: None,
         noise_mode: None,
         ear_detection: None,
         features: BTreeMap::new(),
      }
   }

   pub fn is_connected(&self) -> bool {
      self.link == LinkState::Connected
   }

   pub const fn capabilities(&self) -> Capabilities {
      self.model.capabilities()
   }

   /// Family of the device, from its model or else from the battery it reported.
   pub fn family(&self) -> Option<ModelFamily> {
      self
         .model
         .family()
         .or_else(|| self.battery.map(|b| b.family()))
   }

   /// Converts the device state to a JSON representation.
   pub fn to_json(&self) -> serde_json::Value {
      let caps = self.capabilities();
      let features: BTreeMap<_, _> = self
         .features
         .iter()
         .map(|(k, v)| (k.to_str(), *v))
         .collect();

      json!({
          "address": self.address.to_string(),
          "name": self.name.as_str(),
          "model": self.model.to_str(),
          "connected": self.is_connected(),
          "connection_state": self.link.to_str(),
          "battery": self.battery.map(Battery::to_json),
          "battery_ttl_estimate": self.battery_ttl,
          "noise_control": self.noise_mode.map_or("unknown", NoiseControlMode::to_str),
          "ear_detection": self.ear_detection.map(EarDetection::to_json),
          "capabilities": {
              "ear_detection": caps.ear_detection,
              "noise_control": caps.noise_control,
              "spatial_audio": caps.spatial_audio,
          },
          "features": features,
      })
   }
}
