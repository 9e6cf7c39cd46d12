//! Device recognition logic for `AirPods` devices.
//!
//! This module contains the logic for recognizing `AirPods` devices
//! based on various criteria such as modalias, manufacturer data,
//! services, and name/alias patterns, and for identifying their model.

use log::debug;
use uuid::Uuid;

use crate::airpods::protocol::Model;

/// Patterns to match `AirPods` devices (case-insensitive)
const NAME_PATTERNS: &[&str] = &["airpods", "beats", "powerbeats"];
// Note: "earpods" are wired earphones, not Bluetooth AirPods

/// Apple vendor ID
const APPLE_VID: u32 = 0x004C;

/// Apple company ID for manufacturer data (u16)
const APPLE_CID: u16 = 0x004C;

/// Proximity-pairing message type in manufacturer data
const PP_TYPE: u8 = 0x07;

/// Offset of the little-endian product id inside the proximity-pairing message
const PID_OFFSET: usize = 3;

/// Apple service UUIDs - Note: Not always advertised by AirPods
static APPLE_SERVICES: [Uuid; 3] = [
   Uuid::from_u128(0x0000fd6f_0000_1000_8000_00805f9b34fb), // Find My
   Uuid::from_u128(0x0000fd39_0000_1000_8000_00805f9b34fb), // Apple service
   Uuid::from_u128(0x0000fd32_0000_1000_8000_00805f9b34fb), // Apple service
];

fn model_from_modalias(vendor: u32, product: u32) -> Option<Model> {
   (vendor == APPLE_VID)
      .then(|| Model::from_product_id(product))
      .filter(|model| model.is_known())
}

/// Identifies the model advertised in Apple manufacturer data.
fn model_from_manufacturer_data(data: &[u8]) -> Option<Model> {
   // [0] type, [1] len, [2] prefix, [3..5] product id, ...
   if data.first() != Some(&PP_TYPE) {
      return None;
   }
   let pid = data.get(PID_OFFSET..PID_OFFSET + 2)?;
   let pid = u16::from_le_bytes([pid[0], pid[1]]);
   Some(Model::from_product_id(u32::from(pid))).filter(|model| model.is_known())
}

fn matches_name(name: &str) -> bool {
   let name = name.to_ascii_lowercase();
   NAME_PATTERNS.iter().any(|pattern| name.contains(pattern))
}

/// Checks whether a device is an `AirPods`/Beats accessory.
///
/// Returns the identified model, `Model::Unknown` when the device is
/// recognized without a model, or `None` when it is something else.
pub async fn identify(dev: &bluer::Device) -> Option<Model> {
   // 1. Check modalias (most reliable for connected devices)
   if let Ok(Some(modalias)) = dev.modalias().await
      && let Some(model) = model_from_modalias(modalias.vendor, modalias.product)
   {
      debug!(
         "AirPods detected via modalias: vendor={:#06x}, product={:#06x}",
         modalias.vendor, modalias.product
      );
      return Some(model);
   }

   // 2. Check manufacturer data (useful for advertising/unconnected devices)
   if let Ok(Some(mfg_data)) = dev.manufacturer_data().await
      && let Some(model) = mfg_data
         .get(&APPLE_CID)
         .and_then(|data| model_from_manufacturer_data(data))
   {
      debug!("AirPods detected via manufacturer data: {model}");
      return Some(model);
   }

   // 3. Check service UUIDs (not always present, but definitive when found)
   if let Ok(Some(uuids)) = dev.uuids().await
      && uuids.iter().any(|u| APPLE_SERVICES.contains(u))
   {
      debug!("AirPods detected via Apple service UUID");
      return Some(Model::Unknown);
   }

   // 4. Last-chance name/alias pattern matching
   if let Ok(Some(name)) = dev.name().await
      && matches_name(&name)
   {
      debug!("AirPods detected via name: {name}");
      return Some(Model::Unknown);
   }
   if let Ok(alias) = dev.alias().await
      && matches_name(&alias)
   {
      debug!("AirPods detected via alias: {alias}");
      return Some(Model::Unknown);
   }
   None
}
